use crate::actor::Event;
use crate::replica::LeaderTimerTick;
use std::time::Duration;
use tokio::sync::mpsc;

/// EventProbe stands in for the replica actor and checks what the timers send it.
pub(super) struct EventProbe {
    rx: mpsc::Receiver<Event>,
    quiet_period: Duration,
}

impl EventProbe {
    pub(super) fn new(rx: mpsc::Receiver<Event>) -> Self {
        EventProbe {
            rx,
            quiet_period: Duration::from_millis(10),
        }
    }

    async fn next(&mut self) -> Event {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("Timed out waiting for event")
            .expect("Event queue closed")
    }

    pub(super) async fn expect_heartbeat(&mut self, expected: LeaderTimerTick) {
        match self.next().await {
            Event::LeaderTimer(tick) => assert_eq!(tick, expected),
            other => panic!("Unexpected event {:?}", other),
        }
    }

    pub(super) async fn expect_follower_timeout(&mut self) {
        match self.next().await {
            Event::FollowerTimeout => {}
            other => panic!("Unexpected event {:?}", other),
        }
    }

    pub(super) async fn expect_nothing(&mut self) {
        if let Ok(event) = tokio::time::timeout(self.quiet_period, self.rx.recv()).await {
            panic!("Expected no event, got {:?}", event);
        }
    }
}
