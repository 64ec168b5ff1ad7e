use crate::replica::election::timers::clock::{Clock, RealClock};
use crate::replica::election::timers::deadline::Deadline;
use crate::{actor, replica};
use std::sync::{Arc, Weak};
use tokio::time::Duration;

/// HeartbeatTimerHandle drives AppendEntries to one peer while we lead. Dropping the handle stops
/// the timer task at its next wake.
pub(crate) struct HeartbeatTimerHandle<C: Clock = RealClock> {
    shared: Arc<Shared<C>>,
}

struct Shared<C: Clock> {
    interval: Duration,
    deadline: Deadline,
    clock: C,
}

struct HeartbeatTimerTask<C: Clock> {
    handle_alive: Weak<Shared<C>>,
    deadline: Deadline,
    actor_client: actor::WeakActorClient,
    tick: replica::LeaderTimerTick,
    clock: C,
}

impl HeartbeatTimerHandle {
    pub(crate) fn spawn(
        interval: Duration,
        actor_client: actor::WeakActorClient,
        peer_id: replica::ReplicaId,
        term: replica::Term,
    ) -> Self {
        let (task, handle) = HeartbeatTimerTask::new(interval, actor_client, peer_id, term, RealClock);
        tokio::task::spawn(task.run());
        handle
    }
}

impl<C: Clock> HeartbeatTimerHandle<C> {
    /// Called whenever we send something to the peer, so an idle heartbeat isn't needed for a while.
    pub(crate) fn reset(&self) {
        self.shared.reset();
    }
}

impl<C: Clock> Shared<C> {
    fn reset(&self) {
        self.deadline.push_to(self.clock.now() + self.interval);
    }
}

impl<C: Clock> HeartbeatTimerTask<C> {
    fn new(
        interval: Duration,
        actor_client: actor::WeakActorClient,
        peer_id: replica::ReplicaId,
        term: replica::Term,
        clock: C,
    ) -> (Self, HeartbeatTimerHandle<C>) {
        let deadline = Deadline::default();
        let shared = Arc::new(Shared {
            interval,
            deadline: deadline.clone(),
            clock: clock.clone(),
        });

        let task = HeartbeatTimerTask {
            handle_alive: Arc::downgrade(&shared),
            deadline,
            actor_client,
            tick: replica::LeaderTimerTick { peer_id, term },
            clock,
        };
        (task, HeartbeatTimerHandle { shared })
    }

    async fn run(mut self) {
        // The deadline starts empty, so the first tick goes out right away. A new leader (or a
        // newly added peer) gets contacted without waiting a full interval.
        loop {
            match self.deadline.take() {
                Some(wake_time) => self.clock.sleep_until(wake_time).await,
                None => {
                    let shared = match self.handle_alive.upgrade() {
                        Some(shared) => shared,
                        // No longer leader for this term, or the peer left the config.
                        None => return,
                    };
                    if self.actor_client.leader_timer(self.tick.clone()).await.is_err() {
                        return;
                    }
                    shared.reset();
                }
            }
        }
    }
}
