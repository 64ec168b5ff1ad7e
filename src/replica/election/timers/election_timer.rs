use crate::actor;
use crate::replica::election::timers::clock::{Clock, RealClock};
use crate::replica::election::timers::deadline::Deadline;
use rand::Rng;
use std::ops::RangeInclusive;
use std::sync::{Arc, Weak};
use tokio::time::{Duration, Instant};

/// ElectionTimerHandle fires FollowerTimeout when we stop hearing from a leader. The timeout is
/// drawn at random from the configured range on every reset.
pub(crate) struct ElectionTimerHandle<C: Clock = RealClock> {
    shared: Arc<Shared<C>>,
}

struct Shared<C: Clock> {
    deadline: Deadline,
    timeout_range: RangeInclusive<Duration>,
    clock: C,
}

struct ElectionTimerTask<C: Clock> {
    handle_alive: Weak<Shared<C>>,
    deadline: Deadline,
    actor_client: actor::WeakActorClient,
    clock: C,
    // Pause between repeated timeouts while the actor hasn't dropped us yet.
    retry_backoff: Duration,
}

impl ElectionTimerHandle {
    pub(crate) fn spawn(min_timeout: Duration, max_timeout: Duration, actor_client: actor::WeakActorClient) -> Self {
        let (task, handle) = ElectionTimerTask::new(min_timeout, max_timeout, actor_client, RealClock);
        tokio::task::spawn(task.run());
        handle
    }
}

impl<C: Clock> ElectionTimerHandle<C> {
    pub(crate) fn reset(&self) {
        self.shared.reset();
    }
}

impl<C: Clock> Shared<C> {
    fn reset(&self) {
        let timeout = rand::thread_rng().gen_range(self.timeout_range.clone());
        self.deadline.push_to(self.clock.now() + timeout);
    }
}

impl<C: Clock> ElectionTimerTask<C> {
    fn new(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: actor::WeakActorClient,
        clock: C,
    ) -> (Self, ElectionTimerHandle<C>) {
        let deadline = Deadline::default();
        let shared = Arc::new(Shared {
            deadline: deadline.clone(),
            timeout_range: RangeInclusive::new(min_timeout, max_timeout),
            clock: clock.clone(),
        });
        // Start armed. An empty deadline would time out the moment we become follower.
        shared.reset();

        let task = ElectionTimerTask {
            handle_alive: Arc::downgrade(&shared),
            deadline,
            actor_client,
            clock,
            retry_backoff: min_timeout,
        };
        (task, ElectionTimerHandle { shared })
    }

    fn handle_dropped(&self) -> bool {
        self.handle_alive.strong_count() == 0
    }

    async fn run(mut self) {
        loop {
            match self.deadline.take() {
                Some(wake_time) => self.clock.sleep_until(wake_time).await,
                None => {
                    if self.handle_dropped() {
                        return;
                    }
                    // Keep running after firing. The actor may already hold an AppendEntries
                    // that keeps us follower, in which case it resets us again.
                    if self.actor_client.follower_timeout().await.is_err() {
                        return;
                    }
                    self.sleep_backoff().await;
                }
            }

            if self.handle_dropped() {
                return;
            }
        }
    }

    async fn sleep_backoff(&mut self) {
        let until: Instant = self.clock.now() + self.retry_backoff;
        self.clock.sleep_until(until).await;
    }
}
