use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::Instant;

/// Deadline is the next wake time shared between a timer handle and its task. The handle pushes it
/// out, the task takes it when it wakes. An empty cell means nothing pushed the deadline since the
/// task last slept, so the timer has fired.
#[derive(Clone, Default)]
pub(super) struct Deadline {
    inner: Arc<Mutex<Option<Instant>>>,
}

impl Deadline {
    pub(super) fn push_to(&self, when: Instant) {
        self.inner.lock().replace(when);
    }

    pub(super) fn take(&self) -> Option<Instant> {
        self.inner.lock().take()
    }
}
