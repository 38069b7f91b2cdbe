use std::time::Duration;
use tokio::time::Instant;

/// Trailing-edge debouncer for use inside a `tokio::select!` loop.
///
/// Every `push` replaces the pending value and restarts the window; `ready`
/// resolves with the last value once the window elapses without another
/// push. `ready` is cancel-safe: dropping it leaves the pending value intact.
pub struct Debouncer<T> {
    window: Duration,
    pending: Option<T>,
    deadline: Option<Instant>,
}

impl<T> Debouncer<T> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: None,
            deadline: None,
        }
    }

    pub fn push(&mut self, value: T) {
        self.pending = Some(value);
        self.deadline = Some(Instant::now() + self.window);
    }

    /// Like `push`, but folds the new value into the pending one.
    pub fn push_with(&mut self, value: T, merge: impl FnOnce(T, T) -> T) {
        let next = match self.pending.take() {
            Some(prev) => merge(prev, value),
            None => value,
        };
        self.push(next);
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn cancel(&mut self) {
        self.pending = None;
        self.deadline = None;
    }

    pub async fn ready(&mut self) -> T {
        let deadline = match (self.deadline, self.pending.is_some()) {
            (Some(deadline), true) => deadline,
            _ => return std::future::pending::<T>().await,
        };
        tokio::time::sleep_until(deadline).await;
        self.deadline = None;
        match self.pending.take() {
            Some(value) => value,
            None => std::future::pending::<T>().await,
        }
    }
}
