//! Turn cancellation.
//!
//! A [`CancelHandle`] is cloned out of the loop before a turn starts and can
//! be triggered from anywhere (a Ctrl-C handler, another task). The loop
//! observes it at every suspension point.

use std::sync::Arc;
use tokio::sync::watch;

/// How hard the current turn is being cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CancelLevel {
    None,
    /// Finish in-flight tool calls and record their results, then stop.
    Graceful,
    /// Abandon in-flight tool calls; record them as cancelled.
    Hard,
}

/// Requests cancellation of the running turn.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<CancelLevel>>,
}

impl CancelHandle {
    pub(crate) fn new() -> Self {
        let (sender, _) = watch::channel(CancelLevel::None);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Graceful cancel: in-flight tool calls complete and are recorded.
    pub fn cancel(&self) {
        self.raise(CancelLevel::Graceful);
    }

    /// Hard cancel: in-flight tool calls are abandoned.
    pub fn abort(&self) {
        self.raise(CancelLevel::Hard);
    }

    pub fn level(&self) -> CancelLevel {
        *self.sender.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.level() > CancelLevel::None
    }

    fn raise(&self, level: CancelLevel) {
        self.sender.send_if_modified(|current| {
            if level > *current {
                *current = level;
                true
            } else {
                false
            }
        });
    }

    /// Clear a previous request; called when a turn starts.
    pub(crate) fn reset(&self) {
        self.sender.send_replace(CancelLevel::None);
    }

    pub(crate) fn watch(&self) -> CancelWatch {
        CancelWatch {
            receiver: self.sender.subscribe(),
        }
    }
}

/// The loop's side of a [`CancelHandle`].
pub(crate) struct CancelWatch {
    receiver: watch::Receiver<CancelLevel>,
}

impl CancelWatch {
    pub(crate) fn level(&self) -> CancelLevel {
        *self.receiver.borrow()
    }

    /// Resolve once cancellation reaches at least `level`.
    pub(crate) async fn reached(&mut self, level: CancelLevel) {
        if self.receiver.wait_for(|l| *l >= level).await.is_err() {
            // Sender gone: nobody can cancel any more
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn levels_only_escalate() {
        let handle = CancelHandle::new();
        assert!(!handle.is_cancelled());
        handle.abort();
        handle.cancel();
        assert_eq!(handle.level(), CancelLevel::Hard);
        handle.reset();
        assert_eq!(handle.level(), CancelLevel::None);
    }

    #[tokio::test]
    async fn watch_wakes_on_request() {
        let handle = CancelHandle::new();
        let mut watch = handle.watch();
        let remote = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            remote.cancel();
        });
        watch.reached(CancelLevel::Graceful).await;
        assert_eq!(watch.level(), CancelLevel::Graceful);
    }
}
