use std::time::Duration;
use tokio::sync::watch;

/// A one-shot flag that tasks can wait for. Once set, it stays set.
#[derive(Debug)]
pub struct AsyncLatch {
    state: watch::Sender<bool>,
}

impl Default for AsyncLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncLatch {
    pub fn new() -> AsyncLatch {
        let (state, _) = watch::channel(false);
        AsyncLatch { state }
    }

    /// returns true if this call actually changed the state
    pub fn set(&self) -> bool {
        !self.state.send_replace(true)
    }

    pub fn is_set(&self) -> bool {
        *self.state.borrow()
    }

    pub async fn wait(&self) {
        let mut receiver = self.state.subscribe();
        // the sender lives in self, so this can not fail while we wait
        let _ = receiver.wait_for(|is_set| *is_set).await;
    }

    /// returns false if the timeout expired before the latch was set
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}
