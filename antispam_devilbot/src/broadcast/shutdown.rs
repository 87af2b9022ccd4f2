use std::time::Duration;

use tokio::sync::watch;

/// Becomes triggered once every sender of the watch channel is dropped.
pub struct Shutdown {
    receiver: watch::Receiver<()>,
}

impl Shutdown {
    pub fn new(receiver: watch::Receiver<()>) -> Self {
        Self { receiver }
    }

    pub fn is_triggered(&self) -> bool {
        self.receiver.has_changed().is_err()
    }

    /// Sleep for `duration`, waking up early on shutdown.
    /// Returns `true` if shut down.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if self.is_triggered() {
            return true;
        }
        let woke_early = tokio::select! {
            () = tokio::time::sleep(duration) => false,
            // Nobody sends anything, so this only returns once the sender is gone.
            _ = self.receiver.changed() => true,
        };
        woke_early || self.is_triggered()
    }
}
