use std::sync::Arc;

use tokio::sync::watch;

/// Cooperative cancellation signal shared by the tasks of one worker.
///
/// Triggering is sticky: once set it stays set, and every current and
/// future waiter observes it.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal has been triggered.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_resolves_for_late_and_early_waiters() {
        let shutdown = Shutdown::new();
        let s = shutdown.clone();
        let early = tokio::spawn(async move { s.wait().await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!shutdown.is_triggered());

        shutdown.trigger();
        early.await.unwrap();
        assert!(shutdown.is_triggered());
        tokio::time::timeout(Duration::from_secs(1), shutdown.wait())
            .await
            .expect("late waiter should see the trigger");
    }
}
