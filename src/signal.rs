//! Cooperative stop signal shared by the scheduler, resolver and probes.
//!
//! A [`StopSignal`] is owned by whoever may cancel work; every unit of work
//! holds a [`StopToken`] and races its I/O against [`StopToken::stopped`].

use tokio::sync::watch;

/// Owner side of a stop signal.
#[derive(Debug)]
pub struct StopSignal {
    tx: watch::Sender<bool>,
}

/// Cloneable observer of a [`StopSignal`].
#[derive(Debug, Clone)]
pub struct StopToken {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Hand out a new observer.
    pub fn token(&self) -> StopToken {
        StopToken {
            rx: self.tx.subscribe(),
        }
    }

    /// Fire the signal. Idempotent.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopToken {
    /// A token whose signal can never fire.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the signal fires. Pends forever if the owner was dropped
    /// without stopping.
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|stopped| *stopped).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_token_observes_stop() {
        let signal = StopSignal::new();
        let token = signal.token();
        assert!(!token.is_stopped());

        let waiter = tokio::spawn({
            let token = token.clone();
            async move { token.stopped().await }
        });
        signal.stop();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("stopped() should resolve")
            .unwrap();
        assert!(token.is_stopped());
        assert!(signal.token().is_stopped());
    }

    #[tokio::test]
    async fn test_token_created_after_stop_is_stopped() {
        let signal = StopSignal::new();
        signal.stop();
        let token = signal.token();
        assert!(token.is_stopped());
        tokio::time::timeout(Duration::from_millis(100), token.stopped())
            .await
            .expect("already stopped");
    }

    #[tokio::test]
    async fn test_never_token_pends() {
        let token = StopToken::never();
        let res = tokio::time::timeout(Duration::from_millis(50), token.stopped()).await;
        assert!(res.is_err());
        assert!(!token.is_stopped());
    }
}
