//! Phasen-Timer
//!
//! Höchstens ein Timer ist scharf. `arm` ersetzt den alten, `disarm` bricht
//! den Task ab. Ein Timer, der trotzdem schon gefeuert hat, wird in der
//! State Machine über seine Generation verworfen.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
pub struct PhaseTimer {
    handle: Option<JoinHandle<()>>,
}

impl PhaseTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Führt `fire` nach `after` aus, ein vorheriger Timer wird abgebrochen
    pub fn arm<F>(&mut self, after: Duration, fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.disarm();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            fire.await;
        }));
    }

    pub fn disarm(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for PhaseTimer {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_duration() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = PhaseTimer::new();

        timer.arm(Duration::from_secs(30), async move {
            let _ = tx.send("fired");
        });
        assert!(timer.is_armed());

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.try_recv().unwrap(), "fired");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_previous() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = PhaseTimer::new();

        let first = tx.clone();
        timer.arm(Duration::from_secs(5), async move {
            let _ = first.send(1);
        });
        timer.arm(Duration::from_secs(10), async move {
            let _ = tx.send(2);
        });

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(rx.try_recv().unwrap(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_cancels() {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let mut timer = PhaseTimer::new();

        timer.arm(Duration::from_secs(5), async move {
            let _ = tx.send(());
        });
        timer.disarm();
        assert!(!timer.is_armed());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(rx.try_recv().is_err());
    }
}
