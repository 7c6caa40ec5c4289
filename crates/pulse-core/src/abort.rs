//! Broadcast cancellation shared by every worker of a run.

use std::sync::Mutex;
use tokio::sync::watch;

/// Single-shot abort signal. `abort()` is idempotent; every subscriber
/// sleeping on [`AbortWatch::aborted`] wakes on the first call.
#[derive(Debug)]
pub struct Aborter {
    stopped: Mutex<bool>,
    tx: watch::Sender<bool>,
}

impl Aborter {
    pub fn new() -> Aborter {
        let (tx, _) = watch::channel(false);
        Aborter {
            stopped: Mutex::new(false),
            tx,
        }
    }

    /// Signals every subscriber. Safe to call from any task, any number of
    /// times; only the first call transitions the state.
    pub fn abort(&self) {
        let mut stopped = match self.stopped.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *stopped {
            return;
        }
        *stopped = true;
        // Receivers may all be gone already (run finished); that's fine.
        let _ = self.tx.send(true);
    }

    pub fn is_aborted(&self) -> bool {
        match self.stopped.lock() {
            Ok(g) => *g,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn watch(&self) -> AbortWatch {
        AbortWatch {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Aborter {
    fn default() -> Aborter {
        Aborter::new()
    }
}

/// Per-worker subscription handle.
#[derive(Debug, Clone)]
pub struct AbortWatch {
    rx: watch::Receiver<bool>,
}

impl AbortWatch {
    /// Resolves once the run is aborted. Select against this wherever the
    /// worker sleeps.
    pub async fn aborted(&mut self) {
        // wait_for only errors when the sender is dropped; the aborter
        // outlives the workers, and a dropped sender means stop anyway.
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }

    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn abort_is_idempotent() {
        let a = Aborter::new();
        assert!(!a.is_aborted());
        a.abort();
        a.abort();
        assert!(a.is_aborted());
        assert!(a.watch().is_aborted());
    }

    #[tokio::test]
    async fn abort_wakes_sleepers() {
        let a = Arc::new(Aborter::new());
        let mut watchers: Vec<_> = (0..4).map(|_| a.watch()).collect();
        let tasks: Vec<_> = watchers
            .drain(..)
            .map(|mut w| tokio::spawn(async move { w.aborted().await }))
            .collect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        a.abort();
        for t in tasks {
            tokio::time::timeout(Duration::from_secs(1), t)
                .await
                .expect("watcher should wake")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn late_watch_sees_abort() {
        let a = Aborter::new();
        a.abort();
        let mut w = a.watch();
        w.aborted().await;
    }
}
