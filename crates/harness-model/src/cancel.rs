// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use tokio::sync::watch;

/// A cooperative cancellation flag.
///
/// `CancelToken`s are flat and independent of each other: cloning a token
/// shares the same underlying flag, but a `CancelToken` has no built-in
/// notion of parents or children. Code that needs hierarchical propagation
/// (the sub-agent pool forwarding a parent's cancellation to every child it
/// owns) builds that on top by holding a listen-only clone of the parent
/// token and calling `cancel()` on each child when it fires — propagation is
/// edge-triggered and the listener only needs to see it once.
#[derive(Clone, Debug)]
pub struct CancelToken {
    tx: std::sync::Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    /// True once `cancel()` has been called on this token or any clone of it.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Fire the flag. Idempotent; later calls are no-ops.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// Resolve once the token is cancelled. Returns immediately if it
    /// already is.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        // Sender is held by `self.tx` and every clone sharing it, so this
        // only errs if all of them are dropped — meaning cancellation can
        // never fire, and waiting forever is the correct behaviour.
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_is_not_cancelled() {
        let t = CancelToken::new();
        assert!(!t.is_cancelled());
    }

    #[test]
    fn cancel_is_visible_on_clones() {
        let t = CancelToken::new();
        let clone = t.clone();
        t.cancel();
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_immediately_when_already_cancelled() {
        let t = CancelToken::new();
        t.cancel();
        tokio::time::timeout(std::time::Duration::from_millis(50), t.cancelled())
            .await
            .expect("should resolve immediately");
    }

    #[tokio::test]
    async fn cancelled_resolves_once_cancel_is_called() {
        let t = CancelToken::new();
        let waiter = t.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        t.cancel();
        tokio::time::timeout(std::time::Duration::from_millis(200), handle)
            .await
            .expect("task should finish")
            .unwrap();
    }

    #[test]
    fn cancel_is_idempotent() {
        let t = CancelToken::new();
        t.cancel();
        t.cancel();
        assert!(t.is_cancelled());
    }
}
