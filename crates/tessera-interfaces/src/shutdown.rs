//! Stop signal shared by a component and its background tasks.
//!
//! [`ShutdownToken`] pairs a `watch` channel carrying the stop flag with an
//! online flag and the `JoinHandle`s of the tasks that must be awaited
//! before the owner is considered stopped. Transports use it for their read
//! loops; the node uses one for its scheduler and receive tasks.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

pub struct ShutdownToken {
    stop_tx: watch::Sender<bool>,
    online: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            stop_tx,
            online: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// A receiver for the stop flag, for use in `select!` loops.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Resolves once [`signal_stop`](Self::signal_stop) has been called,
    /// immediately if it already was.
    pub async fn stopped(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    pub fn set_online(&self) {
        self.online.store(true, Ordering::SeqCst);
    }

    pub fn set_offline(&self) {
        self.online.store(false, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub async fn add_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().await.push(handle);
    }

    pub async fn task_count(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Raise the stop flag and go offline. Idempotent.
    pub fn signal_stop(&self) {
        self.stop_tx.send_replace(true);
        self.set_offline();
    }

    /// Await every registered task. Panicked or cancelled tasks are ignored.
    pub async fn join_all(&self) {
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    tracing::warn!("background task panicked during shutdown");
                }
            }
        }
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_token_is_offline_and_running() {
        let token = ShutdownToken::new();
        assert!(!token.is_online());
        assert!(!token.is_stopped());
    }

    #[test]
    fn signal_stop_reaches_subscribers_and_goes_offline() {
        let token = ShutdownToken::new();
        token.set_online();
        let rx = token.subscribe();

        token.signal_stop();
        token.signal_stop();

        assert!(*rx.borrow());
        assert!(token.is_stopped());
        assert!(!token.is_online());
        // late subscribers see the flag too
        assert!(*token.subscribe().borrow());
    }

    #[tokio::test]
    async fn stopped_resolves_after_signal() {
        let token = std::sync::Arc::new(ShutdownToken::new());
        let waiter = {
            let token = std::sync::Arc::clone(&token);
            tokio::spawn(async move { token.stopped().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        token.signal_stop();
        waiter.await.unwrap();
        token.stopped().await;
    }

    #[tokio::test]
    async fn join_all_drains_tasks() {
        let token = ShutdownToken::new();
        let mut rx = token.subscribe();
        token
            .add_task(tokio::spawn(async move {
                let _ = rx.changed().await;
            }))
            .await;
        token.add_task(tokio::spawn(async {})).await;
        assert_eq!(token.task_count().await, 2);

        token.signal_stop();
        token.join_all().await;
        assert_eq!(token.task_count().await, 0);
    }

    #[tokio::test]
    async fn join_all_tolerates_panicked_task() {
        let token = ShutdownToken::new();
        token
            .add_task(tokio::spawn(async { panic!("boom") }))
            .await;
        token.join_all().await;
        assert_eq!(token.task_count().await, 0);
    }
}
