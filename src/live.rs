//! Runtime configuration and control handles for long-running components.
//!
//! This module provides [`LiveConfig`] for tuning checkpoint behaviour of
//! the processor and view loops, and [`RunHandle`] for stopping and
//! joining a spawned background loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Configuration for live loop behaviour.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use streamfold::LiveConfig;
///
/// let config = LiveConfig {
///     checkpoint_interval: Duration::from_secs(10),
///     ..LiveConfig::default()
/// };
/// assert_eq!(config.checkpoint_interval, Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// How often store snapshots are flushed to disk while running.
    ///
    /// Snapshots are also flushed when a partition is revoked and on
    /// graceful shutdown. A shorter interval shortens changelog replay
    /// after a crash; a longer one reduces disk I/O.
    ///
    /// Default: 5 seconds.
    pub checkpoint_interval: Duration,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: Duration::from_secs(5),
        }
    }
}

/// Handle for a spawned background loop.
///
/// Dropping the handle does **not** stop the loop -- call
/// [`shutdown`](RunHandle::shutdown) for graceful termination.
///
/// `Clone` is cheap: all fields are shared.
pub(crate) struct RunHandle<E> {
    shutdown_tx: watch::Sender<bool>,
    task: Arc<tokio::sync::Mutex<Option<JoinHandle<Result<(), E>>>>>,
}

impl<E> Clone for RunHandle<E> {
    fn clone(&self) -> Self {
        Self {
            shutdown_tx: self.shutdown_tx.clone(),
            task: Arc::clone(&self.task),
        }
    }
}

impl<E> std::fmt::Debug for RunHandle<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("shutdown_requested", &*self.shutdown_tx.borrow())
            .finish()
    }
}

impl<E> RunHandle<E>
where
    E: From<tokio::task::JoinError> + Send + 'static,
{
    /// Spawn `run` on the current runtime, handing it the shutdown signal.
    pub(crate) fn spawn<F, Fut>(run: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(shutdown_rx));
        Self {
            shutdown_tx,
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        }
    }

    /// Returns `true` once the loop has exited, for whatever reason.
    pub async fn is_finished(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_none_or(|task| task.is_finished())
    }

    /// Signal the loop to stop and wait for it to exit.
    ///
    /// Calling `shutdown` more than once is safe -- subsequent calls
    /// return `Ok(())` immediately.
    ///
    /// # Errors
    ///
    /// Returns the loop's own error if it failed before or during
    /// shutdown, or a converted [`JoinError`](tokio::task::JoinError) if
    /// it panicked.
    pub async fn shutdown(&self) -> Result<(), E> {
        let _ = self.shutdown_tx.send(true);
        self.join().await
    }

    /// Wait for the loop to exit without asking it to stop.
    ///
    /// Only the first caller observes the loop's result; later callers get
    /// `Ok(())`.
    pub async fn join(&self) -> Result<(), E> {
        let mut guard = self.task.lock().await;
        match guard.as_mut() {
            Some(task) => {
                let result = task.await;
                guard.take();
                result?
            }
            None => Ok(()),
        }
    }
}

/// Resolve once `rx` carries `true` or its sender is gone.
pub(crate) async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error("boom")]
        Boom,
        #[error("task gone: {0}")]
        Gone(String),
    }

    impl From<tokio::task::JoinError> for TestError {
        fn from(e: tokio::task::JoinError) -> Self {
            TestError::Gone(e.to_string())
        }
    }

    #[test]
    fn live_config_defaults() {
        let config = LiveConfig::default();
        assert_eq!(config.checkpoint_interval, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn shutdown_stops_loop_and_is_idempotent() {
        let handle: RunHandle<TestError> = RunHandle::spawn(|mut rx| async move {
            stopped(&mut rx).await;
            Ok(())
        });
        assert!(!handle.is_finished().await);

        handle.shutdown().await.expect("first shutdown");
        handle.shutdown().await.expect("second shutdown is a no-op");
        assert!(handle.is_finished().await);
    }

    #[tokio::test]
    async fn join_reports_loop_error_once() {
        let handle: RunHandle<TestError> = RunHandle::spawn(|_rx| async { Err(TestError::Boom) });
        let clone = handle.clone();

        assert!(matches!(handle.join().await, Err(TestError::Boom)));
        assert!(clone.join().await.is_ok());
    }

    #[tokio::test]
    async fn panicking_loop_maps_join_error() {
        let handle: RunHandle<TestError> = RunHandle::spawn(|_rx| async {
            if true {
                panic!("loop panicked");
            }
            Ok(())
        });
        assert!(matches!(handle.join().await, Err(TestError::Gone(_))));
    }
}
