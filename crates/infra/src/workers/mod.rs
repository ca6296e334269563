//! Long-running background tasks.

pub mod projection_worker;

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use projection_worker::ProjectionHandler;

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.join.await {
            warn!(worker = self.name, error = %err, "worker task did not stop cleanly");
        }
    }
}

/// Spawn `make_run` on the runtime and restart it after `restart_delay`
/// whenever it returns an error.
///
/// The worker stops for good once `cancel` fires or when a run returns
/// `Ok(())`. Each run receives a child token of `cancel`.
pub fn spawn_supervised<F, Fut, E>(
    name: &'static str,
    cancel: CancellationToken,
    restart_delay: Duration,
    mut make_run: F,
) -> WorkerHandle
where
    F: FnMut(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let token = cancel.clone();
    let join = tokio::spawn(async move {
        let mut restarts: u64 = 0;
        loop {
            if token.is_cancelled() {
                break;
            }
            match make_run(token.child_token()).await {
                Ok(()) => {
                    info!(worker = name, "worker finished");
                    break;
                }
                Err(_) if token.is_cancelled() => break,
                Err(err) => {
                    restarts += 1;
                    warn!(
                        worker = name,
                        error = %err,
                        restarts,
                        delay_ms = restart_delay.as_millis() as u64,
                        "worker failed, restarting"
                    );
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(restart_delay) => {}
                    }
                }
            }
        }
        info!(worker = name, "worker stopped");
    });

    WorkerHandle { name, cancel, join }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn failed_runs_are_restarted_until_one_succeeds() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let handle = spawn_supervised(
            "flaky",
            CancellationToken::new(),
            Duration::from_millis(5),
            move |_cancel| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("boom")
                    } else {
                        Ok(())
                    }
                }
            },
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while !handle.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker should finish");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_a_blocked_worker() {
        let handle = spawn_supervised(
            "idle",
            CancellationToken::new(),
            Duration::from_millis(5),
            |cancel: CancellationToken| async move {
                cancel.cancelled().await;
                Err::<(), _>("cancelled")
            },
        );
        assert_eq!(handle.name(), "idle");
        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("shutdown should complete");
    }
}
