use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

/// The concurrency substrate the Connection Engine depends on. On a real
/// async runtime, spawning a task and deferring work past the current poll
/// fall out of `tokio::spawn`/`tokio::task::yield_now` directly wherever the
/// Engine needs them, so the only primitive worth abstracting behind a
/// swappable seam is the one the Call Table actually depends on: racing a
/// future against a timeout.
#[async_trait]
pub trait Scheduler: Send + Sync + 'static {
    /// Race `fut` against a one-shot timer; `Err` on expiry.
    async fn timeout<F, T>(&self, duration: Duration, fut: F) -> Result<T, ()>
    where
        F: Future<Output = T> + Send,
        T: Send;
}

/// The only production [`Scheduler`]: the ambient Tokio runtime.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioScheduler;

#[async_trait]
impl Scheduler for TokioScheduler {
    async fn timeout<F, T>(&self, duration: Duration, fut: F) -> Result<T, ()>
    where
        F: Future<Output = T> + Send,
        T: Send,
    {
        tokio::time::timeout(duration, fut).await.map_err(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timeout_resolves_when_future_is_fast() {
        let scheduler = TokioScheduler;
        let result = scheduler
            .timeout(Duration::from_millis(50), async { 42 })
            .await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn timeout_expires_when_future_is_slow() {
        let scheduler = TokioScheduler;
        let result = scheduler
            .timeout(Duration::from_millis(5), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
            })
            .await;
        assert_eq!(result, Err(()));
    }
}
