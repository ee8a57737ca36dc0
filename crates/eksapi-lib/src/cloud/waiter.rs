//! Bounded polling for remote state transitions

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Poll `probe` every `interval` until it yields `Some`, or fail with
/// [`Error::Timeout`] once `timeout` elapses.
///
/// Retryable probe errors are logged and polling continues; any other
/// error ends the wait.
pub async fn wait_until<F, Fut, T>(
    operation: &str,
    id: &str,
    timeout: Duration,
    interval: Duration,
    mut probe: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let poll = async {
        loop {
            match probe().await {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => debug!(operation = %operation, id = %id, "Still waiting"),
                Err(e) if e.is_retryable() => {
                    warn!(operation = %operation, id = %id, error = %e, "Probe failed, will retry")
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(interval).await;
        }
    };

    match tokio::time::timeout(timeout, poll).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(operation, id, timeout)),
    }
}

/// Run a single remote call under a deadline
///
/// An elapsed deadline is reported as a transient failure so the caller's
/// retry policy can decide what to do with it.
pub async fn with_deadline<Fut, T>(operation: &str, deadline: Duration, call: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(Error::transient(
            operation,
            format!("call exceeded {:?} deadline", deadline),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_returns_value() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let value = wait_until(
            "stack creation",
            "stack-1",
            Duration::from_secs(60),
            Duration::from_secs(5),
            || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 3 {
                        Ok(None)
                    } else {
                        Ok(Some("CREATE_COMPLETE"))
                    }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(value, "CREATE_COMPLETE");
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_times_out() {
        let result: Result<()> = wait_until(
            "cluster activation",
            "cluster-1",
            Duration::from_secs(30),
            Duration::from_secs(5),
            || async { Ok(None) },
        )
        .await;

        match result {
            Err(Error::Timeout { operation, id, timeout }) => {
                assert_eq!(operation, "cluster activation");
                assert_eq!(id, "cluster-1");
                assert_eq!(timeout, Duration::from_secs(30));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_tolerates_transient_errors() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let value = wait_until(
            "nodegroup",
            "ng",
            Duration::from_secs(60),
            Duration::from_secs(1),
            || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(Error::transient("DescribeNodegroup", "throttled"))
                    } else {
                        Ok(Some(7))
                    }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_stops_on_fatal_error() {
        let result: Result<()> = wait_until(
            "cluster",
            "c",
            Duration::from_secs(60),
            Duration::from_secs(1),
            || async { Err(Error::cloud("DescribeCluster", "cluster FAILED")) },
        )
        .await;

        assert!(matches!(result, Err(Error::Cloud { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_deadline_reports_transient() {
        let result: Result<()> = with_deadline("DescribeStacks", Duration::from_secs(15), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.is_retryable());
    }
}
