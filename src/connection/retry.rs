//! Retry policy for idempotent transport operations, narrowed from the
//! teacher's exponential-backoff `RetryPolicy` down to the single
//! documented behavior in spec.md §7: "transport failures are retried
//! once with fresh connect on `ConnectFailed` and `SshTimeout` during
//! idempotent operations ... `uploadFile` and `executeCommand` for
//! mutating playbooks are not retried automatically."

use std::future::Future;
use tracing::{debug, warn};

use crate::error::Error;

/// Runs `op` once, and if it fails with a retryable error, reconnects
/// via `reconnect` and tries exactly once more. Used only around
/// idempotent operations (info queries, existence checks); callers that
/// run mutating playbooks must call the transport directly.
pub async fn with_single_retry<T, Fut, Op, ReconnectFut, Reconnect>(
    mut op: Op,
    mut reconnect: Reconnect,
) -> Result<T, Error>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
    Reconnect: FnMut() -> ReconnectFut,
    ReconnectFut: Future<Output = Result<(), Error>>,
{
    match op().await {
        Ok(v) => Ok(v),
        Err(e) if e.is_retryable_for_idempotent_ops() => {
            warn!(error = %e, "retrying idempotent operation after fresh connect");
            reconnect().await?;
            debug!("retry attempt after reconnect");
            op().await
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_exactly_once_on_connect_failed() {
        let attempts = AtomicU32::new(0);
        let reconnects = AtomicU32::new(0);
        let result = with_single_retry(
            || async {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err(Error::ConnectFailed {
                        host: "h".into(),
                        port: 22,
                        message: "refused".into(),
                    })
                } else {
                    Ok(42)
                }
            },
            || async {
                reconnects.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(reconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn does_not_retry_non_retryable_errors() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), Error> = with_single_retry(
            || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::AuthFailed {
                    host: "h".into(),
                    user: "u".into(),
                    message: "denied".into(),
                })
            },
            || async { Ok(()) },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
