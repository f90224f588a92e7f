// D-Bus connection setup with retry

use crate::error::Result;
use std::time::Duration;
use tokio::time::sleep;
use zbus::Connection;

/// Retry policy for establishing the system bus connection
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    max_retries: usize,
    retry_delay: Duration,
    connection_timeout: Duration,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl ConnectionManager {
    pub fn new(max_retries: usize, retry_delay: Duration, connection_timeout: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
            connection_timeout,
        }
    }

    /// Connect to the system bus, retrying transient failures
    pub async fn connect_systemd(&self) -> Result<Connection> {
        self.with_retry("system bus connection", || async {
            let conn = tokio::time::timeout(self.connection_timeout, Connection::system())
                .await
                .map_err(|_| anyhow::anyhow!("Connection timeout"))?
                .map_err(|e| anyhow::anyhow!("Failed to connect: {}", e))?;
            Ok(conn)
        })
        .await
    }

    /// Execute an operation, retrying up to `max_retries` attempts
    pub async fn with_retry<F, T, Fut>(&self, operation_name: &str, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut last_error = None;

        for attempt in 1..=self.max_retries {
            match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        tracing::info!("'{}' succeeded on attempt {}", operation_name, attempt);
                    }
                    return Ok(result);
                }
                Err(error) => {
                    tracing::warn!("'{}' failed on attempt {}: {}", operation_name, attempt, error);
                    let permanent = is_permanent(&error);
                    last_error = Some(error);

                    if permanent {
                        break;
                    }
                    if attempt < self.max_retries {
                        sleep(self.retry_delay).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("'{}' was never attempted", operation_name)))
    }
}

/// Errors that will not go away by trying again
fn is_permanent(error: &anyhow::Error) -> bool {
    let message = error.to_string().to_lowercase();
    ["permission denied", "access denied", "no such file", "invalid argument"]
        .iter()
        .any(|needle| message.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> ConnectionManager {
        ConnectionManager::new(3, Duration::from_millis(10), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = fast()
            .with_retry("flaky", move || {
                let count = counter.clone();
                async move {
                    if count.fetch_add(1, Ordering::SeqCst) < 1 {
                        Err(anyhow::anyhow!("Simulated failure"))
                    } else {
                        Ok("connected")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "connected");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<()> = fast()
            .with_retry("denied", move || {
                let count = counter.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow::anyhow!("Access denied"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<()> = fast()
            .with_retry("down", move || {
                let count = counter.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow::anyhow!("bus unavailable"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
