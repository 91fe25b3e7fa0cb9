//! Error recovery strategies for background work.
//!
//! Request-path code propagates errors straight to the caller. Work that runs
//! detached from a request (queued preference recomputation, embedding
//! backfill) has nobody to propagate to, so it picks a strategy here instead.

use crate::{CoreError, DatabaseError, ErrorExt};
use std::time::Duration;
use tracing::info;

/// Recovery strategy for handling errors
#[derive(Debug, Clone)]
pub enum RecoveryStrategy {
    /// Retry the operation with exponential backoff
    RetryWithBackoff {
        max_attempts: usize,
        initial_delay: Duration,
        max_delay: Duration,
    },
    /// Skip the operation and continue
    Skip,
    /// Fail immediately
    Fail,
}

/// Result of an error recovery attempt
#[derive(Debug)]
pub enum RecoveryResult<T> {
    /// Recovery was successful, operation can continue
    Recovered(T),
    /// Recovery failed, operation should be skipped
    Skipped,
    /// Recovery failed, error should be propagated
    Failed(CoreError),
}

impl<T> RecoveryResult<T> {
    pub fn is_recovered(&self) -> bool {
        matches!(self, RecoveryResult::Recovered(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, RecoveryResult::Skipped)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, RecoveryResult::Failed(_))
    }

    /// Returns the value if recovered, None otherwise
    pub fn ok(self) -> Option<T> {
        match self {
            RecoveryResult::Recovered(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the error if failed, None otherwise
    pub fn err(self) -> Option<CoreError> {
        match self {
            RecoveryResult::Failed(error) => Some(error),
            _ => None,
        }
    }
}

/// Error recovery handler that provides strategies for different error types
pub struct ErrorRecovery;

impl ErrorRecovery {
    /// Determine the appropriate recovery strategy for a given error
    pub fn determine_strategy(error: &CoreError) -> RecoveryStrategy {
        match error {
            CoreError::Network(_) | CoreError::Llm(_) => RecoveryStrategy::RetryWithBackoff {
                max_attempts: 3,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
            },

            CoreError::Database(db_error) => match db_error {
                DatabaseError::DatabaseLocked => RecoveryStrategy::RetryWithBackoff {
                    max_attempts: 5,
                    initial_delay: Duration::from_millis(100),
                    max_delay: Duration::from_secs(5),
                },
                DatabaseError::StorageReadFailure { .. }
                | DatabaseError::StorageWriteFailure { .. }
                | DatabaseError::ConnectionFailed { .. } => RecoveryStrategy::RetryWithBackoff {
                    max_attempts: 3,
                    initial_delay: Duration::from_millis(250),
                    max_delay: Duration::from_secs(5),
                },
                _ => RecoveryStrategy::Fail,
            },

            // A malformed vector will not fix itself; move on to the next item
            CoreError::Embedding(_) => RecoveryStrategy::Skip,

            CoreError::Config(_) => RecoveryStrategy::Fail,

            CoreError::Timeout { .. } => RecoveryStrategy::RetryWithBackoff {
                max_attempts: 1,
                initial_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(10),
            },

            CoreError::InvalidInput { .. } | CoreError::NotFound { .. } => RecoveryStrategy::Skip,

            CoreError::Internal { .. } => RecoveryStrategy::Fail,

            CoreError::Io(_) | CoreError::Serialization(_) => RecoveryStrategy::RetryWithBackoff {
                max_attempts: 3,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
            },
        }
    }

    /// Apply the recovery strategy to an operation
    pub async fn apply_strategy<F, T, Fut>(
        strategy: RecoveryStrategy,
        mut operation: F,
    ) -> RecoveryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, CoreError>>,
    {
        match strategy {
            RecoveryStrategy::RetryWithBackoff {
                max_attempts,
                initial_delay,
                max_delay,
            } => Self::retry_with_backoff(operation, max_attempts, initial_delay, max_delay).await,
            RecoveryStrategy::Skip => RecoveryResult::Skipped,
            RecoveryStrategy::Fail => match operation().await {
                Ok(value) => RecoveryResult::Recovered(value),
                Err(error) => RecoveryResult::Failed(error),
            },
        }
    }

    /// Retry an operation with exponential backoff
    async fn retry_with_backoff<F, T, Fut>(
        mut operation: F,
        max_attempts: usize,
        initial_delay: Duration,
        max_delay: Duration,
    ) -> RecoveryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, CoreError>>,
    {
        let mut attempt = 0;
        let mut delay = initial_delay;

        loop {
            match operation().await {
                Ok(result) => return RecoveryResult::Recovered(result),
                Err(error) => {
                    attempt += 1;

                    if attempt >= max_attempts || !error.is_retryable() {
                        return RecoveryResult::Failed(error);
                    }

                    if let Some(retry_delay) = error.retry_after() {
                        delay = retry_delay;
                    }

                    if delay > max_delay {
                        delay = max_delay;
                    }

                    info!(
                        "Recovery attempt {}/{} failed. Retrying after {:?}: {}",
                        attempt,
                        max_attempts,
                        delay,
                        error.user_friendly_message()
                    );

                    tokio::time::sleep(delay).await;

                    delay = std::cmp::min(delay * 2, max_delay);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConfigError, EmbeddingError};
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_retry_with_backoff_failure() {
        let strategy = RecoveryStrategy::RetryWithBackoff {
            max_attempts: 2,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
        };

        let result: RecoveryResult<&str> = ErrorRecovery::apply_strategy(strategy, || async {
            Err(CoreError::Database(DatabaseError::DatabaseLocked))
        })
        .await;

        assert!(result.is_failed());
    }

    #[tokio::test]
    async fn test_retry_recovers_after_transient_failure() {
        let calls = AtomicUsize::new(0);
        let strategy = RecoveryStrategy::RetryWithBackoff {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };

        let result = ErrorRecovery::apply_strategy(strategy, || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(CoreError::Database(DatabaseError::DatabaseLocked))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert!(result.is_recovered());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_skip_strategy() {
        let strategy = RecoveryStrategy::Skip;
        let result: RecoveryResult<&str> = ErrorRecovery::apply_strategy(strategy, || async {
            Err(CoreError::InvalidInput {
                message: "test".to_string(),
            })
        })
        .await;

        assert!(result.is_skipped());
    }

    #[tokio::test]
    async fn test_fail_strategy_runs_once() {
        let calls = AtomicUsize::new(0);
        let result: RecoveryResult<()> =
            ErrorRecovery::apply_strategy(RecoveryStrategy::Fail, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(CoreError::Internal {
                        message: "boom".to_string(),
                    })
                }
            })
            .await;

        assert!(result.is_failed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_determine_strategy() {
        let io_error = CoreError::Io(io::Error::new(io::ErrorKind::Other, "test"));
        let strategy = ErrorRecovery::determine_strategy(&io_error);
        assert!(matches!(
            strategy,
            RecoveryStrategy::RetryWithBackoff { .. }
        ));

        let config_error = CoreError::Config(ConfigError::ValidationFailed {
            reason: "test".to_string(),
        });
        let strategy = ErrorRecovery::determine_strategy(&config_error);
        assert!(matches!(strategy, RecoveryStrategy::Fail));

        let db_locked_error = CoreError::Database(DatabaseError::DatabaseLocked);
        let strategy = ErrorRecovery::determine_strategy(&db_locked_error);
        assert!(matches!(
            strategy,
            RecoveryStrategy::RetryWithBackoff {
                max_attempts: 5,
                ..
            }
        ));

        let mismatch = CoreError::Embedding(EmbeddingError::DimensionMismatch {
            expected: 3,
            actual: 2,
        });
        let strategy = ErrorRecovery::determine_strategy(&mismatch);
        assert!(matches!(strategy, RecoveryStrategy::Skip));
    }
}
