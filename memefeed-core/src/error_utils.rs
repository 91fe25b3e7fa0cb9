use crate::error::*;
use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::time::Duration;
use tracing::{error, info, warn};

/// Classification and logging shared by every error type in the workspace.
pub trait ErrorExt: Display {
    /// Stable machine-readable code, e.g. `DB_READ_FAILED`.
    fn error_code(&self) -> &'static str;

    fn is_retryable(&self) -> bool;

    fn user_friendly_message(&self) -> String;

    fn retry_after(&self) -> Option<Duration> {
        None
    }

    fn log_error(&self) -> &Self {
        error!(code = self.error_code(), "{}", self);
        self
    }

    fn log_warn(&self) -> &Self {
        warn!(code = self.error_code(), "{}", self);
        self
    }
}

impl ErrorExt for CoreError {
    fn error_code(&self) -> &'static str {
        match self {
            CoreError::Database(e) => e.error_code(),
            CoreError::Llm(e) => e.error_code(),
            CoreError::Embedding(e) => e.error_code(),
            CoreError::Config(e) => e.error_code(),
            CoreError::Io(_) => "IO",
            CoreError::Serialization(_) => "SERIALIZATION",
            CoreError::Network(_) => "NETWORK",
            CoreError::InvalidInput { .. } => "INVALID_INPUT",
            CoreError::Timeout { .. } => "TIMEOUT",
            CoreError::NotFound { .. } => "NOT_FOUND",
            CoreError::Internal { .. } => "INTERNAL",
        }
    }

    fn is_retryable(&self) -> bool {
        match self {
            CoreError::Database(e) => e.is_retryable(),
            CoreError::Llm(e) => e.is_retryable(),
            CoreError::Embedding(e) => e.is_retryable(),
            CoreError::Config(e) => e.is_retryable(),
            CoreError::Network(_) | CoreError::Timeout { .. } => true,
            _ => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            CoreError::Database(e) => e.retry_after(),
            CoreError::Llm(e) => e.retry_after(),
            CoreError::Timeout { seconds } => Some(Duration::from_secs(*seconds)),
            CoreError::Network(_) => Some(Duration::from_secs(2)),
            _ => None,
        }
    }

    fn user_friendly_message(&self) -> String {
        match self {
            CoreError::Database(e) => e.user_friendly_message(),
            CoreError::Llm(e) => e.user_friendly_message(),
            CoreError::Embedding(e) => e.user_friendly_message(),
            CoreError::Config(e) => e.user_friendly_message(),
            CoreError::Network(_) => "Could not reach the embeddings service.".to_string(),
            CoreError::InvalidInput { message } => format!("Rejected input: {}", message),
            CoreError::Timeout { seconds } => format!("Gave up after {} seconds.", seconds),
            CoreError::NotFound { resource } => format!("No such {}.", resource),
            CoreError::Io(_) | CoreError::Serialization(_) | CoreError::Internal { .. } => {
                format!("Feed backend failure: {}", self)
            }
        }
    }
}

impl ErrorExt for DatabaseError {
    fn error_code(&self) -> &'static str {
        match self {
            DatabaseError::ConnectionFailed { .. } => "DB_CONNECTION_FAILED",
            DatabaseError::MigrationFailed { .. } => "DB_MIGRATION_FAILED",
            DatabaseError::StorageReadFailure { .. } => "DB_READ_FAILED",
            DatabaseError::StorageWriteFailure { .. } => "DB_WRITE_FAILED",
            DatabaseError::CorruptValue { .. } => "DB_CORRUPT_VALUE",
            DatabaseError::ConstraintViolation { .. } => "DB_CONSTRAINT_VIOLATION",
            DatabaseError::DatabaseLocked => "DB_LOCKED",
            DatabaseError::Sql(_) => "DB_SQL_ERROR",
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(
            self,
            DatabaseError::DatabaseLocked
                | DatabaseError::ConnectionFailed { .. }
                | DatabaseError::StorageReadFailure { .. }
                | DatabaseError::StorageWriteFailure { .. }
        )
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            DatabaseError::DatabaseLocked => Some(Duration::from_millis(100)),
            _ if self.is_retryable() => Some(Duration::from_secs(1)),
            _ => None,
        }
    }

    fn user_friendly_message(&self) -> String {
        match self {
            DatabaseError::StorageReadFailure { operation, .. } => {
                format!("Feed store unavailable while {}.", operation)
            }
            DatabaseError::StorageWriteFailure { operation, .. } => {
                format!("Feed store rejected the write while {}.", operation)
            }
            DatabaseError::CorruptValue { column, .. } => {
                format!("Column {} holds a value this version cannot decode.", column)
            }
            DatabaseError::DatabaseLocked => "Feed store is busy.".to_string(),
            DatabaseError::ConnectionFailed { reason } => {
                format!("Cannot open the feed store: {}", reason)
            }
            DatabaseError::MigrationFailed { migration } => {
                format!("Schema upgrade failed: {}", migration)
            }
            DatabaseError::ConstraintViolation { .. } | DatabaseError::Sql(_) => {
                format!("Feed store error: {}", self)
            }
        }
    }
}

impl ErrorExt for LlmError {
    fn error_code(&self) -> &'static str {
        match self {
            LlmError::InvalidApiKey { .. } => "EMBED_API_KEY",
            LlmError::RateLimitExceeded { .. } => "EMBED_RATE_LIMITED",
            LlmError::ModelNotAvailable { .. } => "EMBED_MODEL_UNAVAILABLE",
            LlmError::ServiceUnavailable { .. } => "EMBED_SERVICE_DOWN",
            LlmError::RequestTimeout { .. } => "EMBED_TIMEOUT",
            LlmError::RequestRejected { .. } => "EMBED_REQUEST_REJECTED",
            LlmError::InvalidResponseFormat { .. } => "EMBED_BAD_RESPONSE",
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimitExceeded { .. }
                | LlmError::ServiceUnavailable { .. }
                | LlmError::RequestTimeout { .. }
        )
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimitExceeded { retry_after, .. } => {
                Some(Duration::from_secs(*retry_after))
            }
            LlmError::ServiceUnavailable { .. } | LlmError::RequestTimeout { .. } => {
                Some(Duration::from_secs(10))
            }
            _ => None,
        }
    }

    fn user_friendly_message(&self) -> String {
        match self {
            LlmError::InvalidApiKey { provider } => {
                format!("{} refused the API key; set OPENAI_API_KEY.", provider)
            }
            LlmError::RateLimitExceeded {
                provider,
                retry_after,
            } => format!("{} is throttling embeddings for {}s.", provider, retry_after),
            LlmError::ModelNotAvailable { model } => {
                format!("Embedding model {} is not available.", model)
            }
            LlmError::RequestRejected {
                provider,
                status_code,
            } => format!("{} rejected the post text ({}).", provider, status_code),
            LlmError::ServiceUnavailable { provider }
            | LlmError::RequestTimeout { provider }
            | LlmError::InvalidResponseFormat { provider } => {
                format!("{} could not embed the post right now.", provider)
            }
        }
    }
}

impl ErrorExt for EmbeddingError {
    fn error_code(&self) -> &'static str {
        match self {
            EmbeddingError::DimensionMismatch { .. } => "EMBED_DIMENSION_MISMATCH",
            EmbeddingError::InvalidVector { .. } => "EMBED_INVALID_VECTOR",
            EmbeddingError::EmptyInput { .. } => "EMBED_EMPTY_INPUT",
        }
    }

    // A bad vector stays bad until the post is reprocessed.
    fn is_retryable(&self) -> bool {
        false
    }

    fn user_friendly_message(&self) -> String {
        match self {
            EmbeddingError::DimensionMismatch { expected, actual } => format!(
                "Embedding has {} dimensions but {} were expected.",
                actual, expected
            ),
            EmbeddingError::InvalidVector { reason } => format!("Unusable vector: {}", reason),
            EmbeddingError::EmptyInput { post_id } => {
                format!("Post {} has no description to embed.", post_id)
            }
        }
    }
}

impl ErrorExt for ConfigError {
    fn error_code(&self) -> &'static str {
        match self {
            ConfigError::FileNotFound { .. } => "CONFIG_FILE_NOT_FOUND",
            ConfigError::InvalidValue { .. } => "CONFIG_INVALID_VALUE",
            ConfigError::MissingEnvironmentVariable { .. } => "CONFIG_MISSING_ENV_VAR",
            ConfigError::ValidationFailed { .. } => "CONFIG_VALIDATION_FAILED",
            ConfigError::Parse(_) => "CONFIG_PARSE_ERROR",
        }
    }

    fn is_retryable(&self) -> bool {
        false
    }

    fn user_friendly_message(&self) -> String {
        match self {
            ConfigError::FileNotFound { path } => format!("No configuration at {}.", path),
            ConfigError::InvalidValue { field, value } => {
                format!("{} = {} is not allowed.", field, value)
            }
            ConfigError::MissingEnvironmentVariable { var_name } => {
                format!("{} must be set.", var_name)
            }
            ConfigError::ValidationFailed { reason } => reason.clone(),
            ConfigError::Parse(e) => format!("memefeed.toml does not parse: {}", e),
        }
    }
}

/// Tally of the items a batch job (recompute-all, backfill) could not handle.
///
/// Each failure is logged as it happens; `log_summary` prints one line per
/// error code when the job ends.
#[derive(Debug)]
pub struct ErrorReporter {
    job: &'static str,
    by_code: BTreeMap<&'static str, usize>,
}

impl ErrorReporter {
    pub fn new(job: &'static str) -> Self {
        Self {
            job,
            by_code: BTreeMap::new(),
        }
    }

    pub fn report(&mut self, subject: impl Display, error: &CoreError) {
        error!(
            job = self.job,
            code = error.error_code(),
            "{} failed: {}",
            subject,
            error
        );
        *self.by_code.entry(error.error_code()).or_default() += 1;
    }

    pub fn failures(&self) -> usize {
        self.by_code.values().sum()
    }

    pub fn count(&self, code: &str) -> usize {
        self.by_code.get(code).copied().unwrap_or(0)
    }

    pub fn log_summary(&self) {
        if self.by_code.is_empty() {
            info!("{}: no failures", self.job);
            return;
        }
        for (code, count) in &self.by_code {
            warn!("{}: {} x {}", self.job, count, code);
        }
    }
}

impl Display for ErrorReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failures in {}", self.failures(), self.job)?;
        for (code, count) in &self.by_code {
            write!(f, ", {} {}", count, code)?;
        }
        Ok(())
    }
}
