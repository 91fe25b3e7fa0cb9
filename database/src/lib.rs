use memefeed_core::{CoreError, DatabaseError, Embedding, EMBEDDING_DIM};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

mod engagement;
mod posts;
mod reactions;
mod users;


#[derive(Debug, Clone)]
pub struct Database {
    connection_string: String,
    embedding_dimension: usize,
    pool: Option<SqlitePool>,
}

impl Database {
    pub fn new(connection_string: String) -> Self {
        Self {
            connection_string,
            embedding_dimension: EMBEDDING_DIM,
            pool: None,
        }
    }

    /// Length every stored post embedding must have.
    pub fn with_embedding_dimension(mut self, dimension: usize) -> Self {
        self.embedding_dimension = dimension;
        self
    }

    pub fn embedding_dimension(&self) -> usize {
        self.embedding_dimension
    }

    pub async fn connect(&mut self) -> Result<(), CoreError> {
        let options = SqliteConnectOptions::from_str(&self.connection_string)
            .map_err(|e| DatabaseError::ConnectionFailed {
                reason: e.to_string(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed {
                reason: e.to_string(),
            })?;

        info!("Connected to database {}", self.connection_string);
        self.pool = Some(pool);
        Ok(())
    }

    pub async fn run_migrations(&self) -> Result<(), CoreError> {
        sqlx::migrate!("./migrations")
            .run(self.pool()?)
            .await
            .map_err(|e| DatabaseError::MigrationFailed {
                migration: e.to_string(),
            })?;

        debug!("Database migrations applied");
        Ok(())
    }

    pub async fn close(&self) {
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
    }

    fn pool(&self) -> Result<&SqlitePool, DatabaseError> {
        self.pool.as_ref().ok_or_else(|| DatabaseError::ConnectionFailed {
            reason: "database is not connected".to_string(),
        })
    }

    fn check_dimension(&self, vector: &[f64]) -> Result<(), CoreError> {
        if vector.len() != self.embedding_dimension {
            return Err(memefeed_core::EmbeddingError::DimensionMismatch {
                expected: self.embedding_dimension,
                actual: vector.len(),
            }
            .into());
        }
        Ok(())
    }
}

pub(crate) fn encode_vector(vector: &[f64]) -> Result<String, CoreError> {
    Ok(serde_json::to_string(vector)?)
}

pub(crate) fn decode_vector(column: &str, raw: Option<String>) -> Result<Option<Embedding>, CoreError> {
    raw.map(|text| {
        serde_json::from_str::<Embedding>(&text).map_err(|e| {
            DatabaseError::CorruptValue {
                column: column.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    })
    .transpose()
}

pub(crate) fn parse_column<T>(column: &str, raw: &str) -> Result<T, CoreError>
where
    T: FromStr,
{
    raw.parse::<T>().map_err(|_| {
        DatabaseError::CorruptValue {
            column: column.to_string(),
            reason: format!("unexpected value '{}'", raw),
        }
        .into()
    })
}
