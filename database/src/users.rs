use chrono::{DateTime, Utc};
use memefeed_core::{CoreError, DatabaseError, Embedding, User, UserId};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::{decode_vector, Database};

const USER_COLUMNS: &str =
    "id, external_id, name, email, avatar_url, preferences_embedding, created_at, updated_at";

impl Database {
    /// Returns the user behind an auth subject, creating it on first sight.
    pub async fn get_or_create_user(&self, external_id: &str) -> Result<User, CoreError> {
        let pool = self.pool()?;
        let now = Utc::now();

        let inserted = sqlx::query(
            "INSERT INTO users (id, external_id, created_at, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (external_id) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(external_id)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await
        .map_err(|e| DatabaseError::write("creating user", e))?;

        if inserted.rows_affected() > 0 {
            info!("Created user for external id {}", external_id);
        }

        let row = sqlx::query(&format!(
            "SELECT {} FROM users WHERE external_id = ?",
            USER_COLUMNS
        ))
        .bind(external_id)
        .fetch_one(pool)
        .await
        .map_err(|e| DatabaseError::read("loading user", e))?;

        user_from_row(&row)
    }

    pub async fn get_user(&self, id: UserId) -> Result<Option<User>, CoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS))
            .bind(id)
            .fetch_optional(self.pool()?)
            .await
            .map_err(|e| DatabaseError::read("loading user", e))?;

        row.as_ref().map(user_from_row).transpose()
    }

    pub async fn update_user_profile(
        &self,
        id: UserId,
        name: Option<&str>,
        email: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<(), CoreError> {
        let result = sqlx::query(
            "UPDATE users SET name = ?, email = ?, avatar_url = ?, updated_at = ? WHERE id = ?",
        )
        .bind(name)
        .bind(email)
        .bind(avatar_url)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool()?)
        .await
        .map_err(|e| DatabaseError::write("updating user profile", e))?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound {
                resource: format!("user {}", id),
            });
        }
        Ok(())
    }

    pub async fn get_user_preference(&self, id: UserId) -> Result<Option<Embedding>, CoreError> {
        let raw: Option<Option<String>> =
            sqlx::query_scalar("SELECT preferences_embedding FROM users WHERE id = ?")
                .bind(id)
                .fetch_optional(self.pool()?)
                .await
                .map_err(|e| DatabaseError::read("loading user preferences", e))?;

        match raw {
            Some(raw) => decode_vector("users.preferences_embedding", raw),
            None => Err(CoreError::NotFound {
                resource: format!("user {}", id),
            }),
        }
    }

    pub async fn all_user_ids(&self) -> Result<Vec<UserId>, CoreError> {
        let ids: Vec<UserId> = sqlx::query_scalar("SELECT id FROM users ORDER BY created_at")
            .fetch_all(self.pool()?)
            .await
            .map_err(|e| DatabaseError::read("listing users", e))?;
        Ok(ids)
    }
}

fn user_from_row(row: &SqliteRow) -> Result<User, CoreError> {
    let read = |e| DatabaseError::read("decoding user", e);

    Ok(User {
        id: row.try_get("id").map_err(read)?,
        external_id: row.try_get("external_id").map_err(read)?,
        name: row.try_get("name").map_err(read)?,
        email: row.try_get("email").map_err(read)?,
        avatar_url: row.try_get("avatar_url").map_err(read)?,
        preferences_embedding: decode_vector(
            "users.preferences_embedding",
            row.try_get("preferences_embedding").map_err(read)?,
        )?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(read)?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at").map_err(read)?,
    })
}
