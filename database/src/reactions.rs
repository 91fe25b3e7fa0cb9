use chrono::{DateTime, Utc};
use memefeed_core::{
    CoreError, DatabaseError, PostId, Reaction, ReactionChange, ReactionInput, ReactionKind,
    ReactionSummary, UserId,
};
use preference_engine::{PreferenceSink, ReactionHook, ReactionSource};
use sqlx::Row;
use tracing::{debug, warn};

use crate::{decode_vector, encode_vector, parse_column, Database};

impl Database {
    /// Creates, replaces or clears the reaction of `user` to `post`.
    ///
    /// At most one reaction exists per (user, post): a new kind replaces the
    /// old one and `None` deletes it. The write is committed first; `hook` then
    /// runs with the user's id for every change except [`ReactionChange::Unchanged`]
    /// (clearing a reaction that does not exist). A hook error is returned to
    /// the caller but does not roll the reaction back.
    pub async fn set_reaction<H>(
        &self,
        user: UserId,
        post: PostId,
        kind: Option<ReactionKind>,
        hook: &H,
    ) -> Result<ReactionChange, CoreError>
    where
        H: ReactionHook,
    {
        let write = |e| DatabaseError::write("saving reaction", e);
        let read = |e| DatabaseError::read("loading reaction", e);
        let mut tx = self.pool()?.begin().await.map_err(write)?;

        let post_exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM posts WHERE id = ?")
            .bind(post)
            .fetch_optional(&mut *tx)
            .await
            .map_err(read)?;
        if post_exists.is_none() {
            return Err(CoreError::NotFound {
                resource: format!("post {}", post),
            });
        }

        let user_exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM users WHERE id = ?")
            .bind(user)
            .fetch_optional(&mut *tx)
            .await
            .map_err(read)?;
        if user_exists.is_none() {
            return Err(CoreError::NotFound {
                resource: format!("user {}", user),
            });
        }

        let existing: Option<String> =
            sqlx::query_scalar("SELECT kind FROM reactions WHERE user_id = ? AND post_id = ?")
                .bind(user)
                .bind(post)
                .fetch_optional(&mut *tx)
                .await
                .map_err(read)?;

        let now = Utc::now();
        let change = match (existing, kind) {
            (None, None) => ReactionChange::Unchanged,
            (None, Some(kind)) => {
                sqlx::query(
                    "INSERT INTO reactions (user_id, post_id, kind, created_at, updated_at)
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(user)
                .bind(post)
                .bind(kind.as_str())
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(write)?;
                ReactionChange::Created
            }
            (Some(_), Some(kind)) => {
                sqlx::query(
                    "UPDATE reactions SET kind = ?, updated_at = ? WHERE user_id = ? AND post_id = ?",
                )
                .bind(kind.as_str())
                .bind(now)
                .bind(user)
                .bind(post)
                .execute(&mut *tx)
                .await
                .map_err(write)?;
                ReactionChange::Updated
            }
            (Some(_), None) => {
                sqlx::query("DELETE FROM reactions WHERE user_id = ? AND post_id = ?")
                    .bind(user)
                    .bind(post)
                    .execute(&mut *tx)
                    .await
                    .map_err(write)?;
                ReactionChange::Deleted
            }
        };

        tx.commit().await.map_err(write)?;
        debug!("Reaction of user {} to post {}: {:?}", user, post, change);

        if change.is_mutation() {
            if let Err(e) = hook.on_reactions_changed(user).await {
                warn!(
                    "Reaction of user {} saved but preference refresh failed: {}",
                    user, e
                );
                return Err(e);
            }
        }

        Ok(change)
    }

    pub async fn get_reaction(
        &self,
        user: UserId,
        post: PostId,
    ) -> Result<Option<Reaction>, CoreError> {
        let row = sqlx::query(
            "SELECT kind, created_at, updated_at FROM reactions WHERE user_id = ? AND post_id = ?",
        )
        .bind(user)
        .bind(post)
        .fetch_optional(self.pool()?)
        .await
        .map_err(|e| DatabaseError::read("loading reaction", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let read = |e| DatabaseError::read("decoding reaction", e);
        let kind: String = row.try_get("kind").map_err(read)?;
        Ok(Some(Reaction {
            user_id: user,
            post_id: post,
            kind: parse_column("reactions.kind", &kind)?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(read)?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at").map_err(read)?,
        }))
    }

    /// Per-kind reaction counts for a post. Rows whose kind is no longer known
    /// are left out.
    pub async fn reaction_summary(&self, post: PostId) -> Result<ReactionSummary, CoreError> {
        let rows = sqlx::query(
            "SELECT kind, COUNT(*) AS total FROM reactions WHERE post_id = ? GROUP BY kind",
        )
        .bind(post)
        .fetch_all(self.pool()?)
        .await
        .map_err(|e| DatabaseError::read("counting reactions", e))?;

        let mut summary = ReactionSummary::default();
        for row in rows {
            let read = |e| DatabaseError::read("decoding reaction counts", e);
            let kind: String = row.try_get("kind").map_err(read)?;
            let total: i64 = row.try_get("total").map_err(read)?;

            if let Ok(kind) = kind.parse::<ReactionKind>() {
                summary.add(kind, total as u32);
            }
        }
        Ok(summary)
    }
}

impl ReactionSource for Database {
    async fn reaction_inputs(&self, user: UserId) -> Result<Vec<ReactionInput>, CoreError> {
        let rows = sqlx::query(
            "SELECT r.kind, p.embedding FROM reactions r
             JOIN posts p ON p.id = r.post_id
             WHERE r.user_id = ? AND p.embedding IS NOT NULL",
        )
        .bind(user)
        .fetch_all(self.pool()?)
        .await
        .map_err(|e| DatabaseError::read("loading reactions", e))?;

        rows.iter()
            .map(|row| -> Result<ReactionInput, CoreError> {
                let read = |e| DatabaseError::read("decoding reactions", e);
                let kind: String = row.try_get("kind").map_err(read)?;
                let embedding =
                    decode_vector("posts.embedding", row.try_get("embedding").map_err(read)?)?;
                Ok(ReactionInput::new(kind, embedding))
            })
            .collect()
    }
}

impl PreferenceSink for Database {
    async fn store_preference(
        &self,
        user: UserId,
        preference: Option<&[f64]>,
    ) -> Result<(), CoreError> {
        let encoded = preference.map(encode_vector).transpose()?;

        // Single-column write; updated_at stays untouched.
        let result = sqlx::query("UPDATE users SET preferences_embedding = ? WHERE id = ?")
            .bind(encoded)
            .bind(user)
            .execute(self.pool()?)
            .await
            .map_err(|e| DatabaseError::write("storing user preferences", e))?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound {
                resource: format!("user {}", user),
            });
        }
        Ok(())
    }
}
