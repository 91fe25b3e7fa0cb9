use chrono::{DateTime, Utc};
use memefeed_core::{
    CoreError, DatabaseError, NewPost, Post, PostFilter, PostId, PostStatus, UserId,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{decode_vector, encode_vector, parse_column, Database};

const POST_COLUMNS: &str = "id, title, description, post_type, status, provider, external_link, \
                            embedding, created_at, updated_at";

impl Database {
    pub async fn create_post(&self, new_post: NewPost) -> Result<Post, CoreError> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO posts (id, description, post_type, status, provider, external_link, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(&new_post.description)
        .bind(new_post.post_type.map(|t| t.as_str()))
        .bind(PostStatus::Pending.as_str())
        .bind(&new_post.provider)
        .bind(&new_post.external_link)
        .bind(now)
        .bind(now)
        .execute(self.pool()?)
        .await
        .map_err(|e| DatabaseError::write("creating post", e))?;

        info!("Created post {}", id);
        self.require_post(id).await
    }

    pub async fn get_post(&self, id: PostId) -> Result<Option<Post>, CoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM posts WHERE id = ?", POST_COLUMNS))
            .bind(id)
            .fetch_optional(self.pool()?)
            .await
            .map_err(|e| DatabaseError::read("loading post", e))?;

        match row {
            Some(row) => {
                let mut post = post_from_row(&row)?;
                post.keywords = self.post_keywords(id).await?;
                Ok(Some(post))
            }
            None => Ok(None),
        }
    }

    /// Stores AI-generated title, description and keywords. Keywords are
    /// upper-cased and replace the post's previous set.
    pub async fn update_post_metadata(
        &self,
        id: PostId,
        title: Option<&str>,
        description: Option<&str>,
        keywords: &[String],
    ) -> Result<Post, CoreError> {
        let write = |e| DatabaseError::write("updating post metadata", e);
        let now = Utc::now();
        let mut tx = self.pool()?.begin().await.map_err(write)?;

        let updated = sqlx::query(
            "UPDATE posts SET title = ?, description = ?, updated_at = ? WHERE id = ?",
        )
        .bind(title)
        .bind(description)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(write)?;

        if updated.rows_affected() == 0 {
            return Err(CoreError::NotFound {
                resource: format!("post {}", id),
            });
        }

        sqlx::query("DELETE FROM post_keywords WHERE post_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(write)?;

        for keyword in keywords {
            let name = keyword.trim().to_uppercase();
            if name.is_empty() {
                continue;
            }

            sqlx::query(
                "INSERT INTO keywords (name, created_at) VALUES (?, ?) ON CONFLICT (name) DO NOTHING",
            )
            .bind(&name)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(write)?;

            sqlx::query(
                "INSERT OR IGNORE INTO post_keywords (post_id, keyword_id)
                 SELECT ?, id FROM keywords WHERE name = ?",
            )
            .bind(id)
            .bind(&name)
            .execute(&mut *tx)
            .await
            .map_err(write)?;
        }

        tx.commit().await.map_err(write)?;
        debug!("Updated metadata of post {} ({} keywords)", id, keywords.len());
        self.require_post(id).await
    }

    pub async fn set_post_status(&self, id: PostId, status: PostStatus) -> Result<(), CoreError> {
        let result = sqlx::query("UPDATE posts SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool()?)
            .await
            .map_err(|e| DatabaseError::write("updating post status", e))?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound {
                resource: format!("post {}", id),
            });
        }
        Ok(())
    }

    /// Sets (or, when reprocessing, replaces) a post's content embedding.
    ///
    /// Users who already reacted to the post still hold a preference vector
    /// computed without it, so the post is flagged until
    /// [`Database::clear_preference_refresh`] confirms they were all refreshed.
    pub async fn set_post_embedding(&self, id: PostId, embedding: &[f64]) -> Result<(), CoreError> {
        self.check_dimension(embedding)?;

        let result = sqlx::query(
            "UPDATE posts SET embedding = ?, preference_refresh_pending = 1, updated_at = ?
             WHERE id = ?",
        )
        .bind(encode_vector(embedding)?)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool()?)
        .await
        .map_err(|e| DatabaseError::write("storing post embedding", e))?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound {
                resource: format!("post {}", id),
            });
        }
        debug!("Stored embedding for post {}", id);
        Ok(())
    }

    /// Posts that have a description to embed but no embedding yet, fewest
    /// failed attempts first. Posts that already failed `max_attempts` times
    /// are left out.
    pub async fn posts_missing_embedding(
        &self,
        limit: u32,
        max_attempts: u32,
    ) -> Result<Vec<Post>, CoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM posts
             WHERE embedding IS NULL AND description IS NOT NULL AND TRIM(description) != ''
               AND embedding_attempts < ?
             ORDER BY embedding_attempts, created_at
             LIMIT ?",
            POST_COLUMNS
        ))
        .bind(max_attempts)
        .bind(limit)
        .fetch_all(self.pool()?)
        .await
        .map_err(|e| DatabaseError::read("listing posts without embeddings", e))?;

        rows.iter().map(post_from_row).collect()
    }

    /// Counts a failed embedding attempt against the post. Returns the number
    /// of failures so far.
    pub async fn record_embedding_failure(&self, id: PostId) -> Result<u32, CoreError> {
        let attempts: Option<u32> = sqlx::query_scalar(
            "UPDATE posts
             SET embedding_attempts = embedding_attempts + 1, last_embedding_attempt_at = ?
             WHERE id = ?
             RETURNING embedding_attempts",
        )
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(self.pool()?)
        .await
        .map_err(|e| DatabaseError::write("recording embedding failure", e))?;

        attempts.ok_or_else(|| CoreError::NotFound {
            resource: format!("post {}", id),
        })
    }

    /// Embedded posts whose reacting users have not all been refreshed yet.
    pub async fn posts_pending_preference_refresh(&self, limit: u32) -> Result<Vec<PostId>, CoreError> {
        let posts: Vec<PostId> = sqlx::query_scalar(
            "SELECT id FROM posts WHERE preference_refresh_pending = 1 ORDER BY updated_at LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.pool()?)
        .await
        .map_err(|e| DatabaseError::read("listing posts pending preference refresh", e))?;
        Ok(posts)
    }

    pub async fn clear_preference_refresh(&self, id: PostId) -> Result<(), CoreError> {
        sqlx::query("UPDATE posts SET preference_refresh_pending = 0 WHERE id = ?")
            .bind(id)
            .execute(self.pool()?)
            .await
            .map_err(|e| DatabaseError::write("clearing preference refresh", e))?;
        Ok(())
    }

    /// Posts matching `filter`, newest first.
    pub async fn list_posts(&self, filter: &PostFilter) -> Result<Vec<Post>, CoreError> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM posts WHERE 1 = 1", POST_COLUMNS));

        if !filter.statuses.is_empty() {
            query.push(" AND status IN (");
            let mut values = query.separated(", ");
            for status in &filter.statuses {
                values.push_bind(status.as_str());
            }
            values.push_unseparated(")");
        }
        if !filter.post_types.is_empty() {
            query.push(" AND post_type IN (");
            let mut values = query.separated(", ");
            for post_type in &filter.post_types {
                values.push_bind(post_type.as_str());
            }
            values.push_unseparated(")");
        }
        if let Some(from) = filter.created_from {
            query.push(" AND created_at >= ").push_bind(from);
        }
        if let Some(until) = filter.created_until {
            query.push(" AND created_at <= ").push_bind(until);
        }
        query.push(" ORDER BY created_at DESC");

        let rows = query
            .build()
            .fetch_all(self.pool()?)
            .await
            .map_err(|e| DatabaseError::read("listing posts", e))?;

        let mut posts = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut post = post_from_row(row)?;
            post.keywords = self.post_keywords(post.id).await?;
            posts.push(post);
        }
        Ok(posts)
    }

    pub async fn users_reacting_to(&self, post: PostId) -> Result<Vec<UserId>, CoreError> {
        let users: Vec<UserId> = sqlx::query_scalar("SELECT user_id FROM reactions WHERE post_id = ?")
            .bind(post)
            .fetch_all(self.pool()?)
            .await
            .map_err(|e| DatabaseError::read("listing reacting users", e))?;
        Ok(users)
    }

    async fn post_keywords(&self, id: PostId) -> Result<Vec<String>, CoreError> {
        let keywords: Vec<String> = sqlx::query_scalar(
            "SELECT k.name FROM keywords k
             JOIN post_keywords pk ON pk.keyword_id = k.id
             WHERE pk.post_id = ?
             ORDER BY k.name",
        )
        .bind(id)
        .fetch_all(self.pool()?)
        .await
        .map_err(|e| DatabaseError::read("loading post keywords", e))?;
        Ok(keywords)
    }

    pub(crate) async fn require_post(&self, id: PostId) -> Result<Post, CoreError> {
        self.get_post(id).await?.ok_or_else(|| CoreError::NotFound {
            resource: format!("post {}", id),
        })
    }
}

fn post_from_row(row: &SqliteRow) -> Result<Post, CoreError> {
    let read = |e| DatabaseError::read("decoding post", e);

    let post_type: Option<String> = row.try_get("post_type").map_err(read)?;
    let status: String = row.try_get("status").map_err(read)?;

    Ok(Post {
        id: row.try_get("id").map_err(read)?,
        title: row.try_get("title").map_err(read)?,
        description: row.try_get("description").map_err(read)?,
        post_type: post_type
            .map(|raw| parse_column("posts.post_type", &raw))
            .transpose()?,
        status: parse_column("posts.status", &status)?,
        provider: row.try_get("provider").map_err(read)?,
        external_link: row.try_get("external_link").map_err(read)?,
        keywords: Vec::new(),
        embedding: decode_vector("posts.embedding", row.try_get("embedding").map_err(read)?)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(read)?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at").map_err(read)?,
    })
}
