use chrono::{DateTime, Utc};
use memefeed_core::{CoreError, DatabaseError, PostId, Report, ReportReason, ReportStatus, UserId};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{parse_column, Database};

impl Database {
    /// Flips the favorite flag of `post` for `user`. Returns whether the post
    /// is a favorite afterwards.
    pub async fn toggle_favorite(&self, user: UserId, post: PostId) -> Result<bool, CoreError> {
        self.require_post(post).await?;

        let write = |e| DatabaseError::write("toggling favorite", e);
        let mut tx = self.pool()?.begin().await.map_err(write)?;

        let removed = sqlx::query("DELETE FROM favorites WHERE user_id = ? AND post_id = ?")
            .bind(user)
            .bind(post)
            .execute(&mut *tx)
            .await
            .map_err(write)?;

        let favorite = if removed.rows_affected() > 0 {
            false
        } else {
            sqlx::query("INSERT INTO favorites (user_id, post_id, created_at) VALUES (?, ?, ?)")
                .bind(user)
                .bind(post)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await
                .map_err(write)?;
            true
        };

        tx.commit().await.map_err(write)?;
        Ok(favorite)
    }

    /// Favorite posts of `user`, most recent first.
    pub async fn list_favorites(&self, user: UserId) -> Result<Vec<PostId>, CoreError> {
        let posts: Vec<PostId> = sqlx::query_scalar(
            "SELECT post_id FROM favorites WHERE user_id = ? ORDER BY created_at DESC",
        )
        .bind(user)
        .fetch_all(self.pool()?)
        .await
        .map_err(|e| DatabaseError::read("listing favorites", e))?;
        Ok(posts)
    }

    /// Files a report against a post. Reporting the same post for the same
    /// reason again while the first report is still pending returns the
    /// existing report.
    pub async fn create_report(
        &self,
        user: UserId,
        post: PostId,
        reason: ReportReason,
    ) -> Result<Report, CoreError> {
        self.require_post(post).await?;

        let existing = sqlx::query(&format!(
            "SELECT {} FROM reports
             WHERE user_id = ? AND post_id = ? AND reason = ? AND status = ?",
            REPORT_COLUMNS
        ))
        .bind(user)
        .bind(post)
        .bind(reason.as_str())
        .bind(ReportStatus::Pending.as_str())
        .fetch_optional(self.pool()?)
        .await
        .map_err(|e| DatabaseError::read("loading report", e))?;

        if let Some(row) = existing {
            return report_from_row(&row);
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO reports (id, user_id, post_id, reason, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(user)
        .bind(post)
        .bind(reason.as_str())
        .bind(ReportStatus::Pending.as_str())
        .bind(now)
        .bind(now)
        .execute(self.pool()?)
        .await
        .map_err(|e| DatabaseError::write("creating report", e))?;

        info!("Post {} reported for {}", post, reason);
        Ok(Report {
            id,
            user_id: user,
            post_id: post,
            reason,
            status: ReportStatus::Pending,
            created_at: now,
        })
    }

    /// Reports for moderation, oldest first, optionally narrowed to one status.
    pub async fn list_reports(&self, status: Option<ReportStatus>) -> Result<Vec<Report>, CoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM reports WHERE (? IS NULL OR status = ?) ORDER BY created_at",
            REPORT_COLUMNS
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(self.pool()?)
        .await
        .map_err(|e| DatabaseError::read("listing reports", e))?;

        rows.iter().map(report_from_row).collect()
    }

    /// Moderation decision on a report (approve or reject).
    pub async fn set_report_status(&self, id: Uuid, status: ReportStatus) -> Result<Report, CoreError> {
        let row = sqlx::query(&format!(
            "UPDATE reports SET status = ?, updated_at = ? WHERE id = ? RETURNING {}",
            REPORT_COLUMNS
        ))
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(self.pool()?)
        .await
        .map_err(|e| DatabaseError::write("updating report status", e))?;

        let row = row.ok_or_else(|| CoreError::NotFound {
            resource: format!("report {}", id),
        })?;
        debug!("Report {} is now {}", id, status);
        report_from_row(&row)
    }
}

const REPORT_COLUMNS: &str = "id, user_id, post_id, reason, status, created_at";

fn report_from_row(row: &SqliteRow) -> Result<Report, CoreError> {
    let read = |e| DatabaseError::read("decoding report", e);

    let reason: String = row.try_get("reason").map_err(read)?;
    let status: String = row.try_get("status").map_err(read)?;

    Ok(Report {
        id: row.try_get("id").map_err(read)?,
        user_id: row.try_get("user_id").map_err(read)?,
        post_id: row.try_get("post_id").map_err(read)?,
        reason: parse_column("reports.reason", &reason)?,
        status: parse_column("reports.status", &status)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(read)?,
    })
}
