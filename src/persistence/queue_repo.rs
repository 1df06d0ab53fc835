//! Durable action queue repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::Utc;

use crate::models::queue::{ActionType, QueueAction, QueueItem, QueueStatus};
use crate::{AppError, Result};

use super::db::Database;
use super::queue_store::{QueueStore, StoreFuture};

/// Repository for pending queue items.
#[derive(Clone)]
pub struct QueueRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct QueueRow {
    id: String,
    session_id: String,
    local_timestamp: String,
    action_type: String,
    payload: String,
    status: String,
}

impl QueueRow {
    fn into_item(self) -> Result<QueueItem> {
        let local_timestamp = chrono::DateTime::parse_from_rfc3339(&self.local_timestamp)
            .map_err(|e| AppError::Db(format!("invalid local_timestamp: {e}")))?
            .with_timezone(&Utc);
        let action: QueueAction = serde_json::from_str(&self.payload)?;
        if action.action_type() != ActionType::parse(&self.action_type)? {
            return Err(AppError::Db(format!(
                "queue item {} payload does not match action type {}",
                self.id, self.action_type
            )));
        }
        let status = parse_status(&self.status)?;

        Ok(QueueItem {
            id: self.id,
            session_id: self.session_id,
            local_timestamp,
            action,
            status,
        })
    }
}

fn parse_status(s: &str) -> Result<QueueStatus> {
    match s {
        "PENDING" => Ok(QueueStatus::Pending),
        other => Err(AppError::Db(format!("invalid queue status: {other}"))),
    }
}

fn status_str(status: QueueStatus) -> &'static str {
    match status {
        QueueStatus::Pending => "PENDING",
    }
}

fn unavailable(err: impl std::fmt::Display) -> AppError {
    AppError::StoreUnavailable(err.to_string())
}

impl QueueRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a pending item.
    ///
    /// # Errors
    ///
    /// Returns `AppError::StoreUnavailable` if the insert fails.
    pub async fn insert(&self, item: &QueueItem) -> Result<String> {
        let payload = serde_json::to_string(&item.action)?;
        let local_timestamp = item.local_timestamp.to_rfc3339();

        sqlx::query(
            "INSERT INTO queue_item (id, session_id, local_timestamp, action_type, payload, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&item.id)
        .bind(&item.session_id)
        .bind(&local_timestamp)
        .bind(item.action_type().as_str())
        .bind(&payload)
        .bind(status_str(item.status))
        .execute(self.db.as_ref())
        .await
        .map_err(unavailable)?;

        Ok(item.id.clone())
    }

    /// Fetch pending items for a session, oldest insertion first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::StoreUnavailable` if the query fails, or
    /// `AppError::Db` / `AppError::Serialization` for a corrupt row.
    pub async fn fetch_pending(
        &self,
        session_id: &str,
        filter: Option<ActionType>,
    ) -> Result<Vec<QueueItem>> {
        let rows: Vec<QueueRow> = if let Some(action_type) = filter {
            sqlx::query_as(
                "SELECT id, session_id, local_timestamp, action_type, payload, status
                 FROM queue_item
                 WHERE session_id = ?1 AND status = 'PENDING' AND action_type = ?2
                 ORDER BY seq ASC",
            )
            .bind(session_id)
            .bind(action_type.as_str())
            .fetch_all(self.db.as_ref())
            .await
            .map_err(unavailable)?
        } else {
            sqlx::query_as(
                "SELECT id, session_id, local_timestamp, action_type, payload, status
                 FROM queue_item
                 WHERE session_id = ?1 AND status = 'PENDING'
                 ORDER BY seq ASC",
            )
            .bind(session_id)
            .fetch_all(self.db.as_ref())
            .await
            .map_err(unavailable)?
        };

        rows.into_iter().map(QueueRow::into_item).collect()
    }

    /// Delete the given items in one transaction.
    ///
    /// Returns the number of rows deleted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::StoreUnavailable` if the transaction fails; no
    /// item is deleted in that case.
    pub async fn delete_ids(&self, ids: &[String]) -> Result<u64> {
        let mut tx = self.db.begin().await.map_err(unavailable)?;
        let mut removed = 0;
        for id in ids {
            removed += sqlx::query("DELETE FROM queue_item WHERE id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(unavailable)?
                .rows_affected();
        }
        tx.commit().await.map_err(unavailable)?;
        Ok(removed)
    }

    /// Count pending items for a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::StoreUnavailable` if the query fails.
    pub async fn count_pending(&self, session_id: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_item WHERE session_id = ?1 AND status = 'PENDING'",
        )
        .bind(session_id)
        .fetch_one(self.db.as_ref())
        .await
        .map_err(unavailable)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

impl QueueStore for QueueRepo {
    fn add(&self, item: &QueueItem) -> StoreFuture<'_, String> {
        let item = item.clone();
        Box::pin(async move { self.insert(&item).await })
    }

    fn list_pending(
        &self,
        session_id: &str,
        filter: Option<ActionType>,
    ) -> StoreFuture<'_, Vec<QueueItem>> {
        let session_id = session_id.to_owned();
        Box::pin(async move { self.fetch_pending(&session_id, filter).await })
    }

    fn delete_many(&self, ids: &[String]) -> StoreFuture<'_, u64> {
        let ids = ids.to_vec();
        Box::pin(async move { self.delete_ids(&ids).await })
    }

    fn count(&self, session_id: &str) -> StoreFuture<'_, u64> {
        let session_id = session_id.to_owned();
        Box::pin(async move { self.count_pending(&session_id).await })
    }

    fn is_durable(&self) -> bool {
        true
    }
}
