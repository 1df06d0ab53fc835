//! `SQLite`-backed remote record store.
//!
//! Documents are stored as JSON text. Several processes pointed at the same
//! database file share records, which is how the CLI exercises duplicate
//! instances without a network backend.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};

use crate::{AppError, Result};

use super::db::Database;
use super::record_store::{apply_writes, FieldWrite, RecordStore, StoreFuture, TransactFn};

/// Repository for JSON record documents.
#[derive(Clone)]
pub struct RecordRepo {
    db: Arc<Database>,
}

fn parse_doc(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(AppError::from)
}

impl RecordRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Fetch a document by id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn fetch(&self, id: &str) -> Result<Option<Value>> {
        let raw: Option<String> = sqlx::query_scalar("SELECT doc FROM record WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;
        raw.as_deref().map(parse_doc).transpose()
    }

    /// Insert a document built from `writes` unless the id exists.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn insert_if_absent(&self, id: &str, writes: &[FieldWrite]) -> Result<bool> {
        let now = Utc::now();
        let mut doc = Value::Object(Map::new());
        apply_writes(&mut doc, writes, now)?;

        let result = sqlx::query(
            "INSERT OR IGNORE INTO record (id, doc, updated_at) VALUES (?1, ?2, ?3)",
        )
        .bind(id)
        .bind(doc.to_string())
        .bind(now.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Apply writes to an existing document inside one transaction.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the document is missing, `AppError::Db`
    /// if the transaction fails.
    pub async fn patch(&self, id: &str, writes: &[FieldWrite]) -> Result<()> {
        let mut tx = self.db.begin().await?;
        let raw: Option<String> = sqlx::query_scalar("SELECT doc FROM record WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let mut doc = raw
            .as_deref()
            .map(parse_doc)
            .transpose()?
            .ok_or_else(|| AppError::NotFound(format!("record {id} not found")))?;

        let now = Utc::now();
        apply_writes(&mut doc, writes, now)?;
        sqlx::query("UPDATE record SET doc = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(doc.to_string())
            .bind(now.to_rfc3339())
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Read-modify-write a document inside one transaction.
    ///
    /// # Errors
    ///
    /// Returns the body's error, or `AppError::Db` if the transaction fails.
    pub async fn read_modify_write(&self, id: &str, body: TransactFn) -> Result<()> {
        let mut tx = self.db.begin().await?;
        let raw: Option<String> = sqlx::query_scalar("SELECT doc FROM record WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let current = raw.as_deref().map(parse_doc).transpose()?;

        let writes = body(current.as_ref())?;
        if writes.is_empty() {
            tx.rollback().await?;
            return Ok(());
        }

        let now = Utc::now();
        let mut doc = current.unwrap_or_else(|| Value::Object(Map::new()));
        apply_writes(&mut doc, &writes, now)?;
        sqlx::query(
            "INSERT INTO record (id, doc, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET doc = excluded.doc, updated_at = excluded.updated_at",
        )
        .bind(id)
        .bind(doc.to_string())
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

impl RecordStore for RecordRepo {
    fn get(&self, id: &str) -> StoreFuture<'_, Option<Value>> {
        let id = id.to_owned();
        Box::pin(async move { self.fetch(&id).await })
    }

    fn create_if_absent(&self, id: &str, writes: Vec<FieldWrite>) -> StoreFuture<'_, bool> {
        let id = id.to_owned();
        Box::pin(async move { self.insert_if_absent(&id, &writes).await })
    }

    fn update(&self, id: &str, writes: Vec<FieldWrite>) -> StoreFuture<'_, ()> {
        let id = id.to_owned();
        Box::pin(async move { self.patch(&id, &writes).await })
    }

    fn transact(&self, id: &str, body: TransactFn) -> StoreFuture<'_, ()> {
        let id = id.to_owned();
        Box::pin(async move { self.read_modify_write(&id, body).await })
    }
}
