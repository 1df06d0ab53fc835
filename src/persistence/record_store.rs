//! Remote record store contract: field-level writes with dot-path targets
//! and transactional read-modify-write.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::{AppError, Result};

pub use super::queue_store::StoreFuture;

/// Value written to one field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Literal JSON value.
    Set(Value),
    /// Replaced by the store's own clock at write time.
    ServerTimestamp,
    /// Remove the field.
    Delete,
}

/// A write to one field addressed by a dot path such as `answers.q1.a`.
///
/// Intermediate segments that are missing or not objects are replaced with
/// empty objects.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldWrite {
    /// Dot-separated field path.
    pub path: String,
    /// Value to write.
    pub value: FieldValue,
}

impl FieldWrite {
    /// Write a serializable value.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Serialization` if `value` cannot be represented as JSON.
    pub fn set(path: impl Into<String>, value: impl Serialize) -> Result<Self> {
        Ok(Self::value(path, serde_json::to_value(value)?))
    }

    /// Write a JSON value.
    #[must_use]
    pub fn value(path: impl Into<String>, value: Value) -> Self {
        Self {
            path: path.into(),
            value: FieldValue::Set(value),
        }
    }

    /// Write the server's current time.
    #[must_use]
    pub fn server_timestamp(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            value: FieldValue::ServerTimestamp,
        }
    }

    /// Remove a field.
    #[must_use]
    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            value: FieldValue::Delete,
        }
    }

    /// One write per top-level field of a serialized document.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Serialization` if `doc` does not serialize to an object.
    pub fn document(doc: impl Serialize) -> Result<Vec<Self>> {
        match serde_json::to_value(doc)? {
            Value::Object(fields) => Ok(fields
                .into_iter()
                .map(|(path, value)| Self::value(path, value))
                .collect()),
            other => Err(AppError::Serialization(format!(
                "document must be an object, got {other}"
            ))),
        }
    }
}

/// Read-modify-write body: receives the current document (if any) and
/// returns the writes to commit atomically.
pub type TransactFn = Box<dyn FnOnce(Option<&Value>) -> Result<Vec<FieldWrite>> + Send>;

/// Shared remote record store.
pub trait RecordStore: Send + Sync {
    /// Fetch a document.
    fn get(&self, id: &str) -> StoreFuture<'_, Option<Value>>;

    /// Create a document from `writes` unless one already exists; returns
    /// whether it was created.
    fn create_if_absent(&self, id: &str, writes: Vec<FieldWrite>) -> StoreFuture<'_, bool>;

    /// Apply field writes to an existing document.
    ///
    /// Fails with [`AppError::NotFound`] if the document does not exist.
    fn update(&self, id: &str, writes: Vec<FieldWrite>) -> StoreFuture<'_, ()>;

    /// Run `body` against the current document and commit its writes
    /// atomically. An absent document is created if `body` writes anything.
    fn transact(&self, id: &str, body: TransactFn) -> StoreFuture<'_, ()>;
}

/// Apply writes to a document, resolving server timestamps to `now`.
///
/// # Errors
///
/// Returns `AppError::Serialization` for an empty path or empty segment.
pub fn apply_writes(doc: &mut Value, writes: &[FieldWrite], now: DateTime<Utc>) -> Result<()> {
    for write in writes {
        let value = match &write.value {
            FieldValue::Set(value) => Some(value.clone()),
            FieldValue::ServerTimestamp => Some(serde_json::to_value(now)?),
            FieldValue::Delete => None,
        };
        apply_path(doc, &write.path, value)?;
    }
    Ok(())
}

fn apply_path(doc: &mut Value, path: &str, value: Option<Value>) -> Result<()> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(AppError::Serialization(format!("invalid field path: {path:?}")));
    }
    let Some((last, parents)) = segments.split_last() else {
        return Err(AppError::Serialization("empty field path".into()));
    };

    let mut cursor = doc;
    for segment in parents {
        cursor = ensure_object(cursor, path)?
            .entry((*segment).to_owned())
            .or_insert(Value::Null);
    }

    let fields = ensure_object(cursor, path)?;
    match value {
        Some(value) => {
            fields.insert((*last).to_owned(), value);
        }
        None => {
            fields.remove(*last);
        }
    }
    Ok(())
}

/// Replace a non-object parent with an empty object and return its fields.
fn ensure_object<'a>(value: &'a mut Value, path: &str) -> Result<&'a mut Map<String, Value>> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    value
        .as_object_mut()
        .ok_or_else(|| AppError::Serialization(format!("cannot write through {path:?}")))
}

/// Deserialize an optional document into a typed record.
///
/// # Errors
///
/// Returns `AppError::Serialization` if the document does not match `T`.
pub fn decode<T: DeserializeOwned>(doc: Option<Value>) -> Result<Option<T>> {
    doc.map(serde_json::from_value)
        .transpose()
        .map_err(AppError::from)
}

/// Run a remote operation under a time budget.
///
/// Exceeding the budget cancels only this attempt and reports
/// [`AppError::Timeout`].
///
/// # Errors
///
/// Returns the operation's own error, or `AppError::Timeout`.
pub async fn with_budget<T>(
    budget: Duration,
    operation: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(budget, fut).await {
        Ok(result) => result,
        Err(_) => Err(AppError::Timeout(format!(
            "{operation} exceeded {}ms",
            budget.as_millis()
        ))),
    }
}
