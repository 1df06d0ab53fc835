//! Result-creation service.
//!
//! Creating a result is idempotent per session: the result id is derived
//! from the session id, and both the result document and the session's
//! completion are written inside read-modify-write transactions that do
//! nothing when the work is already done.

use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::models::record::{SessionRecord, SessionStatus};
use crate::models::result::{result_id_for, SubmissionMetadata, TestResult};
use crate::persistence::record_store::{decode, FieldWrite, RecordStore, StoreFuture};
use crate::AppError;

/// Creates the scored result for a submitted session.
pub trait ResultService: Send + Sync {
    /// Create the result for `session_id` (or find the existing one) and
    /// mark the session completed. Returns the result id.
    fn create_test_result(
        &self,
        session_id: &str,
        metadata: SubmissionMetadata,
    ) -> StoreFuture<'_, String>;
}

/// [`ResultService`] writing results into the same record store as sessions.
pub struct RecordResultService {
    store: Arc<dyn RecordStore>,
}

impl RecordResultService {
    /// Create a service over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

impl ResultService for RecordResultService {
    fn create_test_result(
        &self,
        session_id: &str,
        metadata: SubmissionMetadata,
    ) -> StoreFuture<'_, String> {
        let session_id = session_id.to_owned();
        Box::pin(async move {
            let result_id = result_id_for(&session_id);

            let record: SessionRecord = decode(self.store.get(&session_id).await?)?
                .ok_or_else(|| AppError::NotFound(format!("session {session_id} not found")))?;

            let result = TestResult {
                id: result_id.clone(),
                session_id: session_id.clone(),
                answers: record.answers,
                flagged_questions: record.flagged_questions,
                metadata,
                submitted_at: None,
            };
            self.store
                .transact(
                    &result_id,
                    Box::new(move |existing: Option<&Value>| {
                        if existing.is_some() {
                            return Ok(Vec::new());
                        }
                        let mut writes = FieldWrite::document(&result)?;
                        writes.push(FieldWrite::server_timestamp("submitted_at"));
                        Ok(writes)
                    }),
                )
                .await?;

            let missing_id = session_id.clone();
            self.store
                .transact(
                    &session_id,
                    Box::new(move |current: Option<&Value>| {
                        let current = current.ok_or_else(|| {
                            AppError::NotFound(format!("session {missing_id} not found"))
                        })?;
                        let completed = current.get("status").and_then(Value::as_str)
                            == Some("COMPLETED");
                        if completed {
                            return Ok(Vec::new());
                        }
                        Ok(vec![
                            FieldWrite::set("status", SessionStatus::Completed)?,
                            FieldWrite::server_timestamp("completed_at"),
                            FieldWrite::server_timestamp("last_action"),
                        ])
                    }),
                )
                .await?;

            info!(%session_id, %result_id, "result recorded");
            Ok(result_id)
        })
    }
}
