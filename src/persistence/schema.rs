//! `SQLite` schema bootstrap logic.
//!
//! All definitions use `IF NOT EXISTS`, so bootstrap runs on every open.

use sqlx::SqlitePool;

use crate::Result;

/// Apply the queue and record table definitions.
///
/// `queue_item.seq` preserves insertion order; `record` holds one JSON
/// document per remote record id.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS queue_item (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
    id              TEXT NOT NULL UNIQUE,
    session_id      TEXT NOT NULL,
    local_timestamp TEXT NOT NULL,
    action_type     TEXT NOT NULL CHECK(action_type IN ('ANSWER_CHANGE','FLAG_TOGGLE','NAVIGATION','TIMER_SYNC','ANNOTATION_UPDATE','AUTO_SUBMIT')),
    payload         TEXT NOT NULL,
    status          TEXT NOT NULL CHECK(status IN ('PENDING'))
);

CREATE TABLE IF NOT EXISTS record (
    id              TEXT PRIMARY KEY NOT NULL,
    doc             TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_queue_session ON queue_item(session_id, action_type);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
