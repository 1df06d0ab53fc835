//! Contract tests for the `SQLite` schema.
//!
//! Verify table creation, idempotent bootstrap and the CHECK constraints
//! guarding queue rows.

use exam_session_sync::persistence::db;
use exam_session_sync::persistence::schema;

#[tokio::test]
async fn bootstrap_is_idempotent() {
    let pool = db::connect_memory().await.expect("db");

    schema::bootstrap_schema(&pool)
        .await
        .expect("second bootstrap");

    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('queue_item', 'record') ORDER BY name",
    )
    .fetch_all(&pool)
    .await
    .expect("list tables");
    assert_eq!(tables, vec!["queue_item".to_owned(), "record".to_owned()]);
}

#[tokio::test]
async fn unknown_action_type_is_rejected() {
    let pool = db::connect_memory().await.expect("db");

    let result = sqlx::query(
        "INSERT INTO queue_item (id, session_id, local_timestamp, action_type, payload, status)
         VALUES ('q:1', 's', '2026-01-01T00:00:00Z', 'SUBMIT', '{}', 'PENDING')",
    )
    .execute(&pool)
    .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn unknown_status_is_rejected() {
    let pool = db::connect_memory().await.expect("db");

    let result = sqlx::query(
        "INSERT INTO queue_item (id, session_id, local_timestamp, action_type, payload, status)
         VALUES ('q:1', 's', '2026-01-01T00:00:00Z', 'TIMER_SYNC', '{}', 'CONFIRMED')",
    )
    .execute(&pool)
    .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn file_database_is_created_with_parents() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("a").join("b").join("records.db");

    let pool = db::connect(&path).await.expect("file db");

    assert!(path.exists());
    pool.close().await;
}
