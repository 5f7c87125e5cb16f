//! Tests for database initialization

use harvest_common::config::DatabaseConfig;
use harvest_common::db::init::init_database;
use tempfile::TempDir;

async fn table_exists(pool: &sqlx::SqlitePool, name: &str) -> bool {
    sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
    )
    .bind(name)
    .fetch_one(pool)
    .await
    .unwrap()
        == 1
}

#[tokio::test]
async fn test_database_creation_when_missing() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("nested").join("harvest.db");

    let pool = init_database(&db_path, &DatabaseConfig::default()).await;
    assert!(pool.is_ok(), "Database initialization failed: {:?}", pool.err());
    assert!(db_path.exists(), "Database file was not created");

    let pool = pool.unwrap();
    assert!(table_exists(&pool, "session_descriptors").await);
    assert!(table_exists(&pool, "backfill_runs").await);
}

#[tokio::test]
async fn test_database_opens_existing() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("harvest.db");

    let pool1 = init_database(&db_path, &DatabaseConfig::default()).await.unwrap();
    pool1.close().await;

    let pool2 = init_database(&db_path, &DatabaseConfig::default()).await;
    assert!(pool2.is_ok(), "Failed to open existing database: {:?}", pool2.err());
}

#[tokio::test]
async fn test_only_one_running_run_allowed() {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_database(&temp_dir.path().join("harvest.db"), &DatabaseConfig::default())
        .await
        .unwrap();

    let insert = |run_id: &'static str, status: &'static str| {
        let pool = pool.clone();
        async move {
            sqlx::query(
                "INSERT INTO backfill_runs (run_id, status, started_at, updated_at, config_snapshot)
                 VALUES (?, ?, '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z', '{}')",
            )
            .bind(run_id)
            .bind(status)
            .execute(&pool)
            .await
        }
    };

    assert!(insert("run-a", "running").await.is_ok());
    assert!(insert("run-b", "paused").await.is_ok());
    assert!(insert("run-c", "running").await.is_err(), "second running run must be rejected");
}

#[tokio::test]
async fn test_status_check_constraint() {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_database(&temp_dir.path().join("harvest.db"), &DatabaseConfig::default())
        .await
        .unwrap();

    let result = sqlx::query(
        "INSERT INTO session_descriptors (report_id, access_key, import_status, discovered_at, updated_at)
         VALUES ('r1', 'k1', 'done', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
    )
    .execute(&pool)
    .await;

    assert!(result.is_err(), "unknown import_status must be rejected");
}
