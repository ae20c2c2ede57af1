//! Shared test helpers: a file-backed SQLite pool per test.

use snapsum::database::{DbPool, ensure_schema, init_pool_with_size};
use tempfile::TempDir;

/// Create a fresh database in a temp directory. Keep the `TempDir` alive
/// for the duration of the test.
pub async fn test_db() -> (TempDir, DbPool) {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("test.db");
    let url = format!("sqlite:{}?mode=rwc", db_path.display());
    let pool = init_pool_with_size(&url, 5).await.unwrap();
    ensure_schema(&pool).await.unwrap();
    (dir, pool)
}
