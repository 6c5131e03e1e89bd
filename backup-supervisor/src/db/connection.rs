use anyhow::Context;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;

pub type DbPool = Pool<SqliteConnectionManager>;

pub fn create_pool(db_path: &Path) -> anyhow::Result<DbPool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let manager = SqliteConnectionManager::file(db_path);
    let pool = Pool::builder()
        .max_size(4)
        .build(manager)
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;

    let conn = pool.get()?;
    conn.execute_batch(
        "PRAGMA journal_mode = DELETE;
         PRAGMA synchronous = FULL;",
    )?;

    Ok(pool)
}

#[cfg(test)]
pub fn memory_pool() -> DbPool {
    // One connection: every checkout must see the same in-memory database.
    Pool::builder()
        .max_size(1)
        .build(SqliteConnectionManager::memory())
        .unwrap()
}
