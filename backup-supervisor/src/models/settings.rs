//! Key/value rows of the `settings` table.

use rusqlite::{params, Connection};
use std::collections::HashMap;

pub fn set(conn: &Connection, key: &str, value: &str) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
        params![key, value],
    )?;
    Ok(())
}

/// All settings whose key starts with `prefix`, keyed without the prefix.
pub fn get_prefixed(conn: &Connection, prefix: &str) -> anyhow::Result<HashMap<String, String>> {
    let mut stmt = conn.prepare("SELECT key, value FROM settings WHERE key LIKE ?1 || '%'")?;
    let rows = stmt.query_map(params![prefix], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut map = HashMap::new();
    for row in rows {
        let (key, value) = row?;
        if let Some(stripped) = key.strip_prefix(prefix) {
            map.insert(stripped.to_string(), value);
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::memory_pool;
    use crate::db::migrate::migrate;

    #[test]
    fn test_set_overwrites_and_prefix_filters() {
        let pool = memory_pool();
        migrate(&pool).unwrap();
        let conn = pool.get().unwrap();

        assert!(get_prefixed(&conn, "backups.").unwrap().is_empty());
        set(&conn, "backups.days_until_stale", "30").unwrap();
        set(&conn, "backups.days_until_stale", "7").unwrap();
        set(&conn, "ui.theme", "dark").unwrap();

        let backups = get_prefixed(&conn, "backups.").unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups["days_until_stale"], "7");
    }
}
