//! [`OptionsStore`] on the SQLite `settings` table.
//!
//! Each option is one row under the `backups.` prefix holding its JSON value,
//! so options added later fall back to their defaults on old databases.

use crate::db::connection::DbPool;
use crate::models::settings;
use async_trait::async_trait;
use backup_core::options::{BackupOptions, OptionsStore};
use backup_core::{BackupError, Result};
use serde_json::{Map, Value};

const PREFIX: &str = "backups.";

pub struct SqliteOptionsStore {
    db: DbPool,
}

impl SqliteOptionsStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

fn store_error(e: impl std::fmt::Display) -> BackupError {
    BackupError::Options(e.to_string())
}

#[async_trait]
impl OptionsStore for SqliteOptionsStore {
    async fn load(&self) -> Result<BackupOptions> {
        let db = self.db.clone();
        let rows = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            settings::get_prefixed(&conn, PREFIX)
        })
        .await?
        .map_err(|e| store_error(format!("{e:#}")))?;

        let mut object = Map::new();
        for (key, raw) in rows {
            let value: Value = serde_json::from_str(&raw)
                .map_err(|e| store_error(format!("setting {}{}: {}", PREFIX, key, e)))?;
            object.insert(key, value);
        }
        serde_json::from_value(Value::Object(object)).map_err(store_error)
    }

    async fn save(&self, options: &BackupOptions) -> Result<()> {
        let Value::Object(object) = serde_json::to_value(options)? else {
            return Err(store_error("options did not serialize to an object"));
        };

        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let mut conn = db.get()?;
            let tx = conn.transaction()?;
            for (key, value) in &object {
                settings::set(&tx, &format!("{}{}", PREFIX, key), &value.to_string())?;
            }
            tx.commit()?;
            Ok(())
        })
        .await?
        .map_err(|e| store_error(format!("{e:#}")))
    }
}
