use std::fs;
use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::AppError;
use crate::models::Credentials;
use crate::pipeline::CredentialStore;

const HANDLE_KEY: &str = "handle";
const USERNAME_KEY: &str = "username";
const UPSERT: &str =
    "INSERT INTO settings(key, value) VALUES(?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value";

/// Process-wide key-value settings persisted in SQLite.
pub struct SettingsStore {
    conn: Connection,
}

impl SettingsStore {
    pub fn open() -> Result<Self, AppError> {
        let mut db_dir = dirs::home_dir()
            .ok_or_else(|| AppError::Internal("home directory not found".to_string()))?;
        db_dir.push(".trophy-cli");
        fs::create_dir_all(&db_dir).map_err(|e| AppError::Internal(e.to_string()))?;

        Self::open_at(db_dir.join("settings.db"))
    }

    pub fn open_at(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), AppError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS settings(key TEXT PRIMARY KEY, value TEXT NOT NULL);",
        )?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Missing keys read as empty strings.
    pub fn credentials(&self) -> Result<Credentials, AppError> {
        Ok(Credentials {
            handle: self.get(HANDLE_KEY)?.unwrap_or_default(),
            username: self.get(USERNAME_KEY)?.unwrap_or_default(),
        })
    }
}

impl CredentialStore for SettingsStore {
    fn save_credentials(&self, credentials: &Credentials) -> Result<(), AppError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(UPSERT, params![HANDLE_KEY, credentials.handle])?;
        tx.execute(UPSERT, params![USERNAME_KEY, credentials.username])?;
        tx.commit()?;
        Ok(())
    }
}
