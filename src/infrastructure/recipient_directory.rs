use crate::domain::models::ChannelType;
use crate::infrastructure::error::InfraError;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Resolves the channel-specific address of a user (for example a Telegram chat id).
pub trait RecipientDirectory: Send + Sync {
    fn external_id(&self, user_id: &str, channel: ChannelType) -> Result<Option<String>, InfraError>;
}

#[derive(Debug, Clone)]
pub struct SqliteRecipientDirectory {
    db_path: PathBuf,
}

impl SqliteRecipientDirectory {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        Connection::open(&self.db_path).map_err(InfraError::from)
    }

    pub fn register(
        &self,
        user_id: &str,
        channel: ChannelType,
        external_id: &str,
    ) -> Result<(), InfraError> {
        let external_id = external_id.trim();
        if external_id.is_empty() {
            return Err(InfraError::Validation(
                "recipient external id must not be empty".to_string(),
            ));
        }
        let connection = self.connect()?;
        connection.execute(
            "INSERT INTO recipients (user_id, channel, external_id) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id, channel) DO UPDATE SET external_id = excluded.external_id",
            params![user_id, channel.as_str(), external_id],
        )?;
        Ok(())
    }
}

impl RecipientDirectory for SqliteRecipientDirectory {
    fn external_id(&self, user_id: &str, channel: ChannelType) -> Result<Option<String>, InfraError> {
        let connection = self.connect()?;
        let external_id: Option<String> = connection
            .query_row(
                "SELECT external_id FROM recipients WHERE user_id = ?1 AND channel = ?2",
                params![user_id, channel.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(external_id.filter(|value| !value.trim().is_empty()))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRecipientDirectory {
    entries: Mutex<HashMap<(String, ChannelType), String>>,
}

impl InMemoryRecipientDirectory {
    pub fn insert(&self, user_id: &str, channel: ChannelType, external_id: &str) -> Result<(), InfraError> {
        let mut entries = self.entries.lock().map_err(|error| {
            InfraError::InvalidConfig(format!("recipient directory lock poisoned: {error}"))
        })?;
        entries.insert((user_id.to_string(), channel), external_id.to_string());
        Ok(())
    }
}

impl RecipientDirectory for InMemoryRecipientDirectory {
    fn external_id(&self, user_id: &str, channel: ChannelType) -> Result<Option<String>, InfraError> {
        let entries = self.entries.lock().map_err(|error| {
            InfraError::InvalidConfig(format!("recipient directory lock poisoned: {error}"))
        })?;
        Ok(entries.get(&(user_id.to_string(), channel)).cloned())
    }
}
