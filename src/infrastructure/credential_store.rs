use crate::domain::models::OAuthToken;
use crate::infrastructure::error::InfraError;
use std::collections::HashMap;
use std::sync::Mutex;

/// Per-user storage of calendar OAuth credentials.
pub trait CredentialStore: Send + Sync {
    fn save_token(&self, user_id: &str, token: &OAuthToken) -> Result<(), InfraError>;
    fn load_token(&self, user_id: &str) -> Result<Option<OAuthToken>, InfraError>;
    fn delete_token(&self, user_id: &str) -> Result<(), InfraError>;
}

#[derive(Debug, Clone)]
pub struct KeyringCredentialStore {
    service_name: String,
}

impl KeyringCredentialStore {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    fn entry(&self, user_id: &str) -> Result<keyring::Entry, InfraError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(InfraError::Credential("user id must not be empty".to_string()));
        }
        keyring::Entry::new(&self.service_name, user_id)
            .map_err(|error| InfraError::Credential(error.to_string()))
    }
}

impl Default for KeyringCredentialStore {
    fn default() -> Self {
        Self::new("remindsync.oauth.google")
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn save_token(&self, user_id: &str, token: &OAuthToken) -> Result<(), InfraError> {
        let payload =
            serde_json::to_string(token).map_err(|error| InfraError::Credential(error.to_string()))?;
        self.entry(user_id)?
            .set_password(&payload)
            .map_err(|error| InfraError::Credential(error.to_string()))
    }

    fn load_token(&self, user_id: &str) -> Result<Option<OAuthToken>, InfraError> {
        let payload = match self.entry(user_id)?.get_password() {
            Ok(value) => value,
            Err(keyring::Error::NoEntry) => return Ok(None),
            Err(error) => return Err(InfraError::Credential(error.to_string())),
        };

        let token = serde_json::from_str::<OAuthToken>(&payload)
            .map_err(|error| InfraError::Credential(error.to_string()))?;
        Ok(Some(token))
    }

    fn delete_token(&self, user_id: &str) -> Result<(), InfraError> {
        match self.entry(user_id)?.delete_credential() {
            Ok(_) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(error) => Err(InfraError::Credential(error.to_string())),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    tokens: Mutex<HashMap<String, OAuthToken>>,
}

impl InMemoryCredentialStore {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, OAuthToken>>, InfraError> {
        self.tokens
            .lock()
            .map_err(|error| InfraError::Credential(format!("in-memory lock poisoned: {error}")))
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn save_token(&self, user_id: &str, token: &OAuthToken) -> Result<(), InfraError> {
        self.lock()?.insert(user_id.to_string(), token.clone());
        Ok(())
    }

    fn load_token(&self, user_id: &str) -> Result<Option<OAuthToken>, InfraError> {
        Ok(self.lock()?.get(user_id).cloned())
    }

    fn delete_token(&self, user_id: &str) -> Result<(), InfraError> {
        self.lock()?.remove(user_id);
        Ok(())
    }
}
