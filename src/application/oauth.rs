use crate::application::NowProvider;
use crate::domain::models::OAuthToken;
use crate::infrastructure::credential_store::CredentialStore;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::oauth_client::{OAuthHttpClient, OAuthRefreshRequest, OAuthTokenResponse};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

const DEFAULT_TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
const TOKEN_LEEWAY_SECONDS: i64 = 60;

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_endpoint: String,
}

impl OAuthConfig {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token_endpoint: DEFAULT_TOKEN_ENDPOINT.to_string(),
        }
    }

    pub fn from_env() -> Result<Self, InfraError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, InfraError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let client_id = required_lookup_value(
            &lookup,
            &["REMINDSYNC_GOOGLE_CLIENT_ID", "GOOGLE_CLIENT_ID"],
            "google client id",
        )?;
        let client_secret = required_lookup_value(
            &lookup,
            &["REMINDSYNC_GOOGLE_CLIENT_SECRET", "GOOGLE_CLIENT_SECRET"],
            "google client secret",
        )?;
        let mut config = Self::new(client_id, client_secret);
        if let Some(endpoint) = optional_lookup_value(&lookup, &["REMINDSYNC_GOOGLE_TOKEN_ENDPOINT"]) {
            config.token_endpoint = endpoint;
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsureTokenResult {
    Existing(OAuthToken),
    Refreshed(OAuthToken),
    ReauthenticationRequired,
}

impl EnsureTokenResult {
    pub fn into_token(self) -> Option<OAuthToken> {
        match self {
            Self::Existing(token) | Self::Refreshed(token) => Some(token),
            Self::ReauthenticationRequired => None,
        }
    }
}

/// Owns the per-user credential lifecycle: validity checks, refresh and invalidation.
pub struct CredentialManager {
    config: OAuthConfig,
    credential_store: Arc<dyn CredentialStore>,
    oauth_client: Arc<dyn OAuthHttpClient>,
    now_provider: NowProvider,
}

impl CredentialManager {
    pub fn new(
        config: OAuthConfig,
        credential_store: Arc<dyn CredentialStore>,
        oauth_client: Arc<dyn OAuthHttpClient>,
    ) -> Self {
        Self {
            config,
            credential_store,
            oauth_client,
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn is_token_valid(&self, token: &OAuthToken) -> bool {
        token.is_valid_at((self.now_provider)(), TOKEN_LEEWAY_SECONDS)
    }

    /// True when credentials are stored for the user. A stale token still counts:
    /// it is only dropped once the provider rejects its refresh.
    pub fn has_integration(&self, user_id: &str) -> Result<bool, InfraError> {
        Ok(self.credential_store.load_token(user_id)?.is_some())
    }

    /// Returns a usable token, refreshing it when expired.
    ///
    /// A rejected refresh deletes the stored credential and reports
    /// `ReauthenticationRequired`; network failures propagate as `Transient`.
    pub async fn ensure_access_token(&self, user_id: &str) -> Result<EnsureTokenResult, InfraError> {
        let Some(stored_token) = self.credential_store.load_token(user_id)? else {
            return Ok(EnsureTokenResult::ReauthenticationRequired);
        };

        if self.is_token_valid(&stored_token) {
            return Ok(EnsureTokenResult::Existing(stored_token));
        }

        let Some(refresh_token) = stored_token.refresh_token.clone() else {
            info!(user_id, "stored token expired without refresh token");
            self.invalidate(user_id)?;
            return Ok(EnsureTokenResult::ReauthenticationRequired);
        };

        let refreshed = self
            .oauth_client
            .refresh_access_token(OAuthRefreshRequest {
                token_endpoint: self.config.token_endpoint.clone(),
                client_id: self.config.client_id.clone(),
                client_secret: self.config.client_secret.clone(),
                refresh_token,
            })
            .await;

        match refreshed {
            Ok(response) => {
                let token = self.token_from_response(response, stored_token.refresh_token);
                self.credential_store.save_token(user_id, &token)?;
                info!(user_id, "calendar access token refreshed");
                Ok(EnsureTokenResult::Refreshed(token))
            }
            Err(InfraError::AuthRequired(message)) => {
                warn!(user_id, error = %message, "token refresh rejected; dropping credential");
                self.invalidate(user_id)?;
                Ok(EnsureTokenResult::ReauthenticationRequired)
            }
            Err(error) => Err(error),
        }
    }

    pub fn invalidate(&self, user_id: &str) -> Result<(), InfraError> {
        self.credential_store.delete_token(user_id)
    }

    fn token_from_response(
        &self,
        response: OAuthTokenResponse,
        fallback_refresh_token: Option<String>,
    ) -> OAuthToken {
        let expires_at = (self.now_provider)() + Duration::seconds(response.expires_in.max(0));
        OAuthToken {
            access_token: response.access_token,
            refresh_token: response.refresh_token.or(fallback_refresh_token),
            expires_at,
            token_type: response.token_type.unwrap_or_else(|| "Bearer".to_string()),
            scope: response.scope,
        }
    }
}

fn required_lookup_value<F>(lookup: &F, keys: &[&str], field_name: &str) -> Result<String, InfraError>
where
    F: Fn(&str) -> Option<String>,
{
    optional_lookup_value(lookup, keys).ok_or_else(|| {
        InfraError::InvalidConfig(format!(
            "missing {} (set one of: {})",
            field_name,
            keys.join(", ")
        ))
    })
}

fn optional_lookup_value<F>(lookup: &F, keys: &[&str]) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    keys.iter()
        .filter_map(|key| lookup(key))
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::credential_store::InMemoryCredentialStore;
    use crate::test_support::{fixed_time, FakeOAuthHttpClient, FakeRefresh};
    use proptest::prelude::*;
    use std::sync::atomic::Ordering;

    fn manager(
        store: &Arc<InMemoryCredentialStore>,
        client: &Arc<FakeOAuthHttpClient>,
    ) -> CredentialManager {
        CredentialManager::new(
            OAuthConfig::new("client-id", "client-secret"),
            store.clone(),
            client.clone(),
        )
        .with_now_provider(Arc::new(|| fixed_time("2026-03-01T09:00:00Z")))
    }

    fn token(expires_at: &str, refresh_token: Option<&str>) -> OAuthToken {
        OAuthToken {
            access_token: "access".to_string(),
            refresh_token: refresh_token.map(ToOwned::to_owned),
            expires_at: fixed_time(expires_at),
            token_type: "Bearer".to_string(),
            scope: None,
        }
    }

    proptest! {
        #[test]
        fn valid_token_is_reused_without_refresh(minutes_left in 2i64..100_000i64) {
            let runtime = tokio::runtime::Runtime::new().expect("runtime");
            runtime.block_on(async move {
                let store = Arc::new(InMemoryCredentialStore::default());
                let mut stored = token("2026-03-01T09:00:00Z", Some("refresh"));
                stored.expires_at += Duration::minutes(minutes_left);
                store.save_token("teacher-a", &stored).expect("save token");

                let client = Arc::new(FakeOAuthHttpClient::default());
                let result = manager(&store, &client)
                    .ensure_access_token("teacher-a")
                    .await
                    .expect("ensure token");

                assert!(matches!(result, EnsureTokenResult::Existing(_)));
                assert_eq!(client.refresh_calls.load(Ordering::SeqCst), 0);
            });
        }
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_and_keeps_refresh_token() {
        let store = Arc::new(InMemoryCredentialStore::default());
        store
            .save_token("teacher-a", &token("2026-03-01T08:00:00Z", Some("refresh")))
            .expect("save token");
        let client = Arc::new(FakeOAuthHttpClient::default());

        let result = manager(&store, &client)
            .ensure_access_token("teacher-a")
            .await
            .expect("ensure token");

        let EnsureTokenResult::Refreshed(refreshed) = result else {
            panic!("expected refreshed token");
        };
        assert_eq!(refreshed.access_token, "fresh-access");
        assert_eq!(refreshed.refresh_token, Some("refresh".to_string()));
        assert_eq!(refreshed.expires_at, fixed_time("2026-03-01T10:00:00Z"));
        assert_eq!(
            store.load_token("teacher-a").expect("load").map(|t| t.access_token),
            Some("fresh-access".to_string())
        );
    }

    #[tokio::test]
    async fn rejected_refresh_deletes_credential() {
        let store = Arc::new(InMemoryCredentialStore::default());
        store
            .save_token("teacher-a", &token("2026-03-01T08:00:00Z", Some("revoked")))
            .expect("save token");
        let client = Arc::new(FakeOAuthHttpClient::default());
        client.set_refresh(FakeRefresh::Rejected);
        let manager = manager(&store, &client);

        let result = manager.ensure_access_token("teacher-a").await.expect("ensure");

        assert_eq!(result, EnsureTokenResult::ReauthenticationRequired);
        assert!(!manager.has_integration("teacher-a").expect("integration"));
    }

    #[tokio::test]
    async fn transient_refresh_failure_keeps_credential() {
        let store = Arc::new(InMemoryCredentialStore::default());
        store
            .save_token("teacher-a", &token("2026-03-01T08:00:00Z", Some("refresh")))
            .expect("save token");
        let client = Arc::new(FakeOAuthHttpClient::default());
        client.set_refresh(FakeRefresh::Unavailable);
        let manager = manager(&store, &client);

        let error = manager
            .ensure_access_token("teacher-a")
            .await
            .expect_err("transient error");

        assert!(error.is_retryable());
        assert!(manager.has_integration("teacher-a").expect("integration"));
    }

    #[tokio::test]
    async fn missing_credential_requires_reauthentication() {
        let store = Arc::new(InMemoryCredentialStore::default());
        let client = Arc::new(FakeOAuthHttpClient::default());
        let result = manager(&store, &client)
            .ensure_access_token("nobody")
            .await
            .expect("ensure");
        assert_eq!(result, EnsureTokenResult::ReauthenticationRequired);
    }

    #[test]
    fn config_lookup_prefers_prefixed_keys_and_reports_missing() {
        let config = OAuthConfig::from_lookup(|key| match key {
            "REMINDSYNC_GOOGLE_CLIENT_ID" => Some(" prefixed-id ".to_string()),
            "GOOGLE_CLIENT_ID" => Some("plain-id".to_string()),
            "GOOGLE_CLIENT_SECRET" => Some("secret".to_string()),
            _ => None,
        })
        .expect("config");
        assert_eq!(config.client_id, "prefixed-id");
        assert_eq!(config.client_secret, "secret");
        assert_eq!(config.token_endpoint, DEFAULT_TOKEN_ENDPOINT);

        let missing = OAuthConfig::from_lookup(|_| None).expect_err("missing id");
        assert!(missing.to_string().contains("REMINDSYNC_GOOGLE_CLIENT_ID"));
    }
}
