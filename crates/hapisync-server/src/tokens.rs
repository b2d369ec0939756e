//! Centralised access-token resolution.
//!
//! Provider calls never refresh tokens themselves. [`TokenManager`] opens the
//! sealed credentials of a connection and, when the access token is expired,
//! refreshes it under a per-connection lock so concurrent callers trigger a
//! single refresh. The new pair is sealed again and persisted.

use std::sync::Arc;

use chrono::Utc;
use hapisync_providers::{AccessToken, CalendarProvider, ProviderError, TokenCipher, TokenInfo};
use hapisync_store::{CalendarConnection, Store};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::locks::KeyedLocks;

pub struct TokenManager {
    store: Arc<Store>,
    provider: Arc<dyn CalendarProvider>,
    cipher: TokenCipher,
    refresh_locks: KeyedLocks,
}

impl TokenManager {
    pub fn new(store: Arc<Store>, provider: Arc<dyn CalendarProvider>, cipher: TokenCipher) -> Self {
        Self {
            store,
            provider,
            cipher,
            refresh_locks: KeyedLocks::new(),
        }
    }

    /// Seals a credential pair for storage on a connection row.
    pub fn seal(&self, tokens: &TokenInfo) -> SyncResult<String> {
        Ok(self.cipher.seal(tokens)?)
    }

    fn open(&self, connection: &CalendarConnection) -> SyncResult<TokenInfo> {
        self.cipher
            .open(&connection.encrypted_credentials)
            .map_err(|e| SyncError::credentials(&connection.id, e.message()))
    }

    /// Returns a usable access token for the connection.
    pub async fn access_token(&self, connection: &CalendarConnection) -> SyncResult<AccessToken> {
        let tokens = self.open(connection)?;
        if !tokens.is_expired(Utc::now()) {
            return Ok(tokens.access());
        }

        let _guard = self.refresh_locks.lock(&connection.id).await;

        // Another caller may have refreshed while we waited.
        let connection_id = connection.id.clone();
        let current = self
            .store
            .call(move |s| s.get_connection(&connection_id))
            .await?
            .ok_or_else(|| SyncError::ConnectionNotFound(connection.id.clone()))?;
        let mut tokens = self.open(&current)?;
        if !tokens.is_expired(Utc::now()) {
            debug!(connection_id = %connection.id, "token refreshed by another caller");
            return Ok(tokens.access());
        }

        let Some(refresh_token) = tokens.refresh_token.clone() else {
            return Err(SyncError::credentials(
                &connection.id,
                "access token expired and no refresh token is stored",
            ));
        };

        let refreshed = match self.provider.refresh_access_token(&refresh_token).await {
            Ok(refreshed) => refreshed,
            Err(err) if err.is_auth() => {
                warn!(connection_id = %connection.id, error = %err, "token refresh rejected");
                return Err(SyncError::Provider(ProviderError::auth_expired(
                    "refresh token rejected; reconnect required",
                )));
            }
            Err(err) => return Err(err.into()),
        };

        tokens.apply_refresh(refreshed, Utc::now());
        let sealed = self.seal(&tokens)?;
        let connection_id = connection.id.clone();
        self.store
            .call(move |s| s.update_credentials(&connection_id, &sealed))
            .await?;
        info!(connection_id = %connection.id, "access token refreshed");
        Ok(tokens.access())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use hapisync_providers::{MemoryProvider, ProviderErrorCode};
    use hapisync_store::{NewConnection, SyncToggles};

    struct Fixture {
        store: Arc<Store>,
        memory: Arc<MemoryProvider>,
        manager: Arc<TokenManager>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let memory = Arc::new(MemoryProvider::new());
        let cipher = TokenCipher::from_base64_key(&TokenCipher::generate_key()).unwrap();
        let manager = Arc::new(TokenManager::new(store.clone(), memory.clone(), cipher));
        Fixture {
            store,
            memory,
            manager,
        }
    }

    fn connect(f: &Fixture, tokens: &TokenInfo) -> CalendarConnection {
        f.store
            .insert_connection(&NewConnection {
                user_id: "u-1".into(),
                provider: "memory".into(),
                account_email: None,
                calendar_id: "primary".into(),
                timezone: None,
                toggles: SyncToggles::default(),
                encrypted_credentials: f.manager.seal(tokens).unwrap(),
            })
            .unwrap()
    }

    fn expired() -> TokenInfo {
        TokenInfo::new(
            "old",
            Some("refresh-1".into()),
            Some(Utc::now() - Duration::minutes(5)),
        )
    }

    #[tokio::test]
    async fn fresh_token_is_returned_as_is() {
        let f = fixture();
        let tokens = TokenInfo::new("live", None, Some(Utc::now() + Duration::hours(1)));
        let conn = connect(&f, &tokens);

        let access = f.manager.access_token(&conn).await.unwrap();
        assert_eq!(access.secret(), "live");
        assert_eq!(f.memory.refresh_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_callers_refresh_once() {
        let f = fixture();
        let conn = connect(&f, &expired());

        let (a, b) = tokio::join!(f.manager.access_token(&conn), f.manager.access_token(&conn));
        assert_eq!(a.unwrap().secret(), b.unwrap().secret());
        assert_eq!(f.memory.refresh_count(), 1);

        let stored = f.store.require_connection(&conn.id).unwrap();
        assert_ne!(stored.encrypted_credentials, conn.encrypted_credentials);
        let access = f.manager.access_token(&stored).await.unwrap();
        assert!(access.secret().starts_with("mem-access-"));
        assert_eq!(f.memory.refresh_count(), 1);
    }

    #[tokio::test]
    async fn rejected_refresh_requires_reconnect() {
        let f = fixture();
        let conn = connect(&f, &expired());
        f.memory
            .set_refresh_error(Some(ProviderErrorCode::AuthenticationFailed));

        let err = f.manager.access_token(&conn).await.unwrap_err();
        assert!(err.requires_reconnect());
    }

    #[tokio::test]
    async fn missing_refresh_token_and_bad_payload() {
        let f = fixture();
        let conn = connect(
            &f,
            &TokenInfo::new("old", None, Some(Utc::now() - Duration::minutes(5))),
        );
        let err = f.manager.access_token(&conn).await.unwrap_err();
        assert!(matches!(err, SyncError::Credentials { .. }));

        let mut garbled = conn.clone();
        garbled.encrypted_credentials = "not-a-sealed-payload".into();
        let err = f.manager.access_token(&garbled).await.unwrap_err();
        assert!(err.requires_reconnect());
    }
}
