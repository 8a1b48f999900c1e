//! Token lifecycle management.
//!
//! Hands out access tokens guaranteed valid for at least the safety window,
//! refreshing through the platform adapter when needed. Refreshes serialize
//! per connection on an async lock; concurrent callers for the same
//! connection get the refreshed token without a second network call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::TwitterAppCredential;
use crate::crypto::SecretBox;
use crate::db::Database;
use crate::error::{Error, ErrorKind, Result};
use crate::platforms::PlatformAdapter;
use crate::types::{PlatformConnection, TokenBundle};

/// Returned tokens are valid at least this long.
pub const SAFETY_WINDOW_MS: i64 = 60_000;

pub struct TokenManager {
    db: Database,
    secrets: Arc<SecretBox>,
    clock: Arc<dyn Clock>,
    app_credential: Option<TwitterAppCredential>,
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl TokenManager {
    pub fn new(
        db: Database,
        secrets: Arc<SecretBox>,
        clock: Arc<dyn Clock>,
        app_credential: Option<TwitterAppCredential>,
    ) -> Self {
        if app_credential.is_none() {
            warn!("app-level oauth1 credential not configured; dual-credential publishes will fail CONFIG_MISSING");
        }
        Self {
            db,
            secrets,
            clock,
            app_credential,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The app-level OAuth 1.0a credential for dual-credential platforms.
    pub fn app_credential(&self) -> Result<&TwitterAppCredential> {
        self.app_credential
            .as_ref()
            .ok_or_else(|| Error::config_missing("TWITTER_API_KEY credentials are not configured"))
    }

    /// An access token for the connection, valid for at least the safety
    /// window. Refreshes through the adapter when the stored token is stale.
    pub async fn access_token(
        &self,
        adapter: &dyn PlatformAdapter,
        connection_id: Uuid,
    ) -> Result<String> {
        let connection = self.load_active(connection_id).await?;
        let now = self.clock.now_ms();
        if connection.expires_at - now > SAFETY_WINDOW_MS {
            return self.secrets.open_str(&connection.access_token_sealed);
        }
        self.refresh_locked(adapter, connection_id, false).await
    }

    /// Refresh after an adapter reported `AUTH_EXPIRED` mid-publish. A
    /// refresh completed by another worker since the report is reused.
    pub async fn force_refresh(
        &self,
        adapter: &dyn PlatformAdapter,
        connection_id: Uuid,
    ) -> Result<String> {
        self.refresh_locked(adapter, connection_id, true).await
    }

    fn lock_for(&self, connection_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("token lock map poisoned");
        locks.entry(connection_id).or_default().clone()
    }

    async fn load_active(&self, connection_id: Uuid) -> Result<PlatformConnection> {
        let connection = self
            .db
            .get_connection(connection_id)
            .await?
            .ok_or_else(|| Error::new(ErrorKind::AuthRevoked, "platform not connected"))?;
        if !connection.active {
            return Err(Error::new(ErrorKind::AuthRevoked, "platform not connected"));
        }
        Ok(connection)
    }

    async fn refresh_locked(
        &self,
        adapter: &dyn PlatformAdapter,
        connection_id: Uuid,
        forced: bool,
    ) -> Result<String> {
        let started = self.clock.now_ms();
        let lock = self.lock_for(connection_id);
        let _guard = lock.lock().await;

        // Double-check under the lock: a concurrent caller may already have
        // refreshed this connection.
        let connection = self.load_active(connection_id).await?;
        let now = self.clock.now_ms();
        let fresh = connection.expires_at - now > SAFETY_WINDOW_MS;
        let refreshed_since_start = connection.updated_at >= started;
        if fresh && (!forced || refreshed_since_start) {
            return self.secrets.open_str(&connection.access_token_sealed);
        }

        let refresh_token = match &connection.refresh_token_sealed {
            Some(sealed) => self.secrets.open_str(sealed)?,
            None => {
                return Err(Error::new(
                    ErrorKind::AuthExpired,
                    format!(
                        "{} token expired and no refresh grant is stored; reconnect the account",
                        connection.platform
                    ),
                ));
            }
        };

        let bundle = match adapter.refresh(&refresh_token).await {
            Ok(bundle) => bundle,
            Err(e) if matches!(e.kind, ErrorKind::InvalidGrant | ErrorKind::AuthRevoked) => {
                self.db.deactivate_connection(connection_id, now).await?;
                info!(connection_id = %connection_id, platform = %connection.platform,
                      "connection deactivated after refresh rejection");
                return Err(Error::new(
                    ErrorKind::AuthRevoked,
                    format!("{} refresh grant rejected", connection.platform),
                ));
            }
            Err(e) => return Err(e),
        };

        self.store_bundle(&connection, &bundle).await?;
        Ok(bundle.access_token)
    }

    async fn store_bundle(
        &self,
        connection: &PlatformConnection,
        bundle: &TokenBundle,
    ) -> Result<()> {
        let access_sealed = self.secrets.seal_str(&bundle.access_token)?;
        let refresh_sealed = bundle
            .refresh_token
            .as_deref()
            .map(|t| self.secrets.seal_str(t))
            .transpose()?;
        self.db
            .update_connection_tokens(
                connection.id,
                access_sealed,
                refresh_sealed,
                bundle.expires_at,
                self.clock.now_ms(),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::db::test_db;
    use crate::platforms::mock::MockAdapter;
    use crate::types::PlatformId;

    const START_MS: i64 = 1_700_000_000_000;

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Database,
        clock: Arc<VirtualClock>,
        secrets: Arc<SecretBox>,
        manager: TokenManager,
        adapter: Arc<MockAdapter>,
    }

    async fn fixture() -> Fixture {
        let (dir, db) = test_db().await;
        let clock = Arc::new(VirtualClock::at_ms(START_MS));
        let secrets = Arc::new(SecretBox::derive("test-key", b"salt"));
        let manager = TokenManager::new(db.clone(), secrets.clone(), clock.clone(), None);
        let adapter = Arc::new(MockAdapter::new(PlatformId::Instagram, clock.clone()));
        Fixture {
            _dir: dir,
            db,
            clock,
            secrets,
            manager,
            adapter,
        }
    }

    async fn seed_connection(fx: &Fixture, expires_at: i64, with_refresh: bool) -> Uuid {
        let connection = PlatformConnection {
            id: Uuid::new_v4(),
            user_id: "u1".into(),
            platform: PlatformId::Instagram,
            account_id: "acct".into(),
            display_name: "d".into(),
            scopes: vec![],
            access_token_sealed: fx.secrets.seal_str("stored-access").unwrap(),
            refresh_token_sealed: with_refresh
                .then(|| fx.secrets.seal_str("stored-refresh").unwrap()),
            expires_at,
            active: true,
            created_at: 0,
            updated_at: 0,
        };
        fx.db.insert_connection(&connection).await.unwrap();
        connection.id
    }

    #[tokio::test]
    async fn fresh_token_returned_without_refresh() {
        let fx = fixture().await;
        let id = seed_connection(&fx, START_MS + 3_600_000, true).await;

        let token = fx.manager.access_token(fx.adapter.as_ref(), id).await.unwrap();
        assert_eq!(token, "stored-access");
        assert_eq!(fx.adapter.refresh_count(), 0);
    }

    #[tokio::test]
    async fn token_inside_safety_window_is_refreshed() {
        let fx = fixture().await;
        // Expires in 30s: inside the 60s window.
        let id = seed_connection(&fx, START_MS + 30_000, true).await;

        let token = fx.manager.access_token(fx.adapter.as_ref(), id).await.unwrap();
        assert_eq!(token, "refreshed-token-1");
        assert_eq!(fx.adapter.refresh_count(), 1);

        // The stored bundle was replaced and sealed.
        let row = fx.db.get_connection(id).await.unwrap().unwrap();
        assert_eq!(
            fx.secrets.open_str(&row.access_token_sealed).unwrap(),
            "refreshed-token-1"
        );
        assert!(row.expires_at > START_MS + SAFETY_WINDOW_MS);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let fx = fixture().await;
        let id = seed_connection(&fx, START_MS - 1_000, true).await;

        let (a, b) = tokio::join!(
            fx.manager.access_token(fx.adapter.as_ref(), id),
            fx.manager.access_token(fx.adapter.as_ref(), id),
        );
        let a = a.unwrap();
        let b = b.unwrap();
        assert_eq!(a, "refreshed-token-1");
        assert_eq!(b, "refreshed-token-1");
        assert_eq!(fx.adapter.refresh_count(), 1);
    }

    #[tokio::test]
    async fn invalid_grant_deactivates_connection() {
        let fx = fixture().await;
        let id = seed_connection(&fx, START_MS - 1_000, true).await;
        fx.adapter
            .push_refresh_err(Error::new(ErrorKind::InvalidGrant, "revoked"));

        let err = fx
            .manager
            .access_token(fx.adapter.as_ref(), id)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthRevoked);

        let row = fx.db.get_connection(id).await.unwrap().unwrap();
        assert!(!row.active);

        // Subsequent requests fail fast on the inactive connection.
        let err = fx
            .manager
            .access_token(fx.adapter.as_ref(), id)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthRevoked);
    }

    #[tokio::test]
    async fn transient_refresh_failures_propagate() {
        let fx = fixture().await;
        let id = seed_connection(&fx, START_MS - 1_000, true).await;
        fx.adapter
            .push_refresh_err(Error::new(ErrorKind::PlatformTransient, "gateway timeout"));

        let err = fx
            .manager
            .access_token(fx.adapter.as_ref(), id)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PlatformTransient);

        // The connection stays active for the retry.
        let row = fx.db.get_connection(id).await.unwrap().unwrap();
        assert!(row.active);
    }

    #[tokio::test]
    async fn expired_without_refresh_grant_is_auth_expired() {
        let fx = fixture().await;
        let id = seed_connection(&fx, START_MS - 1_000, false).await;

        let err = fx
            .manager
            .access_token(fx.adapter.as_ref(), id)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthExpired);
        assert!(err.message.contains("reconnect"));
    }

    #[tokio::test]
    async fn force_refresh_reuses_a_just_completed_refresh() {
        let fx = fixture().await;
        let id = seed_connection(&fx, START_MS + 20_000, true).await;

        // First caller refreshes.
        let token = fx
            .manager
            .force_refresh(fx.adapter.as_ref(), id)
            .await
            .unwrap();
        assert_eq!(token, "refreshed-token-1");

        // A forced refresh started before that one completed reuses it.
        let token = fx
            .manager
            .force_refresh(fx.adapter.as_ref(), id)
            .await
            .unwrap();
        assert_eq!(token, "refreshed-token-1");
        assert_eq!(fx.adapter.refresh_count(), 1);
    }

    #[tokio::test]
    async fn missing_app_credential_is_config_missing() {
        let fx = fixture().await;
        let err = fx.manager.app_credential().unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConfigMissing);
    }

    #[tokio::test]
    async fn unknown_connection_is_auth_revoked() {
        let fx = fixture().await;
        let err = fx
            .manager
            .access_token(fx.adapter.as_ref(), Uuid::new_v4())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthRevoked);
        assert!(err.message.contains("not connected"));
    }
}
