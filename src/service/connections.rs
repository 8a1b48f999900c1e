//! Platform connection operations: OAuth start/complete, disconnect, listing.

use std::sync::Arc;

use tracing::info;

use super::events::{Event, EventBus};
use crate::clock::Clock;
use crate::crypto::{SecretBox, StateSigner};
use crate::db::Database;
use crate::error::Result;
use crate::platforms::AdapterRegistry;
use crate::types::{PlatformConnection, PlatformId};

/// Token-free projection of a connection for callers.
#[derive(Debug, Clone)]
pub struct ConnectionView {
    pub id: uuid::Uuid,
    pub platform: PlatformId,
    pub account_id: String,
    pub display_name: String,
    pub scopes: Vec<String>,
    pub expires_at: i64,
    pub active: bool,
}

impl From<&PlatformConnection> for ConnectionView {
    fn from(conn: &PlatformConnection) -> Self {
        Self {
            id: conn.id,
            platform: conn.platform,
            account_id: conn.account_id.clone(),
            display_name: conn.display_name.clone(),
            scopes: conn.scopes.clone(),
            expires_at: conn.expires_at,
            active: conn.active,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OAuthStart {
    pub authorization_url: String,
    pub state: String,
}

pub struct ConnectionService {
    db: Database,
    registry: Arc<AdapterRegistry>,
    secrets: Arc<SecretBox>,
    state_signer: Arc<StateSigner>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl ConnectionService {
    pub fn new(
        db: Database,
        registry: Arc<AdapterRegistry>,
        secrets: Arc<SecretBox>,
        state_signer: Arc<StateSigner>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self {
            db,
            registry,
            secrets,
            state_signer,
            clock,
            events,
        }
    }

    /// Begin the OAuth dance: mint a signed state token and build the
    /// platform's authorization URL around it. Adapters that use PKCE get a
    /// fresh verifier whose only round-trip channel is the state token.
    pub async fn start_platform_oauth(
        &self,
        user_id: &str,
        platform_name: &str,
    ) -> Result<OAuthStart> {
        let platform = PlatformId::parse(platform_name)?;
        let adapter = self.registry.get(platform)?;

        let expires_at = self.clock.now_ms() + StateSigner::DEFAULT_TTL_MS;
        let code_verifier = adapter.new_code_verifier()?;
        let state = match code_verifier.as_deref() {
            Some(verifier) => {
                self.state_signer
                    .mint_with_claim(user_id, platform.as_str(), verifier, expires_at)
            }
            None => self.state_signer.mint(user_id, platform.as_str(), expires_at),
        };
        let authorization_url =
            adapter.build_authorization_url(&state, code_verifier.as_deref())?;
        Ok(OAuthStart {
            authorization_url,
            state,
        })
    }

    /// Finish the OAuth dance: validate state, exchange the code, resolve
    /// the platform identity, and persist the sealed token bundle.
    pub async fn complete_platform_oauth(
        &self,
        user_id: &str,
        platform_name: &str,
        code: &str,
        state: &str,
    ) -> Result<ConnectionView> {
        let platform = PlatformId::parse(platform_name)?;
        let code_verifier =
            self.state_signer
                .verify(state, user_id, platform.as_str(), self.clock.now_ms())?;

        let adapter = self.registry.get(platform)?;
        let bundle = adapter.exchange_code(code, code_verifier.as_deref()).await?;

        // Some token endpoints return the account identity inline; fetch it
        // otherwise.
        let (account_id, display_name) = if bundle.account_id.is_empty() {
            let identity = adapter.fetch_identity(&bundle.access_token).await?;
            (identity.account_id, identity.display_name)
        } else {
            (
                bundle.account_id.clone(),
                bundle.display_name.clone().unwrap_or_default(),
            )
        };

        let now = self.clock.now_ms();
        let connection = PlatformConnection {
            id: self.clock.new_id(),
            user_id: user_id.to_string(),
            platform,
            account_id,
            display_name,
            scopes: bundle.scopes.clone(),
            access_token_sealed: self.secrets.seal_str(&bundle.access_token)?,
            refresh_token_sealed: bundle
                .refresh_token
                .as_deref()
                .map(|t| self.secrets.seal_str(t))
                .transpose()?,
            expires_at: bundle.expires_at,
            active: true,
            created_at: now,
            updated_at: now,
        };
        self.db.insert_connection(&connection).await?;

        info!(connection_id = %connection.id, platform = %platform, "platform connected");
        self.events.emit(Event::ConnectionLinked {
            connection_id: connection.id,
            platform,
        });
        Ok(ConnectionView::from(&connection))
    }

    /// Deactivate the user's connections for a platform. Platform-side
    /// grants are not revoked remotely.
    pub async fn disconnect_platform(&self, user_id: &str, platform_name: &str) -> Result<bool> {
        let platform = PlatformId::parse(platform_name)?;
        let count = self
            .db
            .deactivate_user_platform(user_id, platform, self.clock.now_ms())
            .await?;
        if count > 0 {
            info!(platform = %platform, "platform disconnected");
            self.events.emit(Event::ConnectionRevoked { platform });
        }
        Ok(count > 0)
    }

    pub async fn list_connections(&self, user_id: &str) -> Result<Vec<ConnectionView>> {
        let connections = self.db.list_connections(user_id).await?;
        Ok(connections.iter().map(ConnectionView::from).collect())
    }
}
