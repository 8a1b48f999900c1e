//! Process configuration.
//!
//! Loaded once at start and immutable during the run. A TOML file provides
//! defaults; environment variables (the deployment surface) override it.
//! Required options are checked by [`Config::validate`]; absent per-platform
//! credentials degrade that platform to `CONFIG_MISSING` on use.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::PlatformId;

/// OAuth 2.0 application registration for one platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthApp {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

/// App-level OAuth 1.0a credential for Twitter media upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwitterAppCredential {
    pub api_key: String,
    pub api_secret: String,
    pub access_token: String,
    pub access_token_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database_url: String,
    /// Source material for the process sealing key.
    pub encryption_key: String,
    /// Stable KDF salt, stored with configuration.
    #[serde(default = "default_encryption_salt")]
    pub encryption_salt: String,
    #[serde(default)]
    pub job_broker_url: Option<String>,
    #[serde(default)]
    pub object_store: Option<ObjectStoreConfig>,
    #[serde(default)]
    pub tiktok: Option<OAuthApp>,
    #[serde(default)]
    pub youtube: Option<OAuthApp>,
    #[serde(default)]
    pub twitter: Option<OAuthApp>,
    #[serde(default)]
    pub instagram: Option<OAuthApp>,
    #[serde(default)]
    pub facebook: Option<OAuthApp>,
    #[serde(default)]
    pub twitter_app: Option<TwitterAppCredential>,
    #[serde(default = "default_scheduler_tick_ms")]
    pub scheduler_tick_ms: u64,
    #[serde(default = "default_dispatcher_concurrency")]
    pub dispatcher_concurrency: usize,
    #[serde(default = "default_publish_deadline_ms")]
    pub publish_deadline_ms: u64,
}

fn default_encryption_salt() -> String {
    "vidcast-token-sealing-salt".to_string()
}

fn default_scheduler_tick_ms() -> u64 {
    30_000
}

fn default_dispatcher_concurrency() -> usize {
    4
}

fn default_publish_deadline_ms() -> u64 {
    1_800_000
}

impl Config {
    /// Parse a TOML configuration document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::error::Error::config_missing(format!("config parse error: {e}")))?;
        Ok(config)
    }

    /// Build configuration purely from the process environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Config {
            database_url: require_env("DATABASE_URL")?,
            encryption_key: require_env("ENCRYPTION_KEY")?,
            encryption_salt: env_or("ENCRYPTION_SALT", default_encryption_salt()),
            job_broker_url: optional_env("JOB_BROKER_URL"),
            object_store: object_store_from_env(),
            tiktok: None,
            youtube: None,
            twitter: None,
            instagram: None,
            facebook: None,
            twitter_app: twitter_app_from_env(),
            scheduler_tick_ms: env_parsed("SCHEDULER_TICK_MS", default_scheduler_tick_ms()),
            dispatcher_concurrency: env_parsed(
                "DISPATCHER_CONCURRENCY",
                default_dispatcher_concurrency(),
            ),
            publish_deadline_ms: env_parsed("PUBLISH_DEADLINE_MS", default_publish_deadline_ms()),
        };
        config.tiktok = oauth_app_from_env("TIKTOK");
        config.youtube = oauth_app_from_env("YOUTUBE");
        config.twitter = oauth_app_from_env("TWITTER");
        config.instagram = oauth_app_from_env("INSTAGRAM");
        config.facebook = oauth_app_from_env("FACEBOOK");
        Ok(config)
    }

    /// Check required options; call once at startup.
    pub fn validate(&self) -> Result<()> {
        if self.database_url.is_empty() {
            return Err(crate::error::Error::config_missing("DATABASE_URL is empty"));
        }
        if self.encryption_key.is_empty() {
            return Err(crate::error::Error::config_missing("ENCRYPTION_KEY is empty"));
        }
        if self.twitter.is_some() && self.twitter_app.is_none() {
            // Publishable Twitter needs the 1.0a media credential; identity
            // alone still works, so this is a warning, not an error.
            tracing::warn!("twitter oauth app configured without TWITTER_API_KEY credentials; media upload will fail CONFIG_MISSING");
        }
        Ok(())
    }

    /// OAuth application for a platform, if configured.
    pub fn oauth_app(&self, platform: PlatformId) -> Option<&OAuthApp> {
        match platform {
            PlatformId::Tiktok => self.tiktok.as_ref(),
            PlatformId::Youtube => self.youtube.as_ref(),
            PlatformId::Twitter => self.twitter.as_ref(),
            PlatformId::Instagram => self.instagram.as_ref(),
            PlatformId::Facebook => self.facebook.as_ref(),
        }
    }
}

fn require_env(name: &str) -> Result<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::config_missing(format!("{name} is not set")))
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_or(name: &str, default: String) -> String {
    optional_env(name).unwrap_or(default)
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    optional_env(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn oauth_app_from_env(prefix: &str) -> Option<OAuthApp> {
    Some(OAuthApp {
        client_id: optional_env(&format!("{prefix}_CLIENT_ID"))?,
        client_secret: optional_env(&format!("{prefix}_CLIENT_SECRET"))?,
        redirect_uri: optional_env(&format!("{prefix}_REDIRECT_URI"))?,
    })
}

fn twitter_app_from_env() -> Option<TwitterAppCredential> {
    Some(TwitterAppCredential {
        api_key: optional_env("TWITTER_API_KEY")?,
        api_secret: optional_env("TWITTER_API_SECRET")?,
        access_token: optional_env("TWITTER_ACCESS_TOKEN")?,
        access_token_secret: optional_env("TWITTER_ACCESS_TOKEN_SECRET")?,
    })
}

fn object_store_from_env() -> Option<ObjectStoreConfig> {
    Some(ObjectStoreConfig {
        endpoint: optional_env("OBJECT_STORE_ENDPOINT")?,
        bucket: optional_env("OBJECT_STORE_BUCKET")?,
        access_key: optional_env("OBJECT_STORE_ACCESS_KEY")?,
        secret_key: optional_env("OBJECT_STORE_SECRET_KEY")?,
    })
}
