//! Platform adapter framework.
//!
//! The single seam through which platform heterogeneity enters the core:
//! a uniform auth/publish contract with one implementation per platform.
//! No other module branches on platform identity.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

pub mod chunked;
pub mod facebook;
pub mod instagram;
pub mod mock;
pub mod oauth1;
pub mod tiktok;
pub mod twitter;
pub mod youtube;

use crate::clock::Clock;
use crate::config::{Config, TwitterAppCredential};
use crate::error::{Error, ErrorKind, Result};
use crate::storage::ObjectStore;
use crate::types::{PlatformId, TokenBundle, Video};

/// Declared media acceptance for a platform.
#[derive(Debug, Clone)]
pub struct MediaConstraints {
    pub containers: &'static [&'static str],
    pub codecs: &'static [&'static str],
    pub max_size_bytes: i64,
    pub min_duration_ms: i64,
    pub max_duration_ms: i64,
}

#[derive(Debug, Clone)]
pub struct PlatformIdentity {
    pub account_id: String,
    pub display_name: String,
}

/// What to publish: caption (pre-validated against `caption_limit`), tags,
/// and optional platform extras.
#[derive(Debug, Clone)]
pub struct PublishSpec {
    pub caption: String,
    pub tags: Vec<String>,
    pub privacy: String,
    pub category_id: Option<String>,
}

impl PublishSpec {
    pub fn new(caption: impl Into<String>, tags: Vec<String>) -> Self {
        Self {
            caption: caption.into(),
            tags,
            privacy: "public".to_string(),
            category_id: None,
        }
    }
}

/// Handle to the video bytes in the object store.
pub struct VideoSource<'a> {
    pub key: &'a str,
    pub size_bytes: i64,
    pub container: &'a str,
    pub store: &'a dyn ObjectStore,
}

/// Per-attempt context handed to `publish`.
pub struct PublishContext<'a> {
    pub clock: &'a dyn Clock,
    /// Platform-side account id of the connection being published through.
    pub account_id: &'a str,
    /// App-level OAuth 1.0a credential, for adapters that declare the need.
    pub app_credential: Option<&'a TwitterAppCredential>,
}

#[derive(Debug, Clone)]
pub struct PublishedPost {
    pub platform_post_id: String,
    pub platform_url: Option<String>,
}

#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn id(&self) -> PlatformId;

    fn caption_limit(&self) -> usize {
        self.id().caption_limit()
    }

    fn media_constraints(&self) -> MediaConstraints;

    /// Whether `publish` needs the app-level OAuth 1.0a credential.
    fn requires_app_credential(&self) -> bool {
        false
    }

    /// Whether `refresh` can mint a new access token.
    fn supports_refresh(&self) -> bool {
        true
    }

    /// Fresh PKCE code verifier for one authorization dance, for platforms
    /// that require it. The service layer carries it to `exchange_code`
    /// inside the signed state token.
    fn new_code_verifier(&self) -> Result<Option<String>> {
        Ok(None)
    }

    fn build_authorization_url(&self, state: &str, code_verifier: Option<&str>) -> Result<String>;

    async fn exchange_code(&self, code: &str, code_verifier: Option<&str>) -> Result<TokenBundle>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenBundle>;

    async fn fetch_identity(&self, access_token: &str) -> Result<PlatformIdentity>;

    async fn publish(
        &self,
        video: &VideoSource<'_>,
        spec: &PublishSpec,
        access_token: &str,
        ctx: &PublishContext<'_>,
    ) -> Result<PublishedPost>;
}

/// Caption pre-flight shared by creation-time validation and the dispatcher.
pub fn validate_caption(platform: PlatformId, caption: &str) -> Result<()> {
    let limit = platform.caption_limit();
    let chars = caption.chars().count();
    if chars > limit {
        return Err(Error::validation(format!(
            "caption exceeds {platform} limit of {limit} characters (got {chars})"
        )));
    }
    Ok(())
}

/// Media pre-flight against the adapter's declared constraints.
pub fn validate_media(adapter: &dyn PlatformAdapter, video: &Video) -> Result<()> {
    let constraints = adapter.media_constraints();
    let platform = adapter.id();

    let container = video.container.to_ascii_lowercase();
    if !constraints.containers.contains(&container.as_str()) {
        return Err(Error::new(
            ErrorKind::MediaUnsupported,
            format!("{platform} does not accept container '{}'", video.container),
        ));
    }
    let codec = video.codec.to_ascii_lowercase();
    if !constraints.codecs.contains(&codec.as_str()) {
        return Err(Error::new(
            ErrorKind::MediaUnsupported,
            format!("{platform} does not accept codec '{}'", video.codec),
        ));
    }
    if video.size_bytes > constraints.max_size_bytes {
        return Err(Error::new(
            ErrorKind::MediaUnsupported,
            format!(
                "{platform} caps uploads at {} bytes (video is {})",
                constraints.max_size_bytes, video.size_bytes
            ),
        ));
    }
    if video.duration_ms < constraints.min_duration_ms
        || video.duration_ms > constraints.max_duration_ms
    {
        return Err(Error::new(
            ErrorKind::MediaUnsupported,
            format!(
                "{platform} requires duration between {} and {} ms",
                constraints.min_duration_ms, constraints.max_duration_ms
            ),
        ));
    }
    Ok(())
}

/// Truncate a response body for error records; never log whole bodies.
pub(crate) fn excerpt(body: &str) -> String {
    const MAX: usize = 200;
    if body.chars().count() <= MAX {
        body.to_string()
    } else {
        body.chars().take(MAX).collect()
    }
}

/// Map an HTTP failure status to the closed error set.
pub(crate) fn map_error_status(
    platform: PlatformId,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> Error {
    let excerpt = excerpt(body);
    match status {
        StatusCode::UNAUTHORIZED => Error::new(
            ErrorKind::AuthExpired,
            format!("{platform} rejected the access token"),
        ),
        StatusCode::FORBIDDEN => Error::new(
            ErrorKind::AuthRevoked,
            format!("{platform} reported the grant revoked"),
        ),
        StatusCode::TOO_MANY_REQUESTS => {
            let hint = retry_after.unwrap_or(Duration::from_secs(60));
            Error::rate_limited(
                format!("{platform} rate limit exceeded"),
                hint.as_millis() as u64,
            )
        }
        s if s.is_server_error() => Error::new(
            ErrorKind::PlatformTransient,
            format!("{platform} server error {s}: {excerpt}"),
        ),
        s => Error::new(
            ErrorKind::PlatformPermanent,
            format!("{platform} rejected the request ({s}): {excerpt}"),
        ),
    }
}

/// Check a response, returning its JSON body on success and a mapped error
/// otherwise.
pub(crate) async fn json_or_error(
    platform: PlatformId,
    response: reqwest::Response,
) -> Result<serde_json::Value> {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);

    if status.is_success() {
        let value = response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| Error::new(ErrorKind::PlatformTransient, format!("{platform} returned unparseable body: {e}")))?;
        return Ok(value);
    }

    let body = response.text().await.unwrap_or_default();
    Err(map_error_status(platform, status, retry_after, &body))
}

pub(crate) fn required_str(value: &serde_json::Value, pointer: &str) -> Result<String> {
    value
        .pointer(pointer)
        .and_then(|v| {
            v.as_str()
                .map(str::to_string)
                .or_else(|| v.as_i64().map(|n| n.to_string()))
        })
        .ok_or_else(|| {
            Error::new(
                ErrorKind::PlatformTransient,
                format!("response missing field {pointer}"),
            )
        })
}

/// Shared HTTP client for adapters.
pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_default()
}

/// Adapter selection: built once from configuration; unconfigured platforms
/// fail `CONFIG_MISSING` at lookup.
pub struct AdapterRegistry {
    adapters: HashMap<PlatformId, Arc<dyn PlatformAdapter>>,
}

impl AdapterRegistry {
    pub fn from_config(config: &Config, clock: Arc<dyn Clock>) -> Self {
        let http = http_client();
        let mut adapters: HashMap<PlatformId, Arc<dyn PlatformAdapter>> = HashMap::new();

        if let Some(app) = config.oauth_app(PlatformId::Tiktok) {
            adapters.insert(
                PlatformId::Tiktok,
                Arc::new(tiktok::TiktokAdapter::new(app.clone(), http.clone(), clock.clone())),
            );
        }
        if let Some(app) = config.oauth_app(PlatformId::Youtube) {
            adapters.insert(
                PlatformId::Youtube,
                Arc::new(youtube::YoutubeAdapter::new(app.clone(), http.clone(), clock.clone())),
            );
        }
        if let Some(app) = config.oauth_app(PlatformId::Twitter) {
            adapters.insert(
                PlatformId::Twitter,
                Arc::new(twitter::TwitterAdapter::new(app.clone(), http.clone(), clock.clone())),
            );
        }
        if let Some(app) = config.oauth_app(PlatformId::Instagram) {
            adapters.insert(
                PlatformId::Instagram,
                Arc::new(instagram::InstagramAdapter::new(
                    app.clone(),
                    http.clone(),
                    clock.clone(),
                )),
            );
        }
        if let Some(app) = config.oauth_app(PlatformId::Facebook) {
            adapters.insert(
                PlatformId::Facebook,
                Arc::new(facebook::FacebookAdapter::new(app.clone(), http, clock)),
            );
        }

        Self { adapters }
    }

    /// Registry with explicit adapters; used by tests to install mocks.
    pub fn with_adapters(adapters: Vec<Arc<dyn PlatformAdapter>>) -> Self {
        Self {
            adapters: adapters.into_iter().map(|a| (a.id(), a)).collect(),
        }
    }

    pub fn get(&self, platform: PlatformId) -> Result<Arc<dyn PlatformAdapter>> {
        self.adapters.get(&platform).cloned().ok_or_else(|| {
            Error::config_missing(format!("{platform} credentials are not configured"))
        })
    }

    pub fn configured(&self) -> Vec<PlatformId> {
        let mut platforms: Vec<_> = self.adapters.keys().copied().collect();
        platforms.sort();
        platforms
    }
}
