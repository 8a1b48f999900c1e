//! Facebook adapter (Graph video API).
//!
//! Facebook also pulls by URL: one POST to the page's `/videos` edge with a
//! presigned GET URL publishes the video. The code-grant token is exchanged
//! for a long-lived token at connect time; there is no refresh grant.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use super::{
    json_or_error, required_str, MediaConstraints, PlatformAdapter, PlatformIdentity,
    PublishContext, PublishSpec, PublishedPost, VideoSource,
};
use crate::clock::Clock;
use crate::config::OAuthApp;
use crate::error::{Error, ErrorKind, Result};
use crate::types::{PlatformId, TokenBundle};

const AUTH_URL: &str = "https://www.facebook.com/v18.0/dialog/oauth";
const TOKEN_URL: &str = "https://graph.facebook.com/v18.0/oauth/access_token";
const ME_URL: &str = "https://graph.facebook.com/v18.0/me";
const VIDEO_GRAPH_URL: &str = "https://graph-video.facebook.com/v18.0";

const SCOPE: &str = "pages_manage_posts,pages_read_engagement,publish_video";
const LONG_LIVED_EXPIRES_SECS: i64 = 60 * 24 * 60 * 60;
const SOURCE_URL_TTL: Duration = Duration::from_secs(3600);

pub struct FacebookAdapter {
    app: OAuthApp,
    http: reqwest::Client,
    clock: Arc<dyn Clock>,
}

impl FacebookAdapter {
    pub fn new(app: OAuthApp, http: reqwest::Client, clock: Arc<dyn Clock>) -> Self {
        Self { app, http, clock }
    }

    async fn exchange_long_lived(&self, short_lived: &str) -> Result<(String, i64)> {
        let response = self
            .http
            .get(TOKEN_URL)
            .query(&[
                ("grant_type", "fb_exchange_token"),
                ("client_id", self.app.client_id.as_str()),
                ("client_secret", self.app.client_secret.as_str()),
                ("fb_exchange_token", short_lived),
            ])
            .send()
            .await?;
        let data = json_or_error(self.id(), response).await?;
        let token = required_str(&data, "/access_token")?;
        let expires_in = data
            .get("expires_in")
            .and_then(|v| v.as_i64())
            .unwrap_or(LONG_LIVED_EXPIRES_SECS);
        Ok((token, expires_in))
    }
}

#[async_trait]
impl PlatformAdapter for FacebookAdapter {
    fn id(&self) -> PlatformId {
        PlatformId::Facebook
    }

    fn supports_refresh(&self) -> bool {
        false
    }

    fn media_constraints(&self) -> MediaConstraints {
        MediaConstraints {
            containers: &["mp4", "mov"],
            codecs: &["h264", "hevc"],
            max_size_bytes: 10 * 1024 * 1024 * 1024,
            min_duration_ms: 1_000,
            max_duration_ms: 4 * 60 * 60 * 1000,
        }
    }

    fn build_authorization_url(&self, state: &str, _code_verifier: Option<&str>) -> Result<String> {
        let mut url = Url::parse(AUTH_URL).map_err(|e| Error::internal(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.app.client_id)
            .append_pair("redirect_uri", &self.app.redirect_uri)
            .append_pair("scope", SCOPE)
            .append_pair("state", state);
        Ok(url.into())
    }

    async fn exchange_code(&self, code: &str, _code_verifier: Option<&str>) -> Result<TokenBundle> {
        let response = self
            .http
            .get(TOKEN_URL)
            .query(&[
                ("client_id", self.app.client_id.as_str()),
                ("client_secret", self.app.client_secret.as_str()),
                ("redirect_uri", self.app.redirect_uri.as_str()),
                ("code", code),
            ])
            .send()
            .await?;
        let data = json_or_error(self.id(), response).await?;
        let short_lived = required_str(&data, "/access_token")?;

        let (access_token, expires_in) = self.exchange_long_lived(&short_lived).await?;

        Ok(TokenBundle {
            access_token,
            refresh_token: None,
            expires_at: self.clock.now_ms() + expires_in * 1000,
            scopes: SCOPE.split(',').map(str::to_string).collect(),
            account_id: String::new(),
            display_name: None,
        })
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<TokenBundle> {
        Err(Error::new(
            ErrorKind::AuthExpired,
            "facebook does not support token refresh; reconnect the account",
        ))
    }

    async fn fetch_identity(&self, access_token: &str) -> Result<PlatformIdentity> {
        let response = self
            .http
            .get(ME_URL)
            .query(&[("fields", "id,name"), ("access_token", access_token)])
            .send()
            .await?;
        let data = json_or_error(self.id(), response).await?;
        Ok(PlatformIdentity {
            account_id: required_str(&data, "/id")?,
            display_name: required_str(&data, "/name").unwrap_or_default(),
        })
    }

    async fn publish(
        &self,
        video: &VideoSource<'_>,
        spec: &PublishSpec,
        access_token: &str,
        ctx: &PublishContext<'_>,
    ) -> Result<PublishedPost> {
        let file_url = video
            .store
            .presigned_get_url(video.key, SOURCE_URL_TTL)
            .await?;

        let response = self
            .http
            .post(format!("{VIDEO_GRAPH_URL}/{}/videos", ctx.account_id))
            .form(&[
                ("file_url", file_url.as_str()),
                ("description", spec.caption.as_str()),
                ("access_token", access_token),
            ])
            .send()
            .await?;
        let data = json_or_error(self.id(), response).await?;
        let video_id = required_str(&data, "/id")?;

        Ok(PublishedPost {
            platform_url: Some(format!("https://www.facebook.com/{video_id}")),
            platform_post_id: video_id,
        })
    }
}
