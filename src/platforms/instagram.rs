//! Instagram adapter (Graph API container publishing).
//!
//! Instagram pulls the video by URL: a media container is created with a
//! presigned GET URL from the object store, its processing status is polled,
//! and the container is then published. The code-grant token is exchanged
//! for a long-lived token at connect time; there is no refresh grant.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use super::chunked::{poll_until_ready, ProcessingState};
use super::{
    json_or_error, required_str, MediaConstraints, PlatformAdapter, PlatformIdentity,
    PublishContext, PublishSpec, PublishedPost, VideoSource,
};
use crate::clock::Clock;
use crate::config::OAuthApp;
use crate::error::{Error, ErrorKind, Result};
use crate::types::{PlatformId, TokenBundle};

const AUTH_URL: &str = "https://api.instagram.com/oauth/authorize";
const TOKEN_URL: &str = "https://api.instagram.com/oauth/access_token";
const EXCHANGE_URL: &str = "https://graph.instagram.com/access_token";
const GRAPH_URL: &str = "https://graph.facebook.com/v18.0";
const ME_URL: &str = "https://graph.instagram.com/me";

const SCOPE: &str = "instagram_basic,instagram_content_publish";
const LONG_LIVED_EXPIRES_SECS: i64 = 60 * 24 * 60 * 60;
/// Presigned URL lifetime; covers Instagram's server-side fetch window.
const SOURCE_URL_TTL: Duration = Duration::from_secs(3600);

pub struct InstagramAdapter {
    app: OAuthApp,
    http: reqwest::Client,
    clock: Arc<dyn Clock>,
}

impl InstagramAdapter {
    pub fn new(app: OAuthApp, http: reqwest::Client, clock: Arc<dyn Clock>) -> Self {
        Self { app, http, clock }
    }
}

#[async_trait]
impl PlatformAdapter for InstagramAdapter {
    fn id(&self) -> PlatformId {
        PlatformId::Instagram
    }

    fn supports_refresh(&self) -> bool {
        false
    }

    fn media_constraints(&self) -> MediaConstraints {
        MediaConstraints {
            containers: &["mp4", "mov"],
            codecs: &["h264", "hevc"],
            max_size_bytes: 1024 * 1024 * 1024,
            min_duration_ms: 3_000,
            max_duration_ms: 90_000,
        }
    }

    fn build_authorization_url(&self, state: &str, _code_verifier: Option<&str>) -> Result<String> {
        let mut url = Url::parse(AUTH_URL).map_err(|e| Error::internal(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.app.client_id)
            .append_pair("redirect_uri", &self.app.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", SCOPE)
            .append_pair("state", state);
        Ok(url.into())
    }

    async fn exchange_code(&self, code: &str, _code_verifier: Option<&str>) -> Result<TokenBundle> {
        let response = self
            .http
            .post(TOKEN_URL)
            .form(&[
                ("client_id", self.app.client_id.as_str()),
                ("client_secret", self.app.client_secret.as_str()),
                ("grant_type", "authorization_code"),
                ("redirect_uri", self.app.redirect_uri.as_str()),
                ("code", code),
            ])
            .send()
            .await?;
        let data = json_or_error(self.id(), response).await?;
        let short_lived = required_str(&data, "/access_token")?;
        let account_id = required_str(&data, "/user_id").unwrap_or_default();

        // Upgrade to the 60-day token immediately; the short-lived token is
        // never persisted.
        let response = self
            .http
            .get(EXCHANGE_URL)
            .query(&[
                ("grant_type", "ig_exchange_token"),
                ("client_secret", self.app.client_secret.as_str()),
                ("access_token", short_lived.as_str()),
            ])
            .send()
            .await?;
        let data = json_or_error(self.id(), response).await?;
        let expires_in = data
            .get("expires_in")
            .and_then(|v| v.as_i64())
            .unwrap_or(LONG_LIVED_EXPIRES_SECS);

        Ok(TokenBundle {
            access_token: required_str(&data, "/access_token")?,
            refresh_token: None,
            expires_at: self.clock.now_ms() + expires_in * 1000,
            scopes: SCOPE.split(',').map(str::to_string).collect(),
            account_id,
            display_name: None,
        })
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<TokenBundle> {
        Err(Error::new(
            ErrorKind::AuthExpired,
            "instagram does not support token refresh; reconnect the account",
        ))
    }

    async fn fetch_identity(&self, access_token: &str) -> Result<PlatformIdentity> {
        let response = self
            .http
            .get(ME_URL)
            .query(&[("fields", "id,username"), ("access_token", access_token)])
            .send()
            .await?;
        let data = json_or_error(self.id(), response).await?;
        Ok(PlatformIdentity {
            account_id: required_str(&data, "/id")?,
            display_name: required_str(&data, "/username").unwrap_or_default(),
        })
    }

    async fn publish(
        &self,
        video: &VideoSource<'_>,
        spec: &PublishSpec,
        access_token: &str,
        ctx: &PublishContext<'_>,
    ) -> Result<PublishedPost> {
        let video_url = video
            .store
            .presigned_get_url(video.key, SOURCE_URL_TTL)
            .await?;

        // Create the media container.
        let response = self
            .http
            .post(format!("{GRAPH_URL}/{}/media", ctx.account_id))
            .form(&[
                ("media_type", "REELS"),
                ("video_url", video_url.as_str()),
                ("caption", spec.caption.as_str()),
                ("access_token", access_token),
            ])
            .send()
            .await?;
        let data = json_or_error(self.id(), response).await?;
        let container_id = required_str(&data, "/id")?;

        // Wait for Instagram's server-side fetch and transcode.
        poll_until_ready(ctx.clock, || {
            self.probe_container(&container_id, access_token)
        })
        .await?;

        // Publish the finished container.
        let response = self
            .http
            .post(format!("{GRAPH_URL}/{}/media_publish", ctx.account_id))
            .form(&[
                ("creation_id", container_id.as_str()),
                ("access_token", access_token),
            ])
            .send()
            .await?;
        let data = json_or_error(self.id(), response).await?;
        let media_id = required_str(&data, "/id")?;

        // Permalink is best-effort; the post id is the durable reference.
        let platform_url = self.fetch_permalink(&media_id, access_token).await;

        Ok(PublishedPost {
            platform_post_id: media_id,
            platform_url,
        })
    }
}

impl InstagramAdapter {
    async fn probe_container(
        &self,
        container_id: &str,
        access_token: &str,
    ) -> Result<ProcessingState> {
        let response = self
            .http
            .get(format!("{GRAPH_URL}/{container_id}"))
            .query(&[("fields", "status_code"), ("access_token", access_token)])
            .send()
            .await?;
        let data = json_or_error(self.id(), response).await?;
        Ok(
            match data.get("status_code").and_then(|v| v.as_str()).unwrap_or("IN_PROGRESS") {
                "FINISHED" => ProcessingState::Ready { url: None },
                "ERROR" => ProcessingState::Failed {
                    message: "instagram rejected the media container".into(),
                },
                _ => ProcessingState::Pending {
                    check_after: Some(Duration::from_secs(5)),
                },
            },
        )
    }

    async fn fetch_permalink(&self, media_id: &str, access_token: &str) -> Option<String> {
        let response = self
            .http
            .get(format!("{GRAPH_URL}/{media_id}"))
            .query(&[("fields", "permalink"), ("access_token", access_token)])
            .send()
            .await
            .ok()?;
        let data = response.json::<serde_json::Value>().await.ok()?;
        data.get("permalink").and_then(|v| v.as_str()).map(str::to_string)
    }
}
