//! TikTok adapter (Content Posting API).
//!
//! Publish is two-phase: INIT returns an upload URL and a publish id, the
//! video bytes go to the upload URL in one PUT, then the publish status
//! endpoint is polled until TikTok reports the post complete.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
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

const AUTH_URL: &str = "https://www.tiktok.com/v2/auth/authorize/";
const TOKEN_URL: &str = "https://open.tiktokapis.com/v2/oauth/token/";
const USER_INFO_URL: &str = "https://open.tiktokapis.com/v2/user/info/";
const PUBLISH_INIT_URL: &str = "https://open.tiktokapis.com/v2/post/publish/video/init/";
const PUBLISH_STATUS_URL: &str = "https://open.tiktokapis.com/v2/post/publish/status/fetch/";

const DEFAULT_SCOPE: &str = "video.upload,user.info.basic";
const DEFAULT_EXPIRES_IN_SECS: i64 = 86_400;

pub struct TiktokAdapter {
    app: OAuthApp,
    http: reqwest::Client,
    clock: Arc<dyn Clock>,
}

impl TiktokAdapter {
    pub fn new(app: OAuthApp, http: reqwest::Client, clock: Arc<dyn Clock>) -> Self {
        Self { app, http, clock }
    }

    fn bundle_from_token_response(&self, data: &serde_json::Value) -> Result<TokenBundle> {
        let expires_in = data
            .get("expires_in")
            .and_then(|v| v.as_i64())
            .unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        Ok(TokenBundle {
            access_token: required_str(data, "/access_token")?,
            refresh_token: data
                .get("refresh_token")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            expires_at: self.clock.now_ms() + expires_in * 1000,
            scopes: data
                .get("scope")
                .and_then(|v| v.as_str())
                .map(|s| s.split(',').map(str::to_string).collect())
                .unwrap_or_default(),
            account_id: required_str(data, "/open_id").unwrap_or_default(),
            display_name: None,
        })
    }
}

#[async_trait]
impl PlatformAdapter for TiktokAdapter {
    fn id(&self) -> PlatformId {
        PlatformId::Tiktok
    }

    fn media_constraints(&self) -> MediaConstraints {
        MediaConstraints {
            containers: &["mp4", "mov", "webm"],
            codecs: &["h264", "hevc"],
            max_size_bytes: 500 * 1024 * 1024,
            min_duration_ms: 3_000,
            max_duration_ms: 600_000,
        }
    }

    fn build_authorization_url(&self, state: &str, _code_verifier: Option<&str>) -> Result<String> {
        let mut url = Url::parse(AUTH_URL).map_err(|e| Error::internal(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("client_key", &self.app.client_id)
            .append_pair("response_type", "code")
            .append_pair("scope", DEFAULT_SCOPE)
            .append_pair("redirect_uri", &self.app.redirect_uri)
            .append_pair("state", state);
        Ok(url.into())
    }

    async fn exchange_code(&self, code: &str, _code_verifier: Option<&str>) -> Result<TokenBundle> {
        let response = self
            .http
            .post(TOKEN_URL)
            .form(&[
                ("client_key", self.app.client_id.as_str()),
                ("client_secret", self.app.client_secret.as_str()),
                ("code", code),
                ("grant_type", "authorization_code"),
                ("redirect_uri", self.app.redirect_uri.as_str()),
            ])
            .send()
            .await?;
        let data = json_or_error(self.id(), response).await?;
        self.bundle_from_token_response(&data)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenBundle> {
        let response = self
            .http
            .post(TOKEN_URL)
            .form(&[
                ("client_key", self.app.client_id.as_str()),
                ("client_secret", self.app.client_secret.as_str()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await?;
        let data = json_or_error(self.id(), response).await?;
        if data.pointer("/error").is_some()
            && data.pointer("/error/code").and_then(|v| v.as_str()) == Some("invalid_grant")
        {
            return Err(Error::new(
                ErrorKind::InvalidGrant,
                "tiktok rejected the refresh token",
            ));
        }
        let mut bundle = self.bundle_from_token_response(&data)?;
        if bundle.refresh_token.is_none() {
            bundle.refresh_token = Some(refresh_token.to_string());
        }
        Ok(bundle)
    }

    async fn fetch_identity(&self, access_token: &str) -> Result<PlatformIdentity> {
        let response = self
            .http
            .get(USER_INFO_URL)
            .query(&[("fields", "open_id,display_name")])
            .bearer_auth(access_token)
            .send()
            .await?;
        let data = json_or_error(self.id(), response).await?;
        Ok(PlatformIdentity {
            account_id: required_str(&data, "/data/user/open_id")?,
            display_name: required_str(&data, "/data/user/display_name").unwrap_or_default(),
        })
    }

    async fn publish(
        &self,
        video: &VideoSource<'_>,
        spec: &PublishSpec,
        access_token: &str,
        ctx: &PublishContext<'_>,
    ) -> Result<PublishedPost> {
        // Phase 1: INIT declares the post and yields the upload target.
        let init_payload = json!({
            "post_info": {
                "title": spec.caption,
                "privacy_level": spec.privacy.to_ascii_uppercase(),
                "disable_comment": false,
                "disable_duet": false,
                "disable_stitch": false,
            },
            "source_info": {
                "source": "FILE_UPLOAD",
                "video_size": video.size_bytes,
            }
        });
        let response = self
            .http
            .post(PUBLISH_INIT_URL)
            .bearer_auth(access_token)
            .json(&init_payload)
            .send()
            .await?;
        let data = json_or_error(self.id(), response).await?;
        let upload_url = required_str(&data, "/data/upload_url")?;
        let publish_id = required_str(&data, "/data/publish_id")?;

        // Phase 2: single PUT of the video bytes.
        let bytes = video.store.read(video.key).await?;
        let response = self
            .http
            .put(&upload_url)
            .header(reqwest::header::CONTENT_TYPE, "video/mp4")
            .body(bytes)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(super::map_error_status(self.id(), status, None, &body));
        }

        // Phase 3: poll until TikTok finishes server-side publishing.
        poll_until_ready(ctx.clock, || self.probe_status(&publish_id, access_token)).await?;

        Ok(PublishedPost {
            platform_post_id: publish_id,
            platform_url: None,
        })
    }
}

impl TiktokAdapter {
    async fn probe_status(&self, publish_id: &str, access_token: &str) -> Result<ProcessingState> {
        let response = self
            .http
            .post(PUBLISH_STATUS_URL)
            .bearer_auth(access_token)
            .json(&json!({ "publish_id": publish_id }))
            .send()
            .await?;
        let data = json_or_error(self.id(), response).await?;
        let status = data
            .pointer("/data/status")
            .and_then(|v| v.as_str())
            .unwrap_or("PROCESSING");
        Ok(match status {
            "PUBLISH_COMPLETE" => ProcessingState::Ready { url: None },
            "FAILED" => ProcessingState::Failed {
                message: format!(
                    "tiktok publish failed: {}",
                    data.pointer("/data/fail_reason")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown reason")
                ),
            },
            _ => ProcessingState::Pending {
                check_after: Some(Duration::from_secs(5)),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn adapter() -> TiktokAdapter {
        TiktokAdapter::new(
            OAuthApp {
                client_id: "client-key".into(),
                client_secret: "secret".into(),
                redirect_uri: "https://app.test/callback/tiktok".into(),
            },
            reqwest::Client::new(),
            Arc::new(SystemClock::new()),
        )
    }

    #[test]
    fn authorization_url_carries_state_and_scope() {
        let url = adapter()
            .build_authorization_url("state-token", None)
            .unwrap();
        assert!(url.starts_with(AUTH_URL));
        assert!(url.contains("client_key=client-key"));
        assert!(url.contains("state=state-token"));
        assert!(url.contains("scope=video.upload%2Cuser.info.basic"));
        assert!(url.contains("response_type=code"));
    }

    #[test]
    fn token_response_maps_to_bundle() {
        let adapter = adapter();
        let data = serde_json::json!({
            "access_token": "act.123",
            "refresh_token": "rft.456",
            "expires_in": 7200,
            "open_id": "open-1",
            "scope": "video.upload,user.info.basic",
        });
        let bundle = adapter.bundle_from_token_response(&data).unwrap();
        assert_eq!(bundle.access_token, "act.123");
        assert_eq!(bundle.refresh_token.as_deref(), Some("rft.456"));
        assert_eq!(bundle.account_id, "open-1");
        assert_eq!(bundle.scopes.len(), 2);
        assert!(bundle.expires_at > adapter.clock.now_ms());
    }

    #[test]
    fn declared_limits() {
        let adapter = adapter();
        assert_eq!(adapter.caption_limit(), 2200);
        assert!(!adapter.requires_app_credential());
        assert!(adapter.supports_refresh());
        let constraints = adapter.media_constraints();
        assert_eq!(constraints.max_size_bytes, 500 * 1024 * 1024);
    }
}
