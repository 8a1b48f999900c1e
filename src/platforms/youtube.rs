//! YouTube adapter (Data API v3, resumable uploads).
//!
//! Publish opens a resumable session, streams the bytes in 5 MiB ranged
//! PUTs (308 between chunks), and reads the video id off the final response.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use url::Url;

use super::chunked::CHUNK_SIZE;
use super::{
    json_or_error, map_error_status, required_str, MediaConstraints, PlatformAdapter,
    PlatformIdentity, PublishContext, PublishSpec, PublishedPost, VideoSource,
};
use crate::clock::Clock;
use crate::config::OAuthApp;
use crate::error::{Error, ErrorKind, Result};
use crate::types::{PlatformId, TokenBundle};

const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const CHANNELS_URL: &str = "https://www.googleapis.com/youtube/v3/channels";
const UPLOAD_URL: &str = "https://www.googleapis.com/upload/youtube/v3/videos";

const SCOPE: &str = "https://www.googleapis.com/auth/youtube.upload https://www.googleapis.com/auth/youtube.readonly";
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

pub struct YoutubeAdapter {
    app: OAuthApp,
    http: reqwest::Client,
    clock: Arc<dyn Clock>,
}

impl YoutubeAdapter {
    pub fn new(app: OAuthApp, http: reqwest::Client, clock: Arc<dyn Clock>) -> Self {
        Self { app, http, clock }
    }

    fn bundle_from_token_response(
        &self,
        data: &serde_json::Value,
        fallback_refresh: Option<&str>,
    ) -> Result<TokenBundle> {
        let expires_in = data
            .get("expires_in")
            .and_then(|v| v.as_i64())
            .unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        Ok(TokenBundle {
            access_token: required_str(data, "/access_token")?,
            refresh_token: data
                .get("refresh_token")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .or_else(|| fallback_refresh.map(str::to_string)),
            expires_at: self.clock.now_ms() + expires_in * 1000,
            scopes: data
                .get("scope")
                .and_then(|v| v.as_str())
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            account_id: String::new(),
            display_name: None,
        })
    }
}

#[async_trait]
impl PlatformAdapter for YoutubeAdapter {
    fn id(&self) -> PlatformId {
        PlatformId::Youtube
    }

    fn media_constraints(&self) -> MediaConstraints {
        MediaConstraints {
            containers: &["mp4", "mov", "avi", "webm"],
            codecs: &["h264", "hevc", "vp9", "av1"],
            max_size_bytes: 128 * 1024 * 1024 * 1024,
            min_duration_ms: 1_000,
            max_duration_ms: 12 * 60 * 60 * 1000,
        }
    }

    fn build_authorization_url(&self, state: &str, _code_verifier: Option<&str>) -> Result<String> {
        let mut url = Url::parse(AUTH_URL).map_err(|e| Error::internal(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.app.client_id)
            .append_pair("redirect_uri", &self.app.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", SCOPE)
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent")
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
                ("code", code),
                ("grant_type", "authorization_code"),
                ("redirect_uri", self.app.redirect_uri.as_str()),
            ])
            .send()
            .await?;
        let data = json_or_error(self.id(), response).await?;
        self.bundle_from_token_response(&data, None)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenBundle> {
        let response = self
            .http
            .post(TOKEN_URL)
            .form(&[
                ("client_id", self.app.client_id.as_str()),
                ("client_secret", self.app.client_secret.as_str()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await?;

        // Google reports a revoked grant as 400 {"error": "invalid_grant"}.
        if response.status() == reqwest::StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            if body.contains("invalid_grant") {
                return Err(Error::new(
                    ErrorKind::InvalidGrant,
                    "youtube rejected the refresh token",
                ));
            }
            return Err(Error::new(
                ErrorKind::PlatformPermanent,
                format!("youtube refresh rejected: {}", super::excerpt(&body)),
            ));
        }

        let data = json_or_error(self.id(), response).await?;
        self.bundle_from_token_response(&data, Some(refresh_token))
    }

    async fn fetch_identity(&self, access_token: &str) -> Result<PlatformIdentity> {
        let response = self
            .http
            .get(CHANNELS_URL)
            .query(&[("part", "snippet"), ("mine", "true")])
            .bearer_auth(access_token)
            .send()
            .await?;
        let data = json_or_error(self.id(), response).await?;
        Ok(PlatformIdentity {
            account_id: required_str(&data, "/items/0/id")?,
            display_name: required_str(&data, "/items/0/snippet/title").unwrap_or_default(),
        })
    }

    async fn publish(
        &self,
        video: &VideoSource<'_>,
        spec: &PublishSpec,
        access_token: &str,
        _ctx: &PublishContext<'_>,
    ) -> Result<PublishedPost> {
        // Title is the caption's first line, clamped to YouTube's 100 chars.
        let title: String = spec
            .caption
            .lines()
            .next()
            .unwrap_or("Untitled")
            .chars()
            .take(100)
            .collect();

        let metadata = json!({
            "snippet": {
                "title": title,
                "description": spec.caption,
                "tags": spec.tags,
                "categoryId": spec.category_id.as_deref().unwrap_or("22"),
            },
            "status": { "privacyStatus": spec.privacy },
        });

        // Open the resumable session.
        let response = self
            .http
            .post(UPLOAD_URL)
            .query(&[("uploadType", "resumable"), ("part", "snippet,status")])
            .bearer_auth(access_token)
            .header("X-Upload-Content-Type", "video/mp4")
            .header("X-Upload-Content-Length", video.size_bytes)
            .json(&metadata)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_error_status(self.id(), status, None, &body));
        }
        let session_url = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::PlatformTransient,
                    "youtube resumable session missing Location header",
                )
            })?;

        // Stream the bytes in ranged PUTs; 308 acknowledges each chunk.
        let total = video.size_bytes;
        let mut offset: i64 = 0;
        loop {
            let chunk = video
                .store
                .read_range(video.key, offset as u64, CHUNK_SIZE)
                .await?;
            if chunk.is_empty() {
                return Err(Error::new(
                    ErrorKind::StorageUnavailable,
                    "video object shorter than declared size",
                ));
            }
            let end = offset + chunk.len() as i64 - 1;
            let response = self
                .http
                .put(&session_url)
                .bearer_auth(access_token)
                .header(
                    reqwest::header::CONTENT_RANGE,
                    format!("bytes {offset}-{end}/{total}"),
                )
                .body(chunk)
                .send()
                .await?;

            let status = response.status();
            if status.as_u16() == 308 {
                offset = end + 1;
                continue;
            }
            if status.is_success() {
                let data = response.json::<serde_json::Value>().await.map_err(|e| {
                    Error::new(
                        ErrorKind::PlatformTransient,
                        format!("youtube returned unparseable body: {e}"),
                    )
                })?;
                let video_id = required_str(&data, "/id")?;
                return Ok(PublishedPost {
                    platform_url: Some(format!("https://www.youtube.com/watch?v={video_id}")),
                    platform_post_id: video_id,
                });
            }
            let body = response.text().await.unwrap_or_default();
            return Err(map_error_status(self.id(), status, None, &body));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn adapter() -> YoutubeAdapter {
        YoutubeAdapter::new(
            OAuthApp {
                client_id: "cid".into(),
                client_secret: "secret".into(),
                redirect_uri: "https://app.test/callback/youtube".into(),
            },
            reqwest::Client::new(),
            Arc::new(SystemClock::new()),
        )
    }

    #[test]
    fn authorization_url_requests_offline_access() {
        let url = adapter().build_authorization_url("st", None).unwrap();
        assert!(url.starts_with(AUTH_URL));
        assert!(url.contains("access_type=offline"));
        assert!(url.contains("prompt=consent"));
        assert!(url.contains("state=st"));
    }

    #[test]
    fn refresh_falls_back_to_previous_refresh_token() {
        let adapter = adapter();
        let data = serde_json::json!({
            "access_token": "ya29.new",
            "expires_in": 3599,
            "scope": "https://www.googleapis.com/auth/youtube.upload",
        });
        let bundle = adapter
            .bundle_from_token_response(&data, Some("1//refresh"))
            .unwrap();
        assert_eq!(bundle.refresh_token.as_deref(), Some("1//refresh"));
        assert_eq!(bundle.scopes.len(), 1);
    }

    #[test]
    fn declared_limits() {
        let adapter = adapter();
        assert_eq!(adapter.caption_limit(), 5000);
        assert!(adapter.supports_refresh());
        assert_eq!(
            adapter.media_constraints().max_duration_ms,
            12 * 60 * 60 * 1000
        );
    }
}
