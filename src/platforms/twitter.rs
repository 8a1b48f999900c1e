//! Twitter adapter.
//!
//! Dual-credential platform: the user's OAuth 2.0 bearer token creates the
//! tweet and answers identity calls, while media upload goes through the
//! app-level OAuth 1.0a credential on the chunked upload endpoints
//! (INIT → APPEND → FINALIZE → STATUS).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde_json::json;
use sha2::{Digest, Sha256};
use url::Url;

use super::chunked::{ChunkedUploader, MediaTransport, ProcessingState};
use super::{
    json_or_error, oauth1, required_str, MediaConstraints, PlatformAdapter, PlatformIdentity,
    PublishContext, PublishSpec, PublishedPost, VideoSource,
};
use crate::clock::Clock;
use crate::config::{OAuthApp, TwitterAppCredential};
use crate::error::{Error, ErrorKind, Result};
use crate::types::{PlatformId, TokenBundle};

const AUTH_URL: &str = "https://twitter.com/i/oauth2/authorize";
const TOKEN_URL: &str = "https://api.twitter.com/2/oauth2/token";
const ME_URL: &str = "https://api.twitter.com/2/users/me";
const TWEETS_URL: &str = "https://api.twitter.com/2/tweets";
const MEDIA_UPLOAD_URL: &str = "https://upload.twitter.com/1.1/media/upload.json";

const SCOPE: &str = "tweet.read tweet.write users.read offline.access";
const DEFAULT_EXPIRES_IN_SECS: i64 = 7200;

/// RFC 7636 S256: base64url(SHA-256(verifier)), unpadded.
fn s256_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

pub struct TwitterAdapter {
    app: OAuthApp,
    http: reqwest::Client,
    clock: Arc<dyn Clock>,
}

impl TwitterAdapter {
    pub fn new(app: OAuthApp, http: reqwest::Client, clock: Arc<dyn Clock>) -> Self {
        Self { app, http, clock }
    }

    fn basic_auth_value(&self) -> String {
        let credentials = format!("{}:{}", self.app.client_id, self.app.client_secret);
        format!("Basic {}", STANDARD.encode(credentials))
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<serde_json::Value> {
        let response = self
            .http
            .post(TOKEN_URL)
            .header(reqwest::header::AUTHORIZATION, self.basic_auth_value())
            .form(form)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            if body.contains("invalid_grant") || body.contains("invalid_request") {
                return Err(Error::new(
                    ErrorKind::InvalidGrant,
                    "twitter rejected the grant",
                ));
            }
            return Err(Error::new(
                ErrorKind::PlatformPermanent,
                format!("twitter token endpoint rejected: {}", super::excerpt(&body)),
            ));
        }
        json_or_error(self.id(), response).await
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
impl PlatformAdapter for TwitterAdapter {
    fn id(&self) -> PlatformId {
        PlatformId::Twitter
    }

    fn requires_app_credential(&self) -> bool {
        true
    }

    fn media_constraints(&self) -> MediaConstraints {
        MediaConstraints {
            containers: &["mp4", "mov"],
            codecs: &["h264", "hevc"],
            max_size_bytes: 512 * 1024 * 1024,
            min_duration_ms: 500,
            max_duration_ms: 140_000,
        }
    }

    fn new_code_verifier(&self) -> Result<Option<String>> {
        // 32 random bytes, base64url: 43 chars, within RFC 7636's 43-128.
        let mut bytes = [0u8; 32];
        getrandom::getrandom(&mut bytes)
            .map_err(|e| Error::internal(format!("rng failure: {e}")))?;
        Ok(Some(URL_SAFE_NO_PAD.encode(bytes)))
    }

    fn build_authorization_url(&self, state: &str, code_verifier: Option<&str>) -> Result<String> {
        let verifier = code_verifier.ok_or_else(|| {
            Error::internal("twitter authorization requires a pkce code verifier")
        })?;
        let mut url = Url::parse(AUTH_URL).map_err(|e| Error::internal(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.app.client_id)
            .append_pair("redirect_uri", &self.app.redirect_uri)
            .append_pair("scope", SCOPE)
            .append_pair("state", state)
            .append_pair("code_challenge", &s256_challenge(verifier))
            .append_pair("code_challenge_method", "S256");
        Ok(url.into())
    }

    async fn exchange_code(&self, code: &str, code_verifier: Option<&str>) -> Result<TokenBundle> {
        // The verifier minted alongside the authorization URL must come
        // back through the signed state token.
        let verifier = code_verifier.ok_or_else(|| {
            Error::new(
                ErrorKind::AuthStateInvalid,
                "twitter code exchange is missing its pkce verifier",
            )
        })?;
        let data = self
            .token_request(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.app.redirect_uri.as_str()),
                ("code_verifier", verifier),
            ])
            .await?;
        self.bundle_from_token_response(&data, None)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenBundle> {
        let data = self
            .token_request(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .await?;
        self.bundle_from_token_response(&data, Some(refresh_token))
    }

    async fn fetch_identity(&self, access_token: &str) -> Result<PlatformIdentity> {
        let response = self
            .http
            .get(ME_URL)
            .bearer_auth(access_token)
            .send()
            .await?;
        let data = json_or_error(self.id(), response).await?;
        Ok(PlatformIdentity {
            account_id: required_str(&data, "/data/id")?,
            display_name: required_str(&data, "/data/username").unwrap_or_default(),
        })
    }

    async fn publish(
        &self,
        video: &VideoSource<'_>,
        spec: &PublishSpec,
        access_token: &str,
        ctx: &PublishContext<'_>,
    ) -> Result<PublishedPost> {
        // Fail before any network call when the 1.0a credential is absent.
        let credential = ctx.app_credential.ok_or_else(|| {
            Error::config_missing("twitter media upload requires TWITTER_API_KEY credentials")
        })?;

        let transport = TwitterMediaTransport {
            http: self.http.clone(),
            credential: credential.clone(),
            clock: self.clock.clone(),
        };
        let media_id = ChunkedUploader::new()
            .run(
                &transport,
                video.store,
                video.key,
                video.size_bytes,
                "video/mp4",
                ctx.clock,
            )
            .await?;

        let response = self
            .http
            .post(TWEETS_URL)
            .bearer_auth(access_token)
            .json(&json!({
                "text": spec.caption,
                "media": { "media_ids": [media_id] },
            }))
            .send()
            .await?;
        let data = json_or_error(self.id(), response).await?;
        let tweet_id = required_str(&data, "/data/id")?;
        Ok(PublishedPost {
            platform_url: Some(format!("https://twitter.com/i/web/status/{tweet_id}")),
            platform_post_id: tweet_id,
        })
    }
}

/// OAuth 1.0a-signed wire calls for the chunked media upload endpoints.
struct TwitterMediaTransport {
    http: reqwest::Client,
    credential: TwitterAppCredential,
    clock: Arc<dyn Clock>,
}

impl TwitterMediaTransport {
    fn signed_header(&self, method: &str, params: &[(String, String)]) -> Result<String> {
        Ok(oauth1::authorization_header(
            &self.credential,
            method,
            MEDIA_UPLOAD_URL,
            params,
            &oauth1::nonce()?,
            self.clock.now_ms() / 1000,
        ))
    }
}

#[async_trait]
impl MediaTransport for TwitterMediaTransport {
    async fn init(&self, total_bytes: i64, media_type: &str) -> Result<String> {
        let params: Vec<(String, String)> = vec![
            ("command".into(), "INIT".into()),
            ("total_bytes".into(), total_bytes.to_string()),
            ("media_type".into(), media_type.to_string()),
            ("media_category".into(), "tweet_video".into()),
        ];
        let header = self.signed_header("POST", &params)?;
        let response = self
            .http
            .post(MEDIA_UPLOAD_URL)
            .header(reqwest::header::AUTHORIZATION, header)
            .form(&params)
            .send()
            .await?;
        let data = json_or_error(PlatformId::Twitter, response).await?;
        required_str(&data, "/media_id_string")
    }

    async fn append(&self, media_id: &str, segment_index: i64, chunk: Vec<u8>) -> Result<()> {
        // The multipart media body does not participate in the signature.
        let params: Vec<(String, String)> = vec![
            ("command".into(), "APPEND".into()),
            ("media_id".into(), media_id.to_string()),
            ("segment_index".into(), segment_index.to_string()),
        ];
        let header = self.signed_header("POST", &params)?;
        let form = reqwest::multipart::Form::new()
            .text("command", "APPEND")
            .text("media_id", media_id.to_string())
            .text("segment_index", segment_index.to_string())
            .part("media", reqwest::multipart::Part::bytes(chunk));
        let response = self
            .http
            .post(MEDIA_UPLOAD_URL)
            .header(reqwest::header::AUTHORIZATION, header)
            .multipart(form)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(super::map_error_status(
                PlatformId::Twitter,
                status,
                None,
                &body,
            ));
        }
        Ok(())
    }

    async fn finalize(&self, media_id: &str) -> Result<()> {
        let params: Vec<(String, String)> = vec![
            ("command".into(), "FINALIZE".into()),
            ("media_id".into(), media_id.to_string()),
        ];
        let header = self.signed_header("POST", &params)?;
        let response = self
            .http
            .post(MEDIA_UPLOAD_URL)
            .header(reqwest::header::AUTHORIZATION, header)
            .form(&params)
            .send()
            .await?;
        json_or_error(PlatformId::Twitter, response).await?;
        Ok(())
    }

    async fn status(&self, media_id: &str) -> Result<ProcessingState> {
        let params: Vec<(String, String)> = vec![
            ("command".into(), "STATUS".into()),
            ("media_id".into(), media_id.to_string()),
        ];
        let header = self.signed_header("GET", &params)?;
        let response = self
            .http
            .get(MEDIA_UPLOAD_URL)
            .header(reqwest::header::AUTHORIZATION, header)
            .query(&params)
            .send()
            .await?;
        let data = json_or_error(PlatformId::Twitter, response).await?;

        let Some(info) = data.get("processing_info") else {
            // No processing phase for this media.
            return Ok(ProcessingState::Ready { url: None });
        };
        match info.get("state").and_then(|v| v.as_str()) {
            Some("succeeded") => Ok(ProcessingState::Ready { url: None }),
            Some("failed") => Ok(ProcessingState::Failed {
                message: format!(
                    "twitter media processing failed: {}",
                    info.pointer("/error/message")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown error")
                ),
            }),
            _ => Ok(ProcessingState::Pending {
                check_after: info
                    .get("check_after_secs")
                    .and_then(|v| v.as_u64())
                    .map(Duration::from_secs),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn adapter() -> TwitterAdapter {
        TwitterAdapter::new(
            OAuthApp {
                client_id: "cid".into(),
                client_secret: "secret".into(),
                redirect_uri: "https://app.test/callback/twitter".into(),
            },
            reqwest::Client::new(),
            Arc::new(SystemClock::new()),
        )
    }

    #[test]
    fn authorization_url_uses_s256_pkce() {
        let adapter = adapter();
        let verifier = adapter.new_code_verifier().unwrap().unwrap();
        let url = adapter
            .build_authorization_url("st", Some(&verifier))
            .unwrap();
        assert!(url.starts_with(AUTH_URL));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains(&format!("code_challenge={}", s256_challenge(&verifier))));
        // The raw verifier never appears in the authorization request.
        assert!(!url.contains(&verifier));
        assert!(url.contains("scope=tweet.read+tweet.write+users.read+offline.access"));
    }

    #[test]
    fn code_verifiers_are_fresh_per_request() {
        let adapter = adapter();
        let a = adapter.new_code_verifier().unwrap().unwrap();
        let b = adapter.new_code_verifier().unwrap().unwrap();
        assert_ne!(a, b);
        assert!(a.len() >= 43);
        assert_ne!(s256_challenge(&a), s256_challenge(&b));
    }

    #[tokio::test]
    async fn exchange_without_verifier_is_rejected_locally() {
        let err = adapter().exchange_code("code", None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthStateInvalid);
    }

    #[test]
    fn missing_verifier_fails_url_construction() {
        let err = adapter().build_authorization_url("st", None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
    }

    #[test]
    fn declares_dual_credential_need() {
        let adapter = adapter();
        assert!(adapter.requires_app_credential());
        assert!(adapter.supports_refresh());
        assert_eq!(adapter.caption_limit(), 280);
    }

    #[tokio::test]
    async fn publish_without_app_credential_fails_config_missing() {
        let adapter = adapter();
        let store = crate::storage::MemoryStore::new();
        let clock = SystemClock::new();
        let source = VideoSource {
            key: "k",
            size_bytes: 10,
            container: "mp4",
            store: &store,
        };
        let ctx = PublishContext {
            clock: &clock,
            account_id: "acct",
            app_credential: None,
        };
        let err = adapter
            .publish(&source, &PublishSpec::new("hi", vec![]), "token", &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConfigMissing);
    }
}
