//! Scriptable mock adapter for integration tests.
//!
//! Behaviors (publish results, refresh results) are queued ahead of time;
//! call counts and published captions are recorded for verification. With
//! nothing scripted, every operation succeeds.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{
    MediaConstraints, PlatformAdapter, PlatformIdentity, PublishContext, PublishSpec,
    PublishedPost, VideoSource,
};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::types::{PlatformId, TokenBundle};

#[derive(Debug, Clone)]
pub struct PublishRecord {
    pub caption: String,
    pub tags: Vec<String>,
    pub account_id: String,
}

#[derive(Default)]
struct MockState {
    publish_results: Mutex<VecDeque<std::result::Result<PublishedPost, Error>>>,
    refresh_results: Mutex<VecDeque<std::result::Result<TokenBundle, Error>>>,
    publish_calls: Mutex<Vec<PublishRecord>>,
    exchange_calls: Mutex<Vec<(String, Option<String>)>>,
    refresh_calls: AtomicUsize,
    publish_seq: AtomicUsize,
    verifier_seq: AtomicUsize,
}

pub struct MockAdapter {
    platform: PlatformId,
    clock: Arc<dyn Clock>,
    supports_refresh: bool,
    requires_app_credential: bool,
    uses_code_verifier: bool,
    state: Arc<MockState>,
}

impl MockAdapter {
    pub fn new(platform: PlatformId, clock: Arc<dyn Clock>) -> Self {
        Self {
            platform,
            clock,
            supports_refresh: true,
            requires_app_credential: false,
            uses_code_verifier: false,
            state: Arc::new(MockState::default()),
        }
    }

    pub fn requiring_app_credential(mut self) -> Self {
        self.requires_app_credential = true;
        self
    }

    pub fn without_refresh(mut self) -> Self {
        self.supports_refresh = false;
        self
    }

    /// Hand out PKCE verifiers and demand them back at code exchange.
    pub fn with_code_verifier(mut self) -> Self {
        self.uses_code_verifier = true;
        self
    }

    /// Queue a successful publish result.
    pub fn push_publish_ok(&self, post_id: &str, url: Option<&str>) {
        self.state
            .publish_results
            .lock()
            .unwrap()
            .push_back(Ok(PublishedPost {
                platform_post_id: post_id.to_string(),
                platform_url: url.map(str::to_string),
            }));
    }

    /// Queue a publish failure.
    pub fn push_publish_err(&self, error: Error) {
        self.state
            .publish_results
            .lock()
            .unwrap()
            .push_back(Err(error));
    }

    /// Queue a refresh failure.
    pub fn push_refresh_err(&self, error: Error) {
        self.state
            .refresh_results
            .lock()
            .unwrap()
            .push_back(Err(error));
    }

    pub fn publish_count(&self) -> usize {
        self.state.publish_calls.lock().unwrap().len()
    }

    pub fn refresh_count(&self) -> usize {
        self.state.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<PublishRecord> {
        self.state.publish_calls.lock().unwrap().clone()
    }

    /// (code, verifier) pairs seen by `exchange_code`.
    pub fn exchanges(&self) -> Vec<(String, Option<String>)> {
        self.state.exchange_calls.lock().unwrap().clone()
    }

    fn default_bundle(&self, tag: &str) -> TokenBundle {
        TokenBundle {
            access_token: format!("{}-{tag}-token", self.platform.as_str().to_lowercase()),
            refresh_token: self
                .supports_refresh
                .then(|| format!("{}-{tag}-refresh", self.platform.as_str().to_lowercase())),
            expires_at: self.clock.now_ms() + 3_600_000,
            scopes: vec!["mock.publish".to_string()],
            account_id: format!("{}-acct", self.platform.as_str().to_lowercase()),
            display_name: Some(format!("Mock {}", self.platform)),
        }
    }
}

#[async_trait]
impl PlatformAdapter for MockAdapter {
    fn id(&self) -> PlatformId {
        self.platform
    }

    fn requires_app_credential(&self) -> bool {
        self.requires_app_credential
    }

    fn supports_refresh(&self) -> bool {
        self.supports_refresh
    }

    fn media_constraints(&self) -> MediaConstraints {
        MediaConstraints {
            containers: &["mp4", "mov"],
            codecs: &["h264"],
            max_size_bytes: 500 * 1024 * 1024,
            min_duration_ms: 1_000,
            max_duration_ms: 600_000,
        }
    }

    fn new_code_verifier(&self) -> Result<Option<String>> {
        if !self.uses_code_verifier {
            return Ok(None);
        }
        let n = self.state.verifier_seq.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Some(format!("mock-verifier-{n}")))
    }

    fn build_authorization_url(&self, state: &str, _code_verifier: Option<&str>) -> Result<String> {
        Ok(format!(
            "https://auth.mock/{}?state={state}",
            self.platform.as_str().to_lowercase()
        ))
    }

    async fn exchange_code(&self, code: &str, code_verifier: Option<&str>) -> Result<TokenBundle> {
        self.state
            .exchange_calls
            .lock()
            .unwrap()
            .push((code.to_string(), code_verifier.map(str::to_string)));
        if self.uses_code_verifier && code_verifier.is_none() {
            return Err(Error::new(
                crate::error::ErrorKind::AuthStateInvalid,
                "mock platform expected a pkce verifier",
            ));
        }
        let mut bundle = self.default_bundle("exchanged");
        bundle.access_token = format!("access-{code}");
        Ok(bundle)
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<TokenBundle> {
        let n = self.state.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(scripted) = self.state.refresh_results.lock().unwrap().pop_front() {
            return scripted;
        }
        let mut bundle = self.default_bundle("refreshed");
        bundle.access_token = format!("refreshed-token-{n}");
        Ok(bundle)
    }

    async fn fetch_identity(&self, _access_token: &str) -> Result<PlatformIdentity> {
        Ok(PlatformIdentity {
            account_id: format!("{}-acct", self.platform.as_str().to_lowercase()),
            display_name: format!("Mock {}", self.platform),
        })
    }

    async fn publish(
        &self,
        _video: &VideoSource<'_>,
        spec: &PublishSpec,
        _access_token: &str,
        ctx: &PublishContext<'_>,
    ) -> Result<PublishedPost> {
        if self.requires_app_credential && ctx.app_credential.is_none() {
            return Err(Error::config_missing(
                "mock platform requires the app credential",
            ));
        }
        self.state.publish_calls.lock().unwrap().push(PublishRecord {
            caption: spec.caption.clone(),
            tags: spec.tags.clone(),
            account_id: ctx.account_id.to_string(),
        });
        if let Some(scripted) = self.state.publish_results.lock().unwrap().pop_front() {
            return scripted;
        }
        let n = self.state.publish_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let platform = self.platform.as_str().to_lowercase();
        Ok(PublishedPost {
            platform_post_id: format!("{platform}-post-{n}"),
            platform_url: Some(format!("https://{platform}.mock/{n}")),
        })
    }
}
