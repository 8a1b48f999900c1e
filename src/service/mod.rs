//! Service layer.
//!
//! `VidcastService` is the crate's public API surface: the excluded HTTP
//! layer calls these operations and gets domain results or typed errors.
//! Sub-services share the database, clock, broker, adapter registry, and
//! token manager through `Arc`s; inbound platform names are normalized to
//! the canonical enum here and nowhere below.

pub mod connections;
pub mod events;
pub mod posting;
pub mod scheduling;
pub mod videos;

use std::sync::Arc;

use self::connections::ConnectionService;
use self::events::{EventBus, EventReceiver};
use self::posting::PostingService;
use self::scheduling::ScheduleService;
use self::videos::VideoService;
use crate::broker::{JobBroker, SqliteBroker};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::crypto::{SecretBox, StateSigner};
use crate::db::Database;
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::error::Result;
use crate::platforms::{validate_caption, AdapterRegistry};
use crate::scheduler::Scheduler;
use crate::storage::ObjectStore;
use crate::tokens::TokenManager;
use crate::types::{PlatformPostSpec, TargetSpecs};

/// One target platform of a multi-post or schedule request. Platform names
/// are accepted case-insensitively.
#[derive(Debug, Clone)]
pub struct TargetInput {
    pub platform: String,
    pub caption: String,
    pub tags: Vec<String>,
}

/// Normalize target inputs: canonical platform ids, no duplicates, captions
/// within each platform's limit.
pub(crate) fn normalize_targets(inputs: &[TargetInput]) -> Result<TargetSpecs> {
    if inputs.is_empty() {
        return Err(crate::error::Error::validation(
            "at least one target platform is required",
        ));
    }
    let mut targets = TargetSpecs::new();
    for input in inputs {
        let platform = crate::types::PlatformId::parse(&input.platform)?;
        validate_caption(platform, &input.caption)?;
        if targets
            .insert(
                platform,
                PlatformPostSpec {
                    caption: input.caption.clone(),
                    tags: input.tags.clone(),
                },
            )
            .is_some()
        {
            return Err(crate::error::Error::validation(format!(
                "duplicate target platform: {platform}"
            )));
        }
    }
    Ok(targets)
}

pub struct VidcastService {
    db: Database,
    clock: Arc<dyn Clock>,
    broker: Arc<dyn JobBroker>,
    registry: Arc<AdapterRegistry>,
    tokens: Arc<TokenManager>,
    store: Arc<dyn ObjectStore>,
    events: EventBus,
    config: Config,
    videos: VideoService,
    connections: ConnectionService,
    posting: PostingService,
    scheduling: ScheduleService,
}

impl VidcastService {
    /// Production construction: system clock, sqlite-backed broker,
    /// adapters from configuration.
    pub async fn from_config(config: Config, store: Arc<dyn ObjectStore>) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let registry = Arc::new(AdapterRegistry::from_config(&config, clock.clone()));
        Self::assemble(config, store, clock, registry).await
    }

    /// Construction with an injected clock and adapter registry; the test
    /// entry point.
    pub async fn assemble(
        config: Config,
        store: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
        registry: Arc<AdapterRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        let db = Database::open(&config.database_url).await?;
        let secrets = Arc::new(SecretBox::derive(
            &config.encryption_key,
            config.encryption_salt.as_bytes(),
        ));
        let state_signer = Arc::new(StateSigner::new(&config.encryption_key));
        let broker: Arc<dyn JobBroker> = Arc::new(SqliteBroker::new(db.clone(), clock.clone()));
        let tokens = Arc::new(TokenManager::new(
            db.clone(),
            secrets.clone(),
            clock.clone(),
            config.twitter_app.clone(),
        ));
        let events = EventBus::new(128);

        let videos = VideoService::new(db.clone(), store.clone(), clock.clone(), events.clone());
        let connections = ConnectionService::new(
            db.clone(),
            registry.clone(),
            secrets,
            state_signer,
            clock.clone(),
            events.clone(),
        );
        let posting = PostingService::new(
            db.clone(),
            broker.clone(),
            clock.clone(),
            events.clone(),
        );
        let scheduling = ScheduleService::new(db.clone(), clock.clone(), events.clone());

        Ok(Self {
            db,
            clock,
            broker,
            registry,
            tokens,
            store,
            events,
            config,
            videos,
            connections,
            posting,
            scheduling,
        })
    }

    pub fn videos(&self) -> &VideoService {
        &self.videos
    }

    pub fn connections(&self) -> &ConnectionService {
        &self.connections
    }

    pub fn posting(&self) -> &PostingService {
        &self.posting
    }

    pub fn scheduling(&self) -> &ScheduleService {
        &self.scheduling
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Build the scheduler beat over this service's shared state.
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.db.clone(),
            self.broker.clone(),
            self.clock.clone(),
            self.events.clone(),
            std::time::Duration::from_millis(self.config.scheduler_tick_ms),
        )
    }

    /// Build a dispatcher over this service's shared state.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            self.db.clone(),
            self.broker.clone(),
            self.registry.clone(),
            self.tokens.clone(),
            self.store.clone(),
            self.clock.clone(),
            self.events.clone(),
            DispatcherConfig {
                concurrency: self.config.dispatcher_concurrency,
                publish_deadline: std::time::Duration::from_millis(self.config.publish_deadline_ms),
                ..DispatcherConfig::default()
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_targets_rejects_empty_and_duplicates() {
        let err = normalize_targets(&[]).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);

        let inputs = vec![
            TargetInput {
                platform: "tiktok".into(),
                caption: "a".into(),
                tags: vec![],
            },
            TargetInput {
                platform: "TIKTOK".into(),
                caption: "b".into(),
                tags: vec![],
            },
        ];
        let err = normalize_targets(&inputs).unwrap_err();
        assert!(err.message.contains("duplicate"));
    }

    #[test]
    fn normalize_targets_enforces_caption_limits() {
        let inputs = vec![TargetInput {
            platform: "twitter".into(),
            caption: "x".repeat(281),
            tags: vec![],
        }];
        let err = normalize_targets(&inputs).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);

        let inputs = vec![TargetInput {
            platform: "twitter".into(),
            caption: "x".repeat(280),
            tags: vec![],
        }];
        let targets = normalize_targets(&inputs).unwrap();
        assert_eq!(targets.len(), 1);
    }
}
