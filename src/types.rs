//! Core domain types for vidcast.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, ErrorKind, Result};

/// The closed set of supported platforms. Internal code always works on this
/// enum; inbound names are normalized at the service boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlatformId {
    Tiktok,
    Youtube,
    Twitter,
    Instagram,
    Facebook,
}

impl PlatformId {
    pub const ALL: [PlatformId; 5] = [
        PlatformId::Tiktok,
        PlatformId::Youtube,
        PlatformId::Twitter,
        PlatformId::Instagram,
        PlatformId::Facebook,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformId::Tiktok => "TIKTOK",
            PlatformId::Youtube => "YOUTUBE",
            PlatformId::Twitter => "TWITTER",
            PlatformId::Instagram => "INSTAGRAM",
            PlatformId::Facebook => "FACEBOOK",
        }
    }

    /// Case-insensitive parse; unknown names are a `VALIDATION` failure.
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_uppercase().as_str() {
            "TIKTOK" => Ok(PlatformId::Tiktok),
            "YOUTUBE" => Ok(PlatformId::Youtube),
            "TWITTER" => Ok(PlatformId::Twitter),
            "INSTAGRAM" => Ok(PlatformId::Instagram),
            "FACEBOOK" => Ok(PlatformId::Facebook),
            _ => Err(Error::validation(format!("unknown platform: {name}"))),
        }
    }

    /// Contract caption limits, in characters.
    pub fn caption_limit(&self) -> usize {
        match self {
            PlatformId::Tiktok => 2200,
            PlatformId::Youtube => 5000,
            PlatformId::Twitter => 280,
            PlatformId::Instagram => 2200,
            PlatformId::Facebook => 63_206,
        }
    }
}

impl std::fmt::Display for PlatformId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoStatus {
    Uploading,
    Ready,
    Failed,
}

impl VideoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoStatus::Uploading => "uploading",
            VideoStatus::Ready => "ready",
            VideoStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uploading" => Some(VideoStatus::Uploading),
            "ready" => Some(VideoStatus::Ready),
            "failed" => Some(VideoStatus::Failed),
            _ => None,
        }
    }
}

/// An uploaded video. Immutable once `ready`, except for the user-editable
/// default caption and tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Video {
    pub id: Uuid,
    pub user_id: String,
    pub title: String,
    pub storage_key: String,
    pub container: String,
    pub codec: String,
    pub duration_ms: i64,
    pub width: i64,
    pub height: i64,
    pub size_bytes: i64,
    pub status: VideoStatus,
    pub default_caption: Option<String>,
    pub default_tags: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A linked platform account. Token blobs are sealed with the process key
/// and never leave this struct in plaintext.
#[derive(Debug, Clone)]
pub struct PlatformConnection {
    pub id: Uuid,
    pub user_id: String,
    pub platform: PlatformId,
    pub account_id: String,
    pub display_name: String,
    pub scopes: Vec<String>,
    pub access_token_sealed: Vec<u8>,
    pub refresh_token_sealed: Option<Vec<u8>>,
    pub expires_at: i64,
    pub active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Token bundle returned by an adapter's code exchange or refresh.
#[derive(Debug, Clone)]
pub struct TokenBundle {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: i64,
    pub scopes: Vec<String>,
    pub account_id: String,
    pub display_name: Option<String>,
}

/// User-facing aggregate of one video published to one or more platforms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiPost {
    pub id: Uuid,
    pub user_id: String,
    pub video_id: Uuid,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostStatus {
    Pending,
    Processing,
    Posted,
    Failed,
    Canceled,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Pending => "PENDING",
            PostStatus::Processing => "PROCESSING",
            PostStatus::Posted => "POSTED",
            PostStatus::Failed => "FAILED",
            PostStatus::Canceled => "CANCELED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(PostStatus::Pending),
            "PROCESSING" => Some(PostStatus::Processing),
            "POSTED" => Some(PostStatus::Posted),
            "FAILED" => Some(PostStatus::Failed),
            "CANCELED" => Some(PostStatus::Canceled),
            _ => None,
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PostStatus::Posted | PostStatus::Failed | PostStatus::Canceled
        )
    }
}

impl std::fmt::Display for PostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-platform publishing intent with its own state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: Uuid,
    pub multi_post_id: Uuid,
    pub user_id: String,
    pub video_id: Uuid,
    pub platform: PlatformId,
    pub caption: String,
    pub tags: Vec<String>,
    pub status: PostStatus,
    pub attempts: i64,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub platform_post_id: Option<String>,
    pub platform_url: Option<String>,
    pub posted_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Aggregate state of a multi-post, derived from its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MultiPostState {
    Processing,
    Posted,
    Failed,
    Canceled,
}

impl MultiPostState {
    pub fn derive(posts: &[Post]) -> Self {
        if posts
            .iter()
            .any(|p| matches!(p.status, PostStatus::Pending | PostStatus::Processing))
        {
            MultiPostState::Processing
        } else if posts.iter().any(|p| p.status == PostStatus::Posted) {
            MultiPostState::Posted
        } else if posts.iter().all(|p| p.status == PostStatus::Canceled) {
            MultiPostState::Canceled
        } else {
            MultiPostState::Failed
        }
    }
}

/// Per-platform caption and tags carried by schedules and multi-post requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformPostSpec {
    pub caption: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

pub type TargetSpecs = BTreeMap<PlatformId, PlatformPostSpec>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleState {
    Pending,
    Fired,
    Canceled,
}

impl ScheduleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleState::Pending => "PENDING",
            ScheduleState::Fired => "FIRED",
            ScheduleState::Canceled => "CANCELED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ScheduleState::Pending),
            "FIRED" => Some(ScheduleState::Fired),
            "CANCELED" => Some(ScheduleState::Canceled),
            _ => None,
        }
    }
}

/// One-shot deferred publishing intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub user_id: String,
    pub video_id: Uuid,
    pub targets: TargetSpecs,
    pub scheduled_at: i64,
    pub state: ScheduleState,
    pub created_at: i64,
}

/// Recurring cadence, anchored at HH:MM UTC. Weekdays are Monday-based
/// (0 = Monday .. 6 = Sunday); monthly days clamp to short months.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Cadence {
    Daily { hour: u32, minute: u32 },
    Weekly { weekday: u8, hour: u32, minute: u32 },
    Monthly { day: u32, hour: u32, minute: u32 },
}

impl Cadence {
    pub fn validate(&self) -> Result<()> {
        let (hour, minute) = match self {
            Cadence::Daily { hour, minute } => (*hour, *minute),
            Cadence::Weekly {
                weekday,
                hour,
                minute,
            } => {
                if *weekday > 6 {
                    return Err(Error::validation("weekday must be 0 (Monday) .. 6 (Sunday)"));
                }
                (*hour, *minute)
            }
            Cadence::Monthly { day, hour, minute } => {
                if !(1..=31).contains(day) {
                    return Err(Error::validation("day of month must be 1..=31"));
                }
                (*hour, *minute)
            }
        };
        if hour > 23 || minute > 59 {
            return Err(Error::validation("time of day must be a valid HH:MM"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecurringState {
    Active,
    Paused,
    Canceled,
}

impl RecurringState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecurringState::Active => "ACTIVE",
            RecurringState::Paused => "PAUSED",
            RecurringState::Canceled => "CANCELED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(RecurringState::Active),
            "PAUSED" => Some(RecurringState::Paused),
            "CANCELED" => Some(RecurringState::Canceled),
            _ => None,
        }
    }
}

/// Recurring publishing intent with caption rotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringSchedule {
    pub id: Uuid,
    pub user_id: String,
    pub video_id: Uuid,
    pub targets: TargetSpecs,
    pub cadence: Cadence,
    /// Ordered caption variants; empty means reuse the base captions.
    pub caption_variants: Vec<String>,
    /// Advances by one per firing; selection is `cursor mod len`.
    pub variant_cursor: i64,
    pub state: RecurringState,
    pub next_occurrence: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    Success,
    TransientFail,
    PermanentFail,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Success => "SUCCESS",
            OutcomeKind::TransientFail => "TRANSIENT_FAIL",
            OutcomeKind::PermanentFail => "PERMANENT_FAIL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUCCESS" => Some(OutcomeKind::Success),
            "TRANSIENT_FAIL" => Some(OutcomeKind::TransientFail),
            "PERMANENT_FAIL" => Some(OutcomeKind::PermanentFail),
            _ => None,
        }
    }
}

/// Append-only attempt record; the audit trail per post.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostOutcome {
    pub id: Option<i64>,
    pub post_id: Uuid,
    pub attempt: i64,
    pub started_at: i64,
    pub finished_at: i64,
    pub outcome: OutcomeKind,
    pub error_kind: Option<ErrorKind>,
    pub response_excerpt: Option<String>,
}
