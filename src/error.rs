//! Error types for vidcast.
//!
//! Every failure in the crate surfaces exactly one [`ErrorKind`]; retry
//! policy in the dispatcher derives from the kind, not from downcasting.

use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, Error>;

/// The closed set of failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Input rejected locally (caption length, unknown platform, schedule too soon).
    Validation,
    /// Access token expired; retried once after a forced refresh.
    AuthExpired,
    /// Permanent auth failure; the connection is marked inactive.
    AuthRevoked,
    /// OAuth state token failed validation.
    AuthStateInvalid,
    /// Refresh grant rejected by the platform.
    InvalidGrant,
    /// Required credential or configuration absent.
    ConfigMissing,
    /// Repost governor denial; carries `hours_remaining`.
    RepostCooldown,
    /// Adapter-declared format or size violation.
    MediaUnsupported,
    /// Platform never reported the upload ready.
    UploadProcessingTimeout,
    /// Platform rate limit; carries `retry_after_ms`.
    RateLimited,
    /// 5xx or network failure; standard backoff.
    PlatformTransient,
    /// Platform declared the post invalid.
    PlatformPermanent,
    /// Object store failure; transient.
    StorageUnavailable,
    /// Ciphertext failed authentication.
    CryptoTamper,
    /// Per-attempt deadline expired.
    Timeout,
    /// Bug or unexpected condition.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::AuthExpired => "AUTH_EXPIRED",
            ErrorKind::AuthRevoked => "AUTH_REVOKED",
            ErrorKind::AuthStateInvalid => "AUTH_STATE_INVALID",
            ErrorKind::InvalidGrant => "INVALID_GRANT",
            ErrorKind::ConfigMissing => "CONFIG_MISSING",
            ErrorKind::RepostCooldown => "REPOST_COOLDOWN",
            ErrorKind::MediaUnsupported => "MEDIA_UNSUPPORTED",
            ErrorKind::UploadProcessingTimeout => "UPLOAD_PROCESSING_TIMEOUT",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::PlatformTransient => "PLATFORM_TRANSIENT",
            ErrorKind::PlatformPermanent => "PLATFORM_PERMANENT",
            ErrorKind::StorageUnavailable => "STORAGE_UNAVAILABLE",
            ErrorKind::CryptoTamper => "CRYPTO_TAMPER",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Internal => "INTERNAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "VALIDATION" => Some(ErrorKind::Validation),
            "AUTH_EXPIRED" => Some(ErrorKind::AuthExpired),
            "AUTH_REVOKED" => Some(ErrorKind::AuthRevoked),
            "AUTH_STATE_INVALID" => Some(ErrorKind::AuthStateInvalid),
            "INVALID_GRANT" => Some(ErrorKind::InvalidGrant),
            "CONFIG_MISSING" => Some(ErrorKind::ConfigMissing),
            "REPOST_COOLDOWN" => Some(ErrorKind::RepostCooldown),
            "MEDIA_UNSUPPORTED" => Some(ErrorKind::MediaUnsupported),
            "UPLOAD_PROCESSING_TIMEOUT" => Some(ErrorKind::UploadProcessingTimeout),
            "RATE_LIMITED" => Some(ErrorKind::RateLimited),
            "PLATFORM_TRANSIENT" => Some(ErrorKind::PlatformTransient),
            "PLATFORM_PERMANENT" => Some(ErrorKind::PlatformPermanent),
            "STORAGE_UNAVAILABLE" => Some(ErrorKind::StorageUnavailable),
            "CRYPTO_TAMPER" => Some(ErrorKind::CryptoTamper),
            "TIMEOUT" => Some(ErrorKind::Timeout),
            "INTERNAL" => Some(ErrorKind::Internal),
            _ => None,
        }
    }

    /// Kinds the dispatcher retries with backoff (up to the attempt cap).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited
                | ErrorKind::PlatformTransient
                | ErrorKind::StorageUnavailable
                | ErrorKind::UploadProcessingTimeout
                | ErrorKind::Timeout
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Crate-wide error: one kind, a human-readable message, and optional hints.
///
/// Messages must never contain tokens, ciphertext, or raw response bodies
/// beyond the truncated excerpt produced by the adapter layer.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    /// Platform-supplied retry hint, when the kind is `RATE_LIMITED`.
    pub retry_after_ms: Option<u64>,
    /// Cooldown remainder, when the kind is `REPOST_COOLDOWN`.
    pub hours_remaining: Option<f64>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after_ms: None,
            hours_remaining: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn config_missing(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigMissing, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after_ms: u64) -> Self {
        Self {
            retry_after_ms: Some(retry_after_ms),
            ..Self::new(ErrorKind::RateLimited, message)
        }
    }

    pub fn cooldown(hours_remaining: f64) -> Self {
        Self {
            hours_remaining: Some(hours_remaining),
            ..Self::new(
                ErrorKind::RepostCooldown,
                format!(
                    "already posted within the last 24 hours; wait {hours_remaining:.1} more hours"
                ),
            )
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::internal(format!("database error: {e}"))
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        Error::internal(format!("migration error: {e}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::internal(format!("io error: {e}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::internal(format!("serialization error: {e}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        // Connection-level failures only; status-code triage happens in the
        // adapter layer before this conversion applies.
        Error::new(ErrorKind::PlatformTransient, format!("network error: {e}"))
    }
}
