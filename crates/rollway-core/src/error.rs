use thiserror::Error;

/// Conditions callers are expected to branch on. They travel inside
/// `anyhow::Error` and are recovered with [`UpdateError::classify`].
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("source-unavailable: {reason}")]
    SourceUnavailable { reason: String },
    #[error("no-manifest-available: {reason}")]
    NoManifestAvailable { reason: String },
    #[error("version-not-found: {version}")]
    NotFound { version: String },
    #[error(
        "manifest-tampered: version {version} was published with checksum {known} and is now declared as {declared}"
    )]
    ManifestTampered {
        version: String,
        known: String,
        declared: String,
    },
    #[error("checksum-mismatch: {subject} expected {expected}, got {actual}")]
    ChecksumMismatch {
        subject: String,
        expected: String,
        actual: String,
    },
    #[error("hook-failure: {hook} {detail}")]
    HookFailure { hook: String, detail: String },
    #[error("health-check-timeout: service not healthy within {window_ms}ms after {attempts} probe(s)")]
    HealthCheckTimeout { window_ms: u64, attempts: u32 },
    #[error("service-not-ready: {detail}")]
    ServiceNotReady { detail: String },
    #[error("already-in-progress: transaction {txid} is {status}")]
    AlreadyInProgress { txid: String, status: String },
    #[error("already-current: version {version} is already active")]
    AlreadyCurrent { version: String },
    #[error("not-installed: version {version}")]
    NotInstalled { version: String },
    #[error("no-previous-version: nothing to roll back to from {current}")]
    NoPreviousVersion { current: String },
    #[error("rollback-failed: {reason}; manual intervention required")]
    RollbackFailed { reason: String },
    #[error(transparent)]
    Other(anyhow::Error),
}

impl UpdateError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::SourceUnavailable { .. } => "source-unavailable",
            Self::NoManifestAvailable { .. } => "no-manifest-available",
            Self::NotFound { .. } => "version-not-found",
            Self::ManifestTampered { .. } => "manifest-tampered",
            Self::ChecksumMismatch { .. } => "checksum-mismatch",
            Self::HookFailure { .. } => "hook-failure",
            Self::HealthCheckTimeout { .. } => "health-check-timeout",
            Self::ServiceNotReady { .. } => "service-not-ready",
            Self::AlreadyInProgress { .. } => "already-in-progress",
            Self::AlreadyCurrent { .. } => "already-current",
            Self::NotInstalled { .. } => "not-installed",
            Self::NoPreviousVersion { .. } => "no-previous-version",
            Self::RollbackFailed { .. } => "rollback-failed",
            Self::Other(_) => "internal",
        }
    }

    /// Recovers a typed condition from an `anyhow` chain, looking through
    /// any context layers added on the way up.
    pub fn classify(err: anyhow::Error) -> Self {
        match err.downcast::<UpdateError>() {
            Ok(typed) => typed,
            Err(other) => Self::Other(other),
        }
    }
}
