use std::path::PathBuf;
use thiserror::Error;

/// Result alias for core operations.
pub type KeyphyResult<T> = Result<T, KeyphyError>;

#[derive(Error, Debug)]
pub enum KeyphyError {
    #[error("[KP1000] io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[KP1001] json config parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("[KP1002] toml config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("[KP1100] configuration error: {0}")]
    InvalidConfig(String),

    #[error("[KP2000] no authentication device configured")]
    NotConfigured,

    #[error("[KP2001] authentication device {0} not connected")]
    DeviceNotConnected(String),

    #[error("[KP2002] device fingerprint mismatch for {0}: potential device cloning detected")]
    FingerprintMismatch(String),

    #[error("[KP2003] device mount state `{actual}` does not satisfy required `{expected}`")]
    StateMismatch { expected: String, actual: String },

    #[error("[KP2004] device credential rejected")]
    InvalidCredential,

    #[error("[KP2005] failed to enumerate devices: {0}")]
    Enumeration(String),

    #[error("[KP2100] malformed session token at {path}: {reason}")]
    InvalidToken { path: PathBuf, reason: String },

    #[error("[KP3000] failed to {action} {kind} `{item}`: {reason}")]
    Enforcement {
        action: &'static str,
        kind: &'static str,
        item: String,
        reason: String,
    },

    #[error("[KP3100] integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("[KP4000] dns server could not bind any candidate address: {0}")]
    DnsBind(String),

    #[error("[KP4100] host dns integration failed: {0}")]
    SystemIntegration(String),

    #[error("[KP5000] provider error: {0}")]
    Provider(String),

    #[error("[KP6000] daemon already running")]
    AlreadyRunning,

    #[error("[KP6001] command `{command}` refused: {reason}")]
    CommandRefused { command: String, reason: String },
}

impl KeyphyError {
    pub fn code(&self) -> &'static str {
        match self {
            KeyphyError::Io(_) => "KP1000",
            KeyphyError::Json(_) => "KP1001",
            KeyphyError::Toml(_) => "KP1002",
            KeyphyError::InvalidConfig(_) => "KP1100",
            KeyphyError::NotConfigured => "KP2000",
            KeyphyError::DeviceNotConnected(_) => "KP2001",
            KeyphyError::FingerprintMismatch(_) => "KP2002",
            KeyphyError::StateMismatch { .. } => "KP2003",
            KeyphyError::InvalidCredential => "KP2004",
            KeyphyError::Enumeration(_) => "KP2005",
            KeyphyError::InvalidToken { .. } => "KP2100",
            KeyphyError::Enforcement { .. } => "KP3000",
            KeyphyError::IntegrityViolation(_) => "KP3100",
            KeyphyError::DnsBind(_) => "KP4000",
            KeyphyError::SystemIntegration(_) => "KP4100",
            KeyphyError::Provider(_) => "KP5000",
            KeyphyError::AlreadyRunning => "KP6000",
            KeyphyError::CommandRefused { .. } => "KP6001",
        }
    }

    /// True for the fail-closed authentication family.
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            KeyphyError::NotConfigured
                | KeyphyError::DeviceNotConnected(_)
                | KeyphyError::FingerprintMismatch(_)
                | KeyphyError::StateMismatch { .. }
                | KeyphyError::InvalidCredential
                | KeyphyError::Enumeration(_)
        )
    }
}
