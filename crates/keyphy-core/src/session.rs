//! Session token persistence shared by the daemon and the control commands.
//!
//! On disk the token is a single line `deviceUUID:challenge:issuedAt:fingerprint`
//! in a 0400 file inside a 0700 directory.

use crate::error::{KeyphyError, KeyphyResult};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Lifetime of a session token.
pub const SESSION_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub device_uuid: String,
    pub challenge: String,
    pub issued_at: u64,
    pub fingerprint: String,
}

impl SessionToken {
    pub fn encode(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.device_uuid, self.challenge, self.issued_at, self.fingerprint
        )
    }

    pub fn parse(origin: &Path, raw: &str) -> KeyphyResult<Self> {
        let parts: Vec<&str> = raw.trim().split(':').collect();
        if parts.len() != 4 {
            return Err(invalid_token(
                origin,
                format!("expected 4 fields, found {}", parts.len()),
            ));
        }
        if parts.iter().any(|part| part.is_empty()) {
            return Err(invalid_token(origin, "empty field"));
        }
        let issued_at = parts[2]
            .parse::<u64>()
            .map_err(|err| invalid_token(origin, format!("bad issuedAt: {err}")))?;
        Ok(Self {
            device_uuid: parts[0].to_string(),
            challenge: parts[1].to_string(),
            issued_at,
            fingerprint: parts[3].to_string(),
        })
    }

    /// Within the TTL window relative to `now`. Future timestamps never qualify.
    pub fn is_fresh(&self, now: u64) -> bool {
        now >= self.issued_at && now - self.issued_at < SESSION_TTL.as_secs()
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Write `token` to `path`, replacing any previous token.
pub fn write_session_token(path: &Path, token: &SessionToken) -> KeyphyResult<()> {
    if let Some(parent) = path.parent() {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(parent)?;
    }
    remove_session_token(path)?;
    fs::write(path, token.encode())?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o400))?;
    Ok(())
}

/// Read the token at `path`; `Ok(None)` when no token exists.
pub fn read_session_token(path: &Path) -> KeyphyResult<Option<SessionToken>> {
    match fs::read_to_string(path) {
        Ok(raw) => SessionToken::parse(path, &raw).map(Some),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

pub fn remove_session_token(path: &Path) -> KeyphyResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn invalid_token(path: &Path, reason: impl Into<String>) -> KeyphyError {
    KeyphyError::InvalidToken {
        path: PathBuf::from(path),
        reason: reason.into(),
    }
}
