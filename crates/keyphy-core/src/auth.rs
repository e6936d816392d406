//! Physical-device authentication: credential check, clone detection via
//! device fingerprints, and short-lived session tokens.

use crate::config::{AuthConfig, MountState};
use crate::error::{KeyphyError, KeyphyResult};
use crate::provider::{Device, DeviceEnumerator};
use crate::session::{
    read_session_token, remove_session_token, unix_now, write_session_token, SessionToken,
};
use log::{debug, info, warn};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use zeroize::Zeroizing;

const KEY_SALT: &[u8] = b"keyphy-salt";
const KEY_ITERATIONS: u32 = 10_000;
const KEY_LEN: usize = 32;
const CHALLENGE_LEN: usize = 32;

/// Derive the stored credential for a device: PBKDF2-HMAC-SHA256 over
/// `uuid:name` with a fixed salt, hex encoded.
pub fn derive_device_key(uuid: &str, name: &str) -> String {
    let combined = Zeroizing::new(format!("{uuid}:{name}").into_bytes());
    let mut derived = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2_hmac::<Sha256>(&combined, KEY_SALT, KEY_ITERATIONS, derived.as_mut());
    hex::encode(derived.as_ref())
}

/// Deterministic identity hash over `(uuid, name, dev_path)`.
pub fn device_fingerprint(device: &Device) -> String {
    let data = format!("{}:{}:{}", device.uuid, device.name, device.dev_path);
    hex::encode(Sha256::digest(data.as_bytes()))
}

fn credential_matches(device: &Device, expected_hex: &str) -> KeyphyResult<bool> {
    if device.uuid.is_empty() || expected_hex.is_empty() {
        return Ok(false);
    }
    hex::decode(expected_hex).map_err(|err| {
        KeyphyError::InvalidConfig(format!("auth.derived_key is not valid hex: {err}"))
    })?;
    let derived = Zeroizing::new(derive_device_key(&device.uuid, &device.name));
    Ok(derived.eq_ignore_ascii_case(expected_hex))
}

/// Read-only view over the authentication state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthStatus {
    pub device_connected: bool,
    pub session_valid: bool,
    pub tamper_detected: bool,
    pub last_auth_time: Option<u64>,
    pub challenge_active: bool,
}

#[derive(Debug, Default)]
struct AuthState {
    fingerprint: Option<String>,
    challenge: Option<String>,
    last_auth_time: Option<u64>,
    tamper_detected: bool,
}

/// Authenticates the configured device against the current enumeration.
///
/// Every failure is fail-closed: any error means "not authenticated".
pub struct AuthSession {
    enumerator: Arc<dyn DeviceEnumerator>,
    config: RwLock<Option<AuthConfig>>,
    state: Mutex<AuthState>,
}

impl AuthSession {
    pub fn new(enumerator: Arc<dyn DeviceEnumerator>, config: Option<AuthConfig>) -> Self {
        Self {
            enumerator,
            config: RwLock::new(config),
            state: Mutex::new(AuthState::default()),
        }
    }

    /// Swap in a reloaded configuration. Recorded fingerprints survive.
    pub fn set_config(&self, config: Option<AuthConfig>) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    fn config(&self) -> Option<AuthConfig> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn state(&self) -> MutexGuard<'_, AuthState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn find_device(&self, uuid: &str) -> KeyphyResult<Option<Device>> {
        let devices = self
            .enumerator
            .list_devices()
            .map_err(|err| KeyphyError::Enumeration(err.to_string()))?;
        Ok(devices.into_iter().find(|dev| dev.uuid == uuid))
    }

    /// Full authentication attempt; on success a fresh session token is issued.
    pub fn authenticate_device(&self) -> KeyphyResult<()> {
        let cfg = self.config().ok_or(KeyphyError::NotConfigured)?;

        let mut nonce = [0u8; CHALLENGE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let challenge = hex::encode(nonce);
        self.state().challenge = Some(challenge.clone());

        let device = self
            .find_device(&cfg.device_uuid)?
            .ok_or_else(|| KeyphyError::DeviceNotConnected(cfg.device_uuid.clone()))?;

        let fingerprint = device_fingerprint(&device);
        self.check_fingerprint(&device, &fingerprint)?;

        if cfg.enforce_state {
            check_mount_state(&device, &cfg)?;
        }

        if !credential_matches(&device, &cfg.derived_key)? {
            warn!("credential rejected for device {}", device.uuid);
            return Err(KeyphyError::InvalidCredential);
        }

        let issued_at = unix_now();
        {
            let mut state = self.state();
            state.tamper_detected = false;
            state.fingerprint = Some(fingerprint.clone());
            state.last_auth_time = Some(issued_at);
        }

        let token = SessionToken {
            device_uuid: device.uuid.clone(),
            challenge,
            issued_at,
            fingerprint,
        };
        write_session_token(&cfg.session_token_path(), &token)?;
        info!("device {} authenticated", device.uuid);
        Ok(())
    }

    fn check_fingerprint(&self, device: &Device, fingerprint: &str) -> KeyphyResult<()> {
        let mut state = self.state();
        match state.fingerprint.as_deref() {
            Some(prior) if prior != fingerprint => {
                state.tamper_detected = true;
                warn!(
                    "SECURITY ALERT: fingerprint mismatch for device {}; possible clone",
                    device.uuid
                );
                Err(KeyphyError::FingerprintMismatch(device.uuid.clone()))
            }
            _ => Ok(()),
        }
    }

    /// Whether the configured device is present and would pass authentication,
    /// without issuing a session token.
    pub fn check_device(&self) -> bool {
        let Some(cfg) = self.config() else {
            return false;
        };
        let device = match self.find_device(&cfg.device_uuid) {
            Ok(Some(device)) => device,
            Ok(None) => return false,
            Err(err) => {
                debug!("device check failed: {err}");
                return false;
            }
        };
        if self
            .check_fingerprint(&device, &device_fingerprint(&device))
            .is_err()
        {
            return false;
        }
        if cfg.enforce_state && check_mount_state(&device, &cfg).is_err() {
            return false;
        }
        credential_matches(&device, &cfg.derived_key).unwrap_or(false)
    }

    /// True only for a fresh token whose fingerprint matches the device that is
    /// connected right now. Invalid tokens are deleted.
    pub fn validate_session(&self) -> bool {
        let Some(cfg) = self.config() else {
            return false;
        };
        let path = cfg.session_token_path();
        match self.session_matches(&cfg, &path) {
            Ok(true) => true,
            Ok(false) => {
                discard_token(&path);
                false
            }
            Err(err) => {
                debug!("session validation failed: {err}");
                discard_token(&path);
                false
            }
        }
    }

    fn session_matches(&self, cfg: &AuthConfig, path: &Path) -> KeyphyResult<bool> {
        let Some(token) = read_session_token(path)? else {
            return Ok(false);
        };
        if !token.is_fresh(unix_now()) || token.device_uuid != cfg.device_uuid {
            return Ok(false);
        }
        let Some(device) = self.find_device(&cfg.device_uuid)? else {
            return Ok(false);
        };
        Ok(device_fingerprint(&device) == token.fingerprint)
    }

    pub fn is_device_connected(&self) -> bool {
        let Some(cfg) = self.config() else {
            return false;
        };
        matches!(self.find_device(&cfg.device_uuid), Ok(Some(_)))
    }

    pub fn tamper_detected(&self) -> bool {
        self.state().tamper_detected
    }

    pub fn status(&self) -> AuthStatus {
        let device_connected = self.is_device_connected();
        let session_valid = self.validate_session();
        let state = self.state();
        AuthStatus {
            device_connected,
            session_valid,
            tamper_detected: state.tamper_detected,
            last_auth_time: state.last_auth_time,
            challenge_active: state.challenge.is_some(),
        }
    }

    /// Forget the current challenge and delete the session token.
    pub fn clear_session(&self) -> KeyphyResult<()> {
        {
            let mut state = self.state();
            state.challenge = None;
            state.last_auth_time = None;
        }
        match self.config() {
            Some(cfg) => remove_session_token(&cfg.session_token_path()),
            None => Ok(()),
        }
    }
}

fn check_mount_state(device: &Device, cfg: &AuthConfig) -> KeyphyResult<()> {
    let actual = MountState::classify(device.mount_point.as_deref());
    if actual != cfg.required_mount_state {
        return Err(KeyphyError::StateMismatch {
            expected: cfg.required_mount_state.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

fn discard_token(path: &Path) {
    if let Err(err) = remove_session_token(path) {
        warn!("failed to remove session token {}: {err}", path.display());
    }
}
