use crate::error::{KeyphyError, KeyphyResult};
use crate::protect::{with_unprotected, Protector};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/keyphy/config.json";

/// Mount classification of the authentication device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum MountState {
    #[default]
    Unmounted,
    Mounted,
    MountedEncrypted,
}

impl MountState {
    /// Classify a device by the mount point reported for it.
    ///
    /// A mount point naming a device-mapper node (or the legacy `encrypted`
    /// marker) counts as an encrypted mount.
    pub fn classify(mount_point: Option<&str>) -> Self {
        match mount_point.map(str::trim) {
            None | Some("") | Some("(not mounted)") => MountState::Unmounted,
            Some(mp) if mp.contains("/dev/mapper/") || mp.contains("encrypted") => {
                MountState::MountedEncrypted
            }
            Some(_) => MountState::Mounted,
        }
    }
}

impl fmt::Display for MountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MountState::Unmounted => "unmounted",
            MountState::Mounted => "mounted",
            MountState::MountedEncrypted => "mounted-encrypted",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AuthConfig {
    pub device_uuid: String,

    #[serde(default)]
    pub device_name: String,

    /// Hex PBKDF2 output over `uuid:name`.
    pub derived_key: String,

    #[serde(default)]
    pub required_mount_state: MountState,

    #[serde(default)]
    pub enforce_state: bool,

    #[serde(default = "default_session_token_path")]
    pub session_token_path: String,
}

fn default_session_token_path() -> String {
    "/run/keyphy-auth/session.token".to_string()
}

impl AuthConfig {
    pub fn session_token_path(&self) -> PathBuf {
        PathBuf::from(&self.session_token_path)
    }
}

/// Items the daemon keeps blocked while locked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BlockSet {
    #[serde(default)]
    pub apps: Vec<String>,

    #[serde(default)]
    pub websites: Vec<String>,

    #[serde(default)]
    pub paths: Vec<String>,

    #[serde(default)]
    pub ips: Vec<String>,
}

impl BlockSet {
    pub fn is_empty(&self) -> bool {
        self.apps.is_empty() && self.websites.is_empty() && self.paths.is_empty() && self.ips.is_empty()
    }

    /// Drop duplicate entries, keeping the first occurrence of each.
    pub fn dedup(&mut self) {
        for list in [
            &mut self.apps,
            &mut self.websites,
            &mut self.paths,
            &mut self.ips,
        ] {
            let mut seen = HashSet::new();
            list.retain(|item| seen.insert(item.clone()));
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DnsCfg {
    /// Listen addresses tried in order; the first successful bind wins.
    #[serde(default = "default_listen_candidates")]
    pub listen_candidates: Vec<String>,

    #[serde(default = "default_privileged_addr")]
    pub privileged_addr: String,

    #[serde(default = "default_upstream")]
    pub upstream: String,

    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,

    #[serde(default = "default_integrity_interval_secs")]
    pub integrity_interval_secs: u64,

    #[serde(default = "default_fallback_servers")]
    pub fallback_servers: Vec<String>,

    #[serde(default = "default_resolv_conf_path")]
    pub resolv_conf_path: String,

    #[serde(default = "default_stub_override_path")]
    pub stub_override_path: String,
}

fn default_listen_candidates() -> Vec<String> {
    vec![
        "0.0.0.0:53".to_string(),
        "0.0.0.0:6666".to_string(),
        "0.0.0.0:5353".to_string(),
    ]
}

fn default_privileged_addr() -> String {
    "0.0.0.0:53".to_string()
}

fn default_upstream() -> String {
    "8.8.8.8:53".to_string()
}

fn default_upstream_timeout_ms() -> u64 {
    3000
}

fn default_integrity_interval_secs() -> u64 {
    30
}

fn default_fallback_servers() -> Vec<String> {
    vec!["8.8.8.8".to_string(), "8.8.4.4".to_string()]
}

fn default_resolv_conf_path() -> String {
    "/etc/resolv.conf".to_string()
}

fn default_stub_override_path() -> String {
    "/etc/systemd/resolved.conf.d/keyphy.conf".to_string()
}

impl Default for DnsCfg {
    fn default() -> Self {
        Self {
            listen_candidates: default_listen_candidates(),
            privileged_addr: default_privileged_addr(),
            upstream: default_upstream(),
            upstream_timeout_ms: default_upstream_timeout_ms(),
            integrity_interval_secs: default_integrity_interval_secs(),
            fallback_servers: default_fallback_servers(),
            resolv_conf_path: default_resolv_conf_path(),
            stub_override_path: default_stub_override_path(),
        }
    }
}

impl DnsCfg {
    pub fn listen_addrs(&self) -> KeyphyResult<Vec<SocketAddr>> {
        self.listen_candidates
            .iter()
            .map(|raw| parse_socket_addr("dns.listen_candidates", raw))
            .collect()
    }

    pub fn privileged_socket(&self) -> KeyphyResult<SocketAddr> {
        parse_socket_addr("dns.privileged_addr", &self.privileged_addr)
    }

    pub fn upstream_socket(&self) -> KeyphyResult<SocketAddr> {
        parse_socket_addr("dns.upstream", &self.upstream)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms.max(1))
    }

    pub fn integrity_interval(&self) -> Duration {
        Duration::from_secs(self.integrity_interval_secs.max(1))
    }
}

fn parse_socket_addr(field: &str, raw: &str) -> KeyphyResult<SocketAddr> {
    raw.parse()
        .map_err(|err| KeyphyError::InvalidConfig(format!("invalid {field} `{raw}`: {err}")))
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DaemonCfg {
    #[serde(default = "default_device_interval")]
    pub device_interval_secs: u64,

    #[serde(default = "default_process_interval")]
    pub process_interval_secs: u64,

    #[serde(default = "default_config_interval")]
    pub config_interval_secs: u64,

    #[serde(default = "default_integrity_interval")]
    pub integrity_interval_secs: u64,

    #[serde(default = "default_activity_interval")]
    pub activity_interval_secs: u64,

    #[serde(default = "default_supervisor_interval")]
    pub supervisor_interval_secs: u64,

    #[serde(default = "default_pid_file")]
    pub pid_file: String,

    #[serde(default)]
    pub status_addr: Option<String>,

    #[serde(default = "default_protect_config")]
    pub protect_config: bool,
}

fn default_device_interval() -> u64 {
    5
}

fn default_process_interval() -> u64 {
    2
}

fn default_config_interval() -> u64 {
    30
}

fn default_integrity_interval() -> u64 {
    15
}

fn default_activity_interval() -> u64 {
    10
}

fn default_supervisor_interval() -> u64 {
    5
}

fn default_pid_file() -> String {
    "/run/keyphy/keyphyd.pid".to_string()
}

fn default_protect_config() -> bool {
    true
}

impl Default for DaemonCfg {
    fn default() -> Self {
        Self {
            device_interval_secs: default_device_interval(),
            process_interval_secs: default_process_interval(),
            config_interval_secs: default_config_interval(),
            integrity_interval_secs: default_integrity_interval(),
            activity_interval_secs: default_activity_interval(),
            supervisor_interval_secs: default_supervisor_interval(),
            pid_file: default_pid_file(),
            status_addr: None,
            protect_config: default_protect_config(),
        }
    }
}

impl DaemonCfg {
    pub fn pid_file(&self) -> PathBuf {
        PathBuf::from(&self.pid_file)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct KeyphyConfig {
    #[serde(default)]
    pub auth: Option<AuthConfig>,

    #[serde(default)]
    pub blocks: BlockSet,

    #[serde(default)]
    pub dns: DnsCfg,

    #[serde(default)]
    pub daemon: DaemonCfg,

    #[serde(skip)]
    pub path: PathBuf,
}

impl KeyphyConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> KeyphyResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut cfg = if is_toml(path) {
            toml::from_str::<Self>(&contents)?
        } else {
            serde_json::from_str::<Self>(&contents)?
        };

        cfg.path = path.to_path_buf();
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> KeyphyResult<()> {
        if let Some(auth) = &self.auth {
            if auth.device_uuid.trim().is_empty() {
                return Err(KeyphyError::InvalidConfig(
                    "auth.device_uuid must not be empty".to_string(),
                ));
            }
            hex::decode(&auth.derived_key).map_err(|err| {
                KeyphyError::InvalidConfig(format!("auth.derived_key is not valid hex: {err}"))
            })?;
        }
        self.dns.listen_addrs()?;
        self.dns.privileged_socket()?;
        self.dns.upstream_socket()?;
        Ok(())
    }

    /// Persist the configuration as JSON, lifting protection for the write.
    pub fn save(&self, protector: &dyn Protector) -> KeyphyResult<()> {
        let data = serde_json::to_string_pretty(self)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        with_unprotected(protector, &self.path, || {
            fs::write(&self.path, data.as_bytes())?;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
            Ok(())
        })
    }

    pub fn auth_configured(&self) -> bool {
        self.auth.is_some()
    }
}

fn is_toml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some(ext) if ext.eq_ignore_ascii_case("toml")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protect::NoopProtector;
    use tempfile::tempdir;

    #[test]
    fn classify_mount_points() {
        assert_eq!(MountState::default(), MountState::Unmounted);
        assert_eq!(MountState::classify(None), MountState::Unmounted);
        assert_eq!(
            MountState::classify(Some("(not mounted)")),
            MountState::Unmounted
        );
        assert_eq!(
            MountState::classify(Some("/media/key")),
            MountState::Mounted
        );
        assert_eq!(
            MountState::classify(Some("/dev/mapper/keyphy")),
            MountState::MountedEncrypted
        );
        assert_eq!(
            MountState::classify(Some("/media/encrypted-key")),
            MountState::MountedEncrypted
        );
    }

    #[test]
    fn load_json_applies_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{
                "auth": {
                    "device_uuid": "1234-ABCD",
                    "device_name": "KEY",
                    "derived_key": "00ff",
                    "required_mount_state": "mounted-encrypted",
                    "enforce_state": true
                },
                "blocks": { "websites": ["example.com"] }
            }"#,
        )
        .unwrap();

        let cfg = KeyphyConfig::load(&path).unwrap();
        let auth = cfg.auth.as_ref().unwrap();
        assert_eq!(auth.required_mount_state, MountState::MountedEncrypted);
        assert_eq!(
            auth.session_token_path(),
            PathBuf::from("/run/keyphy-auth/session.token")
        );
        assert_eq!(cfg.blocks.websites, vec!["example.com".to_string()]);
        assert!(cfg.blocks.apps.is_empty());
        assert_eq!(cfg.dns.upstream, "8.8.8.8:53");
        assert_eq!(cfg.daemon.device_interval_secs, 5);
        assert_eq!(cfg.path, path);
    }

    #[test]
    fn load_toml_by_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[blocks]\napps = [\"steam\"]\n").unwrap();
        let cfg = KeyphyConfig::load(&path).unwrap();
        assert_eq!(cfg.blocks.apps, vec!["steam".to_string()]);
        assert!(cfg.auth.is_none());
    }

    #[test]
    fn load_rejects_non_hex_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"auth": {"device_uuid": "u", "derived_key": "zz"}}"#,
        )
        .unwrap();
        let err = KeyphyConfig::load(&path).unwrap_err();
        assert!(matches!(err, KeyphyError::InvalidConfig(_)));
    }

    #[test]
    fn save_round_trips_with_restrictive_mode() {
        let dir = tempdir().unwrap();
        let mut cfg = KeyphyConfig {
            path: dir.path().join("nested").join("config.json"),
            ..KeyphyConfig::default()
        };
        cfg.blocks.paths.push("/srv/games".to_string());
        cfg.save(&NoopProtector).unwrap();

        let metadata = fs::metadata(&cfg.path).unwrap();
        assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
        let loaded = KeyphyConfig::load(&cfg.path).unwrap();
        assert_eq!(loaded.blocks, cfg.blocks);
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let mut set = BlockSet {
            apps: vec!["a".into(), "b".into(), "a".into()],
            websites: vec!["x.com".into(), "x.com".into()],
            ..BlockSet::default()
        };
        set.dedup();
        assert_eq!(set.apps, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(set.websites, vec!["x.com".to_string()]);
    }
}
