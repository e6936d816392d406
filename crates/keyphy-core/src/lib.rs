pub mod auth;
pub mod command;
pub mod config;
pub mod error;
pub mod logging;
pub mod protect;
pub mod provider;
pub mod service;
pub mod session;

pub use auth::{derive_device_key, device_fingerprint, AuthSession, AuthStatus};
pub use config::{AuthConfig, BlockSet, DaemonCfg, DnsCfg, KeyphyConfig, MountState};
pub use error::{KeyphyError, KeyphyResult};
pub use protect::{with_unprotected, ChattrProtector, NoopProtector, Protector};
pub use provider::{BlockProvider, Device, DeviceEnumerator, ProcessInfo, SystemProbe, SystemSample};
pub use service::{EnforcementReport, EnforcementService};
