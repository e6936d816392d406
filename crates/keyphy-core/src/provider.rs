use crate::error::KeyphyResult;
use serde::Serialize;

/// Snapshot of one attached authentication-capable device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    pub uuid: String,
    pub name: String,
    /// `None` when the device is not mounted.
    pub mount_point: Option<String>,
    pub dev_path: String,
}

/// Source of device snapshots. Each call re-polls the host.
pub trait DeviceEnumerator: Send + Sync {
    fn list_devices(&self) -> KeyphyResult<Vec<Device>>;
}

/// Per-item blockers the enforcement layer delegates to.
///
/// Implementations must make every block/unblock idempotent: the orchestrator
/// re-applies the full set whenever it suspects drift and never deduplicates
/// on its own.
pub trait BlockProvider: Send + Sync {
    fn block_app(&self, app: &str) -> KeyphyResult<()>;
    fn unblock_app(&self, app: &str) -> KeyphyResult<()>;

    fn block_website(&self, domain: &str) -> KeyphyResult<()>;
    fn unblock_website(&self, domain: &str) -> KeyphyResult<()>;
    fn unblock_all_websites(&self) -> KeyphyResult<()>;

    fn block_path(&self, path: &str) -> KeyphyResult<()>;
    fn unblock_path(&self, path: &str) -> KeyphyResult<()>;

    fn block_ip(&self, ip: &str) -> KeyphyResult<()>;
    fn unblock_ip(&self, ip: &str) -> KeyphyResult<()>;
    fn unblock_all_ips(&self) -> KeyphyResult<()>;

    /// Terminate running processes of the given apps; returns the pids hit.
    fn terminate_blocked_processes(&self, apps: &[String]) -> KeyphyResult<Vec<u32>>;

    /// Check that blocking state (executable fingerprints, wrappers) is intact.
    /// Violations surface as `KeyphyError::IntegrityViolation`.
    fn verify_integrity(&self) -> KeyphyResult<()>;

    /// Re-assert app blocks after an integrity violation.
    fn enforce_blocks(&self) -> KeyphyResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
}

/// One sample of host activity.
#[derive(Debug, Clone, Default)]
pub struct SystemSample {
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub processes: Vec<ProcessInfo>,
}

/// Host activity sampling used by the advisory monitor.
pub trait SystemProbe: Send + Sync {
    fn sample(&self) -> KeyphyResult<SystemSample>;
}
