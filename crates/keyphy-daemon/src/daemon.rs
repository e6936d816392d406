//! The enforcement orchestrator: lifecycle, lock/unlock transitions and the
//! per-tick logic driven by the monitor loops.

use crate::commands::Command;
use crate::monitors::{spawn_monitors, MonitorSet};
use keyphy_core::auth::AuthSession;
use keyphy_core::config::{BlockSet, KeyphyConfig};
use keyphy_core::error::{KeyphyError, KeyphyResult};
use keyphy_core::provider::{BlockProvider, DeviceEnumerator, SystemProbe, SystemSample};
use keyphy_core::service::{EnforcementReport, EnforcementService};
use keyphy_dns::DnsSystemIntegrator;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::SystemTime;
use tokio::sync::{watch, Mutex as AsyncMutex};

/// Process names commonly used to strip immutability or firewall rules.
pub const SUSPICIOUS_PROCESSES: &[&str] = &["chattr", "xattr", "lsattr", "iptables", "pfctl"];
const HIGH_USAGE_PERCENT: f64 = 90.0;

/// Externally visible lock state, as served by the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Stopped,
    Locked,
    Unlocked,
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DaemonState::Stopped => "STOPPED",
            DaemonState::Locked => "LOCKED",
            DaemonState::Unlocked => "UNLOCKED",
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn merge(into: &mut BlockSet, other: &BlockSet) {
    for (dst, src) in [
        (&mut into.apps, &other.apps),
        (&mut into.websites, &other.websites),
        (&mut into.paths, &other.paths),
        (&mut into.ips, &other.ips),
    ] {
        let mut seen: HashSet<String> = dst.iter().cloned().collect();
        dst.extend(src.iter().filter(|item| seen.insert((*item).clone())).cloned());
    }
}

fn config_mtime(cfg: &KeyphyConfig) -> Option<SystemTime> {
    if cfg.path.as_os_str().is_empty() {
        return None;
    }
    fs::metadata(&cfg.path).and_then(|meta| meta.modified()).ok()
}

/// Advisory findings for one activity sample.
pub fn activity_alerts(sample: &SystemSample) -> Vec<String> {
    let mut alerts = Vec::new();
    for process in &sample.processes {
        if SUSPICIOUS_PROCESSES.contains(&process.name.as_str()) {
            alerts.push(format!(
                "suspicious process {} running (pid {})",
                process.name, process.pid
            ));
        }
    }
    if let Some(cpu) = sample.cpu_percent.filter(|cpu| *cpu > HIGH_USAGE_PERCENT) {
        alerts.push(format!("high cpu usage {cpu:.1}%"));
    }
    if let Some(mem) = sample.memory_percent.filter(|mem| *mem > HIGH_USAGE_PERCENT) {
        alerts.push(format!("high memory usage {mem:.1}%"));
    }
    alerts
}

/// Run host-touching work (udev, PBKDF2, /proc, signals with grace sleeps)
/// on the blocking pool.
async fn off_runtime<T, F>(op: F) -> KeyphyResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|err| KeyphyError::Provider(format!("blocking task failed: {err}")))
}

fn aborted_pass(err: KeyphyError) -> EnforcementReport {
    error!("enforcement pass aborted: {err}");
    EnforcementReport {
        processed: 0,
        failures: vec![err],
    }
}

pub struct Daemon<P: BlockProvider> {
    config: RwLock<Arc<KeyphyConfig>>,
    config_mtime: Mutex<Option<SystemTime>>,
    auth: Arc<AuthSession>,
    enforcement: Arc<EnforcementService<P>>,
    dns: Option<Arc<DnsSystemIntegrator>>,
    probe: Arc<dyn SystemProbe>,
    running: AtomicBool,
    stop_requested: AtomicBool,
    blocks_active: AtomicBool,
    dns_active: AtomicBool,
    device_authenticated: AtomicBool,
    /// Serializes apply/remove passes.
    transition: AsyncMutex<()>,
    /// Everything applied since the last removal, so unlock also clears items
    /// dropped from the config in the meantime.
    applied: Mutex<BlockSet>,
    monitors: Mutex<Option<MonitorSet>>,
    state_tx: watch::Sender<DaemonState>,
}

impl<P: BlockProvider + 'static> Daemon<P> {
    pub fn new(
        config: KeyphyConfig,
        enumerator: Arc<dyn DeviceEnumerator>,
        provider: P,
        dns: Option<Arc<DnsSystemIntegrator>>,
        probe: Arc<dyn SystemProbe>,
    ) -> Self {
        let mut config = config;
        config.blocks.dedup();
        let auth = AuthSession::new(enumerator, config.auth.clone());
        let (state_tx, _) = watch::channel(DaemonState::Stopped);
        Self {
            config_mtime: Mutex::new(config_mtime(&config)),
            config: RwLock::new(Arc::new(config)),
            auth: Arc::new(auth),
            enforcement: Arc::new(EnforcementService::new(provider)),
            dns,
            probe,
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            blocks_active: AtomicBool::new(false),
            dns_active: AtomicBool::new(false),
            device_authenticated: AtomicBool::new(false),
            transition: AsyncMutex::new(()),
            applied: Mutex::new(BlockSet::default()),
            monitors: Mutex::new(None),
            state_tx,
        }
    }

    pub fn config(&self) -> Arc<KeyphyConfig> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn auth(&self) -> &AuthSession {
        &self.auth
    }

    pub fn enforcement(&self) -> &EnforcementService<P> {
        &self.enforcement
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn blocks_active(&self) -> bool {
        self.blocks_active.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> DaemonState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<DaemonState> {
        self.state_tx.subscribe()
    }

    fn publish_state(&self) {
        let state = if !self.is_running() {
            DaemonState::Stopped
        } else if self.blocks_active() {
            DaemonState::Locked
        } else {
            DaemonState::Unlocked
        };
        self.state_tx.send_replace(state);
    }

    /// Apply the block set (bringing DNS up when websites are blocked) and
    /// spawn the monitors. Returns once setup is done.
    pub async fn start(self: &Arc<Self>) -> KeyphyResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(KeyphyError::AlreadyRunning);
        }
        self.stop_requested.store(false, Ordering::SeqCst);
        info!("keyphy daemon starting");

        let cfg = self.config();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        // Installed before the first apply so a DNS integrity monitor started
        // by it joins this run.
        *lock(&self.monitors) = Some(MonitorSet::new(shutdown_tx, Vec::new()));

        let report = self.apply_blocks().await;
        if !report.is_clean() {
            warn!("{} block(s) failed during start", report.failures.len());
        }

        let handles = spawn_monitors(self, &cfg.daemon, shutdown_rx);
        if let Some(set) = lock(&self.monitors).as_mut() {
            for (name, handle) in handles {
                set.push(name, handle);
            }
            debug!("monitors running: {:?}", set.names());
        }
        self.publish_state();
        info!("keyphy daemon running");
        Ok(())
    }

    /// Cancel the monitors, remove every block and hand DNS back to the host.
    pub async fn stop(&self) -> KeyphyResult<()> {
        self.stop_requested.store(true, Ordering::SeqCst);
        if !self.is_running() {
            debug!("stop requested while not running");
            return Ok(());
        }
        info!("keyphy daemon stopping");

        let monitors = lock(&self.monitors).take();
        if let Some(monitors) = monitors {
            monitors.shutdown().await;
        }

        let report = self.remove_all_blocks().await;
        if !report.is_clean() {
            warn!("{} unblock(s) failed during stop", report.failures.len());
        }

        let mut result = Ok(());
        if self.dns_active.swap(false, Ordering::SeqCst) {
            if let Some(dns) = &self.dns {
                if let Err(err) = dns.stop().await {
                    error!("dns shutdown incomplete: {err}");
                    result = Err(err);
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.publish_state();
        info!("keyphy daemon stopped");
        result
    }

    /// Start DNS blocking the first time a running daemon has websites to
    /// block, whether they came with the initial config, a reload or a lock.
    async fn ensure_dns(&self, cfg: &KeyphyConfig) {
        if cfg.blocks.websites.is_empty()
            || !self.is_running()
            || self.dns_active.load(Ordering::SeqCst)
        {
            return;
        }
        let Some(dns) = &self.dns else {
            return;
        };
        match dns.start().await {
            Ok(()) => {
                self.dns_active.store(true, Ordering::SeqCst);
                if let Some(set) = lock(&self.monitors).as_mut() {
                    let handle =
                        dns.spawn_integrity_monitor(cfg.dns.integrity_interval(), set.subscribe());
                    set.push("dns-integrity", handle);
                }
            }
            Err(err) => warn!("dns blocking unavailable, websites stay reachable: {err}"),
        }
    }

    pub async fn apply_blocks(&self) -> EnforcementReport {
        let _transition = self.transition.lock().await;
        let cfg = self.config();
        self.ensure_dns(&cfg).await;

        let enforcement = self.enforcement.clone();
        let blocks = cfg.blocks.clone();
        let report = off_runtime(move || enforcement.apply_blocks(&blocks))
            .await
            .unwrap_or_else(aborted_pass);
        merge(&mut lock(&self.applied), &cfg.blocks);
        self.blocks_active.store(true, Ordering::SeqCst);
        self.publish_state();
        report
    }

    pub async fn remove_all_blocks(&self) -> EnforcementReport {
        let _transition = self.transition.lock().await;
        let mut blocks = std::mem::take(&mut *lock(&self.applied));
        merge(&mut blocks, &self.config().blocks);
        let enforcement = self.enforcement.clone();
        let report = off_runtime(move || enforcement.remove_all_blocks(&blocks))
            .await
            .unwrap_or_else(aborted_pass);
        self.blocks_active.store(false, Ordering::SeqCst);
        self.publish_state();
        report
    }

    /// Run an external command; every command needs a fresh device
    /// authentication first.
    pub async fn execute(&self, command: Command) -> KeyphyResult<()> {
        let auth = self.auth.clone();
        let verdict = off_runtime(move || auth.authenticate_device())
            .await
            .and_then(|verdict| verdict);
        if let Err(err) = verdict {
            warn!("SECURITY ALERT: refused {command} command: {err}");
            return Err(KeyphyError::CommandRefused {
                command: command.to_string(),
                reason: err.to_string(),
            });
        }
        info!("authenticated {command} command");
        match command {
            Command::Lock => {
                self.apply_blocks().await;
            }
            Command::Unlock => {
                self.remove_all_blocks().await;
            }
            Command::Stop => self.stop().await?,
        }
        Ok(())
    }

    /// Losing the device locks; regaining it never unlocks.
    pub async fn device_tick(&self) {
        let auth = self.auth.clone();
        let now = match off_runtime(move || auth.check_device()).await {
            Ok(now) => now,
            Err(err) => {
                warn!("device check failed: {err}");
                return;
            }
        };
        let before = self.device_authenticated.swap(now, Ordering::SeqCst);
        match (before, now) {
            (true, false) => {
                warn!("authentication device lost; applying blocks");
                self.apply_blocks().await;
            }
            (false, true) => {
                info!("authentication device present; unlocking still requires a command");
            }
            _ => {}
        }
    }

    pub async fn process_tick(&self) {
        if !self.blocks_active() {
            return;
        }
        let applied = lock(&self.applied).clone();
        let enforcement = self.enforcement.clone();
        if let Err(err) = off_runtime(move || enforcement.terminate_blocked_processes(&applied)).await {
            warn!("process sweep failed: {err}");
        }
    }

    /// Reload the config when its mtime moves; re-apply while locked.
    pub async fn config_tick(&self) {
        let cfg = self.config();
        let current = config_mtime(&cfg);
        {
            let mut seen = lock(&self.config_mtime);
            if current.is_none() || *seen == current {
                return;
            }
            *seen = current;
        }

        match KeyphyConfig::load(&cfg.path) {
            Ok(mut fresh) => {
                info!("config {} changed; reloading", cfg.path.display());
                fresh.blocks.dedup();
                self.auth.set_config(fresh.auth.clone());
                *self.config.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(fresh);
                if self.blocks_active() {
                    self.apply_blocks().await;
                }
            }
            Err(err) => warn!(
                "SECURITY ALERT: config {} modified but unreadable, keeping previous: {err}",
                cfg.path.display()
            ),
        }
    }

    /// Returns whether a violation was found and repaired.
    pub async fn integrity_tick(&self) -> bool {
        if !self.blocks_active() {
            return false;
        }
        let _transition = self.transition.lock().await;
        let enforcement = self.enforcement.clone();
        off_runtime(move || enforcement.verify_and_repair())
            .await
            .unwrap_or_else(|err| {
                warn!("integrity check failed: {err}");
                false
            })
    }

    pub async fn activity_tick(&self) {
        let probe = self.probe.clone();
        let sample = match off_runtime(move || probe.sample()).await.and_then(|sample| sample) {
            Ok(sample) => sample,
            Err(err) => {
                debug!("activity sample failed: {err}");
                return;
            }
        };
        for alert in activity_alerts(&sample) {
            warn!("SECURITY ALERT: {alert}");
        }
    }

    /// Watchdog pass: restart when the running flag was lost without a stop
    /// or a monitor died. Returns whether a restart happened.
    pub async fn supervise_tick(self: &Arc<Self>) -> bool {
        if self.stop_requested.load(Ordering::SeqCst) {
            return false;
        }
        let reason = if !self.is_running() {
            Some("running flag lost".to_string())
        } else {
            lock(&self.monitors)
                .as_ref()
                .and_then(MonitorSet::finished)
                .map(|name| format!("{name} monitor exited"))
        };
        let Some(reason) = reason else {
            return false;
        };

        error!("SECURITY ALERT: enforcement loop interrupted ({reason}); restarting");
        let monitors = lock(&self.monitors).take();
        if let Some(monitors) = monitors {
            monitors.shutdown().await;
        }
        if let Some(dns) = &self.dns {
            let integrator = dns.clone();
            if let Err(err) = off_runtime(move || integrator.emergency_restore()).await {
                error!("emergency dns restore failed: {err}");
            }
            dns.server().stop().await;
        }
        self.dns_active.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);

        if let Err(err) = self.start().await {
            error!("daemon restart failed: {err}");
        }
        true
    }
}
