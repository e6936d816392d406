//! Points the host resolver at the blocking server, keeps it pointed there,
//! and puts things back on the way out.

use crate::server::DnsBlockingServer;
use keyphy_core::error::{KeyphyError, KeyphyResult};
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Address the host resolver is pointed at while redirected.
pub const LOCAL_RESOLVER: &str = "127.0.0.1";

/// Host mechanisms for changing the resolver, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectMethod {
    Resolvectl,
    NetworkManager,
    ResolvConf,
}

impl RedirectMethod {
    pub const PRIORITY: [RedirectMethod; 3] = [
        RedirectMethod::Resolvectl,
        RedirectMethod::NetworkManager,
        RedirectMethod::ResolvConf,
    ];
}

impl fmt::Display for RedirectMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RedirectMethod::Resolvectl => "resolvectl",
            RedirectMethod::NetworkManager => "nmcli",
            RedirectMethod::ResolvConf => "resolv.conf",
        })
    }
}

/// Host-side resolver operations. Implementations are blocking.
pub trait ResolverBackend: Send + Sync {
    fn is_available(&self, method: RedirectMethod) -> bool;
    /// Servers currently configured through `method`, primary first.
    fn configured_servers(&self, method: RedirectMethod) -> KeyphyResult<Vec<String>>;
    fn set_servers(&self, method: RedirectMethod, servers: &[String]) -> KeyphyResult<()>;
    /// Free the privileged DNS port held by the OS stub resolver.
    fn disable_stub_listener(&self) -> KeyphyResult<()>;
    fn enable_stub_listener(&self) -> KeyphyResult<()>;
}

pub struct DnsSystemIntegrator {
    server: Arc<DnsBlockingServer>,
    backend: Arc<dyn ResolverBackend>,
    fallback: Vec<String>,
    backup: Mutex<Vec<String>>,
    method: Mutex<Option<RedirectMethod>>,
    stub_disabled: AtomicBool,
}

impl DnsSystemIntegrator {
    pub fn new(
        server: Arc<DnsBlockingServer>,
        backend: Arc<dyn ResolverBackend>,
        fallback: Vec<String>,
    ) -> Self {
        Self {
            server,
            backend,
            fallback,
            backup: Mutex::new(Vec::new()),
            method: Mutex::new(None),
            stub_disabled: AtomicBool::new(false),
        }
    }

    pub fn server(&self) -> &Arc<DnsBlockingServer> {
        &self.server
    }

    /// Servers captured at start for restoration.
    pub fn backup(&self) -> Vec<String> {
        self.backup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn active_method(&self) -> Option<RedirectMethod> {
        *self.method.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn blocking<T, F>(&self, op: F) -> KeyphyResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ResolverBackend) -> KeyphyResult<T> + Send + 'static,
    {
        let backend = self.backend.clone();
        tokio::task::spawn_blocking(move || op(backend.as_ref()))
            .await
            .map_err(|err| KeyphyError::SystemIntegration(format!("resolver task failed: {err}")))?
    }

    fn first_available(&self) -> Option<RedirectMethod> {
        RedirectMethod::PRIORITY
            .into_iter()
            .find(|method| self.backend.is_available(*method))
    }

    /// Capture the current servers, start the blocking server and redirect the
    /// host to it. A failed redirection leaves the server running on whatever
    /// port it got. A restart that only sees our own address keeps the backup
    /// from the earlier start.
    pub async fn start(&self) -> KeyphyResult<()> {
        let captured = match self.first_available() {
            Some(method) => self
                .blocking(move |backend| backend.configured_servers(method))
                .await
                .unwrap_or_else(|err| {
                    warn!("could not read current dns servers via {method}: {err}");
                    Vec::new()
                }),
            None => Vec::new(),
        };
        let captured: Vec<String> = captured
            .into_iter()
            .filter(|server| server != LOCAL_RESOLVER)
            .collect();
        {
            let mut backup = self.backup.lock().unwrap_or_else(PoisonError::into_inner);
            if captured.is_empty() && !backup.is_empty() {
                // Still redirected from an interrupted run.
                info!("keeping previously captured dns servers {:?}", *backup);
            } else {
                info!("captured original dns servers {captured:?}");
                *backup = captured;
            }
        }

        if !self.server.is_running() {
            self.server.start().await?;
        }

        match self.redirect().await {
            Ok(method) => info!("host dns redirected to keyphy via {method}"),
            Err(err) => warn!("dns redirection failed, some lookups may bypass blocking: {err}"),
        }
        Ok(())
    }

    /// Point the host at the local server using the first available method.
    pub async fn redirect(&self) -> KeyphyResult<RedirectMethod> {
        if !self.server.on_privileged_port() {
            self.blocking(|backend| backend.disable_stub_listener())
                .await?;
            self.stub_disabled.store(true, Ordering::SeqCst);
            if let Err(err) = self.server.rebind_privileged().await {
                warn!("dns server stays on fallback port: {err}");
            }
        }

        let method = self.first_available().ok_or_else(|| {
            KeyphyError::SystemIntegration("no resolver redirection method available".into())
        })?;
        let target = vec![LOCAL_RESOLVER.to_string()];
        self.blocking(move |backend| backend.set_servers(method, &target))
            .await?;
        *self.method.lock().unwrap_or_else(PoisonError::into_inner) = Some(method);
        Ok(method)
    }

    /// Primary resolver as seen through the method we redirected with.
    pub async fn primary_server(&self) -> KeyphyResult<Option<String>> {
        let Some(method) = self.active_method().or_else(|| self.first_available()) else {
            return Ok(None);
        };
        let servers = self
            .blocking(move |backend| backend.configured_servers(method))
            .await?;
        Ok(servers.into_iter().next())
    }

    /// One pass of the integrity loop. Returns whether anything was repaired.
    pub async fn check_and_repair(&self) -> KeyphyResult<bool> {
        let mut repaired = false;
        if !self.server.is_running() {
            warn!("SECURITY ALERT: dns blocking server is not running; restarting");
            self.server.start().await?;
            repaired = true;
        }

        let primary = self.primary_server().await?;
        if primary.as_deref() != Some(LOCAL_RESOLVER) {
            warn!(
                "SECURITY ALERT: dns tampering detected (primary resolver {}); reapplying redirection",
                primary.as_deref().unwrap_or("<none>")
            );
            self.redirect().await?;
            repaired = true;
        }
        Ok(repaired)
    }

    /// Re-check the host resolver every `period` until `shutdown` flips.
    pub fn spawn_integrity_monitor(
        self: &Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let integrator = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        match integrator.check_and_repair().await {
                            Ok(true) => info!("dns redirection restored"),
                            Ok(false) => debug!("dns redirection intact"),
                            Err(err) => warn!("dns integrity check failed: {err}"),
                        }
                    }
                }
            }
            debug!("dns integrity monitor stopped");
        })
    }

    /// Restore the captured servers (or the fallback pair) and stop serving.
    pub async fn stop(&self) -> KeyphyResult<()> {
        let mut servers = self.backup();
        if servers.is_empty() {
            servers = self.fallback.clone();
        }

        let method = self
            .method
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let mut result = Ok(());
        if let Some(method) = method {
            info!("restoring dns servers {servers:?} via {method}");
            if let Err(err) = self
                .blocking(move |backend| backend.set_servers(method, &servers))
                .await
            {
                error!("dns restore via {method} failed: {err}");
                self.emergency_restore();
                result = Err(err);
            }
        }

        if self.stub_disabled.swap(false, Ordering::SeqCst) {
            if let Err(err) = self.blocking(|backend| backend.enable_stub_listener()).await {
                warn!("failed to re-enable stub resolver: {err}");
            }
        }

        self.server.stop().await;
        result
    }

    /// Unconditionally give the host working name resolution again: bring the
    /// stub listener back, or write the fallback servers straight to
    /// resolv.conf if that fails. Blocking; safe to call from `Drop`.
    pub fn emergency_restore(&self) {
        warn!("performing emergency dns restoration");
        match self.backend.enable_stub_listener() {
            Ok(()) => {
                self.stub_disabled.store(false, Ordering::SeqCst);
                info!("stub resolver re-enabled");
            }
            Err(err) => {
                warn!("stub resolver restore failed ({err}); rewriting resolv.conf");
                if let Err(err) = self
                    .backend
                    .set_servers(RedirectMethod::ResolvConf, &self.fallback)
                {
                    error!("emergency resolv.conf restore failed: {err}");
                }
            }
        }
    }

    /// Guard that runs [`Self::emergency_restore`] when dropped while armed.
    pub fn emergency_guard(self: &Arc<Self>) -> EmergencyRestoreGuard {
        EmergencyRestoreGuard {
            integrator: self.clone(),
            armed: true,
        }
    }
}

pub struct EmergencyRestoreGuard {
    integrator: Arc<DnsSystemIntegrator>,
    armed: bool,
}

impl EmergencyRestoreGuard {
    /// Normal shutdown completed; nothing to restore.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for EmergencyRestoreGuard {
    fn drop(&mut self) {
        if self.armed {
            self.integrator.emergency_restore();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::SocketAddr;

    #[derive(Default)]
    struct MockBackend {
        available: HashSet<&'static str>,
        servers: Mutex<Vec<String>>,
        calls: Mutex<Vec<String>>,
        stub_fails: bool,
        stub_disable_fails: bool,
    }

    impl MockBackend {
        fn with(available: &[RedirectMethod], servers: &[&str]) -> Self {
            Self {
                available: available.iter().map(|m| key(*m)).collect(),
                servers: Mutex::new(servers.iter().map(|s| s.to_string()).collect()),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    fn key(method: RedirectMethod) -> &'static str {
        match method {
            RedirectMethod::Resolvectl => "resolvectl",
            RedirectMethod::NetworkManager => "nmcli",
            RedirectMethod::ResolvConf => "resolv.conf",
        }
    }

    impl ResolverBackend for MockBackend {
        fn is_available(&self, method: RedirectMethod) -> bool {
            self.available.contains(key(method))
        }

        fn configured_servers(&self, _method: RedirectMethod) -> KeyphyResult<Vec<String>> {
            Ok(self.servers.lock().unwrap().clone())
        }

        fn set_servers(&self, method: RedirectMethod, servers: &[String]) -> KeyphyResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("set {} {}", key(method), servers.join(",")));
            *self.servers.lock().unwrap() = servers.to_vec();
            Ok(())
        }

        fn disable_stub_listener(&self) -> KeyphyResult<()> {
            self.calls.lock().unwrap().push("stub off".into());
            if self.stub_disable_fails {
                return Err(KeyphyError::SystemIntegration("systemctl missing".into()));
            }
            Ok(())
        }

        fn enable_stub_listener(&self) -> KeyphyResult<()> {
            self.calls.lock().unwrap().push("stub on".into());
            if self.stub_fails {
                return Err(KeyphyError::SystemIntegration("systemctl missing".into()));
            }
            Ok(())
        }
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    /// Server whose "privileged" address is the one it binds first, so no stub
    /// juggling is needed.
    async fn privileged_server() -> Arc<DnsBlockingServer> {
        let free = tokio::net::UdpSocket::bind(loopback()).await.unwrap();
        let addr = free.local_addr().unwrap();
        drop(free);
        Arc::new(DnsBlockingServer::new(
            vec![addr],
            addr,
            "127.0.0.1:9".parse().unwrap(),
            Duration::from_millis(100),
        ))
    }

    fn integrator(server: Arc<DnsBlockingServer>, backend: Arc<MockBackend>) -> Arc<DnsSystemIntegrator> {
        Arc::new(DnsSystemIntegrator::new(
            server,
            backend,
            vec!["8.8.8.8".into(), "8.8.4.4".into()],
        ))
    }

    #[tokio::test]
    async fn start_backs_up_and_redirects_with_highest_priority_method() {
        let backend = Arc::new(MockBackend::with(
            &[RedirectMethod::NetworkManager, RedirectMethod::ResolvConf],
            &["192.168.1.1", "1.1.1.1"],
        ));
        let dns = integrator(privileged_server().await, backend.clone());
        dns.start().await.unwrap();

        assert_eq!(dns.backup(), vec!["192.168.1.1", "1.1.1.1"]);
        assert_eq!(dns.active_method(), Some(RedirectMethod::NetworkManager));
        assert_eq!(backend.calls(), vec!["set nmcli 127.0.0.1"]);
        assert!(dns.server().is_running());

        dns.stop().await.unwrap();
        assert_eq!(
            backend.calls().last().unwrap(),
            "set nmcli 192.168.1.1,1.1.1.1"
        );
        assert!(!dns.server().is_running());
    }

    #[tokio::test]
    async fn stop_with_empty_backup_uses_fallback_pair() {
        let backend = Arc::new(MockBackend::with(&[RedirectMethod::ResolvConf], &[]));
        let dns = integrator(privileged_server().await, backend.clone());
        dns.start().await.unwrap();
        assert!(dns.backup().is_empty());
        dns.stop().await.unwrap();
        assert_eq!(*backend.servers.lock().unwrap(), vec!["8.8.8.8", "8.8.4.4"]);
    }

    #[tokio::test]
    async fn own_address_is_not_captured_as_backup() {
        let backend = Arc::new(MockBackend::with(
            &[RedirectMethod::ResolvConf],
            &["127.0.0.1", "9.9.9.9"],
        ));
        let dns = integrator(privileged_server().await, backend);
        dns.start().await.unwrap();
        assert_eq!(dns.backup(), vec!["9.9.9.9"]);
        dns.stop().await.unwrap();
    }

    #[tokio::test]
    async fn restart_while_redirected_keeps_first_backup() {
        let backend = Arc::new(MockBackend::with(&[RedirectMethod::ResolvConf], &["10.1.1.1"]));
        let dns = integrator(privileged_server().await, backend.clone());
        dns.start().await.unwrap();
        dns.emergency_restore();
        dns.server().stop().await;

        dns.start().await.unwrap();
        assert_eq!(dns.backup(), vec!["10.1.1.1"]);
        dns.stop().await.unwrap();
        assert_eq!(*backend.servers.lock().unwrap(), vec!["10.1.1.1"]);
    }

    #[tokio::test]
    async fn non_privileged_bind_frees_stub_before_redirecting() {
        let taken = tokio::net::UdpSocket::bind(loopback()).await.unwrap();
        let server = Arc::new(DnsBlockingServer::new(
            vec![loopback()],
            taken.local_addr().unwrap(),
            "127.0.0.1:9".parse().unwrap(),
            Duration::from_millis(100),
        ));
        let backend = Arc::new(MockBackend::with(&[RedirectMethod::Resolvectl], &["10.0.0.1"]));
        let dns = integrator(server, backend.clone());
        dns.start().await.unwrap();

        // Rebind fails because the port is still taken; redirection proceeds.
        assert_eq!(backend.calls(), vec!["stub off", "set resolvectl 127.0.0.1"]);
        assert!(dns.server().is_running());

        dns.stop().await.unwrap();
        assert_eq!(
            backend.calls(),
            vec![
                "stub off",
                "set resolvectl 127.0.0.1",
                "set resolvectl 10.0.0.1",
                "stub on",
            ]
        );
    }

    #[tokio::test]
    async fn stub_disable_failure_aborts_redirection() {
        let taken = tokio::net::UdpSocket::bind(loopback()).await.unwrap();
        let server = Arc::new(DnsBlockingServer::new(
            vec![loopback()],
            taken.local_addr().unwrap(),
            "127.0.0.1:9".parse().unwrap(),
            Duration::from_millis(100),
        ));
        let backend = Arc::new(MockBackend {
            stub_disable_fails: true,
            ..MockBackend::with(&[RedirectMethod::ResolvConf], &["10.0.0.1"])
        });
        let dns = integrator(server, backend.clone());
        dns.start().await.unwrap();
        assert_eq!(backend.calls(), vec!["stub off"]);
        assert_eq!(dns.active_method(), None);
        dns.server().stop().await;
    }

    #[tokio::test]
    async fn integrity_check_reapplies_after_tampering() {
        let backend = Arc::new(MockBackend::with(&[RedirectMethod::ResolvConf], &["1.1.1.1"]));
        let dns = integrator(privileged_server().await, backend.clone());
        dns.start().await.unwrap();
        assert!(!dns.check_and_repair().await.unwrap());

        *backend.servers.lock().unwrap() = vec!["9.9.9.9".into()];
        assert!(dns.check_and_repair().await.unwrap());
        assert_eq!(*backend.servers.lock().unwrap(), vec![LOCAL_RESOLVER]);
        dns.stop().await.unwrap();
    }

    #[tokio::test]
    async fn integrity_check_restarts_dead_server() {
        let backend = Arc::new(MockBackend::with(&[RedirectMethod::ResolvConf], &[]));
        let dns = integrator(privileged_server().await, backend);
        dns.start().await.unwrap();
        dns.server().stop().await;
        assert!(dns.check_and_repair().await.unwrap());
        assert!(dns.server().is_running());
        dns.stop().await.unwrap();
    }

    #[tokio::test]
    async fn integrity_monitor_converges_and_stops_on_shutdown() {
        let backend = Arc::new(MockBackend::with(&[RedirectMethod::ResolvConf], &[]));
        let dns = integrator(privileged_server().await, backend.clone());
        dns.start().await.unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = dns.spawn_integrity_monitor(Duration::from_millis(20), rx);

        *backend.servers.lock().unwrap() = vec!["6.6.6.6".into()];
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*backend.servers.lock().unwrap(), vec![LOCAL_RESOLVER]);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        dns.stop().await.unwrap();
    }

    #[tokio::test]
    async fn emergency_restore_falls_back_to_resolv_conf() {
        let backend = Arc::new(MockBackend {
            stub_fails: true,
            ..MockBackend::default()
        });
        let dns = integrator(privileged_server().await, backend.clone());
        dns.emergency_restore();
        assert_eq!(
            backend.calls(),
            vec!["stub on", "set resolv.conf 8.8.8.8,8.8.4.4"]
        );
    }

    #[tokio::test]
    async fn armed_guard_restores_on_drop_and_disarmed_does_not() {
        let backend = Arc::new(MockBackend::default());
        let dns = integrator(privileged_server().await, backend.clone());
        dns.emergency_guard().disarm();
        assert!(backend.calls().is_empty());
        drop(dns.emergency_guard());
        assert_eq!(backend.calls(), vec!["stub on"]);
    }
}
