//! System-backed `ResolverBackend`. It shells out to `resolvectl`, `nmcli`,
//! `systemctl` and `ip`, and edits resolv.conf directly as the last resort.

use crate::integrator::{RedirectMethod, ResolverBackend, LOCAL_RESOLVER};
use crate::parse::{
    parse_default_interface, parse_nmcli_dns, parse_resolv_conf, parse_resolvectl_status,
    render_resolv_conf,
};
use keyphy_core::command::{CommandRunner, DEFAULT_COMMAND_TIMEOUT};
use keyphy_core::config::DnsCfg;
use keyphy_core::error::{KeyphyError, KeyphyResult};
use keyphy_core::protect::{with_unprotected, Protector};
use log::{debug, info, warn};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const DEFAULT_RESOLVECTL_PATHS: &[&str] = &["/usr/bin/resolvectl", "/bin/resolvectl"];
pub const DEFAULT_NMCLI_PATHS: &[&str] = &["/usr/bin/nmcli", "/bin/nmcli"];
pub const DEFAULT_SYSTEMCTL_PATHS: &[&str] = &["/usr/bin/systemctl", "/bin/systemctl"];
pub const DEFAULT_IP_PATHS: &[&str] = &["/usr/sbin/ip", "/sbin/ip", "/usr/bin/ip", "/bin/ip"];

const RESOLVED_UNIT: &str = "systemd-resolved";
const STUB_OVERRIDE: &str = "[Resolve]\nDNSStubListener=no\n";
const FALLBACK_INTERFACE: &str = "eth0";
const ACTIVE_POLLS: u32 = 10;

pub struct SystemResolver {
    resolvectl: Option<CommandRunner>,
    nmcli: Option<CommandRunner>,
    systemctl: Option<CommandRunner>,
    ip: Option<CommandRunner>,
    resolv_conf: PathBuf,
    stub_override: PathBuf,
    protector: Arc<dyn Protector>,
    poll_interval: Duration,
}

impl SystemResolver {
    /// Bare resolver with no host tools; only resolv.conf editing works.
    pub fn new(resolv_conf: PathBuf, stub_override: PathBuf, protector: Arc<dyn Protector>) -> Self {
        Self {
            resolvectl: None,
            nmcli: None,
            systemctl: None,
            ip: None,
            resolv_conf,
            stub_override,
            protector,
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Probe the default tool locations.
    pub fn discover(cfg: &DnsCfg, protector: Arc<dyn Protector>) -> Self {
        let timeout = DEFAULT_COMMAND_TIMEOUT;
        let resolver = Self {
            resolvectl: CommandRunner::discover(DEFAULT_RESOLVECTL_PATHS, timeout),
            nmcli: CommandRunner::discover(DEFAULT_NMCLI_PATHS, timeout),
            systemctl: CommandRunner::discover(DEFAULT_SYSTEMCTL_PATHS, timeout),
            ip: CommandRunner::discover(DEFAULT_IP_PATHS, timeout),
            ..Self::new(
                PathBuf::from(&cfg.resolv_conf_path),
                PathBuf::from(&cfg.stub_override_path),
                protector,
            )
        };
        info!(
            "resolver tools: resolvectl={} nmcli={} systemctl={}",
            resolver.resolvectl.is_some(),
            resolver.nmcli.is_some(),
            resolver.systemctl.is_some()
        );
        resolver
    }

    pub fn with_resolvectl(mut self, runner: CommandRunner) -> Self {
        self.resolvectl = Some(runner);
        self
    }

    pub fn with_nmcli(mut self, runner: CommandRunner) -> Self {
        self.nmcli = Some(runner);
        self
    }

    pub fn with_systemctl(mut self, runner: CommandRunner) -> Self {
        self.systemctl = Some(runner);
        self
    }

    pub fn with_ip(mut self, runner: CommandRunner) -> Self {
        self.ip = Some(runner);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Interface carrying the default route.
    fn active_interface(&self) -> String {
        let found = self.ip.as_ref().and_then(|ip| {
            ip.run_checked(&["route", "show", "default"])
                .map(|out| parse_default_interface(&out.stdout))
                .unwrap_or_else(|err| {
                    debug!("default route lookup failed: {err}");
                    None
                })
        });
        found.unwrap_or_else(|| {
            warn!("no default route interface found; assuming {FALLBACK_INTERFACE}");
            FALLBACK_INTERFACE.to_string()
        })
    }

    fn tool(&self, method: RedirectMethod) -> KeyphyResult<&CommandRunner> {
        let runner = match method {
            RedirectMethod::Resolvectl => self.resolvectl.as_ref(),
            RedirectMethod::NetworkManager => self.nmcli.as_ref(),
            RedirectMethod::ResolvConf => None,
        };
        runner.ok_or_else(|| KeyphyError::SystemIntegration(format!("{method} is not available")))
    }

    fn systemctl(&self) -> KeyphyResult<&CommandRunner> {
        self.systemctl
            .as_ref()
            .ok_or_else(|| KeyphyError::SystemIntegration("systemctl is not available".into()))
    }

    fn restart_resolved(&self) -> KeyphyResult<()> {
        self.systemctl()?
            .run_checked(&["restart", RESOLVED_UNIT])
            .map_err(|err| KeyphyError::SystemIntegration(err.to_string()))?;
        Ok(())
    }

    fn read_resolv_conf(&self) -> KeyphyResult<Vec<String>> {
        match fs::read_to_string(&self.resolv_conf) {
            Ok(body) => Ok(parse_resolv_conf(&body)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn write_resolv_conf(&self, servers: &[String]) -> KeyphyResult<()> {
        let header = if servers.iter().any(|s| s == LOCAL_RESOLVER) {
            "Keyphy DNS redirection"
        } else {
            "Restored by Keyphy"
        };
        let body = render_resolv_conf(header, servers);
        let path: &Path = &self.resolv_conf;
        with_unprotected(self.protector.as_ref(), path, || {
            fs::write(path, &body)?;
            Ok(())
        })
    }
}

impl ResolverBackend for SystemResolver {
    fn is_available(&self, method: RedirectMethod) -> bool {
        match method {
            RedirectMethod::Resolvectl => self.resolvectl.is_some(),
            RedirectMethod::NetworkManager => self.nmcli.is_some(),
            RedirectMethod::ResolvConf => true,
        }
    }

    fn configured_servers(&self, method: RedirectMethod) -> KeyphyResult<Vec<String>> {
        match method {
            RedirectMethod::Resolvectl => {
                let out = self.tool(method)?.run_checked(&["status"])?;
                Ok(parse_resolvectl_status(&out.stdout))
            }
            RedirectMethod::NetworkManager => {
                let iface = self.active_interface();
                let out = self.tool(method)?.run_checked(&["dev", "show", &iface])?;
                Ok(parse_nmcli_dns(&out.stdout))
            }
            RedirectMethod::ResolvConf => self.read_resolv_conf(),
        }
    }

    fn set_servers(&self, method: RedirectMethod, servers: &[String]) -> KeyphyResult<()> {
        match method {
            RedirectMethod::Resolvectl => {
                let iface = self.active_interface();
                let mut args = vec!["dns", iface.as_str()];
                args.extend(servers.iter().map(String::as_str));
                self.tool(method)?.run_checked(&args)?;
            }
            RedirectMethod::NetworkManager => {
                let iface = self.active_interface();
                let joined = servers.join(",");
                self.tool(method)?
                    .run_checked(&["dev", "modify", &iface, "ipv4.dns", &joined])?;
            }
            RedirectMethod::ResolvConf => self.write_resolv_conf(servers)?,
        }
        debug!("set dns servers {servers:?} via {method}");
        Ok(())
    }

    fn disable_stub_listener(&self) -> KeyphyResult<()> {
        let systemctl = self.systemctl()?;
        if let Some(parent) = self.stub_override.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.stub_override, STUB_OVERRIDE)?;
        systemctl
            .run_checked(&["restart", RESOLVED_UNIT])
            .map_err(|err| KeyphyError::SystemIntegration(err.to_string()))?;
        thread::sleep(self.poll_interval);
        info!("systemd-resolved stub listener disabled");
        Ok(())
    }

    fn enable_stub_listener(&self) -> KeyphyResult<()> {
        match fs::remove_file(&self.stub_override) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(
                "could not remove {}: {err}",
                self.stub_override.display()
            ),
        }
        self.restart_resolved()?;

        let systemctl = self.systemctl()?;
        for _ in 0..ACTIVE_POLLS {
            if let Ok(out) = systemctl.run(&["is-active", RESOLVED_UNIT]) {
                if out.stdout.trim() == "active" {
                    info!("systemd-resolved is active again");
                    return Ok(());
                }
            }
            thread::sleep(self.poll_interval);
        }
        Err(KeyphyError::SystemIntegration(format!(
            "{RESOLVED_UNIT} did not become active"
        )))
    }
}
