//! Host-backed per-item blockers composed into the daemon's [`BlockProvider`].

use crate::procfs::{scan_processes, ProcEntry, DEFAULT_PROC_ROOT};
use keyphy_core::command::{CommandRunner, DEFAULT_COMMAND_TIMEOUT};
use keyphy_core::error::{KeyphyError, KeyphyResult};
use keyphy_core::protect::{with_unprotected, Protector};
use keyphy_core::provider::BlockProvider;
use keyphy_dns::DnsBlockingServer;
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::env;
use std::fs;
use std::net::IpAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

pub const DEFAULT_IPTABLES_PATHS: &[&str] = &["/usr/sbin/iptables", "/sbin/iptables"];
pub const DEFAULT_IP6TABLES_PATHS: &[&str] = &["/usr/sbin/ip6tables", "/sbin/ip6tables"];

const FALLBACK_BIN_DIRS: &[&str] = &["/usr/local/bin", "/usr/bin", "/bin", "/snap/bin", "/usr/games"];
const COMM_LEN: usize = 15;
const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(200);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn sha256_file(path: &Path) -> KeyphyResult<String> {
    let data = fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&data)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ExeFingerprint {
    exe: PathBuf,
    sha256: String,
}

/// Blocks applications by terminating their processes.
///
/// Executables that can be resolved are fingerprinted when first blocked so
/// the integrity monitor can notice them being swapped.
pub struct ProcAppBlocker {
    proc_root: PathBuf,
    search_dirs: Vec<PathBuf>,
    grace: Duration,
    blocked: Mutex<BTreeMap<String, Option<ExeFingerprint>>>,
}

impl Default for ProcAppBlocker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcAppBlocker {
    pub fn new() -> Self {
        let mut search_dirs: Vec<PathBuf> = env::var_os("PATH")
            .map(|path| env::split_paths(&path).collect())
            .unwrap_or_default();
        for dir in FALLBACK_BIN_DIRS {
            let dir = PathBuf::from(dir);
            if !search_dirs.contains(&dir) {
                search_dirs.push(dir);
            }
        }
        Self::with_roots(PathBuf::from(DEFAULT_PROC_ROOT), search_dirs)
    }

    pub fn with_roots(proc_root: PathBuf, search_dirs: Vec<PathBuf>) -> Self {
        Self {
            proc_root,
            search_dirs,
            grace: DEFAULT_KILL_GRACE,
            blocked: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// `name:/path/to/bin` pins the executable; bare names are searched for.
    fn resolve_executable(&self, app: &str) -> Option<PathBuf> {
        if let Some((_, path)) = app.split_once(':') {
            let path = PathBuf::from(path.trim());
            return path.is_file().then_some(path);
        }
        let candidate = Path::new(app);
        if candidate.is_absolute() {
            return candidate.is_file().then(|| candidate.to_path_buf());
        }
        self.search_dirs
            .iter()
            .map(|dir| dir.join(app))
            .find(|path| path.is_file())
    }

    fn fingerprint(&self, app: &str) -> Option<ExeFingerprint> {
        let exe = self.resolve_executable(app)?;
        let exe = fs::canonicalize(&exe).unwrap_or(exe);
        match sha256_file(&exe) {
            Ok(sha256) => Some(ExeFingerprint { exe, sha256 }),
            Err(err) => {
                warn!("cannot fingerprint {}: {err}", exe.display());
                None
            }
        }
    }

    /// Processes in the current table matching any of `apps`.
    fn matching(&self, apps: &[String]) -> KeyphyResult<Vec<ProcEntry>> {
        let own_pid = process::id();
        let pinned: Vec<(String, Option<PathBuf>)> = {
            let blocked = lock(&self.blocked);
            apps.iter()
                .map(|app| {
                    let exe = blocked
                        .get(app)
                        .and_then(|fp| fp.as_ref().map(|fp| fp.exe.clone()));
                    (display_name(app), exe)
                })
                .collect()
        };
        Ok(scan_processes(&self.proc_root)?
            .into_iter()
            .filter(|entry| entry.pid != own_pid)
            .filter(|entry| {
                pinned
                    .iter()
                    .any(|(name, exe)| process_matches(entry, name, exe.as_deref()))
            })
            .collect())
    }

    /// SIGTERM, then SIGKILL after the grace period. Blocks the calling thread.
    fn terminate(&self, apps: &[String]) -> KeyphyResult<Vec<u32>> {
        let mut signalled = Vec::new();
        for entry in self.matching(apps)? {
            let pid = Pid::from_raw(entry.pid as i32);
            match kill(pid, Signal::SIGTERM) {
                Ok(()) => {
                    info!("terminating blocked process {} ({})", entry.pid, entry.comm);
                    signalled.push(entry.pid);
                }
                Err(Errno::ESRCH) => {}
                Err(err) => warn!("failed to signal {} ({}): {err}", entry.pid, entry.comm),
            }
        }
        if signalled.is_empty() {
            return Ok(signalled);
        }

        thread::sleep(self.grace);
        for pid in &signalled {
            let pid = Pid::from_raw(*pid as i32);
            if kill(pid, None).is_ok() {
                debug!("process {pid} ignored SIGTERM; sending SIGKILL");
                let _ = kill(pid, Signal::SIGKILL);
            }
        }
        Ok(signalled)
    }

    pub fn block_app(&self, app: &str) -> KeyphyResult<()> {
        let fresh = !lock(&self.blocked).contains_key(app);
        if fresh {
            let fingerprint = self.fingerprint(app);
            if fingerprint.is_none() {
                debug!("no executable found for {app}; matching by process name only");
            }
            lock(&self.blocked).insert(app.to_string(), fingerprint);
        }
        self.terminate(&[app.to_string()])?;
        Ok(())
    }

    pub fn unblock_app(&self, app: &str) -> KeyphyResult<()> {
        lock(&self.blocked).remove(app);
        Ok(())
    }

    pub fn terminate_blocked_processes(&self, apps: &[String]) -> KeyphyResult<Vec<u32>> {
        self.terminate(apps)
    }

    /// Fails on the first blocked executable whose hash changed or which
    /// disappeared.
    pub fn verify_integrity(&self) -> KeyphyResult<()> {
        let blocked = lock(&self.blocked);
        for (app, fingerprint) in blocked.iter() {
            let Some(fp) = fingerprint else { continue };
            match sha256_file(&fp.exe) {
                Ok(current) if current == fp.sha256 => {}
                Ok(_) => {
                    return Err(KeyphyError::IntegrityViolation(format!(
                        "executable {} for blocked app {app} was modified",
                        fp.exe.display()
                    )))
                }
                Err(err) => {
                    return Err(KeyphyError::IntegrityViolation(format!(
                        "executable {} for blocked app {app} is unreadable: {err}",
                        fp.exe.display()
                    )))
                }
            }
        }
        Ok(())
    }

    /// Re-fingerprint every blocked app and sweep their processes again.
    pub fn enforce_blocks(&self) -> KeyphyResult<()> {
        let apps: Vec<String> = lock(&self.blocked).keys().cloned().collect();
        for app in &apps {
            let fingerprint = self.fingerprint(app);
            lock(&self.blocked).insert(app.clone(), fingerprint);
        }
        self.terminate(&apps)?;
        Ok(())
    }

    pub fn blocked(&self) -> Vec<String> {
        lock(&self.blocked).keys().cloned().collect()
    }
}

fn display_name(app: &str) -> String {
    let bare = app.split_once(':').map(|(name, _)| name).unwrap_or(app);
    Path::new(bare)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| bare.to_string())
}

fn process_matches(entry: &ProcEntry, name: &str, exe: Option<&Path>) -> bool {
    let comm_name: String = name.chars().take(COMM_LEN).collect();
    if !name.is_empty() && entry.comm == comm_name {
        return true;
    }
    if let (Some(exe), Some(running)) = (exe, entry.exe.as_deref()) {
        if running == exe {
            return true;
        }
    }
    entry
        .argv0
        .as_deref()
        .and_then(|argv0| Path::new(argv0).file_name())
        .is_some_and(|base| !name.is_empty() && base == name)
}

const FALLBACK_FILE_MODE: u32 = 0o644;
const FALLBACK_DIR_MODE: u32 = 0o755;

/// Mode to restore when the real original is unknown, e.g. after a restart
/// found the path already blocked.
fn fallback_mode(meta: &fs::Metadata) -> u32 {
    if meta.is_dir() {
        FALLBACK_DIR_MODE
    } else {
        FALLBACK_FILE_MODE
    }
}

/// Blocks filesystem paths by dropping every permission bit and marking them
/// immutable. The original mode is restored on unblock.
pub struct ModePathBlocker {
    protector: Arc<dyn Protector>,
    original_modes: Mutex<HashMap<PathBuf, u32>>,
}

impl ModePathBlocker {
    pub fn new(protector: Arc<dyn Protector>) -> Self {
        Self {
            protector,
            original_modes: Mutex::new(HashMap::new()),
        }
    }

    pub fn block_path(&self, path: &str) -> KeyphyResult<()> {
        let path = PathBuf::from(path);
        let meta = fs::metadata(&path)?;
        let mode = meta.permissions().mode() & 0o7777;
        // Mode 0 is our own doing from an earlier run; never treat it as original.
        let original = if mode == 0 { fallback_mode(&meta) } else { mode };
        lock(&self.original_modes)
            .entry(path.clone())
            .or_insert(original);
        with_unprotected(self.protector.as_ref(), &path, || {
            fs::set_permissions(&path, fs::Permissions::from_mode(0))?;
            Ok(())
        })
    }

    /// Always clears the immutable flag. A path this instance never blocked is
    /// only re-permissioned when it is still at mode 0.
    pub fn unblock_path(&self, path: &str) -> KeyphyResult<()> {
        let path = PathBuf::from(path);
        if !path.exists() {
            debug!("{} no longer exists; nothing to unblock", path.display());
            lock(&self.original_modes).remove(&path);
            return Ok(());
        }
        self.protector.unprotect(&path)?;

        let meta = fs::metadata(&path)?;
        let recorded = lock(&self.original_modes).get(&path).copied();
        let mode = match recorded {
            Some(mode) => mode,
            None if meta.permissions().mode() & 0o7777 == 0 => {
                let mode = fallback_mode(&meta);
                warn!(
                    "original mode of {} unknown; restoring {mode:o}",
                    path.display()
                );
                mode
            }
            None => return Ok(()),
        };
        fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
        lock(&self.original_modes).remove(&path);
        Ok(())
    }
}

/// Drops outbound traffic to blocked addresses with one `OUTPUT` rule each.
pub struct IptablesBlocker {
    iptables: Option<CommandRunner>,
    ip6tables: Option<CommandRunner>,
    blocked: Mutex<BTreeSet<String>>,
}

impl IptablesBlocker {
    pub fn discover() -> Self {
        let iptables = CommandRunner::discover(DEFAULT_IPTABLES_PATHS, DEFAULT_COMMAND_TIMEOUT);
        if iptables.is_none() {
            warn!("iptables not found; ip blocking unavailable");
        }
        Self {
            iptables,
            ip6tables: CommandRunner::discover(DEFAULT_IP6TABLES_PATHS, DEFAULT_COMMAND_TIMEOUT),
            blocked: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn with_runners(iptables: Option<CommandRunner>, ip6tables: Option<CommandRunner>) -> Self {
        Self {
            iptables,
            ip6tables,
            blocked: Mutex::new(BTreeSet::new()),
        }
    }

    fn runner_for(&self, ip: &str) -> KeyphyResult<(&CommandRunner, String)> {
        let addr: IpAddr = ip
            .trim()
            .parse()
            .map_err(|_| KeyphyError::Provider(format!("invalid ip address `{ip}`")))?;
        let (runner, tool) = match addr {
            IpAddr::V4(_) => (self.iptables.as_ref(), "iptables"),
            IpAddr::V6(_) => (self.ip6tables.as_ref(), "ip6tables"),
        };
        runner
            .map(|runner| (runner, addr.to_string()))
            .ok_or_else(|| KeyphyError::Provider(format!("{tool} not available")))
    }

    fn rule<'a>(op: &'a str, ip: &'a str) -> [&'a str; 6] {
        [op, "OUTPUT", "-d", ip, "-j", "DROP"]
    }

    pub fn block_ip(&self, ip: &str) -> KeyphyResult<()> {
        let (runner, addr) = self.runner_for(ip)?;
        if !runner.run(&Self::rule("-C", &addr))?.success() {
            runner.run_checked(&Self::rule("-A", &addr))?;
        }
        lock(&self.blocked).insert(addr);
        Ok(())
    }

    pub fn unblock_ip(&self, ip: &str) -> KeyphyResult<()> {
        let (runner, addr) = self.runner_for(ip)?;
        // Duplicates may exist if someone else appended the same rule.
        for _ in 0..8 {
            if !runner.run(&Self::rule("-C", &addr))?.success() {
                break;
            }
            runner.run_checked(&Self::rule("-D", &addr))?;
        }
        lock(&self.blocked).remove(&addr);
        Ok(())
    }

    pub fn unblock_all(&self) -> KeyphyResult<()> {
        let tracked: Vec<String> = lock(&self.blocked).iter().cloned().collect();
        let mut first_err = None;
        for ip in tracked {
            if let Err(err) = self.unblock_ip(&ip) {
                warn!("failed to unblock {ip}: {err}");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Production [`BlockProvider`]: processes, file modes, iptables, and the
/// DNS sinkhole for websites.
pub struct SystemBlockProvider {
    apps: ProcAppBlocker,
    paths: ModePathBlocker,
    ips: IptablesBlocker,
    dns: Arc<DnsBlockingServer>,
}

impl SystemBlockProvider {
    pub fn new(
        apps: ProcAppBlocker,
        paths: ModePathBlocker,
        ips: IptablesBlocker,
        dns: Arc<DnsBlockingServer>,
    ) -> Self {
        Self {
            apps,
            paths,
            ips,
            dns,
        }
    }

    pub fn discover(dns: Arc<DnsBlockingServer>, protector: Arc<dyn Protector>) -> Self {
        Self::new(
            ProcAppBlocker::new(),
            ModePathBlocker::new(protector),
            IptablesBlocker::discover(),
            dns,
        )
    }
}

impl BlockProvider for SystemBlockProvider {
    fn block_app(&self, app: &str) -> KeyphyResult<()> {
        self.apps.block_app(app)
    }

    fn unblock_app(&self, app: &str) -> KeyphyResult<()> {
        self.apps.unblock_app(app)
    }

    fn block_website(&self, domain: &str) -> KeyphyResult<()> {
        if !self.dns.is_running() {
            return Err(KeyphyError::Provider(format!(
                "dns blocking server not running; cannot block {domain}"
            )));
        }
        self.dns.block_domain(domain);
        Ok(())
    }

    fn unblock_website(&self, domain: &str) -> KeyphyResult<()> {
        self.dns.unblock_domain(domain);
        Ok(())
    }

    fn unblock_all_websites(&self) -> KeyphyResult<()> {
        self.dns.unblock_all();
        Ok(())
    }

    fn block_path(&self, path: &str) -> KeyphyResult<()> {
        self.paths.block_path(path)
    }

    fn unblock_path(&self, path: &str) -> KeyphyResult<()> {
        self.paths.unblock_path(path)
    }

    fn block_ip(&self, ip: &str) -> KeyphyResult<()> {
        self.ips.block_ip(ip)
    }

    fn unblock_ip(&self, ip: &str) -> KeyphyResult<()> {
        self.ips.unblock_ip(ip)
    }

    fn unblock_all_ips(&self) -> KeyphyResult<()> {
        self.ips.unblock_all()
    }

    fn terminate_blocked_processes(&self, apps: &[String]) -> KeyphyResult<Vec<u32>> {
        self.apps.terminate_blocked_processes(apps)
    }

    fn verify_integrity(&self) -> KeyphyResult<()> {
        self.apps.verify_integrity()
    }

    fn enforce_blocks(&self) -> KeyphyResult<()> {
        self.apps.enforce_blocks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyphy_core::protect::NoopProtector;
    use std::process::Command;
    use tempfile::tempdir;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[derive(Default)]
    struct RecordingProtector {
        calls: Mutex<Vec<String>>,
    }

    impl Protector for RecordingProtector {
        fn protect(&self, path: &Path) -> KeyphyResult<()> {
            self.calls.lock().unwrap().push(format!("+{}", path.display()));
            Ok(())
        }

        fn unprotect(&self, path: &Path) -> KeyphyResult<()> {
            self.calls.lock().unwrap().push(format!("-{}", path.display()));
            Ok(())
        }
    }

    fn entry(comm: &str, exe: Option<&str>, argv0: Option<&str>) -> ProcEntry {
        ProcEntry {
            pid: 10,
            comm: comm.into(),
            exe: exe.map(PathBuf::from),
            argv0: argv0.map(String::from),
        }
    }

    #[test]
    fn process_matching_rules() {
        assert!(process_matches(&entry("steam", None, None), "steam", None));
        assert!(!process_matches(&entry("steamwebhelper", None, None), "steam", None));
        // comm is truncated by the kernel
        assert!(process_matches(
            &entry("chromium-browse", None, None),
            "chromium-browser",
            None
        ));
        assert!(process_matches(
            &entry("java", Some("/opt/game/bin/java"), None),
            "minecraft",
            Some(Path::new("/opt/game/bin/java"))
        ));
        assert!(process_matches(
            &entry("python3", None, Some("/usr/local/bin/steam")),
            "steam",
            None
        ));
        assert!(!process_matches(
            &entry("vim", None, Some("vim")),
            "steam",
            Some(Path::new("/usr/bin/steam"))
        ));
    }

    #[test]
    fn display_name_strips_paths_and_pins() {
        assert_eq!(display_name("/usr/bin/steam"), "steam");
        assert_eq!(display_name("game:/opt/game/run"), "game");
        assert_eq!(display_name("firefox"), "firefox");
    }

    #[test]
    fn integrity_detects_swapped_executable() {
        let dir = tempdir().unwrap();
        let bin_dir = dir.path().join("bin");
        fs::create_dir_all(&bin_dir).unwrap();
        let exe = script(&bin_dir, "solitaire", "exit 0");
        let proc_root = dir.path().join("proc");
        fs::create_dir_all(&proc_root).unwrap();

        let blocker = ProcAppBlocker::with_roots(proc_root, vec![bin_dir]);
        blocker.block_app("solitaire").unwrap();
        blocker.block_app("not-installed").unwrap();
        assert_eq!(blocker.blocked(), vec!["not-installed", "solitaire"]);
        blocker.verify_integrity().unwrap();

        fs::write(&exe, "#!/bin/sh\necho bypass\n").unwrap();
        let err = blocker.verify_integrity().unwrap_err();
        assert!(matches!(err, KeyphyError::IntegrityViolation(_)), "{err}");

        blocker.enforce_blocks().unwrap();
        blocker.verify_integrity().unwrap();

        blocker.unblock_app("solitaire").unwrap();
        fs::remove_file(&exe).unwrap();
        blocker.verify_integrity().unwrap();
    }

    #[test]
    fn block_app_terminates_running_process() {
        let dir = tempdir().unwrap();
        let exe = script(dir.path(), "kp-blocktest", "sleep 30");
        let mut child = Command::new(&exe).spawn().unwrap();
        // give the kernel a moment to exec the script
        thread::sleep(Duration::from_millis(200));

        let blocker = ProcAppBlocker::with_roots(PathBuf::from(DEFAULT_PROC_ROOT), Vec::new())
            .with_grace(Duration::from_millis(50));
        blocker.block_app(exe.to_str().unwrap()).unwrap();

        let status = child.wait().unwrap();
        assert!(!status.success());
        let again = blocker
            .terminate_blocked_processes(&[exe.to_string_lossy().into_owned()])
            .unwrap();
        assert!(!again.contains(&child.id()));
    }

    #[test]
    fn path_block_restores_original_mode() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("saves");
        fs::write(&file, "data").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o640)).unwrap();
        let protector = Arc::new(RecordingProtector::default());
        let blocker = ModePathBlocker::new(protector.clone());
        let target = file.to_str().unwrap();

        blocker.block_path(target).unwrap();
        blocker.block_path(target).unwrap();
        assert_eq!(fs::metadata(&file).unwrap().permissions().mode() & 0o7777, 0);

        blocker.unblock_path(target).unwrap();
        assert_eq!(fs::metadata(&file).unwrap().permissions().mode() & 0o7777, 0o640);
        blocker.unblock_path(target).unwrap();

        let calls = protector.calls.lock().unwrap();
        assert_eq!(calls.first().map(|c| c.starts_with('-')), Some(true));
        assert_eq!(calls.iter().filter(|c| c.starts_with('+')).count(), 2);
    }

    fn mode(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o7777
    }

    #[test]
    fn path_unblock_after_restart_does_not_keep_mode_zero() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("saves");
        fs::write(&file, "data").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o640)).unwrap();
        let folder = dir.path().join("mods");
        fs::create_dir(&folder).unwrap();
        let (file_arg, folder_arg) = (file.to_str().unwrap(), folder.to_str().unwrap());

        let before = ModePathBlocker::new(Arc::new(NoopProtector));
        before.block_path(file_arg).unwrap();
        before.block_path(folder_arg).unwrap();
        assert_eq!(mode(&file), 0);

        // A fresh instance finds both already at 0 and re-blocks them.
        let protector = Arc::new(RecordingProtector::default());
        let after = ModePathBlocker::new(protector.clone());
        after.block_path(file_arg).unwrap();
        after.unblock_path(file_arg).unwrap();
        assert_eq!(mode(&file), FALLBACK_FILE_MODE);

        // One that never blocked the path still clears it.
        let unaware = ModePathBlocker::new(protector.clone());
        unaware.unblock_path(folder_arg).unwrap();
        assert_eq!(mode(&folder), FALLBACK_DIR_MODE);

        let calls = protector.calls.lock().unwrap();
        assert!(calls.contains(&format!("-{}", folder.display())));
        assert_eq!(
            calls.iter().filter(|c| **c == format!("-{}", file.display())).count(),
            2
        );
    }

    #[test]
    fn unblocking_untouched_path_keeps_its_mode() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("notes");
        fs::write(&file, "x").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o600)).unwrap();
        let protector = Arc::new(RecordingProtector::default());
        let blocker = ModePathBlocker::new(protector.clone());
        blocker.unblock_path(file.to_str().unwrap()).unwrap();
        assert_eq!(mode(&file), 0o600);
        assert_eq!(protector.calls.lock().unwrap().len(), 1);
    }

    fn provider_with(dns: Arc<DnsBlockingServer>, proc_root: PathBuf) -> SystemBlockProvider {
        SystemBlockProvider::new(
            ProcAppBlocker::with_roots(proc_root, Vec::new()),
            ModePathBlocker::new(Arc::new(NoopProtector)),
            IptablesBlocker::with_runners(None, None),
            dns,
        )
    }

    #[tokio::test]
    async fn website_block_fails_while_dns_server_is_down() {
        let dir = tempdir().unwrap();
        let any: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
        let dns = Arc::new(DnsBlockingServer::new(
            vec![any],
            any,
            "127.0.0.1:9".parse().unwrap(),
            Duration::from_millis(100),
        ));
        let provider = provider_with(dns.clone(), dir.path().to_path_buf());

        let err = provider.block_website("example.com").unwrap_err();
        assert!(matches!(err, KeyphyError::Provider(_)), "{err}");
        assert!(!dns.is_blocked("example.com"));

        dns.start().await.unwrap();
        provider.block_website("example.com").unwrap();
        assert!(dns.is_blocked("www.example.com"));
        provider.unblock_all_websites().unwrap();
        assert!(!dns.is_blocked("example.com"));
        dns.stop().await;
    }

    #[test]
    fn path_block_missing_path_fails() {
        let blocker = ModePathBlocker::new(Arc::new(NoopProtector));
        assert!(blocker.block_path("/nonexistent/keyphy/path").is_err());
        blocker.unblock_path("/nonexistent/keyphy/path").unwrap();
    }

    fn fake_iptables(dir: &Path) -> CommandRunner {
        let state = dir.join("rules");
        let body = format!(
            r#"state="{state}"
touch "$state"
rule="$2 $3 $4 $5 $6"
case "$1" in
  -C) grep -qxF "$rule" "$state" ;;
  -A) echo "$rule" >> "$state" ;;
  -D) grep -vxF "$rule" "$state" > "$state.tmp"; mv "$state.tmp" "$state" ;;
esac"#,
            state = state.display()
        );
        CommandRunner::new(script(dir, "iptables", &body), Duration::from_secs(5))
    }

    #[test]
    fn iptables_rules_are_idempotent() {
        let dir = tempdir().unwrap();
        let blocker = IptablesBlocker::with_runners(Some(fake_iptables(dir.path())), None);
        let rules = dir.path().join("rules");

        blocker.block_ip("203.0.113.9").unwrap();
        blocker.block_ip("203.0.113.9").unwrap();
        blocker.block_ip("198.51.100.1").unwrap();
        let body = fs::read_to_string(&rules).unwrap();
        assert_eq!(body.lines().filter(|l| l.contains("203.0.113.9")).count(), 1);
        assert_eq!(body.lines().count(), 2);

        blocker.unblock_ip("203.0.113.9").unwrap();
        assert_eq!(
            fs::read_to_string(&rules).unwrap(),
            "OUTPUT -d 198.51.100.1 -j DROP\n"
        );

        blocker.unblock_all().unwrap();
        assert!(fs::read_to_string(&rules).unwrap().is_empty());
    }

    #[test]
    fn iptables_rejects_bad_input_and_missing_tools() {
        let blocker = IptablesBlocker::with_runners(None, None);
        assert!(matches!(
            blocker.block_ip("not-an-ip"),
            Err(KeyphyError::Provider(_))
        ));
        let err = blocker.block_ip("2001:db8::1").unwrap_err();
        assert!(err.to_string().contains("ip6tables"), "{err}");
    }
}
