//! `/proc` readers: process table for the app blocker and CPU/memory samples
//! for the activity monitor.

use keyphy_core::error::KeyphyResult;
use keyphy_core::provider::{ProcessInfo, SystemProbe, SystemSample};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

pub const DEFAULT_PROC_ROOT: &str = "/proc";

/// One row of the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcEntry {
    pub pid: u32,
    /// Kernel `comm`, truncated by the kernel to 15 bytes.
    pub comm: String,
    pub exe: Option<PathBuf>,
    pub argv0: Option<String>,
}

/// Walk `<root>/<pid>` directories. Processes that exit mid-scan are skipped.
pub fn scan_processes(root: &Path) -> KeyphyResult<Vec<ProcEntry>> {
    let mut entries = Vec::new();
    for dir in fs::read_dir(root)?.flatten() {
        let Some(pid) = dir.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let base = dir.path();
        let Ok(comm) = fs::read_to_string(base.join("comm")) else {
            continue;
        };
        let argv0 = fs::read(base.join("cmdline")).ok().and_then(|raw| {
            raw.split(|b| *b == 0)
                .find(|arg| !arg.is_empty())
                .map(|arg| String::from_utf8_lossy(arg).into_owned())
        });
        entries.push(ProcEntry {
            pid,
            comm: comm.trim_end_matches('\n').to_string(),
            exe: fs::read_link(base.join("exe")).ok(),
            argv0,
        });
    }
    entries.sort_by_key(|entry| entry.pid);
    Ok(entries)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

/// Aggregate `cpu` line of `/proc/stat`. Idle includes iowait.
fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|line| line.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .map(|field| field.parse().ok())
        .collect::<Option<_>>()?;
    if fields.len() < 4 {
        return None;
    }
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        idle,
        total: fields.iter().sum(),
    })
}

fn cpu_percent(prev: CpuTimes, cur: CpuTimes) -> Option<f64> {
    let total = cur.total.checked_sub(prev.total)?;
    let idle = cur.idle.checked_sub(prev.idle)?;
    if total == 0 {
        return None;
    }
    Some(100.0 * total.saturating_sub(idle) as f64 / total as f64)
}

/// Used memory as a percentage of `MemTotal`, based on `MemAvailable`.
fn parse_memory_percent(meminfo: &str) -> Option<f64> {
    let field = |name: &str| {
        meminfo
            .lines()
            .find_map(|line| line.strip_prefix(name))
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|value| value.parse::<u64>().ok())
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total == 0 {
        return None;
    }
    Some(100.0 * total.saturating_sub(available) as f64 / total as f64)
}

/// [`SystemProbe`] over procfs. CPU usage is the delta since the previous
/// sample, so the first sample reports none.
pub struct ProcfsProbe {
    root: PathBuf,
    last_cpu: Mutex<Option<CpuTimes>>,
}

impl Default for ProcfsProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcfsProbe {
    pub fn new() -> Self {
        Self::with_root(PathBuf::from(DEFAULT_PROC_ROOT))
    }

    pub fn with_root(root: PathBuf) -> Self {
        Self {
            root,
            last_cpu: Mutex::new(None),
        }
    }

    fn sample_cpu(&self) -> Option<f64> {
        let stat = fs::read_to_string(self.root.join("stat")).ok()?;
        let current = parse_cpu_times(&stat)?;
        let mut last = self.last_cpu.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = last.replace(current)?;
        cpu_percent(previous, current)
    }
}

impl SystemProbe for ProcfsProbe {
    fn sample(&self) -> KeyphyResult<SystemSample> {
        let memory_percent = fs::read_to_string(self.root.join("meminfo"))
            .ok()
            .and_then(|meminfo| parse_memory_percent(&meminfo));
        let processes = scan_processes(&self.root)?
            .into_iter()
            .map(|entry| ProcessInfo {
                pid: entry.pid,
                name: entry.comm,
            })
            .collect();
        Ok(SystemSample {
            cpu_percent: self.sample_cpu(),
            memory_percent,
            processes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fake_process(root: &Path, pid: u32, comm: &str, cmdline: &[u8]) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("comm"), format!("{comm}\n")).unwrap();
        fs::write(dir.join("cmdline"), cmdline).unwrap();
    }

    #[test]
    fn scan_reads_comm_and_argv0() {
        let dir = tempdir().unwrap();
        fake_process(dir.path(), 42, "steam", b"/usr/bin/steam\0-silent\0");
        fake_process(dir.path(), 7, "kworker/0:1", b"");
        fs::create_dir_all(dir.path().join("self")).unwrap();
        fs::create_dir_all(dir.path().join("99")).unwrap();

        let entries = scan_processes(dir.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].pid, 7);
        assert_eq!(entries[0].argv0, None);
        assert_eq!(entries[1].comm, "steam");
        assert_eq!(entries[1].argv0.as_deref(), Some("/usr/bin/steam"));
        assert_eq!(entries[1].exe, None);
    }

    #[test]
    fn cpu_usage_from_stat_deltas() {
        let first = parse_cpu_times("cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 1 2 3 4\n").unwrap();
        let second = parse_cpu_times("cpu  200 0 200 1400 200 0 0 0 0 0\n").unwrap();
        assert_eq!(first, CpuTimes { idle: 800, total: 1000 });
        let usage = cpu_percent(first, second).unwrap();
        assert!((usage - 20.0).abs() < 1e-9, "{usage}");
        assert_eq!(cpu_percent(second, second), None);
        assert_eq!(parse_cpu_times("intr 1 2 3\n"), None);
    }

    #[test]
    fn memory_usage_from_meminfo() {
        let meminfo = "MemTotal:       1000 kB\nMemFree:         100 kB\nMemAvailable:    250 kB\n";
        let used = parse_memory_percent(meminfo).unwrap();
        assert!((used - 75.0).abs() < 1e-9);
        assert_eq!(parse_memory_percent("MemTotal: 10 kB\n"), None);
    }

    #[test]
    fn probe_samples_fake_root() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("stat"), "cpu  10 0 10 80 0 0 0 0\n").unwrap();
        fs::write(
            dir.path().join("meminfo"),
            "MemTotal: 100 kB\nMemAvailable: 5 kB\n",
        )
        .unwrap();
        fake_process(dir.path(), 1, "init", b"/sbin/init\0");

        let probe = ProcfsProbe::with_root(dir.path().to_path_buf());
        let first = probe.sample().unwrap();
        assert_eq!(first.cpu_percent, None);
        assert!(first.memory_percent.unwrap() > 90.0);
        assert_eq!(first.processes, vec![ProcessInfo { pid: 1, name: "init".into() }]);

        fs::write(dir.path().join("stat"), "cpu  60 0 60 80 0 0 0 0\n").unwrap();
        let second = probe.sample().unwrap();
        assert_eq!(second.cpu_percent, Some(100.0));
    }
}
