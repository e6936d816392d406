//! Scoped "remove protection → mutate → restore protection" bracket for files
//! shared with the rest of the host (config file, resolver config, blocked
//! paths).

use crate::command::{CommandRunner, DEFAULT_COMMAND_TIMEOUT};
use crate::error::KeyphyResult;
use log::{debug, warn};
use std::path::{Path, PathBuf};

/// Default locations probed for `chattr`.
pub const DEFAULT_CHATTR_PATHS: &[&str] = &["/usr/bin/chattr", "/bin/chattr", "/sbin/chattr"];

/// Toggles a tamper-deterrent attribute on a resource.
pub trait Protector: Send + Sync {
    fn protect(&self, path: &Path) -> KeyphyResult<()>;
    fn unprotect(&self, path: &Path) -> KeyphyResult<()>;
}

/// Uses the ext-family immutable attribute via `chattr`.
#[derive(Debug, Clone)]
pub struct ChattrProtector {
    runner: Option<CommandRunner>,
}

impl ChattrProtector {
    pub fn discover() -> Self {
        let runner = CommandRunner::discover(DEFAULT_CHATTR_PATHS, DEFAULT_COMMAND_TIMEOUT);
        if runner.is_none() {
            warn!("chattr not found; protected resources fall back to plain permissions");
        }
        Self { runner }
    }

    pub fn with_runner(runner: CommandRunner) -> Self {
        Self {
            runner: Some(runner),
        }
    }

    fn toggle(&self, flag: &str, path: &Path) -> KeyphyResult<()> {
        let Some(runner) = &self.runner else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }
        let target = path.to_string_lossy();
        runner.run_checked(&[flag, target.as_ref()])?;
        Ok(())
    }
}

impl Protector for ChattrProtector {
    fn protect(&self, path: &Path) -> KeyphyResult<()> {
        self.toggle("+i", path)
    }

    fn unprotect(&self, path: &Path) -> KeyphyResult<()> {
        self.toggle("-i", path)
    }
}

/// Protector that does nothing; used when protection is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProtector;

impl Protector for NoopProtector {
    fn protect(&self, _path: &Path) -> KeyphyResult<()> {
        Ok(())
    }

    fn unprotect(&self, _path: &Path) -> KeyphyResult<()> {
        Ok(())
    }
}

/// Re-protects its resource when dropped.
pub struct Unprotected<'a> {
    protector: &'a dyn Protector,
    path: PathBuf,
}

impl<'a> Unprotected<'a> {
    pub fn acquire(protector: &'a dyn Protector, path: &Path) -> KeyphyResult<Self> {
        protector.unprotect(path)?;
        debug!("lifted protection on {}", path.display());
        Ok(Self {
            protector,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for Unprotected<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.protector.protect(&self.path) {
            warn!("failed to restore protection on {}: {err}", self.path.display());
        }
    }
}

/// Run `f` with protection lifted from `path`; protection is restored on every
/// exit path, unwinding included.
pub fn with_unprotected<T, F>(protector: &dyn Protector, path: &Path, f: F) -> KeyphyResult<T>
where
    F: FnOnce() -> KeyphyResult<T>,
{
    let _guard = Unprotected::acquire(protector, path)?;
    f()
}
