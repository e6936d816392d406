//! Spawns host tools (`chattr`, `resolvectl`, `iptables`, ...) with a
//! timeout and captures their output. Everything that touches the host shell
//! goes through here.

use crate::error::{KeyphyError, KeyphyResult};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Default timeout applied to host tool invocations.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
/// Wraps a concrete binary path and the timeout used when running it.
pub struct CommandRunner {
    path: PathBuf,
    timeout: Duration,
}

#[derive(Debug)]
/// Collects stdout, stderr, and exit status from a finished command.
pub struct Output {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl Output {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Stderr when present, otherwise stdout; used for error messages.
    pub fn diagnostic(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

impl CommandRunner {
    pub fn new(path: PathBuf, timeout: Duration) -> Self {
        Self { path, timeout }
    }

    /// Locate the first existing candidate path.
    pub fn discover(candidates: &[&str], timeout: Duration) -> Option<Self> {
        candidates
            .iter()
            .map(Path::new)
            .find(|p| p.exists())
            .map(|p| Self::new(p.to_path_buf(), timeout))
    }

    pub fn binary(&self) -> &Path {
        &self.path
    }

    /// Execute the binary with arguments and capture the result.
    pub fn run(&self, args: &[&str]) -> KeyphyResult<Output> {
        let mut command = Command::new(&self.path);
        command.args(args);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command.spawn()?;
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        self.wait_with_timeout(child, stdout_pipe, stderr_pipe)
    }

    /// Run and turn a non-zero exit into a provider error.
    pub fn run_checked(&self, args: &[&str]) -> KeyphyResult<Output> {
        let out = self.run(args)?;
        if !out.success() {
            return Err(KeyphyError::Provider(format!(
                "{} {} exited with code {}: {}",
                self.path.display(),
                args.join(" "),
                out.status,
                if out.diagnostic().is_empty() {
                    "no additional output"
                } else {
                    out.diagnostic()
                }
            )));
        }
        Ok(out)
    }

    fn wait_with_timeout(
        &self,
        mut child: Child,
        stdout_pipe: Option<ChildStdout>,
        stderr_pipe: Option<ChildStderr>,
    ) -> KeyphyResult<Output> {
        let start = Instant::now();
        let stdout_handle = Self::spawn_output_reader(stdout_pipe);
        let stderr_handle = Self::spawn_output_reader(stderr_pipe);
        let mut exit_status = None;

        while start.elapsed() <= self.timeout {
            if let Some(status) = child.try_wait()? {
                exit_status = Some(status);
                break;
            }
            thread::sleep(Duration::from_millis(25));
        }

        let status = match exit_status {
            Some(status) => status.code().unwrap_or(-1),
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(KeyphyError::Provider(format!(
                    "{} timed out after {:?}",
                    self.path.display(),
                    self.timeout
                )));
            }
        };

        let stdout = stdout_handle
            .join()
            .map_err(|_| KeyphyError::Provider("stdout reader thread panicked".into()))??;
        let stderr = stderr_handle
            .join()
            .map_err(|_| KeyphyError::Provider("stderr reader thread panicked".into()))??;

        Ok(Output {
            stdout,
            stderr,
            status,
        })
    }

    fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<KeyphyResult<String>>
    where
        R: Read + Send + 'static,
    {
        thread::spawn(move || -> KeyphyResult<String> {
            if let Some(mut reader) = pipe {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf)?;
                Ok(String::from_utf8_lossy(&buf).to_string())
            } else {
                Ok(String::new())
            }
        })
    }
}
