//! The authenticated command channel: OS signals become [`Command`]s, and a
//! dispatcher runs each one through [`Daemon::execute`].

use crate::daemon::Daemon;
use keyphy_core::error::{KeyphyError, KeyphyResult};
use keyphy_core::provider::BlockProvider;
use log::{debug, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Lock,
    Unlock,
    Stop,
}

impl Command {
    /// Signal a control client sends to the daemon for this command.
    pub fn signal(self) -> Signal {
        match self {
            Command::Lock => Signal::SIGUSR2,
            Command::Unlock => Signal::SIGUSR1,
            Command::Stop => Signal::SIGTERM,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Command::Lock => "lock",
            Command::Unlock => "unlock",
            Command::Stop => "stop",
        })
    }
}

/// Forward SIGUSR1/SIGUSR2/SIGTERM/SIGINT as unlock/lock/stop until shutdown.
pub fn spawn_signal_listener(
    tx: mpsc::Sender<Command>,
    mut shutdown: watch::Receiver<bool>,
) -> KeyphyResult<JoinHandle<()>> {
    let mut usr1 = signal(SignalKind::user_defined1())?;
    let mut usr2 = signal(SignalKind::user_defined2())?;
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;

    Ok(tokio::spawn(async move {
        loop {
            let command = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = usr1.recv() => Command::Unlock,
                _ = usr2.recv() => Command::Lock,
                _ = term.recv() => Command::Stop,
                _ = int.recv() => Command::Stop,
            };
            debug!("signal received: {command}");
            if tx.send(command).await.is_err() {
                break;
            }
        }
        debug!("signal listener stopped");
    }))
}

/// Execute commands in arrival order. An honoured stop flips `exit`.
pub fn spawn_dispatcher<P: BlockProvider + 'static>(
    daemon: Arc<Daemon<P>>,
    mut rx: mpsc::Receiver<Command>,
    mut shutdown: watch::Receiver<bool>,
    exit: watch::Sender<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let command = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                received = rx.recv() => match received {
                    Some(command) => command,
                    None => break,
                },
            };
            match daemon.execute(command).await {
                Ok(()) if command == Command::Stop => {
                    info!("stop command honoured; exiting");
                    let _ = exit.send(true);
                    break;
                }
                Ok(()) => {}
                Err(err) => warn!("{err}"),
            }
        }
        debug!("command dispatcher stopped");
    })
}

/// PID file of the running daemon; removed again on drop.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(path: &Path) -> KeyphyResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, format!("{}\n", process::id()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            debug!("failed to remove pid file {}: {err}", self.path.display());
        }
    }
}

pub fn read_pid(path: &Path) -> KeyphyResult<Pid> {
    let raw = fs::read_to_string(path)?;
    let pid: i32 = raw.trim().parse().map_err(|_| {
        KeyphyError::Provider(format!("pid file {} is malformed", path.display()))
    })?;
    if pid <= 0 {
        return Err(KeyphyError::Provider(format!(
            "pid file {} holds invalid pid {pid}",
            path.display()
        )));
    }
    Ok(Pid::from_raw(pid))
}

/// Whether the process named by the pid file is alive.
pub fn daemon_alive(pid_file: &Path) -> bool {
    read_pid(pid_file).is_ok_and(|pid| kill(pid, None).is_ok())
}

/// Deliver `command` to the daemon named by the pid file.
pub fn send_command(pid_file: &Path, command: Command) -> KeyphyResult<Pid> {
    let pid = read_pid(pid_file)?;
    kill(pid, command.signal()).map_err(|err| {
        KeyphyError::Provider(format!("failed to signal daemon {pid}: {err}"))
    })?;
    Ok(pid)
}
