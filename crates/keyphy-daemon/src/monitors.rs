//! Ticker loops driving the daemon between commands.

use crate::daemon::Daemon;
use keyphy_core::config::DaemonCfg;
use keyphy_core::provider::BlockProvider;
use log::debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

type NamedHandle = (&'static str, JoinHandle<()>);

/// Monitors of one daemon run, cancelled together.
pub struct MonitorSet {
    shutdown: watch::Sender<bool>,
    handles: Vec<NamedHandle>,
}

impl MonitorSet {
    pub fn new(shutdown: watch::Sender<bool>, handles: Vec<NamedHandle>) -> Self {
        Self { shutdown, handles }
    }

    /// Cancellation signal shared by every monitor of this set.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn push(&mut self, name: &'static str, handle: JoinHandle<()>) {
        self.handles.push((name, handle));
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.handles.iter().map(|(name, _)| *name).collect()
    }

    /// Name of the first monitor that is no longer running.
    pub fn finished(&self) -> Option<&'static str> {
        self.handles
            .iter()
            .find(|(_, handle)| handle.is_finished())
            .map(|(name, _)| *name)
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for (name, handle) in self.handles {
            if let Err(err) = handle.await {
                debug!("{name} monitor ended abnormally: {err}");
            }
        }
    }
}

fn period(secs: u64) -> Duration {
    Duration::from_secs(secs.max(1))
}

/// Run `tick` every `period` until `shutdown` flips or its sender goes away.
pub fn spawn_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => tick().await,
            }
        }
        debug!("{name} monitor stopped");
    })
}

pub fn spawn_monitors<P: BlockProvider + 'static>(
    daemon: &Arc<Daemon<P>>,
    cfg: &DaemonCfg,
    shutdown: watch::Receiver<bool>,
) -> Vec<NamedHandle> {
    let d = daemon.clone();
    let device = spawn_loop("device", period(cfg.device_interval_secs), shutdown.clone(), move || {
        let d = d.clone();
        async move { d.device_tick().await }
    });

    let d = daemon.clone();
    let process = spawn_loop("process", period(cfg.process_interval_secs), shutdown.clone(), move || {
        let d = d.clone();
        async move { d.process_tick().await }
    });

    let d = daemon.clone();
    let config = spawn_loop("config", period(cfg.config_interval_secs), shutdown.clone(), move || {
        let d = d.clone();
        async move { d.config_tick().await }
    });

    let d = daemon.clone();
    let integrity = spawn_loop("integrity", period(cfg.integrity_interval_secs), shutdown.clone(), move || {
        let d = d.clone();
        async move {
            d.integrity_tick().await;
        }
    });

    let d = daemon.clone();
    let activity = spawn_loop("activity", period(cfg.activity_interval_secs), shutdown, move || {
        let d = d.clone();
        async move { d.activity_tick().await }
    });

    vec![
        ("device", device),
        ("process", process),
        ("config", config),
        ("integrity", integrity),
        ("activity", activity),
    ]
}

/// Watchdog loop; lives for the whole process, across daemon restarts.
pub fn spawn_supervisor<P: BlockProvider + 'static>(
    daemon: Arc<Daemon<P>>,
    every: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    spawn_loop("supervisor", every, shutdown, move || {
        let d = daemon.clone();
        async move {
            d.supervise_tick().await;
        }
    })
}
