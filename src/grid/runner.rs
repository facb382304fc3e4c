//! Event loop: market ticks, heartbeat reconciliation, config reloads
//!
//! Single-threaded cooperative scheduling per symbol process. Reconciliations
//! are serialized: the loop owns the reconciler and a new event waits for the
//! current tick to finish. On shutdown the loop persists state and exits
//! without cancelling venue orders; resting orders survive restarts.

use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};

use crate::config::ConfigWatcher;
use crate::grid::errors::{GridError, GridResult};
use crate::grid::executor::VenueExecutor;
use crate::grid::reconciler::Reconciler;
use crate::grid::types::KlineClose;

/// Loop cadence knobs
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Forced reconciliation period, catches silent fills
    pub heartbeat_secs: u64,
    /// Parameter file re-read period
    pub config_reload_secs: u64,
    /// Bound on the shutdown sequence
    pub shutdown_grace_secs: u64,
    /// Consecutive failed ticks before the loop gives up
    pub max_consecutive_errors: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 30,
            config_reload_secs: 60,
            shutdown_grace_secs: 10,
            max_consecutive_errors: 10,
        }
    }
}

pub struct GridRunner<E: VenueExecutor> {
    reconciler: Reconciler<E>,
    watcher: ConfigWatcher,
    runner_config: RunnerConfig,
}

impl<E: VenueExecutor> GridRunner<E> {
    pub fn new(
        reconciler: Reconciler<E>,
        watcher: ConfigWatcher,
        runner_config: RunnerConfig,
    ) -> Self {
        Self {
            reconciler,
            watcher,
            runner_config,
        }
    }

    pub fn reconciler(&self) -> &Reconciler<E> {
        &self.reconciler
    }

    /// Pump events until the kline stream dies or shutdown is signalled.
    ///
    /// `klines` carries closed 1-minute bars; `shutdown` flips to `true` on
    /// SIGTERM/ctrl-c.
    pub async fn run(
        &mut self,
        mut klines: mpsc::Receiver<KlineClose>,
        mut shutdown: watch::Receiver<bool>,
    ) -> GridResult<()> {
        let params = self.watcher.snapshot();
        self.reconciler.prepare_venue(&params).await?;

        let mut heartbeat = interval(Duration::from_secs(self.runner_config.heartbeat_secs));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reload = interval(Duration::from_secs(self.runner_config.config_reload_secs));
        reload.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first interval fire is immediate; the startup reconcile comes
        // from the heartbeat arm
        let mut consecutive_errors = 0u32;

        loop {
            tokio::select! {
                maybe_bar = klines.recv() => {
                    match maybe_bar {
                        Some(bar) => {
                            let params = self.watcher.snapshot();
                            match self.reconciler.on_kline_close(&params, &bar).await {
                                Ok(()) => consecutive_errors = 0,
                                Err(e) => {
                                    consecutive_errors += 1;
                                    self.note_tick_error(e, consecutive_errors)?;
                                }
                            }
                        }
                        None => {
                            return Err(GridError::WebSocket(
                                "kline stream closed".into(),
                            ));
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    let params = self.watcher.snapshot();
                    match self.reconciler.heartbeat(&params).await {
                        Ok(()) => consecutive_errors = 0,
                        Err(e) => {
                            consecutive_errors += 1;
                            self.note_tick_error(e, consecutive_errors)?;
                        }
                    }
                }
                _ = reload.tick() => {
                    if self.watcher.reload() {
                        info!("config snapshot refreshed");
                    }
                }
                changed = shutdown.changed() => {
                    let stop = changed.is_err() || *shutdown.borrow();
                    if stop {
                        info!("shutdown signal received");
                        break;
                    }
                }
            }
        }

        self.shutdown().await
    }

    fn note_tick_error(&self, e: GridError, consecutive: u32) -> GridResult<()> {
        if matches!(e, GridError::StateCorrupt(_)) {
            return Err(e);
        }
        error!("reconciliation failed ({consecutive} consecutive): {e}");
        if consecutive >= self.runner_config.max_consecutive_errors {
            return Err(GridError::WebSocket(format!(
                "{consecutive} consecutive failed ticks, giving up"
            )));
        }
        Ok(())
    }

    /// Persist and exit. Resting venue orders are deliberately kept.
    async fn shutdown(&mut self) -> GridResult<()> {
        let grace = Duration::from_secs(self.runner_config.shutdown_grace_secs);
        match tokio::time::timeout(grace, async { self.reconciler.persist() }).await {
            Ok(result) => result?,
            Err(_) => warn!("shutdown persistence exceeded the grace period"),
        }
        info!("engine stopped; resting orders left at the venue");
        Ok(())
    }
}
