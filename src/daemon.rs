use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clock;
use crate::config::Config;
use crate::monitor::Monitor;
use crate::packages::UidMap;
use crate::puller::manager::{AlarmScheduler, PullerManager};

/// How often cooled-down puller caches are swept.
const PULLER_CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Pull-alarm implementation backed by a tokio timer task. The host
/// variant programs a companion service instead; the manager only
/// sees the [`AlarmScheduler`] trait either way.
pub struct TokioAlarmScheduler {
    tx: mpsc::UnboundedSender<i64>,
}

impl AlarmScheduler for TokioAlarmScheduler {
    fn set_pulling_alarm(&self, elapsed_millis: i64) {
        // Reprogramming replaces any earlier deadline.
        let _ = self.tx.send(elapsed_millis);
    }
}

impl TokioAlarmScheduler {
    /// Spawns the timer task. The manager is held weakly so the
    /// scheduler never keeps it alive.
    pub fn start(manager: Weak<PullerManager>, cancel: CancellationToken) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<i64>();

        tokio::spawn(async move {
            let mut deadline_millis: Option<i64> = None;
            loop {
                let sleep_for = match deadline_millis {
                    Some(deadline) => {
                        let now_millis = clock::ns_to_millis(clock::elapsed_realtime_ns());
                        Duration::from_millis((deadline - now_millis).max(0) as u64)
                    }
                    // Parked until a deadline arrives.
                    None => Duration::from_secs(3600),
                };

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    programmed = rx.recv() => match programmed {
                        Some(millis) => {
                            debug!(millis, "pull alarm programmed");
                            deadline_millis = Some(millis);
                        }
                        None => break,
                    },
                    _ = tokio::time::sleep(sleep_for), if deadline_millis.is_some() => {
                        deadline_millis = None;
                        let Some(manager) = manager.upgrade() else {
                            break;
                        };
                        manager.on_alarm_fired(clock::elapsed_realtime_ns());
                    }
                }
            }
            debug!("pull alarm task stopped");
        });

        Arc::new(Self { tx })
    }
}

/// Wires the engine's subsystems together and owns their lifecycle.
pub struct Daemon {
    cfg: Config,
    monitor: Arc<Monitor>,
    uid_map: Arc<UidMap>,
    puller_manager: Arc<PullerManager>,
    shard_offset: u32,
    cancel: CancellationToken,
}

impl Daemon {
    pub fn new(cfg: Config) -> Result<Self> {
        let monitor =
            Arc::new(Monitor::new(&cfg.monitor.addr).context("creating self-monitor")?);
        let uid_map = Arc::new(UidMap::new(&cfg.uid_map, monitor.clone()));
        let puller_manager = Arc::new(PullerManager::new(&cfg.puller, monitor.clone()));

        // A boot-stable offset keeps sampled metrics on consistent
        // shards for the daemon's lifetime.
        let shard_offset = cfg
            .shard_offset
            .unwrap_or_else(|| (clock::wall_clock_ns() % i64::from(u32::MAX)) as u32);

        Ok(Self {
            cfg,
            monitor,
            uid_map,
            puller_manager,
            shard_offset,
            cancel: CancellationToken::new(),
        })
    }

    pub async fn start(&self) -> Result<()> {
        self.monitor
            .start()
            .await
            .context("starting self-monitor server")?;

        let scheduler =
            TokioAlarmScheduler::start(Arc::downgrade(&self.puller_manager), self.cancel.clone());
        self.puller_manager.set_alarm_scheduler(scheduler);

        // Sweep cooled-down puller caches so stale batches don't sit
        // in memory between scheduled pulls.
        let puller_manager = Arc::downgrade(&self.puller_manager);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PULLER_CACHE_SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = puller_manager.upgrade() else {
                            break;
                        };
                        let cleared =
                            manager.clear_puller_cache_if_necessary(clock::elapsed_realtime_ns());
                        if cleared > 0 {
                            debug!(cleared, "puller caches swept");
                        }
                    }
                }
            }
        });

        info!(
            monitor_addr = %self.cfg.monitor.addr,
            shard_offset = self.shard_offset,
            "daemon started"
        );
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        self.monitor.stop().await?;
        info!("daemon stopped");
        Ok(())
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    pub fn uid_map(&self) -> &Arc<UidMap> {
        &self.uid_map
    }

    pub fn puller_manager(&self) -> &Arc<PullerManager> {
        &self.puller_manager
    }

    pub fn shard_offset(&self) -> u32 {
        self.shard_offset
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_alarm_scheduler_fires_manager() {
        let cfg = Config::default();
        let monitor = Monitor::detached();
        let manager = Arc::new(PullerManager::new(&cfg.puller, monitor));

        let cancel = CancellationToken::new();
        let scheduler = TokioAlarmScheduler::start(Arc::downgrade(&manager), cancel.clone());
        manager.set_alarm_scheduler(scheduler.clone());

        // Program a deadline that is already due.
        scheduler.set_pulling_alarm(0);
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        // No receivers registered: firing is a no-op but must not hang
        // or panic, and must leave no alarm pending.
        assert_eq!(manager.next_pull_time_ns(), i64::MAX);
    }

    #[tokio::test]
    async fn test_daemon_constructs_with_defaults() {
        let daemon = Daemon::new(Config::default()).expect("daemon");
        assert!(daemon.puller_manager().has_puller(
            crate::DAEMON_UID,
            crate::puller::BUILD_INFO_TAG
        ));
        // Offset is derived when the config leaves it unset.
        let _ = daemon.shard_offset();
    }
}
