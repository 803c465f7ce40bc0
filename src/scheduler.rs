//! Cooperative controller scheduler
//!
//! One task dispatches every control loop from a `(controller, period,
//! next_due)` table on a coarse tick. Controller ticks are synchronous
//! decision steps; the writes they return are delivered through the command
//! inbox one at a time, waiting for the bus to drain each before submitting
//! the next, so a multi-write tick is not collapsed by the latest-wins slot.

use crate::config::{Config, ConfigWatcher};
use crate::controllers::services::{ScheduledService, ServiceKind};
use crate::controllers::{ControlContext, Controller, RegisterWrite};
use crate::flags::FlagStore;
use crate::inbox::CommandInbox;
use crate::logging::get_logger;
use crate::telemetry::TelemetrySnapshot;
use chrono::NaiveDateTime;
use chrono_tz::Tz;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

struct Entry {
    controller: Box<dyn Controller>,
    period: Duration,
    next_due: Instant,
}

pub struct Scheduler {
    config: Arc<Config>,
    config_tx: watch::Sender<Arc<Config>>,
    config_watcher: Option<ConfigWatcher>,
    flags: Arc<FlagStore>,
    inbox: Arc<CommandInbox>,
    snapshot_rx: watch::Receiver<Arc<TelemetrySnapshot>>,
    entries: Vec<Entry>,
    logger: crate::logging::StructuredLogger,
}

impl Scheduler {
    /// Build the dispatch table and activate today's scheduled service, if
    /// any. Activation walks the services in a fixed order; the first
    /// eligible one claims the shared slot.
    pub fn new(
        config: Arc<Config>,
        config_tx: watch::Sender<Arc<Config>>,
        config_path: Option<PathBuf>,
        flags: Arc<FlagStore>,
        inbox: Arc<CommandInbox>,
        snapshot_rx: watch::Receiver<Arc<TelemetrySnapshot>>,
    ) -> Self {
        let logger = get_logger("scheduler");
        let now = Instant::now();
        let periods = &config.scheduler;

        let mut entries = vec![
            Entry {
                controller: Box::new(
                    crate::controllers::self_consumption::SelfConsumptionController::new(&config),
                ) as Box<dyn Controller>,
                period: Duration::from_millis(periods.self_consumption_period_ms),
                next_due: now,
            },
            Entry {
                controller: Box::new(crate::controllers::battery::BatteryController::new()),
                period: Duration::from_millis(periods.battery_period_ms),
                next_due: now,
            },
            Entry {
                controller: Box::new(crate::controllers::watchdog::MachineResetWatchdog::new()),
                period: Duration::from_millis(periods.watchdog_period_ms),
                next_due: now,
            },
        ];

        let local_now = local_now(&config);
        for kind in ServiceKind::ALL {
            if let Some(service) = ScheduledService::try_activate(kind, &config, &flags, local_now)
            {
                logger.info(&format!("Scheduled service active: {}", kind.config_name()));
                entries.push(Entry {
                    controller: Box::new(service),
                    period: Duration::from_millis(periods.service_period_ms),
                    next_due: now,
                });
            }
        }

        Self {
            config,
            config_tx,
            config_watcher: config_path.map(ConfigWatcher::new),
            flags,
            inbox,
            snapshot_rx,
            entries,
            logger,
        }
    }

    /// Dispatch loop; returns after the shutdown flag flips and the final
    /// restorative writes are delivered.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.logger.info(&format!(
            "Scheduler running with {} controllers",
            self.entries.len()
        ));

        let tick = Duration::from_millis(self.config.scheduler.tick_ms.max(10));
        let mut config_check_at = Instant::now();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }

            let now_inst = Instant::now();
            if now_inst >= config_check_at {
                self.check_config_reload();
                config_check_at =
                    now_inst + Duration::from_millis(self.config.scheduler.config_check_ms.max(100));
            }

            let snapshot = self.snapshot_rx.borrow().clone();
            let now_local = local_now(&self.config);

            for i in 0..self.entries.len() {
                if self.entries[i].next_due > now_inst {
                    continue;
                }
                let config = self.config.clone();
                let flags = self.flags.clone();
                let writes = {
                    let ctx = ControlContext {
                        config: config.as_ref(),
                        snapshot: snapshot.as_ref(),
                        flags: flags.as_ref(),
                        now: now_local,
                    };
                    self.entries[i].controller.tick(&ctx)
                };
                let period = self.entries[i].period;
                self.entries[i].next_due = now_inst + period;
                self.deliver(&writes).await;
            }
        }

        self.shutdown_sequence().await;
    }

    /// Submit writes one at a time, waiting for the bus to drain each before
    /// the next so none is lost to the latest-wins slot. If the bus stalls,
    /// the bounded wait expires and the newest write wins.
    async fn deliver(&mut self, writes: &[RegisterWrite]) {
        for w in writes {
            self.inbox.submit_write(w.register, w.value);
            let budget = Duration::from_millis((2 * self.config.bus.poll_ms).clamp(200, 3000));
            let deadline = Instant::now() + budget;
            while self.inbox.has_pending() && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }

    fn check_config_reload(&mut self) {
        let Some(watcher) = self.config_watcher.as_mut() else {
            return;
        };
        let Some(new_config) = watcher.poll() else {
            return;
        };
        if let Err(e) = new_config.validate() {
            self.logger
                .warn(&format!("Reloaded config rejected: {}", e));
            return;
        }

        self.logger.info("Configuration reloaded");
        let new_config = Arc::new(new_config);
        self.config = new_config.clone();
        let _ = self.config_tx.send(new_config.clone());

        // refresh dispatch periods; running controllers keep their state
        let periods = &new_config.scheduler;
        let new_periods = [
            Duration::from_millis(periods.self_consumption_period_ms),
            Duration::from_millis(periods.battery_period_ms),
            Duration::from_millis(periods.watchdog_period_ms),
        ];
        for (entry, period) in self.entries.iter_mut().zip(new_periods) {
            entry.period = period;
        }
        for entry in self.entries.iter_mut().skip(new_periods.len()) {
            entry.period = Duration::from_millis(periods.service_period_ms);
        }

        self.flags.update_paths(new_config.paths.clone());
        self.flags.seed_sharing_from_file();
        self.flags.mirror_all();
    }

    /// Give every controller its completion writes, then flush the mirrors.
    async fn shutdown_sequence(&mut self) {
        self.logger.info("Scheduler shutting down");
        for i in 0..self.entries.len() {
            let writes = self.entries[i].controller.on_shutdown(&self.flags);
            if !writes.is_empty() {
                self.logger.info(&format!(
                    "Restoring inverter state for {}",
                    self.entries[i].controller.name()
                ));
            }
            self.deliver(&writes).await;
        }
        self.flags.mirror_all();
        self.logger.info("Scheduler stopped");
    }
}

/// Wall-clock time in the configured timezone.
fn local_now(config: &Config) -> NaiveDateTime {
    let tz: Tz = config.timezone.parse().unwrap_or(chrono_tz::UTC);
    chrono::Utc::now().with_timezone(&tz).naive_local()
}
