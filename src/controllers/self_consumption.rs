//! Grid-zero regulation and community sharing
//!
//! Holds the grid-exchange sensor near its net-zero midpoint by trimming the
//! power setpoint one step at a time. When the battery is full, sharing is
//! consented and a neighbor is in deficit, the target shifts above net zero
//! so the surplus flows to the neighbor, padded by the low-voltage line-loss
//! factor.

use super::{ControlContext, Controller, RegisterWrite};
use crate::boundary;
use crate::logging::get_logger;

/// Net-zero midpoint of the grid-exchange sensor.
const GRID_SETPOINT: i64 = 5000;

pub struct SelfConsumptionController {
    /// Persistent setpoint; survives across ticks so regulation is a walk,
    /// not a jump
    setpoint: i16,
    logger: crate::logging::StructuredLogger,
}

impl SelfConsumptionController {
    pub fn new(config: &crate::config::Config) -> Self {
        Self {
            setpoint: config.self_consumption.param1101_min,
            logger: get_logger("self_consumption"),
        }
    }

    /// Current setpoint, for observability.
    pub fn setpoint(&self) -> i16 {
        self.setpoint
    }

    /// Override the walk start point (used by tests and warm restarts).
    pub fn set_setpoint(&mut self, value: i16) {
        self.setpoint = value;
    }

    fn read_remote_sensor(&self, ctx: &ControlContext<'_>) -> i64 {
        boundary::read_register_from_file(
            &ctx.config.paths.remote_snapshot_path(),
            ctx.config.registers.grid_sensor,
        )
        .unwrap_or(0)
    }

    /// The five conditions that allow helping a neighbor: no local energy
    /// debt, battery full enough, sharing consented, neighbor actually in
    /// deficit, and ourselves at least near net zero.
    fn community_allowed(
        &self,
        ctx: &ControlContext<'_>,
        local: i64,
        remote: i64,
        soc: i64,
    ) -> bool {
        let sc = &ctx.config.self_consumption;
        !ctx.flags.energy_debt()
            && soc >= sc.soc_threshold_community as i64
            && ctx.flags.sharing_enabled()
            && remote > 0
            && remote < GRID_SETPOINT
            && local >= GRID_SETPOINT - 2 * sc.deadband as i64
    }
}

impl Controller for SelfConsumptionController {
    fn name(&self) -> &'static str {
        "self_consumption"
    }

    fn tick(&mut self, ctx: &ControlContext<'_>) -> Vec<RegisterWrite> {
        if !ctx.flags.self_consumption_enabled() {
            return Vec::new();
        }

        let sc = &ctx.config.self_consumption;
        let Some(local) = ctx.snapshot.get(ctx.config.registers.grid_sensor) else {
            return Vec::new();
        };
        if !(0..=10000).contains(&local) {
            return Vec::new();
        }
        let soc = ctx.snapshot.get(ctx.config.registers.soc).unwrap_or(0);

        let remote = if ctx.flags.sharing_enabled() {
            self.read_remote_sensor(ctx)
        } else {
            0
        };

        let community = self.community_allowed(ctx, local, remote, soc);
        let (target, step) = if community {
            let diff = (GRID_SETPOINT - remote) as f64;
            let target = GRID_SETPOINT as f64 + diff + diff * sc.bt_loss_factor;
            self.logger.debug(&format!(
                "Community mode: remote={} target={:.0}",
                remote, target
            ));
            (target, sc.step_community)
        } else {
            (GRID_SETPOINT as f64, sc.step_local)
        };

        let error = target - local as f64;
        if error.abs() > sc.deadband as f64 {
            if error > 0.0 {
                self.setpoint = self.setpoint.saturating_add(step);
            } else {
                self.setpoint = self.setpoint.saturating_sub(step);
            }
        }
        self.setpoint = self.setpoint.clamp(sc.param1101_min, sc.param1101_max);

        // saturated at full output while still importing: we are short of
        // watts, flag the debt so sharing backs off
        let debt = self.setpoint == sc.param1101_max
            && local < GRID_SETPOINT - sc.deadband as i64;
        ctx.flags.set_energy_debt(debt);

        vec![RegisterWrite::new(
            ctx.config.registers.power_setpoint,
            self.setpoint,
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::flags::FlagStore;
    use crate::telemetry::TelemetrySnapshot;

    fn snapshot_with(grid: i64, soc: i64) -> TelemetrySnapshot {
        let mut snap = TelemetrySnapshot::default();
        snap.registers.insert(1090, grid);
        snap.registers.insert(1040, soc);
        snap
    }

    struct Rig {
        config: Config,
        flags: FlagStore,
    }

    impl Rig {
        fn new(dir: &std::path::Path) -> Self {
            let mut config = Config::default();
            config.paths.base_dir = dir.to_path_buf();
            let flags = FlagStore::new(config.paths.clone());
            Self {
                config,
                flags,
            }
        }

        fn ctx<'a>(&'a self, snapshot: &'a TelemetrySnapshot) -> ControlContext<'a> {
            ControlContext {
                config: &self.config,
                snapshot,
                flags: &self.flags,
                now: chrono::NaiveDateTime::default(),
            }
        }
    }

    #[test]
    fn steps_toward_net_zero_when_importing() {
        let dir = tempfile::tempdir().unwrap();
        let mut rig = Rig::new(dir.path());
        rig.config.self_consumption.deadband = 50;
        rig.config.self_consumption.step_local = 20;

        let mut ctrl = SelfConsumptionController::new(&rig.config);
        ctrl.set_setpoint(1000);

        let snap = snapshot_with(4800, 500);
        let writes = ctrl.tick(&rig.ctx(&snap));
        assert_eq!(writes, vec![RegisterWrite::new(1101, 1020)]);

        for _ in 0..9 {
            ctrl.tick(&rig.ctx(&snap));
        }
        assert_eq!(ctrl.setpoint(), 1200);
    }

    #[test]
    fn deadband_freezes_the_walk() {
        let dir = tempfile::tempdir().unwrap();
        let rig = Rig::new(dir.path());
        let mut ctrl = SelfConsumptionController::new(&rig.config);
        ctrl.set_setpoint(1000);

        let snap = snapshot_with(4980, 500);
        let writes = ctrl.tick(&rig.ctx(&snap));
        // within the deadband the setpoint is re-issued unchanged
        assert_eq!(writes, vec![RegisterWrite::new(1101, 1000)]);
    }

    #[test]
    fn exporting_steps_down() {
        let dir = tempfile::tempdir().unwrap();
        let rig = Rig::new(dir.path());
        let mut ctrl = SelfConsumptionController::new(&rig.config);
        ctrl.set_setpoint(1000);

        let snap = snapshot_with(5200, 500);
        let writes = ctrl.tick(&rig.ctx(&snap));
        assert_eq!(writes, vec![RegisterWrite::new(1101, 995)]);
    }

    #[test]
    fn disabled_gate_returns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let rig = Rig::new(dir.path());
        rig.flags.set_self_consumption_enabled(false);
        let mut ctrl = SelfConsumptionController::new(&rig.config);
        let snap = snapshot_with(4000, 500);
        assert!(ctrl.tick(&rig.ctx(&snap)).is_empty());
    }

    #[test]
    fn out_of_range_sensor_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let rig = Rig::new(dir.path());
        let mut ctrl = SelfConsumptionController::new(&rig.config);
        let snap = snapshot_with(10050, 500);
        assert!(ctrl.tick(&rig.ctx(&snap)).is_empty());
    }

    #[test]
    fn energy_debt_set_at_saturation_and_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let mut rig = Rig::new(dir.path());
        rig.config.self_consumption.param1101_max = 1010;
        rig.config.self_consumption.step_local = 20;
        let mut ctrl = SelfConsumptionController::new(&rig.config);
        ctrl.set_setpoint(1000);

        let snap = snapshot_with(4800, 500);
        ctrl.tick(&rig.ctx(&snap));
        assert_eq!(ctrl.setpoint(), 1010); // clamped at max
        assert!(rig.flags.energy_debt());

        // back near net zero: the debt clears
        let snap = snapshot_with(4990, 500);
        ctrl.tick(&rig.ctx(&snap));
        assert!(!rig.flags.energy_debt());
    }

    fn write_remote(dir: &std::path::Path, value: i64) {
        let text = format!("<rootmain><1090>{}</1090></rootmain>", value);
        std::fs::write(dir.join("FromSnapshot_remote.xml"), text).unwrap();
    }

    #[test]
    fn community_mode_tracks_neighbor_deficit() {
        let dir = tempfile::tempdir().unwrap();
        let mut rig = Rig::new(dir.path());
        rig.config.self_consumption.deadband = 50;
        rig.config.self_consumption.step_community = 5;
        rig.flags.set_sharing_enabled(true);
        write_remote(dir.path(), 4500); // neighbor imports

        let mut ctrl = SelfConsumptionController::new(&rig.config);
        ctrl.set_setpoint(1000);

        // local at net zero, battery full: share
        // diff = 500, target = 5000 + 500 + 50 = 5550 > local -> step up
        let snap = snapshot_with(5000, 960);
        let writes = ctrl.tick(&rig.ctx(&snap));
        assert_eq!(writes, vec![RegisterWrite::new(1101, 1005)]);
    }

    #[test]
    fn community_requires_battery_and_consent() {
        let dir = tempfile::tempdir().unwrap();
        let mut rig = Rig::new(dir.path());
        rig.config.self_consumption.deadband = 50;
        rig.flags.set_sharing_enabled(true);
        write_remote(dir.path(), 4500);

        let mut ctrl = SelfConsumptionController::new(&rig.config);
        ctrl.set_setpoint(1000);

        // battery below the community threshold: local mode. Local sensor at
        // net zero means no movement.
        let snap = snapshot_with(5000, 800);
        let writes = ctrl.tick(&rig.ctx(&snap));
        assert_eq!(writes, vec![RegisterWrite::new(1101, 1000)]);
    }
}
