//! Battery supervision: emergency charge and the energy report
//!
//! The emergency-charge machine protects a deeply discharged battery. Entry
//! requires the SOC to sit exactly on the start threshold while the battery
//! current is near idle, so a battery passing through the threshold under
//! load does not trip it. While active, charging power is regulated against
//! the utility-meter import estimate so the site never draws more grid power
//! than the configured budget.

use super::{ControlContext, Controller, RegisterWrite};
use crate::config::{BatteryConfig, MeterConfig};
use crate::flags::FlagStore;
use crate::logging::get_logger;
use serde::Serialize;

/// Battery-mode register values
const MODE_CHARGE_ONLY: i16 = 1;
const MODE_NORMAL: i16 = 3;

/// Estimated grid power derived from the exchange sensor. The sensor is
/// symmetric around 5000: below means import, above means export.
pub fn meter_power(sensor: i64, meter: &MeterConfig) -> (f64, f64) {
    let v = sensor as f64;
    if v <= 5000.0 {
        let prelievo = (5000.0 - v) / 5000.0 * meter.prelievo_w;
        (prelievo, 0.0)
    } else {
        let immissione = (v - 5000.0) / 5000.0 * meter.immissione_w;
        (0.0, immissione)
    }
}

/// Missing-energy report published for external planning tools.
#[derive(Debug, Serialize)]
struct EnergyReport {
    ts_iso: String,
    soc_percent: f64,
    energy_stored_kwh: f64,
    energy_missing_kwh: f64,
}

pub struct BatteryController {
    emergency_active: bool,
    /// Last setpoint this controller commanded during the emergency
    emergency_setpoint: i16,
    logger: crate::logging::StructuredLogger,
}

impl BatteryController {
    pub fn new() -> Self {
        Self {
            emergency_active: false,
            emergency_setpoint: 0,
            logger: get_logger("battery"),
        }
    }

    pub fn emergency_active(&self) -> bool {
        self.emergency_active
    }

    fn publish_energy_report(&self, ctx: &ControlContext<'_>, soc_dec: i64) {
        let battery = &ctx.config.battery;
        let soc_percent = soc_dec as f64 / 10.0;
        let stored = battery.capacity_kwh * soc_percent / 100.0;
        let report = EnergyReport {
            ts_iso: ctx.now.format("%Y-%m-%dT%H:%M:%S").to_string(),
            soc_percent,
            energy_stored_kwh: stored,
            energy_missing_kwh: battery.capacity_kwh - stored,
        };
        self.logger.debug(&format!(
            "SOC={:.1}% stored={:.2}kWh missing={:.2}kWh",
            report.soc_percent, report.energy_stored_kwh, report.energy_missing_kwh
        ));
        match serde_json::to_string_pretty(&report) {
            Ok(json) => {
                if let Err(e) = crate::boundary::write_atomic(
                    &ctx.config.paths.energy_report_path(),
                    &json,
                ) {
                    self.logger.warn(&format!("Energy report write failed: {}", e));
                }
            }
            Err(e) => self.logger.warn(&format!("Energy report encode failed: {}", e)),
        }
    }

    fn regulation_step(
        &self,
        battery: &BatteryConfig,
        meter: &MeterConfig,
        sensor: i64,
        ibat: i64,
    ) -> Option<i16> {
        let (p_pre, _p_imm) = meter_power(sensor, meter);
        let cur = self.emergency_setpoint;

        let new = if ibat > battery.ibat_max as i64 {
            // battery current runaway: back off regardless of the meter
            cur.saturating_add(battery.step_emergency_1101)
        } else if p_pre < battery.grid_limit_w - battery.grid_hysteresis_w {
            cur.saturating_sub(battery.step_emergency_1101)
        } else if p_pre > battery.grid_limit_w + battery.grid_hysteresis_w {
            cur.saturating_add(battery.step_emergency_1101)
        } else {
            self.logger
                .debug("Emergency charge: grid import inside the band, holding");
            return None;
        };

        Some(new.clamp(battery.guardrail_1101_min, battery.emergency_1101_max))
    }
}

impl Default for BatteryController {
    fn default() -> Self {
        Self::new()
    }
}

impl Controller for BatteryController {
    fn name(&self) -> &'static str {
        "battery"
    }

    fn tick(&mut self, ctx: &ControlContext<'_>) -> Vec<RegisterWrite> {
        let regs = &ctx.config.registers;
        let battery = &ctx.config.battery;

        let Some(soc) = ctx.snapshot.get(regs.soc) else {
            return Vec::new();
        };
        let ibat = ctx.snapshot.get(regs.battery_current).unwrap_or(0);

        self.publish_energy_report(ctx, soc);

        if ctx.flags.service_active() {
            self.logger
                .debug("Grid service active: emergency charge suspended");
            return Vec::new();
        }

        let mut writes = Vec::new();

        if !self.emergency_active
            && soc == battery.emergency_start_soc_dec as i64
            && (battery.ibat_low_min as i64..=battery.ibat_low_max as i64).contains(&ibat)
        {
            self.logger.warn(&format!(
                "Emergency charge engaged (soc_dec={} ibat={})",
                soc, ibat
            ));
            self.emergency_active = true;
            self.emergency_setpoint = 0;
            ctx.flags.set_self_consumption_enabled(false);
            writes.push(RegisterWrite::new(regs.battery_mode, MODE_CHARGE_ONLY));
        }

        if !self.emergency_active {
            return writes;
        }

        if soc >= battery.emergency_stop_soc_dec as i64 {
            self.logger.info(&format!(
                "Emergency charge released (soc_dec={})",
                soc
            ));
            self.emergency_active = false;
            self.emergency_setpoint = 0;
            ctx.flags.set_self_consumption_enabled(true);
            writes.push(RegisterWrite::new(regs.battery_mode, MODE_NORMAL));
            writes.push(RegisterWrite::new(regs.power_setpoint, 0));
            return writes;
        }

        let sensor = ctx.snapshot.get(regs.grid_sensor).unwrap_or(5000);
        if let Some(new) = self.regulation_step(battery, &ctx.config.meter, sensor, ibat) {
            self.emergency_setpoint = new;
            writes.push(RegisterWrite::new(regs.power_setpoint, new));
        }

        writes
    }

    fn on_shutdown(&mut self, flags: &FlagStore) -> Vec<RegisterWrite> {
        if self.emergency_active {
            self.emergency_active = false;
            flags.set_self_consumption_enabled(true);
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::telemetry::TelemetrySnapshot;

    #[test]
    fn meter_model_is_piecewise_symmetric() {
        let meter = MeterConfig {
            prelievo_w: 3000.0,
            immissione_w: 3000.0,
        };
        assert_eq!(meter_power(5000, &meter), (0.0, 0.0));
        assert_eq!(meter_power(0, &meter), (3000.0, 0.0));
        assert_eq!(meter_power(10000, &meter), (0.0, 3000.0));
        let (pre, imm) = meter_power(2500, &meter);
        assert!((pre - 1500.0).abs() < 1e-9);
        assert_eq!(imm, 0.0);
    }

    struct Rig {
        config: Config,
        flags: crate::flags::FlagStore,
        _dir: tempfile::TempDir,
    }

    impl Rig {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut config = Config::default();
            config.paths.base_dir = dir.path().to_path_buf();
            let flags = crate::flags::FlagStore::new(config.paths.clone());
            Self {
                config,
                flags,
                _dir: dir,
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

    fn snap(soc: i64, ibat: i64, grid: i64) -> TelemetrySnapshot {
        let mut s = TelemetrySnapshot::default();
        s.registers.insert(1040, soc);
        s.registers.insert(1013, ibat);
        s.registers.insert(1090, grid);
        s
    }

    #[test]
    fn emergency_entry_switches_mode_and_charges() {
        let rig = Rig::new();
        let mut ctrl = BatteryController::new();

        // soc exactly on threshold, battery current idle, grid at net zero
        let snapshot = snap(50, 300, 5000);
        let writes = ctrl.tick(&rig.ctx(&snapshot));

        assert!(ctrl.emergency_active());
        assert!(!rig.flags.self_consumption_enabled());
        // mode first, then a negative charge setpoint from the meter branch
        assert_eq!(writes[0], RegisterWrite::new(1102, 1));
        assert_eq!(writes[1], RegisterWrite::new(1101, -50));
        // sidecar mirrored the gate
        let guardrail = std::fs::read_to_string(
            rig.config.paths.guardrail_path(),
        )
        .unwrap();
        assert_eq!(guardrail, "AUTOCONSUMO=0");
    }

    #[test]
    fn entry_requires_exact_threshold_and_idle_current() {
        let rig = Rig::new();
        let mut ctrl = BatteryController::new();

        // passing through the threshold under load: no trip
        let writes = ctrl.tick(&rig.ctx(&snap(50, 2000, 5000)));
        assert!(!ctrl.emergency_active());
        assert!(writes.is_empty());

        // idle current but soc above threshold: no trip
        ctrl.tick(&rig.ctx(&snap(60, 100, 5000)));
        assert!(!ctrl.emergency_active());
    }

    #[test]
    fn emergency_exit_restores_and_zeroes() {
        let rig = Rig::new();
        let mut ctrl = BatteryController::new();
        ctrl.tick(&rig.ctx(&snap(50, 100, 5000)));
        assert!(ctrl.emergency_active());

        let writes = ctrl.tick(&rig.ctx(&snap(400, 3000, 5000)));
        assert!(!ctrl.emergency_active());
        assert!(rig.flags.self_consumption_enabled());
        assert_eq!(
            writes,
            vec![
                RegisterWrite::new(1102, 3),
                RegisterWrite::new(1101, 0),
            ]
        );
    }

    #[test]
    fn regulation_respects_grid_budget() {
        let rig = Rig::new();
        let mut ctrl = BatteryController::new();
        ctrl.tick(&rig.ctx(&snap(50, 100, 5000)));
        assert_eq!(ctrl.emergency_setpoint, -50);

        // heavy import (sensor well below midpoint): back off charging
        // 1090=0 -> P_pre = 3000 W > 2500 + 200
        let writes = ctrl.tick(&rig.ctx(&snap(60, 100, 0)));
        assert_eq!(writes, vec![RegisterWrite::new(1101, 0)]);

        // import inside the band: hold
        // 1090=909 -> P_pre ~ 2455 W, inside 2300..2700
        let writes = ctrl.tick(&rig.ctx(&snap(60, 100, 909)));
        assert!(writes.is_empty());
    }

    #[test]
    fn regulation_clamps_at_guardrail() {
        let mut rig = Rig::new();
        rig.config.battery.guardrail_1101_min = -100;
        let mut ctrl = BatteryController::new();
        ctrl.tick(&rig.ctx(&snap(50, 100, 5000)));

        for _ in 0..10 {
            ctrl.tick(&rig.ctx(&snap(60, 100, 5000)));
        }
        assert_eq!(ctrl.emergency_setpoint, -100);
    }

    #[test]
    fn overcurrent_biases_toward_less_charging() {
        let rig = Rig::new();
        let mut ctrl = BatteryController::new();
        ctrl.tick(&rig.ctx(&snap(50, 100, 5000)));
        ctrl.tick(&rig.ctx(&snap(60, 100, 5000)));
        assert_eq!(ctrl.emergency_setpoint, -100);

        // ibat above the ceiling forces a step toward zero even though the
        // meter still has headroom
        let writes = ctrl.tick(&rig.ctx(&snap(60, 6500, 5000)));
        assert_eq!(writes, vec![RegisterWrite::new(1101, -50)]);
    }

    #[test]
    fn service_active_suspends_emergency() {
        let rig = Rig::new();
        assert!(rig.flags.try_claim_service());
        let mut ctrl = BatteryController::new();
        let writes = ctrl.tick(&rig.ctx(&snap(50, 100, 5000)));
        assert!(writes.is_empty());
        assert!(!ctrl.emergency_active());
    }

    #[test]
    fn energy_report_written_each_tick() {
        let rig = Rig::new();
        let mut ctrl = BatteryController::new();
        ctrl.tick(&rig.ctx(&snap(500, 100, 5000)));

        let text =
            std::fs::read_to_string(rig.config.paths.energy_report_path()).unwrap();
        let report: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(report["soc_percent"], 50.0);
        assert_eq!(report["energy_stored_kwh"], 5.0);
        assert_eq!(report["energy_missing_kwh"], 5.0);
    }
}
