use helion::config::Config;
use helion::controllers::battery::BatteryController;
use helion::controllers::{ControlContext, Controller, RegisterWrite};
use helion::flags::FlagStore;
use helion::telemetry::TelemetrySnapshot;

struct Site {
    config: Config,
    flags: FlagStore,
    _dir: tempfile::TempDir,
}

fn site() -> Site {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.paths.base_dir = dir.path().to_path_buf();
    let flags = FlagStore::new(config.paths.clone());
    Site {
        config,
        flags,
        _dir: dir,
    }
}

fn ctx<'a>(site: &'a Site, snapshot: &'a TelemetrySnapshot) -> ControlContext<'a> {
    ControlContext {
        config: &site.config,
        snapshot,
        flags: &site.flags,
        now: chrono::NaiveDateTime::default(),
    }
}

fn snapshot(soc: i64, ibat: i64, grid: i64) -> TelemetrySnapshot {
    let mut snap = TelemetrySnapshot::default();
    snap.registers.insert(1040, soc);
    snap.registers.insert(1013, ibat);
    snap.registers.insert(1090, grid);
    snap
}

#[test]
fn emergency_entry_same_tick_actuation() {
    let site = site();
    let mut ctrl = BatteryController::new();

    let snap = snapshot(50, 300, 5000);
    let writes = ctrl.tick(&ctx(&site, &snap));

    // charge-only mode, then a negative setpoint from the meter branch, all
    // from one tick
    assert_eq!(writes[0], RegisterWrite::new(1102, 1));
    assert!(writes[1].register == 1101 && writes[1].value < 0);

    // the gate drops and the sidecar shows it
    assert!(!site.flags.self_consumption_enabled());
    let guardrail =
        std::fs::read_to_string(site.config.paths.guardrail_path()).unwrap();
    assert_eq!(guardrail, "AUTOCONSUMO=0");
}

#[test]
fn self_consumption_stays_disabled_until_exit() {
    let site = site();
    let mut ctrl = BatteryController::new();

    ctrl.tick(&ctx(&site, &snapshot(50, 300, 5000)));
    assert!(ctrl.emergency_active());

    // charging along, still disabled
    for soc in [80, 150, 250, 390] {
        ctrl.tick(&ctx(&site, &snapshot(soc, 2000, 4500)));
        assert!(!site.flags.self_consumption_enabled());
        assert!(ctrl.emergency_active());
    }

    // stop threshold reached: mode restored, setpoint zeroed, gate reopened
    let writes = ctrl.tick(&ctx(&site, &snapshot(400, 2000, 4800)));
    assert_eq!(
        writes,
        vec![RegisterWrite::new(1102, 3), RegisterWrite::new(1101, 0)]
    );
    assert!(site.flags.self_consumption_enabled());
    assert!(!ctrl.emergency_active());
}

#[test]
fn emergency_setpoint_never_commands_discharge() {
    let site = site();
    let mut ctrl = BatteryController::new();
    ctrl.tick(&ctx(&site, &snapshot(50, 300, 5000)));

    // alternate meter extremes; the setpoint must stay within the guardrail
    // band and never go positive
    for grid in [0, 5000, 0, 0, 5000, 10000, 0] {
        let writes = ctrl.tick(&ctx(&site, &snapshot(100, 300, grid)));
        for w in writes {
            if w.register == 1101 {
                assert!(w.value <= 0, "emergency commanded discharge: {}", w.value);
                assert!(w.value >= site.config.battery.guardrail_1101_min);
            }
        }
    }
}

#[test]
fn service_window_suppresses_emergency_entry() {
    let site = site();
    assert!(site.flags.try_claim_service());

    let mut ctrl = BatteryController::new();
    let writes = ctrl.tick(&ctx(&site, &snapshot(50, 300, 5000)));
    assert!(writes.is_empty());
    assert!(!ctrl.emergency_active());

    // the service ends; the very next qualifying tick engages
    site.flags.release_service();
    let writes = ctrl.tick(&ctx(&site, &snapshot(50, 300, 5000)));
    assert_eq!(writes[0], RegisterWrite::new(1102, 1));
}
