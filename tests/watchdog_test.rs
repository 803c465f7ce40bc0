use helion::config::Config;
use helion::controllers::watchdog::MachineResetWatchdog;
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

fn machine(state: i64) -> TelemetrySnapshot {
    let mut snap = TelemetrySnapshot::default();
    snap.registers.insert(1070, state);
    snap
}

#[test]
fn reset_retry_budget_then_alarm_file() {
    let site = site();
    let mut wd = MachineResetWatchdog::new();
    let faulted = machine(1);

    // five consecutive faulted ticks issue five reset commands
    let mut reset_writes = 0;
    for _ in 0..5 {
        let writes = wd.tick(&ctx(&site, &faulted));
        assert_eq!(writes, vec![RegisterWrite::new(1103, 10)]);
        reset_writes += 1;
    }
    assert_eq!(reset_writes, 5);

    // the budget is spent: alarm raised, sidecar written, no more commands
    assert!(wd.tick(&ctx(&site, &faulted)).is_empty());
    assert!(site.flags.machine_alarm());
    let alarm =
        std::fs::read_to_string(site.config.paths.machine_alarm_path()).unwrap();
    assert_eq!(alarm, "MACCHINA IN ALLARME");

    for _ in 0..10 {
        assert!(wd.tick(&ctx(&site, &faulted)).is_empty());
    }

    // recovery clears the alarm and restores the sidecar
    assert!(wd.tick(&ctx(&site, &machine(2))).is_empty());
    assert!(!site.flags.machine_alarm());
    let alarm =
        std::fs::read_to_string(site.config.paths.machine_alarm_path()).unwrap();
    assert_eq!(alarm, "MACCHINA OK");
}

#[test]
fn sleep_state_also_triggers_reset() {
    let site = site();
    let mut wd = MachineResetWatchdog::new();
    let writes = wd.tick(&ctx(&site, &machine(0)));
    assert_eq!(writes, vec![RegisterWrite::new(1103, 10)]);
}

#[test]
fn operational_ticks_reset_the_attempt_budget() {
    let site = site();
    let mut wd = MachineResetWatchdog::new();

    for _ in 0..4 {
        wd.tick(&ctx(&site, &machine(1)));
    }
    // a healthy reading wipes the count
    wd.tick(&ctx(&site, &machine(2)));

    // five fresh attempts are available again
    for _ in 0..5 {
        let writes = wd.tick(&ctx(&site, &machine(1)));
        assert_eq!(writes.len(), 1);
    }
    assert!(wd.tick(&ctx(&site, &machine(1))).is_empty());
}
