//! Shared control flags and their legacy sidecar mirrors
//!
//! The flag store is the only state shared between controllers. It is the
//! in-memory authority; every mutation is mirrored best-effort to the legacy
//! sidecar files so external observers keep working. Mirror failures are
//! logged and never fail the caller.

use crate::boundary::{self, TagDoc};
use crate::config::PathsConfig;
use crate::logging::get_logger;
use std::sync::Mutex;

/// Point-in-time copy of the shared flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlagSnapshot {
    /// Gate for the self-consumption/community loop
    pub self_consumption_enabled: bool,

    /// True while exactly one scheduled service runs
    pub service_active: bool,

    /// Machine failed to reset after the maximum retries
    pub machine_alarm: bool,

    /// Setpoint saturated while the site still imports from the grid
    pub energy_debt: bool,

    /// Community-sharing consent
    pub sharing_enabled: bool,
}

struct Inner {
    flags: FlagSnapshot,
    paths: PathsConfig,
}

/// Mutex-protected flag record with sidecar mirroring.
pub struct FlagStore {
    inner: Mutex<Inner>,
    logger: crate::logging::StructuredLogger,
}

impl FlagStore {
    /// Create the store with startup defaults: self-consumption enabled,
    /// everything else cleared.
    pub fn new(paths: PathsConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                flags: FlagSnapshot {
                    self_consumption_enabled: true,
                    ..Default::default()
                },
                paths,
            }),
            logger: get_logger("flags"),
        }
    }

    /// Current flags.
    pub fn snapshot(&self) -> FlagSnapshot {
        self.lock().flags
    }

    pub fn self_consumption_enabled(&self) -> bool {
        self.lock().flags.self_consumption_enabled
    }

    pub fn service_active(&self) -> bool {
        self.lock().flags.service_active
    }

    pub fn sharing_enabled(&self) -> bool {
        self.lock().flags.sharing_enabled
    }

    pub fn energy_debt(&self) -> bool {
        self.lock().flags.energy_debt
    }

    pub fn machine_alarm(&self) -> bool {
        self.lock().flags.machine_alarm
    }

    pub fn set_self_consumption_enabled(&self, enabled: bool) {
        let mut inner = self.lock();
        if inner.flags.self_consumption_enabled != enabled {
            inner.flags.self_consumption_enabled = enabled;
            self.mirror_guardrail(&inner);
        }
    }

    pub fn set_energy_debt(&self, debt: bool) {
        let mut inner = self.lock();
        if inner.flags.energy_debt != debt {
            inner.flags.energy_debt = debt;
            self.mirror_energy_debt(&inner);
        }
    }

    pub fn set_machine_alarm(&self, alarm: bool) {
        let mut inner = self.lock();
        if inner.flags.machine_alarm != alarm {
            inner.flags.machine_alarm = alarm;
            self.mirror_machine_alarm(&inner);
        }
    }

    pub fn set_sharing_enabled(&self, enabled: bool) {
        let mut inner = self.lock();
        if inner.flags.sharing_enabled != enabled {
            inner.flags.sharing_enabled = enabled;
            self.mirror_sharing(&inner);
        }
    }

    /// Claim the single service slot. Returns false when another service
    /// already holds it.
    pub fn try_claim_service(&self) -> bool {
        let mut inner = self.lock();
        if inner.flags.service_active {
            return false;
        }
        inner.flags.service_active = true;
        self.mirror_service_status(&inner);
        true
    }

    /// Release the service slot.
    pub fn release_service(&self) {
        let mut inner = self.lock();
        if inner.flags.service_active {
            inner.flags.service_active = false;
            self.mirror_service_status(&inner);
        }
    }

    /// Re-read the sharing consent sidecar. The file doubles as an input: a
    /// community coordinator may toggle it while we run.
    pub fn seed_sharing_from_file(&self) {
        let mut inner = self.lock();
        let path = inner.paths.sharing_path();
        if let Ok(text) = std::fs::read_to_string(&path) {
            let enabled = boundary::extract_register(&text, "sharing") == Some(1);
            inner.flags.sharing_enabled = enabled;
        }
    }

    /// Point the mirrors at a new path set (config hot-reload).
    pub fn update_paths(&self, paths: PathsConfig) {
        self.lock().paths = paths;
    }

    /// Rewrite every sidecar from the current flags. Used at startup and
    /// after a config reload.
    pub fn mirror_all(&self) {
        let inner = self.lock();
        self.mirror_guardrail(&inner);
        self.mirror_service_status(&inner);
        self.mirror_energy_debt(&inner);
        self.mirror_machine_alarm(&inner);
        self.mirror_sharing(&inner);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mirror_guardrail(&self, inner: &Inner) {
        let content = format!(
            "AUTOCONSUMO={}",
            if inner.flags.self_consumption_enabled { "1" } else { "0" }
        );
        self.write_sidecar(&inner.paths.guardrail_path(), &content);
    }

    fn mirror_service_status(&self, inner: &Inner) {
        let content = format!(
            "SERVICE={}",
            if inner.flags.service_active { "1" } else { "0" }
        );
        self.write_sidecar(&inner.paths.service_status_path(), &content);
    }

    fn mirror_energy_debt(&self, inner: &Inner) {
        let content = format!(
            "DebitoEnergetico={}",
            if inner.flags.energy_debt { "1" } else { "0" }
        );
        self.write_sidecar(&inner.paths.energy_debt_path(), &content);
    }

    fn mirror_machine_alarm(&self, inner: &Inner) {
        let content = if inner.flags.machine_alarm {
            "MACCHINA IN ALLARME"
        } else {
            "MACCHINA OK"
        };
        self.write_sidecar(&inner.paths.machine_alarm_path(), content);
    }

    fn mirror_sharing(&self, inner: &Inner) {
        let mut doc = TagDoc::new("rootmain");
        doc.push("sharing", if inner.flags.sharing_enabled { "1" } else { "0" });
        doc.push("DATA", chrono::Local::now().format("%d/%m/%Y %H:%M:%S"));
        self.write_sidecar(&inner.paths.sharing_path(), &doc.render());
    }

    fn write_sidecar(&self, path: &std::path::Path, content: &str) {
        if let Err(e) = boundary::write_atomic(path, content) {
            self.logger
                .warn(&format!("Sidecar mirror {} failed: {}", path.display(), e));
        }
    }
}
