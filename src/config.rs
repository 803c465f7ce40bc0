//! Configuration management for Helion
//!
//! This module handles loading, validation, and hot-reload of the application
//! configuration from a YAML file. Missing keys fall back to typed defaults so
//! a partial file never prevents startup.

use crate::error::{HelionError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

mod defaults;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Filesystem boundary paths
    pub paths: PathsConfig,

    /// Serial link parameters
    pub serial: SerialConfig,

    /// Bus server behavior (pacing, retries, chunking, foreign detection)
    pub bus: BusConfig,

    /// Inverter register addresses and the polled read set
    pub registers: RegistersConfig,

    /// Utility-meter scaling for the grid-exchange sensor
    pub meter: MeterConfig,

    /// Battery capacity and emergency-charge parameters
    pub battery: BatteryConfig,

    /// Self-consumption and community-sharing regulation parameters
    pub self_consumption: SelfConsumptionConfig,

    /// Scheduled grid services (DSO flex events and trading windows)
    pub services: ServicesConfig,

    /// Controller dispatch periods
    pub scheduler: SchedulerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Timezone used to resolve "today" and event windows
    pub timezone: String,

    /// When false and stdin is not a terminal, exit at startup
    pub autorun: bool,
}

/// Filesystem boundary paths. File names are resolved against `base_dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding the boundary files, sidecars and CSV logs
    pub base_dir: PathBuf,

    /// Telemetry snapshot published for external observers
    pub from_snapshot: String,

    /// Inbound setpoint command file
    pub to_source: String,

    /// Neighbor-node snapshot (same schema as `from_snapshot`)
    pub remote_snapshot: String,

    /// Sidecar mirrors of the shared flags
    pub guardrail_file: String,
    pub service_status_file: String,
    pub energy_debt_file: String,
    pub machine_alarm_file: String,
    pub sharing_file: String,

    /// Battery missing-energy report
    pub energy_report_file: String,
}

impl PathsConfig {
    pub fn from_snapshot_path(&self) -> PathBuf {
        self.base_dir.join(&self.from_snapshot)
    }

    pub fn to_source_path(&self) -> PathBuf {
        self.base_dir.join(&self.to_source)
    }

    pub fn remote_snapshot_path(&self) -> PathBuf {
        self.base_dir.join(&self.remote_snapshot)
    }

    pub fn guardrail_path(&self) -> PathBuf {
        self.base_dir.join(&self.guardrail_file)
    }

    pub fn service_status_path(&self) -> PathBuf {
        self.base_dir.join(&self.service_status_file)
    }

    pub fn energy_debt_path(&self) -> PathBuf {
        self.base_dir.join(&self.energy_debt_file)
    }

    pub fn machine_alarm_path(&self) -> PathBuf {
        self.base_dir.join(&self.machine_alarm_file)
    }

    pub fn sharing_path(&self) -> PathBuf {
        self.base_dir.join(&self.sharing_file)
    }

    pub fn energy_report_path(&self) -> PathBuf {
        self.base_dir.join(&self.energy_report_file)
    }
}

/// Serial link parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Serial device path (e.g. /dev/ttyUSB0)
    pub port: String,

    /// Modbus slave address of the inverter
    pub slave_id: u8,

    /// Baud rate
    pub baudrate: u32,

    /// Parity: NONE, EVEN or ODD
    pub parity: String,

    /// Stop bits (1 or 2)
    pub stopbits: u8,

    /// Per-transaction response timeout in milliseconds
    pub serial_timeout_ms: u64,

    /// Inter-byte timeout in milliseconds (0 disables)
    pub inter_byte_timeout_ms: u64,
}

/// Bus server behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Offset translating 1-based logical addresses to wire addresses
    pub address_correction: i32,

    /// Modbus function code used for block reads (3 or 4)
    pub read_functioncode: u8,

    /// Idle gap between RTU transactions in milliseconds
    pub rtu_gap_ms: u64,

    /// Sleep after opening the port before any traffic
    pub startup_warmup_ms: u64,

    /// Throwaway reads of the first configured register after open
    pub startup_dummy_reads: u32,

    /// Largest register count per chunked read
    pub read_max_chunk: u16,

    /// Smallest chunk length the adaptive reader will fall back to
    pub read_min_chunk: u16,

    /// Read attempts per chunk before halving
    pub max_retry: u32,

    /// Write attempts per command
    pub write_retries: u32,

    /// Backoff between retries in milliseconds
    pub retry_backoff_ms: u64,

    /// Confirm failed writes with a read-back of the target register
    pub verify_writes: bool,

    /// Register written after a write-with-commit command (0 disables)
    pub commit_register: u16,

    /// Value written to the commit register
    pub commit_value: u16,

    /// Base poll period in milliseconds
    pub poll_ms: u64,

    /// Random jitter applied to the poll period
    pub poll_jitter_ms: u64,

    /// Sliding window for foreign-frame detection, in seconds
    pub foreign_window_s: u64,

    /// Foreign frames within the window that raise the alert
    pub foreign_threshold: usize,

    /// Drop the cycle instead of failing when the snapshot file is locked
    pub ignore_write_errors: bool,

    /// Poll period of the inbound command file watcher
    pub inbox_poll_ms: u64,

    /// Append a CSV row per poll cycle
    pub csv_enable: bool,

    /// CSV size that triggers a rollover
    pub log_rollover_bytes: u64,
}

/// Inverter register addresses. Addresses are logical (1-based); the bus
/// applies `address_correction` before they reach the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistersConfig {
    /// Registers polled every cycle
    pub read_blocks: Vec<u16>,

    /// Battery state of charge in deci-percent
    pub soc: u16,

    /// Battery current, raw unsigned
    pub battery_current: u16,

    /// Machine state (0=sleep, 1=error, 2=operational)
    pub machine_state: u16,

    /// Grid-exchange sensor (0..10000, 5000 = net zero)
    pub grid_sensor: u16,

    /// Auxiliary sensor
    pub aux_sensor: u16,

    /// Power setpoint (positive = discharge, negative = charge)
    pub power_setpoint: u16,

    /// Battery mode (0=excluded, 1=charge-only, 3=normal)
    pub battery_mode: u16,

    /// Command register (10 = reset errors)
    pub command: u16,
}

/// Piecewise-linear meter model scaling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    /// Grid import power at sensor full deflection below 5000, in watts
    pub prelievo_w: f64,

    /// Grid export power at sensor full deflection above 5000, in watts
    pub immissione_w: f64,
}

/// Battery capacity and emergency-charge parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryConfig {
    /// Usable capacity in kWh
    pub capacity_kwh: f64,

    /// SOC (deci-percent) at which emergency charge engages
    pub emergency_start_soc_dec: u16,

    /// SOC (deci-percent) at which emergency charge releases
    pub emergency_stop_soc_dec: u16,

    /// Battery-current window qualifying the emergency entry
    pub ibat_low_min: u16,
    pub ibat_low_max: u16,

    /// Battery current above which charging is reduced regardless of meter
    pub ibat_max: u16,

    /// Setpoint step per regulation tick during emergency
    pub step_emergency_1101: i16,

    /// Most negative setpoint the emergency regulator may command
    pub guardrail_1101_min: i16,

    /// Emergency never commands discharge; kept configurable for bench rigs
    pub emergency_1101_max: i16,

    /// Grid-import budget for the emergency regulator, in watts
    pub grid_limit_w: f64,

    /// Hysteresis around the grid-import budget, in watts
    pub grid_hysteresis_w: f64,
}

/// Self-consumption and community-sharing regulation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfConsumptionConfig {
    /// Deadband around the grid-zero target, in sensor counts
    pub deadband: i32,

    /// Setpoint step in local grid-zero mode
    pub step_local: i16,

    /// Setpoint step in community-sharing mode
    pub step_community: i16,

    /// Low-voltage line-loss compensation factor for shared energy
    pub bt_loss_factor: f64,

    /// Minimum SOC (deci-percent) before sharing is considered
    pub soc_threshold_community: u16,

    /// Setpoint clamp range
    pub param1101_min: i16,
    pub param1101_max: i16,
}

/// Activation mode of a scheduled service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActivationMode {
    /// Started by the scheduler when a program matches today
    Auto,
    /// Never started automatically
    #[default]
    Manual,
}

/// Per-service activation modes
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServiceModes {
    pub dso_charge: ActivationMode,
    pub dso_discharge: ActivationMode,
    pub trading_discharge: ActivationMode,
    pub trading_charge: ActivationMode,
}

/// One scheduled program entry
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServiceProgram {
    /// Program identifier, used only for logging
    pub id: String,

    /// Service this program belongs to (e.g. "dso_charge")
    pub mode: String,

    /// ISO dates (YYYY-MM-DD) on which the program runs
    pub days: Vec<String>,

    /// Event window, local time, "HH:MM"
    pub start: String,
    pub end: String,

    /// SOC partition for trading programs, in deci-percent
    pub partition_soc_dec: Option<u16>,
}

/// Scheduled grid services configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// Activation mode per service
    pub modes: ServiceModes,

    /// DSO flex-event programs
    pub dso_programs: Vec<ServiceProgram>,

    /// Trading-window programs
    pub trading_programs: Vec<ServiceProgram>,

    /// SOC the DSO-discharge pre-phase charges toward, deci-percent
    pub target_soc_high_dec: u16,

    /// Discharge floor for the DSO-discharge event, deci-percent
    pub min_soc_dec: u16,

    /// SOC the DSO-charge pre-phase discharges down to, deci-percent
    pub pre_discharge_soc_dec: u16,

    /// Setpoint magnitude commanded during event windows, in watts
    pub event_power_w: i16,

    /// Fallback SOC partition for trading programs that omit one
    pub default_partition_soc_dec: u16,
}

/// Controller dispatch periods, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Coarse loop tick
    pub tick_ms: u64,

    /// Config-file mtime check period
    pub config_check_ms: u64,

    pub self_consumption_period_ms: u64,
    pub battery_period_ms: u64,
    pub watchdog_period_ms: u64,
    pub service_period_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Optional per-sink overrides
    pub console_level: Option<String>,
    pub file_level: Option<String>,

    /// Path to log file or directory
    pub file: String,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from default locations, falling back to defaults
    pub fn load() -> Result<Self> {
        let default_paths = [
            "helion_config.yaml",
            "/data/helion_config.yaml",
            "/etc/helion/config.yaml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        Ok(Config::default())
    }

    /// Load configuration using an optional override path. When `Some`, the
    /// file must exist and be valid; there is no fall-back to defaults.
    pub fn load_with_override(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => Self::load(),
        }
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.serial.port.is_empty() {
            return Err(HelionError::validation(
                "serial.port",
                "Serial device path cannot be empty",
            ));
        }

        if self.bus.poll_ms == 0 {
            return Err(HelionError::validation(
                "bus.poll_ms",
                "Must be greater than 0",
            ));
        }

        if self.bus.read_min_chunk == 0 || self.bus.read_max_chunk < self.bus.read_min_chunk {
            return Err(HelionError::validation(
                "bus.read_max_chunk",
                "Chunk bounds must satisfy 1 <= read_min_chunk <= read_max_chunk",
            ));
        }

        if self.registers.read_blocks.is_empty() {
            return Err(HelionError::validation(
                "registers.read_blocks",
                "At least one register must be polled",
            ));
        }

        if self.self_consumption.param1101_min > self.self_consumption.param1101_max {
            return Err(HelionError::validation(
                "self_consumption.param1101_min",
                "Setpoint range is inverted",
            ));
        }

        if self.battery.emergency_stop_soc_dec <= self.battery.emergency_start_soc_dec {
            return Err(HelionError::validation(
                "battery.emergency_stop_soc_dec",
                "Emergency stop SOC must be above the start SOC",
            ));
        }

        if self.battery.capacity_kwh <= 0.0 {
            return Err(HelionError::validation(
                "battery.capacity_kwh",
                "Must be positive",
            ));
        }

        Ok(())
    }
}

/// Watches the configuration file and reloads it when its mtime changes
pub struct ConfigWatcher {
    path: PathBuf,
    last_mtime: Option<SystemTime>,
}

impl ConfigWatcher {
    /// Create a watcher for the given file. The initial mtime is recorded so
    /// only subsequent edits trigger a reload.
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        let last_mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        Self { path, last_mtime }
    }

    /// Reload the file if its mtime changed since the last check. Returns the
    /// freshly parsed configuration, or `None` when nothing changed or the
    /// file is currently unreadable.
    pub fn poll(&mut self) -> Option<Config> {
        let mtime = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok()?;
        if Some(mtime) == self.last_mtime {
            return None;
        }
        match Config::from_file(&self.path) {
            Ok(cfg) => {
                self.last_mtime = Some(mtime);
                Some(cfg)
            }
            Err(e) => {
                tracing::warn!("Config reload failed, keeping previous: {}", e);
                self.last_mtime = Some(mtime);
                None
            }
        }
    }
}
