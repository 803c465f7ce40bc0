use super::*;

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            serial: SerialConfig::default(),
            bus: BusConfig::default(),
            registers: RegistersConfig::default(),
            meter: MeterConfig::default(),
            battery: BatteryConfig::default(),
            self_consumption: SelfConsumptionConfig::default(),
            services: ServicesConfig::default(),
            scheduler: SchedulerConfig::default(),
            logging: LoggingConfig::default(),
            timezone: "Europe/Rome".to_string(),
            autorun: true,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./data"),
            from_snapshot: "FromSnapshot.xml".to_string(),
            to_source: "ToSource.xml".to_string(),
            remote_snapshot: "FromSnapshot_remote.xml".to_string(),
            guardrail_file: "guardrail_autoconsumo.txt".to_string(),
            service_status_file: "service_status.txt".to_string(),
            energy_debt_file: "debito.txt".to_string(),
            machine_alarm_file: "machine_alarm.txt".to_string(),
            sharing_file: "sharing.xml".to_string(),
            energy_report_file: "energy_report.json".to_string(),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            slave_id: 1,
            baudrate: 38400,
            parity: "NONE".to_string(),
            stopbits: 1,
            serial_timeout_ms: 500,
            inter_byte_timeout_ms: 10,
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            address_correction: 1,
            read_functioncode: 3,
            rtu_gap_ms: 5,
            startup_warmup_ms: 700,
            startup_dummy_reads: 3,
            read_max_chunk: 4,
            read_min_chunk: 1,
            max_retry: 4,
            write_retries: 3,
            retry_backoff_ms: 80,
            verify_writes: true,
            commit_register: 0,
            commit_value: 1,
            poll_ms: 500,
            poll_jitter_ms: 20,
            foreign_window_s: 10,
            foreign_threshold: 3,
            ignore_write_errors: false,
            inbox_poll_ms: 200,
            csv_enable: true,
            log_rollover_bytes: 5_000_000,
        }
    }
}

impl Default for RegistersConfig {
    fn default() -> Self {
        Self {
            read_blocks: vec![1013, 1040, 1060, 1070, 1090],
            soc: 1040,
            battery_current: 1013,
            machine_state: 1070,
            grid_sensor: 1090,
            aux_sensor: 1060,
            power_setpoint: 1101,
            battery_mode: 1102,
            command: 1103,
        }
    }
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            prelievo_w: 3000.0,
            immissione_w: 3000.0,
        }
    }
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            capacity_kwh: 10.0,
            emergency_start_soc_dec: 50,
            emergency_stop_soc_dec: 400,
            ibat_low_min: 0,
            ibat_low_max: 500,
            ibat_max: 6000,
            step_emergency_1101: 50,
            guardrail_1101_min: -6000,
            emergency_1101_max: 0,
            grid_limit_w: 2500.0,
            grid_hysteresis_w: 200.0,
        }
    }
}

impl Default for SelfConsumptionConfig {
    fn default() -> Self {
        Self {
            deadband: 50,
            step_local: 5,
            step_community: 5,
            bt_loss_factor: 0.10,
            soc_threshold_community: 950,
            param1101_min: 70,
            param1101_max: 6000,
        }
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            modes: ServiceModes::default(),
            dso_programs: Vec::new(),
            trading_programs: Vec::new(),
            target_soc_high_dec: 950,
            min_soc_dec: 100,
            pre_discharge_soc_dec: 50,
            event_power_w: 6000,
            default_partition_soc_dec: 500,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            config_check_ms: 1000,
            self_consumption_period_ms: 500,
            battery_period_ms: 5000,
            watchdog_period_ms: 30000,
            service_period_ms: 5000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            console_level: None,
            file_level: None,
            file: "/tmp/helion.log".to_string(),
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}
