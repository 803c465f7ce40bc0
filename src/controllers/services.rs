//! Scheduled grid services
//!
//! Four state machines share one shape: prepare the battery before a
//! programmed window, hold, actuate through the window, then restore normal
//! operation. DSO services support the distribution grid (absorb during
//! charge events, release during discharge events); trading services move the
//! battery to a contracted SOC partition during a market window.
//!
//! Only one service may run at a time; activation claims the shared
//! `service_active` flag and losers stay inactive for the day.

use super::{ControlContext, Controller, RegisterWrite};
use crate::config::{ActivationMode, Config, ServiceProgram};
use crate::flags::FlagStore;
use crate::logging::get_logger;
use chrono::{NaiveDateTime, NaiveTime};

/// Battery-mode register values
const MODE_EXCLUDED: i16 = 0;
const MODE_CHARGE_ONLY: i16 = 1;
const MODE_NORMAL: i16 = 3;

/// The four service flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    DsoCharge,
    DsoDischarge,
    TradingDischarge,
    TradingCharge,
}

impl ServiceKind {
    /// Activation order; the first eligible service claims the slot.
    pub const ALL: [ServiceKind; 4] = [
        ServiceKind::DsoCharge,
        ServiceKind::DsoDischarge,
        ServiceKind::TradingDischarge,
        ServiceKind::TradingCharge,
    ];

    /// Name used in program entries and the modes table.
    pub fn config_name(self) -> &'static str {
        match self {
            ServiceKind::DsoCharge => "dso_charge",
            ServiceKind::DsoDischarge => "dso_discharge",
            ServiceKind::TradingDischarge => "trading_discharge",
            ServiceKind::TradingCharge => "trading_charge",
        }
    }

    fn is_trading(self) -> bool {
        matches!(
            self,
            ServiceKind::TradingDischarge | ServiceKind::TradingCharge
        )
    }

    fn activation_mode(self, config: &Config) -> ActivationMode {
        let modes = &config.services.modes;
        match self {
            ServiceKind::DsoCharge => modes.dso_charge,
            ServiceKind::DsoDischarge => modes.dso_discharge,
            ServiceKind::TradingDischarge => modes.trading_discharge,
            ServiceKind::TradingCharge => modes.trading_charge,
        }
    }

    fn programs(self, config: &Config) -> &[ServiceProgram] {
        if self.is_trading() {
            &config.services.trading_programs
        } else {
            &config.services.dso_programs
        }
    }
}

/// Lifecycle of one service run. `Done` is terminal for the day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Init,
    PrePhase,
    WaitEvent,
    EventActive,
    Done,
}

pub struct ScheduledService {
    kind: ServiceKind,
    state: ServiceState,
    program_id: String,
    event_start: NaiveDateTime,
    event_end: NaiveDateTime,
    partition_soc_dec: u16,
    claimed: bool,
    /// Register addresses captured at activation so completion can restore
    /// them without a config handle
    battery_mode_reg: u16,
    power_setpoint_reg: u16,
    logger: crate::logging::StructuredLogger,
}

impl ScheduledService {
    /// Activate the service if its mode is `auto`, a program covers today,
    /// and the shared service slot is free. The slot is claimed here.
    pub fn try_activate(
        kind: ServiceKind,
        config: &Config,
        flags: &FlagStore,
        now: NaiveDateTime,
    ) -> Option<Self> {
        let logger = get_logger(kind.config_name());

        if kind.activation_mode(config) != ActivationMode::Auto {
            return None;
        }

        let today = now.date().format("%Y-%m-%d").to_string();
        let program = kind
            .programs(config)
            .iter()
            .find(|p| p.mode == kind.config_name() && p.days.iter().any(|d| d == &today))?;

        let start = parse_hhmm(&program.start)?;
        let end = parse_hhmm(&program.end)?;
        let event_start = now.date().and_time(start);
        let event_end = now.date().and_time(end);
        if event_end <= event_start {
            logger.warn(&format!(
                "Program {} has an empty window {}-{}, skipping",
                program.id, program.start, program.end
            ));
            return None;
        }

        if !flags.try_claim_service() {
            logger.warn(&format!(
                "Program {} not started: another service is already active",
                program.id
            ));
            return None;
        }

        logger.info(&format!(
            "Service armed by program {}: window {} - {}",
            program.id, event_start, event_end
        ));

        Some(Self {
            kind,
            state: ServiceState::Init,
            program_id: program.id.clone(),
            event_start,
            event_end,
            partition_soc_dec: program
                .partition_soc_dec
                .unwrap_or(config.services.default_partition_soc_dec),
            claimed: true,
            battery_mode_reg: config.registers.battery_mode,
            power_setpoint_reg: config.registers.power_setpoint,
            logger,
        })
    }

    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    fn enter(&mut self, state: ServiceState) {
        if self.state != state {
            self.logger.info(&format!(
                "{}: {:?} -> {:?}",
                self.program_id, self.state, state
            ));
            self.state = state;
        }
    }

    /// Common completion: restore normal battery operation, re-enable
    /// self-consumption, release the service slot.
    fn complete(&mut self, flags: &FlagStore) -> Vec<RegisterWrite> {
        self.enter(ServiceState::Done);
        if self.claimed {
            self.claimed = false;
            flags.set_self_consumption_enabled(true);
            flags.release_service();
        }
        self.logger.info(&format!("Service {} completed", self.program_id));
        vec![
            RegisterWrite::new(self.battery_mode_reg, MODE_NORMAL),
            RegisterWrite::new(self.power_setpoint_reg, 0),
        ]
    }

    fn tick_dso_charge(&mut self, ctx: &ControlContext<'_>, soc: i64) -> Vec<RegisterWrite> {
        let regs = &ctx.config.registers;
        let svc = &ctx.config.services;

        if ctx.now < self.event_start {
            if soc > svc.pre_discharge_soc_dec as i64 {
                self.enter(ServiceState::PrePhase);
                ctx.flags.set_self_consumption_enabled(false);
                return vec![
                    RegisterWrite::new(regs.battery_mode, MODE_NORMAL),
                    RegisterWrite::new(regs.power_setpoint, svc.event_power_w),
                ];
            }
            if self.state != ServiceState::WaitEvent {
                self.enter(ServiceState::WaitEvent);
                ctx.flags.set_self_consumption_enabled(true);
                return vec![RegisterWrite::new(regs.battery_mode, MODE_EXCLUDED)];
            }
            return Vec::new();
        }

        self.enter(ServiceState::EventActive);
        ctx.flags.set_self_consumption_enabled(false);
        vec![
            RegisterWrite::new(regs.battery_mode, MODE_CHARGE_ONLY),
            RegisterWrite::new(regs.power_setpoint, -svc.event_power_w),
        ]
    }

    fn tick_dso_discharge(&mut self, ctx: &ControlContext<'_>, soc: i64) -> Vec<RegisterWrite> {
        let regs = &ctx.config.registers;
        let svc = &ctx.config.services;

        if ctx.now < self.event_start {
            if soc < svc.target_soc_high_dec as i64 {
                self.enter(ServiceState::PrePhase);
                ctx.flags.set_self_consumption_enabled(false);
                return vec![
                    RegisterWrite::new(regs.battery_mode, MODE_CHARGE_ONLY),
                    RegisterWrite::new(regs.power_setpoint, -svc.event_power_w),
                ];
            }
            if self.state != ServiceState::WaitEvent {
                self.enter(ServiceState::WaitEvent);
                ctx.flags.set_self_consumption_enabled(true);
                return vec![RegisterWrite::new(regs.battery_mode, MODE_EXCLUDED)];
            }
            return Vec::new();
        }

        self.enter(ServiceState::EventActive);
        ctx.flags.set_self_consumption_enabled(false);
        if soc > svc.min_soc_dec as i64 {
            vec![
                RegisterWrite::new(regs.battery_mode, MODE_NORMAL),
                RegisterWrite::new(regs.power_setpoint, svc.event_power_w),
            ]
        } else {
            // floor reached: stop discharging but keep holding the window
            vec![RegisterWrite::new(regs.power_setpoint, 0)]
        }
    }

    fn tick_trading(&mut self, ctx: &ControlContext<'_>, soc: i64) -> Vec<RegisterWrite> {
        let regs = &ctx.config.registers;
        let svc = &ctx.config.services;

        if ctx.now < self.event_start {
            self.enter(ServiceState::WaitEvent);
            return Vec::new();
        }

        self.enter(ServiceState::EventActive);
        ctx.flags.set_self_consumption_enabled(false);
        let partition = self.partition_soc_dec as i64;
        match self.kind {
            ServiceKind::TradingDischarge if soc > partition => vec![
                RegisterWrite::new(regs.battery_mode, MODE_NORMAL),
                RegisterWrite::new(regs.power_setpoint, svc.event_power_w),
            ],
            ServiceKind::TradingCharge if soc < partition => vec![
                RegisterWrite::new(regs.battery_mode, MODE_CHARGE_ONLY),
                RegisterWrite::new(regs.power_setpoint, -svc.event_power_w),
            ],
            _ => vec![RegisterWrite::new(regs.power_setpoint, 0)],
        }
    }
}

impl Controller for ScheduledService {
    fn name(&self) -> &'static str {
        self.kind.config_name()
    }

    fn tick(&mut self, ctx: &ControlContext<'_>) -> Vec<RegisterWrite> {
        if self.state == ServiceState::Done {
            return Vec::new();
        }

        if ctx.now >= self.event_end {
            return self.complete(ctx.flags);
        }

        let Some(soc) = ctx.snapshot.get(ctx.config.registers.soc) else {
            return Vec::new();
        };

        match self.kind {
            ServiceKind::DsoCharge => self.tick_dso_charge(ctx, soc),
            ServiceKind::DsoDischarge => self.tick_dso_discharge(ctx, soc),
            ServiceKind::TradingDischarge | ServiceKind::TradingCharge => {
                self.tick_trading(ctx, soc)
            }
        }
    }

    fn on_shutdown(&mut self, flags: &FlagStore) -> Vec<RegisterWrite> {
        if self.state != ServiceState::Done {
            self.complete(flags)
        } else {
            Vec::new()
        }
    }
}

fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").ok()
}
