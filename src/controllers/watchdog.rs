//! Machine-state watchdog
//!
//! Polls the machine-state register; on sleep or error it issues the
//! reset command, giving up after a bounded number of attempts and raising
//! the machine alarm for a human to clear.

use super::{ControlContext, Controller, RegisterWrite};
use crate::logging::get_logger;

/// Machine-state register values
const STATE_SLEEP: i64 = 0;
const STATE_ERROR: i64 = 1;
const STATE_OPERATIONAL: i64 = 2;

/// Command-register value requesting an error reset
const RESET_COMMAND: i16 = 10;

const MAX_ATTEMPTS: u32 = 5;

pub struct MachineResetWatchdog {
    reset_attempts: u32,
    alarm_active: bool,
    logger: crate::logging::StructuredLogger,
}

impl MachineResetWatchdog {
    pub fn new() -> Self {
        Self {
            reset_attempts: 0,
            alarm_active: false,
            logger: get_logger("watchdog"),
        }
    }

    pub fn alarm_active(&self) -> bool {
        self.alarm_active
    }
}

impl Default for MachineResetWatchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl Controller for MachineResetWatchdog {
    fn name(&self) -> &'static str {
        "watchdog"
    }

    fn tick(&mut self, ctx: &ControlContext<'_>) -> Vec<RegisterWrite> {
        let regs = &ctx.config.registers;
        let Some(state) = ctx.snapshot.get(regs.machine_state) else {
            return Vec::new();
        };

        match state {
            STATE_OPERATIONAL => {
                if self.reset_attempts > 0 || self.alarm_active {
                    self.logger
                        .info("Machine operational again, clearing attempts and alarm");
                }
                self.reset_attempts = 0;
                if self.alarm_active {
                    self.alarm_active = false;
                    ctx.flags.set_machine_alarm(false);
                }
                Vec::new()
            }
            STATE_SLEEP | STATE_ERROR => {
                if self.alarm_active {
                    self.logger.debug("Machine still faulted, alarm already raised");
                    return Vec::new();
                }
                if self.reset_attempts < MAX_ATTEMPTS {
                    self.reset_attempts += 1;
                    self.logger.warn(&format!(
                        "Machine state {}: reset attempt #{}",
                        state, self.reset_attempts
                    ));
                    vec![RegisterWrite::new(regs.command, RESET_COMMAND)]
                } else {
                    self.logger
                        .error("Machine failed to reset, raising alarm");
                    self.alarm_active = true;
                    ctx.flags.set_machine_alarm(true);
                    Vec::new()
                }
            }
            other => {
                self.logger
                    .debug(&format!("Machine state {} not handled", other));
                Vec::new()
            }
        }
    }
}
