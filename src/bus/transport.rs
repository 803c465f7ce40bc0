//! Serial Modbus RTU transport
//!
//! The bus actor talks to the wire through the [`BusTransport`] trait so the
//! poll cycle, retry ladder and foreign-frame accounting can be exercised in
//! tests against a scripted transport.

use crate::config::SerialConfig;
use crate::error::{HelionError, Result};
use std::time::Duration;
use tokio::time::timeout;
use tokio_modbus::client::{Context, rtu};
use tokio_modbus::prelude::*;
use tokio_serial::SerialStream;

/// Wire-level register access. Addresses here are already 0-based wire
/// addresses; the bus applies the logical-address correction before calling.
#[async_trait::async_trait]
pub trait BusTransport: Send {
    /// Open (or re-open) the serial device.
    async fn open(&mut self) -> Result<()>;

    /// Close the device. Idempotent.
    async fn close(&mut self);

    /// Discard anything buffered in both directions.
    async fn flush(&mut self) -> Result<()>;

    /// Block read with the configured read function code.
    async fn read_registers(&mut self, wire_addr: u16, count: u16) -> Result<Vec<u16>>;

    /// Single register write (Modbus function 6).
    async fn write_register(&mut self, wire_addr: u16, value: u16) -> Result<()>;
}

/// RTU transport over a serial port.
pub struct RtuTransport {
    config: SerialConfig,
    read_functioncode: u8,
    ctx: Option<Context>,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl RtuTransport {
    pub fn new(config: &SerialConfig, read_functioncode: u8) -> Self {
        let read_timeout = Duration::from_millis(config.serial_timeout_ms);
        // writes get at least a second even on aggressively short read timeouts
        let write_timeout = read_timeout.max(Duration::from_secs(1));
        Self {
            config: config.clone(),
            read_functioncode,
            ctx: None,
            read_timeout,
            write_timeout,
        }
    }

    fn context(&mut self) -> Result<&mut Context> {
        self.ctx
            .as_mut()
            .ok_or_else(|| HelionError::bus("serial port not open"))
    }

    fn parity(&self) -> Result<tokio_serial::Parity> {
        match self.config.parity.to_uppercase().as_str() {
            "NONE" => Ok(tokio_serial::Parity::None),
            "EVEN" => Ok(tokio_serial::Parity::Even),
            "ODD" => Ok(tokio_serial::Parity::Odd),
            other => Err(HelionError::config(format!("Invalid parity: {}", other))),
        }
    }

    fn stop_bits(&self) -> tokio_serial::StopBits {
        if self.config.stopbits >= 2 {
            tokio_serial::StopBits::Two
        } else {
            tokio_serial::StopBits::One
        }
    }
}

#[async_trait::async_trait]
impl BusTransport for RtuTransport {
    async fn open(&mut self) -> Result<()> {
        let builder = tokio_serial::new(&self.config.port, self.config.baudrate)
            .parity(self.parity()?)
            .stop_bits(self.stop_bits())
            .timeout(self.read_timeout);
        let stream = SerialStream::open(&builder).map_err(|e| {
            HelionError::bus(format!("failed to open port {}: {}", self.config.port, e))
        })?;
        self.ctx = Some(rtu::attach_slave(stream, Slave(self.config.slave_id)));
        Ok(())
    }

    async fn close(&mut self) {
        self.ctx.take();
    }

    async fn flush(&mut self) -> Result<()> {
        // Dropping buffered bytes is handled by the kernel on reconfigure;
        // nothing is queued at this layer between transactions.
        Ok(())
    }

    async fn read_registers(&mut self, wire_addr: u16, count: u16) -> Result<Vec<u16>> {
        let fcode = self.read_functioncode;
        let read_timeout = self.read_timeout;
        let ctx = self.context()?;
        let request = async {
            if fcode == 4 {
                ctx.read_input_registers(wire_addr, count).await
            } else {
                ctx.read_holding_registers(wire_addr, count).await
            }
        };
        match timeout(read_timeout, request).await {
            Err(_) => Err(HelionError::timeout(format!(
                "no response reading {} registers at {}",
                count, wire_addr
            ))),
            Ok(Err(e)) => Err(classify_modbus_error(&e)),
            Ok(Ok(Err(exc))) => Err(HelionError::protocol(format!(
                "exception response reading {}: {}",
                wire_addr, exc
            ))),
            Ok(Ok(Ok(regs))) => Ok(regs),
        }
    }

    async fn write_register(&mut self, wire_addr: u16, value: u16) -> Result<()> {
        let write_timeout = self.write_timeout;
        let ctx = self.context()?;
        match timeout(write_timeout, ctx.write_single_register(wire_addr, value)).await {
            Err(_) => Err(HelionError::timeout(format!(
                "no response writing register {}",
                wire_addr
            ))),
            Ok(Err(e)) => Err(classify_modbus_error(&e)),
            Ok(Ok(Err(exc))) => Err(HelionError::protocol(format!(
                "exception response writing {}: {}",
                wire_addr, exc
            ))),
            Ok(Ok(Ok(()))) => Ok(()),
        }
    }
}

/// Map a tokio-modbus error onto the bus taxonomy. A reply carrying an
/// unexpected function code means another master's traffic got interleaved
/// with ours, which callers track separately from plain transport noise.
fn classify_modbus_error(err: &tokio_modbus::Error) -> HelionError {
    let msg = err.to_string();
    if msg.to_lowercase().contains("function code") {
        HelionError::foreign_frame(msg)
    } else if msg.to_lowercase().contains("timed out") {
        HelionError::timeout(msg)
    } else {
        HelionError::bus(msg)
    }
}
