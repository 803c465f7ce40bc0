//! # Helion - energy management controller for PV + battery sites
//!
//! Helion runs on the site gateway of a photovoltaic + battery installation.
//! It owns the Modbus RTU link to the inverter, regulates local
//! self-consumption toward grid-zero, shares surplus energy with neighbor
//! nodes, and executes scheduled grid services (DSO flex events and trading
//! windows) while safety loops guard the battery and the machine state.
//!
//! ## Architecture
//!
//! The application follows a modular architecture with clear separation of
//! concerns:
//!
//! - `config`: YAML configuration with typed defaults and hot-reload
//! - `logging`: structured logging and tracing
//! - `error`: error taxonomy shared across the crate
//! - `boundary`: the flat tag-document format of every legacy boundary file
//! - `bus`: the single-owner serial bus actor and its RTU transport
//! - `telemetry`: last-good register snapshot plus bus health metrics
//! - `inbox`: latest-wins command mailbox and the inbound file watcher
//! - `flags`: shared control flags mirrored to legacy sidecar files
//! - `controllers`: the control loops (self-consumption, battery, watchdog,
//!   scheduled services)
//! - `scheduler`: cooperative timed dispatcher for all controllers

pub mod boundary;
pub mod bus;
pub mod config;
pub mod controllers;
pub mod error;
pub mod flags;
pub mod inbox;
pub mod logging;
pub mod scheduler;
pub mod telemetry;

// Re-export commonly used types
pub use config::Config;
pub use error::{HelionError, Result};
pub use scheduler::Scheduler;
