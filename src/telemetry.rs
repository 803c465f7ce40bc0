//! Last-known-good telemetry and bus health metrics
//!
//! The bus actor is the only writer of [`TelemetrySnapshot`]; controllers
//! receive cheap read-only clones through a `tokio::sync::watch` channel, and
//! external observers read the rendered document from the `FromSnapshot`
//! boundary file.

use crate::boundary::{self, TagDoc};
use std::collections::BTreeMap;

/// Bus health counters published alongside the register values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusMetrics {
    pub read_ok: u64,
    pub read_err: u64,
    pub write_ok: u64,
    pub write_err: u64,
    pub resyncs: u64,
    pub last_reset_iso: String,
    pub last_writer_id: String,
    pub foreign_frames_total: u64,
    pub foreign_alert: bool,
    pub foreign_last_iso: String,
}

/// Immutable view of the last-good register values plus health metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    /// Legacy display timestamp (`%d/%m/%Y %H:%M:%S`)
    pub timestamp: String,

    /// ISO-8601 timestamp of the publish
    pub ts_iso: String,

    /// Whether at least one chunk read succeeded this cycle
    pub bus_ok: bool,

    /// Last-good value per polled register
    pub registers: BTreeMap<u16, i64>,

    /// Health counters
    pub metrics: BusMetrics,
}

impl TelemetrySnapshot {
    /// Last-good value of a register, if it has ever been read.
    pub fn get(&self, register: u16) -> Option<i64> {
        self.registers.get(&register).copied()
    }

    /// Render the snapshot as the boundary tag document. Register entries
    /// follow `read_order`; registers never read yet are published as 0, as
    /// legacy observers expect every configured tag to be present.
    pub fn render(&self, read_order: &[u16]) -> String {
        let mut doc = TagDoc::new("rootmain");
        doc.push("DATA", &self.timestamp);
        doc.push("BUS_OK", if self.bus_ok { "1" } else { "0" });
        doc.push("TS_ISO", &self.ts_iso);
        doc.push("READ_OK_TOTAL", self.metrics.read_ok);
        doc.push("READ_ERR_TOTAL", self.metrics.read_err);
        doc.push("WRITE_OK_TOTAL", self.metrics.write_ok);
        doc.push("WRITE_ERR_TOTAL", self.metrics.write_err);
        doc.push("RESYNCS", self.metrics.resyncs);
        doc.push("LAST_RESET_ISO", &self.metrics.last_reset_iso);
        doc.push("WRITER_LAST_ID", &self.metrics.last_writer_id);
        doc.push("FOREIGN_FRAMES_TOTAL", self.metrics.foreign_frames_total);
        doc.push("FOREIGN_ALERT", if self.metrics.foreign_alert { "1" } else { "0" });
        doc.push("FOREIGN_LAST_ISO", &self.metrics.foreign_last_iso);
        for addr in read_order {
            doc.push(&addr.to_string(), self.get(*addr).unwrap_or(0));
        }
        doc.render()
    }

    /// Parse a rendered snapshot document back into a snapshot. Meta tags are
    /// matched by name; every numeric tag becomes a register entry.
    pub fn parse(text: &str) -> Self {
        let mut snapshot = TelemetrySnapshot {
            timestamp: boundary::extract_tag(text, "DATA").unwrap_or("").to_string(),
            ts_iso: boundary::extract_tag(text, "TS_ISO").unwrap_or("").to_string(),
            bus_ok: boundary::extract_tag(text, "BUS_OK") == Some("1"),
            registers: BTreeMap::new(),
            metrics: BusMetrics {
                read_ok: parse_counter(text, "READ_OK_TOTAL"),
                read_err: parse_counter(text, "READ_ERR_TOTAL"),
                write_ok: parse_counter(text, "WRITE_OK_TOTAL"),
                write_err: parse_counter(text, "WRITE_ERR_TOTAL"),
                resyncs: parse_counter(text, "RESYNCS"),
                last_reset_iso: boundary::extract_tag(text, "LAST_RESET_ISO")
                    .unwrap_or("")
                    .to_string(),
                last_writer_id: boundary::extract_tag(text, "WRITER_LAST_ID")
                    .unwrap_or("")
                    .to_string(),
                foreign_frames_total: parse_counter(text, "FOREIGN_FRAMES_TOTAL"),
                foreign_alert: boundary::extract_tag(text, "FOREIGN_ALERT") == Some("1"),
                foreign_last_iso: boundary::extract_tag(text, "FOREIGN_LAST_ISO")
                    .unwrap_or("")
                    .to_string(),
            },
        };

        for (tag, value) in numeric_tags(text) {
            snapshot.registers.insert(tag, value);
        }

        snapshot
    }
}

fn parse_counter(text: &str, tag: &str) -> u64 {
    boundary::extract_tag(text, tag)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Scan for `<N>value</N>` entries whose tag name is entirely numeric.
fn numeric_tags(text: &str) -> Vec<(u16, i64)> {
    let mut out = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'<' {
            i += 1;
            continue;
        }
        let Some(close_angle) = text[i + 1..].find('>') else {
            break;
        };
        let tag = &text[i + 1..i + 1 + close_angle];
        i += 1 + close_angle + 1;
        if tag.is_empty() || !tag.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        if let (Ok(addr), Some(value)) = (tag.parse::<u16>(), boundary::extract_register(text, tag))
        {
            out.push((addr, value));
        }
    }
    out
}
