//! Single-owner serial bus server
//!
//! One actor owns the RTU link. Every poll cycle it drains the command inbox
//! (latest wins), walks the configured read set in adaptive chunks, publishes
//! the telemetry snapshot to the watch channel and the boundary file, and
//! appends a CSV row. Foreign-master interference is tracked in a sliding
//! window and surfaced through the snapshot instead of surfacing as a cascade
//! of unexplained read failures.

use crate::config::Config;
use crate::error::{HelionError, Result};
use crate::inbox::{CommandInbox, CommandKind, SetpointCommand};
use crate::logging::get_logger;
use crate::telemetry::{BusMetrics, TelemetrySnapshot};
use chrono::Local;
use rand::Rng;
use std::collections::{BTreeMap, VecDeque};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

pub mod transport;

use transport::BusTransport;

/// Bus actor lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Initializing,
    WarmingUp,
    Running,
    Reopening,
}

/// The serial bus actor.
pub struct SerialBus {
    transport: Box<dyn BusTransport>,
    config_rx: watch::Receiver<Arc<Config>>,
    inbox: Arc<CommandInbox>,
    snapshot_tx: watch::Sender<Arc<TelemetrySnapshot>>,

    state: BusState,
    last_good: BTreeMap<u16, i64>,

    read_ok: u64,
    read_err: u64,
    write_ok: u64,
    write_err: u64,
    resyncs: u64,
    last_reset_iso: String,
    last_writer_id: String,

    foreign_times: VecDeque<Instant>,
    foreign_frames_total: u64,
    foreign_last_iso: String,

    csv: Option<CsvLog>,
    logger: crate::logging::StructuredLogger,
}

impl SerialBus {
    pub fn new(
        transport: Box<dyn BusTransport>,
        config_rx: watch::Receiver<Arc<Config>>,
        inbox: Arc<CommandInbox>,
        snapshot_tx: watch::Sender<Arc<TelemetrySnapshot>>,
    ) -> Self {
        Self {
            transport,
            config_rx,
            inbox,
            snapshot_tx,
            state: BusState::Initializing,
            last_good: BTreeMap::new(),
            read_ok: 0,
            read_err: 0,
            write_ok: 0,
            write_err: 0,
            resyncs: 0,
            last_reset_iso: String::new(),
            last_writer_id: String::new(),
            foreign_times: VecDeque::new(),
            foreign_frames_total: 0,
            foreign_last_iso: String::new(),
            csv: None,
            logger: get_logger("bus"),
        }
    }

    /// Run the actor until shutdown. Failing to open the port on startup is
    /// the one fatal error; afterwards every failure recovers locally.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.open_with_warmup().await?;

        loop {
            let delay = self.poll_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = self.poll_cycle().await {
                        match e {
                            HelionError::Bus { .. } => {
                                self.logger.warn(&format!("Serial layer error: {}, reopening", e));
                                self.reopen().await;
                            }
                            other => {
                                self.logger.error(&format!("Poll cycle failed: {}", other));
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.transport.close().await;
        self.logger.info("Bus actor stopped");
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BusState {
        self.state
    }

    fn config(&self) -> Arc<Config> {
        self.config_rx.borrow().clone()
    }

    fn poll_delay(&self) -> Duration {
        let cfg = self.config();
        let base = cfg.bus.poll_ms as i64;
        let jitter = cfg.bus.poll_jitter_ms as i64;
        let offset = if jitter > 0 {
            rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            0
        };
        Duration::from_millis((base + offset).max(0) as u64)
    }

    /// Open the port, then warm the link up: settle delay, flush, a few
    /// throwaway reads of the first configured register, flush again.
    async fn open_with_warmup(&mut self) -> Result<()> {
        let cfg = self.config();
        self.transport.open().await?;
        self.state = BusState::WarmingUp;
        self.logger.info("Port open, warming up");

        tokio::time::sleep(Duration::from_millis(cfg.bus.startup_warmup_ms)).await;
        let _ = self.transport.flush().await;

        if let Some(&first) = cfg.registers.read_blocks.first() {
            let wire = wire_address(first, cfg.bus.address_correction);
            for _ in 0..cfg.bus.startup_dummy_reads {
                let _ = self.transport.read_registers(wire, 1).await;
                tokio::time::sleep(Duration::from_millis(cfg.bus.retry_backoff_ms)).await;
            }
        }
        let _ = self.transport.flush().await;

        self.state = BusState::Running;
        self.logger.info("Bus running");
        Ok(())
    }

    /// Close and reopen the link after a serial-layer exception.
    async fn reopen(&mut self) {
        self.state = BusState::Reopening;
        self.transport.close().await;
        self.resyncs += 1;
        self.last_reset_iso = now_iso();
        if let Err(e) = self.open_with_warmup().await {
            self.logger
                .error(&format!("Reopen failed, will retry next cycle: {}", e));
        }
    }

    /// One full poll cycle: drain the inbox, read the register set, publish.
    pub(crate) async fn poll_cycle(&mut self) -> Result<()> {
        let cfg = self.config();

        if let Some(cmd) = self.inbox.take() {
            self.execute_command(&cfg, cmd).await;
        }

        let any_ok = self.read_cycle(&cfg).await?;
        self.publish(&cfg, any_ok);

        if cfg.bus.csv_enable {
            self.csv_append(&cfg);
        }

        Ok(())
    }

    /// Execute the latest command with the retry/read-back ladder.
    async fn execute_command(&mut self, cfg: &Config, cmd: SetpointCommand) {
        let retries = cfg.bus.write_retries.max(1);
        let backoff = Duration::from_millis(cfg.bus.retry_backoff_ms);
        let mut ok = false;

        for _attempt in 0..retries {
            match self.write_with_commit(cfg, &cmd).await {
                Ok(()) => {
                    ok = true;
                    break;
                }
                Err(e) => {
                    self.logger
                        .warn(&format!("Write ID={} failed: {}", cmd.id, e));
                    if e.is_foreign_frame() {
                        self.note_foreign(cfg);
                    }
                    if cfg.bus.verify_writes && self.read_back_matches(cfg, &cmd).await {
                        self.logger.info(&format!(
                            "Write ID={} confirmed via read-back register={} value={}",
                            cmd.id, cmd.register, cmd.value
                        ));
                        ok = true;
                        break;
                    }
                    tokio::time::sleep(backoff).await;
                }
            }
        }

        if ok {
            self.last_writer_id = cmd.id.clone();
            self.write_ok += 1;
            self.logger.info(&format!(
                "Executed ID={} register={} value={}",
                cmd.id, cmd.register, cmd.value
            ));
        } else {
            self.write_err += 1;
            self.logger.error(&format!(
                "Command ID={} dropped after {} attempts",
                cmd.id, retries
            ));
        }
    }

    async fn write_with_commit(&mut self, cfg: &Config, cmd: &SetpointCommand) -> Result<()> {
        let wire = wire_address(cmd.register, cfg.bus.address_correction);
        self.transport.write_register(wire, cmd.value as u16).await?;
        self.gap(cfg).await;

        if cmd.kind == CommandKind::WriteWithCommit && cfg.bus.commit_register > 0 {
            let commit_wire = wire_address(cfg.bus.commit_register, cfg.bus.address_correction);
            self.transport
                .write_register(commit_wire, cfg.bus.commit_value)
                .await?;
            self.gap(cfg).await;
        }
        Ok(())
    }

    /// The inverter sometimes accepts a write whose reply frame is mangled; a
    /// read-back showing the requested value rescues the command.
    async fn read_back_matches(&mut self, cfg: &Config, cmd: &SetpointCommand) -> bool {
        let wire = wire_address(cmd.register, cfg.bus.address_correction);
        match self.transport.read_registers(wire, 1).await {
            Ok(regs) => {
                self.gap(cfg).await;
                regs.first().copied() == Some(cmd.value as u16)
            }
            Err(e) => {
                self.logger.warn(&format!("Read-back failed: {}", e));
                false
            }
        }
    }

    /// Walk the read set in maximal contiguous ranges split into chunks,
    /// retrying and halving chunk length on persistent failure.
    async fn read_cycle(&mut self, cfg: &Config) -> Result<bool> {
        let addrs = uniq_sorted(&cfg.registers.read_blocks);
        if addrs.is_empty() {
            return Ok(false);
        }

        let max_chunk = cfg.bus.read_max_chunk.max(1);
        let min_chunk = cfg.bus.read_min_chunk.max(1);
        let mut any_ok = false;

        for (range_start, range_len) in contiguous_ranges(&addrs) {
            for (start, len) in split_chunks(range_start, range_len, max_chunk) {
                let mut cur = len;
                loop {
                    if cur < min_chunk {
                        self.logger.warn(&format!(
                            "No answer for registers {}-{}",
                            start,
                            start + len - 1
                        ));
                        break;
                    }
                    match self.read_chunk_with_retry(cfg, start, cur).await? {
                        Some(regs) => {
                            self.read_ok += 1;
                            for (offset, value) in regs.iter().enumerate() {
                                self.last_good
                                    .insert(start + offset as u16, *value as i64);
                            }
                            any_ok = true;
                            break;
                        }
                        None => {
                            self.read_err += 1;
                            cur /= 2;
                        }
                    }
                }
            }
        }

        Ok(any_ok)
    }

    /// Up to `max_retry` attempts on one chunk. Returns `Ok(None)` when every
    /// attempt failed recoverably; serial-layer errors propagate so the actor
    /// can reopen the port.
    async fn read_chunk_with_retry(
        &mut self,
        cfg: &Config,
        start: u16,
        count: u16,
    ) -> Result<Option<Vec<u16>>> {
        let wire = wire_address(start, cfg.bus.address_correction);
        let backoff = Duration::from_millis(cfg.bus.retry_backoff_ms);

        for _ in 0..cfg.bus.max_retry.max(1) {
            match self.transport.read_registers(wire, count).await {
                Ok(regs) => {
                    self.gap(cfg).await;
                    return Ok(Some(regs));
                }
                Err(HelionError::Bus { message }) => {
                    return Err(HelionError::bus(message));
                }
                Err(e) => {
                    if e.is_foreign_frame() {
                        self.logger.warn(&format!("Bus read error: {}", e));
                        self.note_foreign(cfg);
                    }
                    tokio::time::sleep(backoff).await;
                }
            }
        }
        Ok(None)
    }

    async fn gap(&mut self, cfg: &Config) {
        tokio::time::sleep(Duration::from_millis(cfg.bus.rtu_gap_ms)).await;
    }

    /// Record a frame from another master and refresh the windowed alert.
    fn note_foreign(&mut self, cfg: &Config) {
        let now = Instant::now();
        self.foreign_times.push_back(now);
        self.prune_foreign(cfg, now);
        self.foreign_frames_total += 1;
        self.foreign_last_iso = now_iso();
        if self.foreign_alert(cfg) {
            self.logger
                .warn("Possible second master on the bus (foreign frames within window)");
        }
    }

    fn prune_foreign(&mut self, cfg: &Config, now: Instant) {
        let window = Duration::from_secs(cfg.bus.foreign_window_s);
        while let Some(&front) = self.foreign_times.front() {
            if now.duration_since(front) > window {
                self.foreign_times.pop_front();
            } else {
                break;
            }
        }
    }

    fn foreign_alert(&self, cfg: &Config) -> bool {
        self.foreign_times.len() >= cfg.bus.foreign_threshold
    }

    /// Build the snapshot, send it to the watch channel and replace the
    /// boundary file atomically.
    fn publish(&mut self, cfg: &Config, any_ok: bool) {
        self.prune_foreign(cfg, Instant::now());
        let now = Local::now();
        let snapshot = TelemetrySnapshot {
            timestamp: now.format("%d/%m/%Y %H:%M:%S").to_string(),
            ts_iso: now.format("%Y-%m-%dT%H:%M:%S").to_string(),
            bus_ok: any_ok,
            registers: self.last_good.clone(),
            metrics: BusMetrics {
                read_ok: self.read_ok,
                read_err: self.read_err,
                write_ok: self.write_ok,
                write_err: self.write_err,
                resyncs: self.resyncs,
                last_reset_iso: self.last_reset_iso.clone(),
                last_writer_id: self.last_writer_id.clone(),
                foreign_frames_total: self.foreign_frames_total,
                foreign_alert: self.foreign_alert(cfg),
                foreign_last_iso: self.foreign_last_iso.clone(),
            },
        };

        let read_order = uniq_sorted(&cfg.registers.read_blocks);
        let rendered = snapshot.render(&read_order);
        let _ = self.snapshot_tx.send(Arc::new(snapshot));

        if let Err(e) = crate::boundary::write_atomic(&cfg.paths.from_snapshot_path(), &rendered) {
            if cfg.bus.ignore_write_errors {
                self.logger
                    .warn(&format!("Snapshot file busy, dropping cycle: {}", e));
            } else {
                self.logger.error(&format!("Snapshot publish failed: {}", e));
            }
        }
    }

    fn csv_append(&mut self, cfg: &Config) {
        let columns = uniq_sorted(&cfg.registers.read_blocks);

        if self.csv.is_none() {
            match CsvLog::open(&cfg.paths.base_dir, &columns) {
                Ok(log) => {
                    self.logger.info(&format!("CSV log started: {}", log.path.display()));
                    self.csv = Some(log);
                }
                Err(e) => {
                    self.logger.warn(&format!("CSV open failed: {}", e));
                    return;
                }
            }
        }

        let mut row = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        for addr in &columns {
            row.push(',');
            if let Some(v) = self.last_good.get(addr) {
                row.push_str(&v.to_string());
            }
        }

        if let Some(log) = self.csv.as_mut() {
            if let Err(e) = log.append(&row) {
                self.logger.warn(&format!("CSV append failed: {}", e));
                self.csv = None;
                return;
            }
            if log.bytes >= cfg.bus.log_rollover_bytes {
                let finished = self.csv.take();
                if let Some(log) = finished {
                    match log.finish() {
                        Ok(path) => self.logger.info(&format!("CSV rolled over: {}", path.display())),
                        Err(e) => self.logger.warn(&format!("CSV rollover failed: {}", e)),
                    }
                }
            }
        }
    }
}

/// Translate a 1-based logical register address into the wire address.
pub(crate) fn wire_address(logical: u16, correction: i32) -> u16 {
    (logical as i32 - 1 + correction).clamp(0, u16::MAX as i32) as u16
}

/// Deduplicate and sort a register list.
pub(crate) fn uniq_sorted(addrs: &[u16]) -> Vec<u16> {
    let mut out: Vec<u16> = addrs.to_vec();
    out.sort_unstable();
    out.dedup();
    out
}

/// Split a sorted register list into maximal contiguous `(start, len)` ranges.
pub(crate) fn contiguous_ranges(sorted: &[u16]) -> Vec<(u16, u16)> {
    let mut out = Vec::new();
    let mut iter = sorted.iter().copied();
    let Some(mut start) = iter.next() else {
        return out;
    };
    let mut prev = start;
    for cur in iter {
        if cur != prev + 1 {
            out.push((start, prev - start + 1));
            start = cur;
        }
        prev = cur;
    }
    out.push((start, prev - start + 1));
    out
}

/// Split one range into chunks of at most `max_len` registers.
pub(crate) fn split_chunks(start: u16, len: u16, max_len: u16) -> Vec<(u16, u16)> {
    let mut out = Vec::new();
    let mut s = start;
    let end = start + len;
    while s < end {
        let ln = max_len.min(end - s);
        out.push((s, ln));
        s += ln;
    }
    out
}

fn now_iso() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Rolling CSV telemetry log.
struct CsvLog {
    file: std::fs::File,
    path: PathBuf,
    start: chrono::DateTime<Local>,
    bytes: u64,
}

impl CsvLog {
    fn open(base_dir: &Path, columns: &[u16]) -> Result<Self> {
        std::fs::create_dir_all(base_dir)?;
        let start = Local::now();
        let path = base_dir.join(format!("logfile_{}_.csv", start.format("%Y%m%d_%H%M%S")));
        let mut file = std::fs::File::create(&path)?;

        let mut header = "DATA".to_string();
        for addr in columns {
            header.push(',');
            header.push_str(&addr.to_string());
        }
        header.push('\n');
        file.write_all(header.as_bytes())?;

        let bytes = header.len() as u64;
        Ok(Self {
            file,
            path,
            start,
            bytes,
        })
    }

    fn append(&mut self, row: &str) -> Result<()> {
        self.file.write_all(row.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.bytes += row.len() as u64 + 1;
        Ok(())
    }

    /// Close the file and stamp its name with the covered interval.
    fn finish(self) -> Result<PathBuf> {
        let end = Local::now();
        let final_path = self.path.with_file_name(format!(
            "logfile_{}_to_{}.csv",
            self.start.format("%Y%m%d_%H%M%S"),
            end.format("%Y%m%d_%H%M%S")
        ));
        drop(self.file);
        std::fs::rename(&self.path, &final_path)?;
        Ok(final_path)
    }
}
