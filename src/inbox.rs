//! Latest-wins setpoint command mailbox
//!
//! Controllers and the `ToSource` boundary watcher submit commands here; the
//! bus actor drains them. The inbox holds at most one command: a new
//! submission unconditionally replaces any command not yet executed, so the
//! inverter always receives the most recent intent and never a backlog.

use crate::boundary;
use crate::logging::get_logger;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;

/// Controller-assigned command ids wrap at this bound, like the legacy
/// writers the external observers already understand.
const ID_WRAP: u64 = 6000;

/// How a command is written to the inverter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Single register write (function 6)
    WriteSingle,
    /// Single register write followed by a commit-register write
    WriteWithCommit,
}

/// One setpoint command for the bus actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetpointCommand {
    /// Monotonic identifier; echoed back as `WRITER_LAST_ID` on success
    pub id: String,
    pub kind: CommandKind,
    /// Logical register address
    pub register: u16,
    /// Signed value; negative setpoints travel as two's-complement u16
    pub value: i16,
}

/// Single-slot, latest-wins mailbox shared by all producers.
#[derive(Default)]
pub struct CommandInbox {
    slot: Mutex<Option<SetpointCommand>>,
    next_id: AtomicU64,
}

impl CommandInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace whatever is pending with `cmd`.
    pub fn submit(&self, cmd: SetpointCommand) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(cmd);
    }

    /// Submit a controller-originated single write, assigning the next id.
    pub fn submit_write(&self, register: u16, value: i16) -> String {
        let id = self.allocate_id();
        self.submit(SetpointCommand {
            id: id.clone(),
            kind: CommandKind::WriteSingle,
            register,
            value,
        });
        id
    }

    /// Take the pending command, leaving the slot empty.
    pub fn take(&self) -> Option<SetpointCommand> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.take()
    }

    /// Whether a command is waiting to be executed.
    pub fn has_pending(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn allocate_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) % ID_WRAP;
        n.to_string()
    }
}

/// Polls the `ToSource` boundary file and forwards valid commands.
pub struct SourceWatcher {
    inbox: std::sync::Arc<CommandInbox>,
    path: PathBuf,
    poll_interval: Duration,
    last_seen_id: String,
    logger: crate::logging::StructuredLogger,
}

impl SourceWatcher {
    pub fn new(
        inbox: std::sync::Arc<CommandInbox>,
        path: PathBuf,
        poll_interval: Duration,
    ) -> Self {
        Self {
            inbox,
            path,
            poll_interval,
            last_seen_id: String::new(),
            logger: get_logger("inbox_watcher"),
        }
    }

    /// One poll of the boundary file. Unknown or malformed commands are
    /// rejected with a log line but their ID is still consumed, so a broken
    /// producer cannot wedge the watcher into a re-parse loop.
    pub fn poll_once(&mut self) {
        let Ok(text) = std::fs::read_to_string(&self.path) else {
            return;
        };

        let id = boundary::extract_tag(&text, "ID").unwrap_or("").to_string();
        if id.is_empty() || id == self.last_seen_id {
            return;
        }

        let cmd = boundary::extract_tag(&text, "CMD").unwrap_or("");
        let kind = match cmd {
            "07" => CommandKind::WriteSingle,
            "09" => CommandKind::WriteWithCommit,
            other => {
                self.logger
                    .warn(&format!("Rejecting command ID={}: invalid CMD '{}'", id, other));
                self.last_seen_id = id;
                return;
            }
        };

        let register = boundary::extract_register(&text, "IND").unwrap_or(0);
        let value = boundary::extract_register(&text, "VAL").unwrap_or(0);
        let (Ok(register), Ok(value)) = (u16::try_from(register), i16::try_from(value)) else {
            self.logger.warn(&format!(
                "Rejecting command ID={}: IND/VAL out of range",
                id
            ));
            self.last_seen_id = id;
            return;
        };

        self.logger.debug(&format!(
            "Command ID={} register={} value={}",
            id, register, value
        ));
        self.inbox.submit(SetpointCommand {
            id: id.clone(),
            kind,
            register,
            value,
        });
        self.last_seen_id = id;
    }

    /// Watcher loop; exits when the shutdown flag flips to true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.logger
            .info(&format!("Watching {} for commands", self.path.display()));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {
                    self.poll_once();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.logger.info("Inbox watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn latest_submission_wins() {
        let inbox = CommandInbox::new();
        inbox.submit_write(1101, 100);
        inbox.submit_write(1101, 250);
        let cmd = inbox.take().unwrap();
        assert_eq!(cmd.value, 250);
        assert!(inbox.take().is_none());
    }

    #[test]
    fn ids_are_monotonic_and_wrap() {
        let inbox = CommandInbox::new();
        let a = inbox.submit_write(1101, 1);
        let b = inbox.submit_write(1101, 2);
        assert_ne!(a, b);
        assert_eq!(a, "0");
        assert_eq!(b, "1");
    }

    #[test]
    fn take_empties_the_slot() {
        let inbox = CommandInbox::new();
        assert!(!inbox.has_pending());
        inbox.submit_write(1102, 3);
        assert!(inbox.has_pending());
        inbox.take();
        assert!(!inbox.has_pending());
    }

    fn write_command_file(path: &std::path::Path, id: &str, cmd: &str, ind: i64, val: i64) {
        let text = format!(
            "<?xml version='1.0'?><rootmain><ID>{id}</ID><CMD>{cmd}</CMD><IND>{ind}</IND><VAL>{val}</VAL></rootmain>"
        );
        std::fs::write(path, text).unwrap();
    }

    #[test]
    fn watcher_posts_and_dedups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ToSource.xml");
        let inbox = Arc::new(CommandInbox::new());
        let mut watcher =
            SourceWatcher::new(inbox.clone(), path.clone(), Duration::from_millis(10));

        write_command_file(&path, "7", "07", 1101, -500);
        watcher.poll_once();
        let cmd = inbox.take().unwrap();
        assert_eq!(cmd.id, "7");
        assert_eq!(cmd.kind, CommandKind::WriteSingle);
        assert_eq!(cmd.register, 1101);
        assert_eq!(cmd.value, -500);

        // same ID again: ignored
        watcher.poll_once();
        assert!(inbox.take().is_none());

        // new ID with commit kind
        write_command_file(&path, "8", "09", 1102, 1);
        watcher.poll_once();
        let cmd = inbox.take().unwrap();
        assert_eq!(cmd.kind, CommandKind::WriteWithCommit);
    }

    #[test]
    fn watcher_rejects_unknown_cmd_but_consumes_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ToSource.xml");
        let inbox = Arc::new(CommandInbox::new());
        let mut watcher =
            SourceWatcher::new(inbox.clone(), path.clone(), Duration::from_millis(10));

        write_command_file(&path, "9", "05", 1101, 10);
        watcher.poll_once();
        assert!(inbox.take().is_none());

        // the bad ID was consumed, so a valid retry under a new ID works
        write_command_file(&path, "10", "07", 1101, 10);
        watcher.poll_once();
        assert!(inbox.take().is_some());
    }
}
