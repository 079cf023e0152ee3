//! Ring-buffer log sink.
//!
//! Keeps the most recent records in memory so they can be dumped over a
//! debug channel after the fact. Installed as the `log` backend by
//! [`init`]; nothing here ever blocks or allocates more than one record.

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Mutex;

const MAX_LOG_ENTRIES: usize = 64;

/// One captured record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: Level,
    pub message: String,
}

/// `log::Log` implementation backed by a fixed-size ring.
pub struct RingLogger {
    entries: Mutex<VecDeque<LogRecord>>,
}

impl RingLogger {
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
        }
    }

    fn push(&self, record: LogRecord) {
        let mut entries = self.entries.lock();
        if entries.len() == MAX_LOG_ENTRIES {
            entries.pop_front();
        }
        entries.push_back(record);
    }
}

impl Default for RingLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl Log for RingLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        self.push(LogRecord {
            level: record.level(),
            message: format!("[ICSSG] {}", record.args()),
        });
    }

    fn flush(&self) {}
}

static LOGGER: RingLogger = RingLogger::new();

/// Install the ring logger as the global `log` backend.
///
/// Safe to call more than once; later calls only adjust the level.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

/// Snapshot of the captured records, oldest first.
pub fn records() -> Vec<LogRecord> {
    LOGGER.entries.lock().iter().cloned().collect()
}

/// Number of records currently held.
pub fn log_count() -> usize {
    LOGGER.entries.lock().len()
}

/// Check whether any captured record contains `needle`.
pub fn contains(needle: &str) -> bool {
    LOGGER.entries.lock().iter().any(|r| r.message.contains(needle))
}
