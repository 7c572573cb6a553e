//! Per-connection counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const NEVER: u64 = u64::MAX;

/// Live counters updated by the connection's reader and writer
#[derive(Debug)]
pub(crate) struct StatsCounters {
    started: Instant,
    frames_written: AtomicU64,
    bytes_written: AtomicU64,
    frames_read: AtomicU64,
    bytes_read: AtomicU64,
    orphaned_responses: AtomicU64,
    cancelled_requests: AtomicU64,
    last_write_ms: AtomicU64,
    last_read_ms: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn new() -> Self {
        Self {
            started: Instant::now(),
            frames_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            frames_read: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            orphaned_responses: AtomicU64::new(0),
            cancelled_requests: AtomicU64::new(0),
            last_write_ms: AtomicU64::new(NEVER),
            last_read_ms: AtomicU64::new(NEVER),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(NEVER - 1)
    }

    pub(crate) fn record_write(&self, bytes: usize) {
        self.frames_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
        self.last_write_ms.store(self.elapsed_ms(), Ordering::Relaxed);
    }

    pub(crate) fn record_read(&self, bytes: usize) {
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
        self.last_read_ms.store(self.elapsed_ms(), Ordering::Relaxed);
    }

    pub(crate) fn record_frame_read(&self) {
        self.frames_read.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_orphan(&self) {
        self.orphaned_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancel(&self) {
        self.cancelled_requests.fetch_add(1, Ordering::Relaxed);
    }

    fn instant(&self, ms: &AtomicU64) -> Option<Instant> {
        match ms.load(Ordering::Relaxed) {
            NEVER => None,
            ms => Some(self.started + Duration::from_millis(ms)),
        }
    }

    pub(crate) fn snapshot(&self, pending_requests: usize) -> ConnectionStats {
        ConnectionStats {
            pending_requests,
            frames_written: self.frames_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            frames_read: self.frames_read.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            orphaned_responses: self.orphaned_responses.load(Ordering::Relaxed),
            cancelled_requests: self.cancelled_requests.load(Ordering::Relaxed),
            last_write: self.instant(&self.last_write_ms),
            last_read: self.instant(&self.last_read_ms),
        }
    }
}

/// Point-in-time connection statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Requests awaiting a response
    pub pending_requests: usize,

    /// Frames handed to the socket
    pub frames_written: u64,

    /// Bytes handed to the socket
    pub bytes_written: u64,

    /// Frames decoded from the socket
    pub frames_read: u64,

    /// Bytes received from the socket
    pub bytes_read: u64,

    /// Responses that matched no pending request
    pub orphaned_responses: u64,

    /// Requests cancelled or timed out by the caller
    pub cancelled_requests: u64,

    /// Most recent write
    pub last_write: Option<Instant>,

    /// Most recent read
    pub last_read: Option<Instant>,
}

impl ConnectionStats {
    /// Time since the most recent read, if anything was read
    #[must_use]
    pub fn read_idle(&self) -> Option<Duration> {
        self.last_read.map(|t| t.elapsed())
    }
}
