//! Per-worker state and adaptive estimators
//!
//! A `WorkerNode` is the dispatcher's exclusive record for one remote
//! machine: identity, the block it currently holds, its heartbeat history,
//! an error budget, and four adaptive timeouts tuned by a weighted moving
//! average of observed behavior.

use crate::config::MachineConfig;
use crate::source::Block;
use std::time::{Duration, Instant};

/// Weight of the newest sample in the moving average
const WMA_WEIGHT: f64 = 0.75;

/// Lower clamp for every adaptive estimate (seconds)
pub const MIN_ESTIMATE_SECS: u64 = 1;

/// Upper clamp for every adaptive estimate (seconds)
pub const MAX_ESTIMATE_SECS: u64 = 300;

/// Errors tolerated before a worker is excluded
pub const MAX_ERRORS: u32 = 5;

/// Weighted moving average of an estimate, floored and clamped to
/// `[MIN_ESTIMATE_SECS, MAX_ESTIMATE_SECS]`. With no previous value the
/// clamped sample stands alone.
pub fn wma(sample_secs: f64, previous: Option<u64>) -> u64 {
    let blended = match previous {
        Some(prev) => WMA_WEIGHT * sample_secs + (1.0 - WMA_WEIGHT) * prev as f64,
        None => sample_secs,
    };
    (blended.floor() as i64).clamp(MIN_ESTIMATE_SECS as i64, MAX_ESTIMATE_SECS as i64) as u64
}

/// Coarse view of a worker's position in the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// No assignment; may accept a block
    Idle,
    /// A block is uploaded and its task is (believed) running
    Running,
    /// The task finished; results await a fetch
    Done,
    /// Quarantined; no further transactions are issued
    Excluded,
}

/// Exclusive state for one remote machine
#[derive(Debug)]
pub struct WorkerNode {
    /// Hostname the transport connects to
    pub hostname: String,

    /// Login name, when configured
    pub username: Option<String>,

    /// Remote working directory
    pub wd: String,

    /// Opaque transport prefix
    pub connect_cmd: String,

    /// Adaptive timeout for initialization transactions (seconds)
    pub init_timeout: u64,

    /// Adaptive timeout for START transactions (seconds)
    pub upload_timeout: u64,

    /// Adaptive timeout for FETCH transactions (seconds)
    pub download_timeout: u64,

    /// Adaptive timeout for CHECK transactions (seconds)
    pub poll_timeout: u64,

    /// Seconds between liveness polls, tuned toward the task's runtime
    pub poll_interval: u64,

    /// Size of the last uploaded block, for timeout scaling
    pub upload_size: u64,

    /// Size of the last downloaded result, for timeout scaling
    pub download_size: u64,

    /// The block currently assigned to this worker
    pub block: Option<Block>,

    /// Remote epoch seconds of the pid file when START returned
    pub start: u64,

    /// Task finished; fetch pending
    pub done: bool,

    /// When this worker was last polled; `None` means act immediately
    pub polled: Option<Instant>,

    /// Last observed pid-file mtime
    pub heartbeat: u64,

    /// Result size reported by a completed task, when present
    pub remote_size: Option<u64>,

    /// Blocks fetched successfully from this worker
    pub completed: u64,

    /// Consecutive-ish error count; reset by a successful fetch
    errors: u32,

    /// Sticky quarantine flag
    excluded: bool,
}

impl WorkerNode {
    pub fn from_config(config: &MachineConfig) -> Self {
        Self {
            hostname: config.hostname.clone(),
            username: config.username.clone(),
            wd: config.wd.clone(),
            connect_cmd: config.connect_cmd.clone(),
            init_timeout: config.init_timeout,
            upload_timeout: config.upload_timeout,
            download_timeout: config.download_timeout,
            poll_timeout: config.poll_timeout,
            poll_interval: config.poll_interval,
            upload_size: 0,
            download_size: 0,
            block: None,
            start: 0,
            done: false,
            polled: None,
            heartbeat: 0,
            remote_size: None,
            completed: 0,
            errors: 0,
            excluded: false,
        }
    }

    /// `user@host`, or the bare hostname when no login name is configured
    pub fn destination(&self) -> String {
        match &self.username {
            Some(user) => format!("{user}@{}", self.hostname),
            None => self.hostname.clone(),
        }
    }

    pub fn state(&self) -> WorkerState {
        if self.excluded {
            WorkerState::Excluded
        } else if self.block.is_none() {
            WorkerState::Idle
        } else if self.done {
            WorkerState::Done
        } else {
            WorkerState::Running
        }
    }

    /// Record one error; past the budget the worker is excluded for good.
    /// Returns the exclusion flag.
    pub fn error(&mut self) -> bool {
        self.errors += 1;
        if self.errors > MAX_ERRORS {
            self.excluded = true;
        }
        self.excluded
    }

    /// Errors are assumed temporally correlated; a completed round is
    /// sufficient evidence of recovery.
    pub fn reset_errors(&mut self) {
        self.errors = 0;
    }

    pub fn errors(&self) -> u32 {
        self.errors
    }

    pub fn excluded(&self) -> bool {
        self.excluded
    }

    /// Quarantine without touching the error count (used when an init
    /// transaction drops the worker from the fleet).
    pub fn exclude(&mut self) {
        self.excluded = true;
    }

    /// START timeout for a block of this size
    pub fn scaled_upload_timeout(&self, block_size: u64) -> Duration {
        scaled(self.upload_timeout, self.upload_size, block_size)
    }

    /// FETCH timeout for a block of this size
    pub fn scaled_download_timeout(&self, block_size: u64) -> Duration {
        scaled(self.download_timeout, self.download_size, block_size)
    }

    pub fn double_upload_timeout(&mut self) {
        self.upload_timeout = (self.upload_timeout * 2).min(MAX_ESTIMATE_SECS);
    }

    pub fn double_download_timeout(&mut self) {
        self.download_timeout = (self.download_timeout * 2).min(MAX_ESTIMATE_SECS);
    }

    pub fn double_poll_timeout(&mut self) {
        self.poll_timeout = (self.poll_timeout * 2).min(MAX_ESTIMATE_SECS);
    }
}

/// Scale a stored per-size estimate to a new payload size. An unknown
/// previous size (or an empty block) leaves the estimate untouched.
fn scaled(estimate_secs: u64, previous_size: u64, block_size: u64) -> Duration {
    if previous_size == 0 || block_size == 0 {
        return Duration::from_secs(estimate_secs);
    }
    let secs = estimate_secs as f64 * block_size as f64 / previous_size as f64;
    Duration::from_secs((secs.ceil() as u64).max(MIN_ESTIMATE_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn node() -> WorkerNode {
        WorkerNode::from_config(&MachineConfig {
            hostname: "w1".to_string(),
            username: Some("batch".to_string()),
            wd: "/scratch".to_string(),
            connect_cmd: "ssh".to_string(),
            poll_interval: 10,
            poll_timeout: 5,
            upload_timeout: 20,
            download_timeout: 20,
            init_timeout: 20,
        })
    }

    #[test]
    fn test_wma_blends_toward_sample() {
        assert_eq!(wma(10.0, Some(20)), 12); // 7.5 + 5.0
        assert_eq!(wma(4.0, Some(4)), 4);
    }

    #[test]
    fn test_wma_without_previous_is_clamped_sample() {
        assert_eq!(wma(42.9, None), 42);
        assert_eq!(wma(0.2, None), MIN_ESTIMATE_SECS);
        assert_eq!(wma(10_000.0, None), MAX_ESTIMATE_SECS);
    }

    #[test]
    fn test_wma_zero_sample_keeps_quarter_of_previous() {
        assert_eq!(wma(0.0, Some(100)), 25);
        // Floor of the blended remainder, never below the minimum.
        assert_eq!(wma(0.0, Some(2)), MIN_ESTIMATE_SECS);
    }

    #[test]
    fn test_error_budget_and_sticky_exclusion() {
        let mut w = node();
        for _ in 0..MAX_ERRORS {
            assert!(!w.error());
        }
        assert!(!w.excluded());

        // The sixth error tips it over.
        assert!(w.error());
        assert!(w.excluded());

        // Resetting errors never un-excludes.
        w.reset_errors();
        assert!(w.excluded());
        assert_eq!(w.state(), WorkerState::Excluded);
    }

    #[test]
    fn test_state_transitions() {
        let mut w = node();
        assert_eq!(w.state(), WorkerState::Idle);

        w.block = Some(Block::for_file(PathBuf::from("in.txt")));
        assert_eq!(w.state(), WorkerState::Running);

        w.done = true;
        assert_eq!(w.state(), WorkerState::Done);
    }

    #[test]
    fn test_destination() {
        let mut w = node();
        assert_eq!(w.destination(), "batch@w1");
        w.username = None;
        assert_eq!(w.destination(), "w1");
    }

    #[test]
    fn test_scaled_timeouts() {
        let mut w = node();
        // Nothing uploaded yet: the stored estimate stands.
        assert_eq!(w.scaled_upload_timeout(1 << 20), Duration::from_secs(20));

        w.upload_size = 1 << 20;
        // Twice the payload, twice the budget.
        assert_eq!(w.scaled_upload_timeout(2 << 20), Duration::from_secs(40));
        // Tiny payloads never drop below the floor.
        assert_eq!(w.scaled_upload_timeout(1), Duration::from_secs(1));
    }

    #[test]
    fn test_timeout_doubling_saturates() {
        let mut w = node();
        w.upload_timeout = 200;
        w.double_upload_timeout();
        assert_eq!(w.upload_timeout, MAX_ESTIMATE_SECS);
    }
}
