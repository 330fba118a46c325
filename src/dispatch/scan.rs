//! The dispatcher scan loop
//!
//! The loop repeats "scans" until no worker is busy and the source has no
//! more blocks. Each scan decides one action per worker, runs the whole
//! batch through the transaction executor, applies the outcomes, then
//! sleeps until the earliest worker needs attention again.
//!
//! `decide` is a pure function of worker state, the clock, and the policy's
//! admission verdict; every side effect lives in the post handlers, which
//! run on the driver thread after `sync` returns.

use crate::config::{DispatchConfig, DistributionMode, InputMode};
use crate::dispatch::policy::Policy;
use crate::dispatch::worker::{wma, WorkerNode};
use crate::error::{ConfigError, DispatchError, Result, SourceError};
use crate::exec::{many, sync, Transaction, TxKind, TxStatus};
use crate::remote::{self, quote, RunKey, TaskState};
use crate::source::{Block, BlockSource};
use crate::workspace::Workspace;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Longest the loop will sleep between scans
const SCAN_WAKE_CAP: Duration = Duration::from_secs(60);

/// Shortest inter-scan sleep when any wait happens at all
const MIN_SLEEP: Duration = Duration::from_secs(1);

/// Growth factor applied to a completed task's runtime when tuning the next
/// poll interval: aim to poll shortly after the task should be done.
const POLL_TUNE_FACTOR: f64 = 1.1 / 4.0;

/// Safety factor applied to observed CHECK round trips
const POLL_TIMEOUT_FACTOR: f64 = 1.5;

/// The single action a scan may take against one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NextAction {
    Fetch,
    Check,
    Start,
    Wait,
}

/// Pure decision: what, if anything, should happen to this worker now?
pub(crate) fn decide(
    worker: &WorkerNode,
    now: Instant,
    may_accept: bool,
    has_more: bool,
) -> NextAction {
    if worker.excluded() {
        return NextAction::Wait;
    }
    if worker.block.is_some() {
        if worker.done {
            return NextAction::Fetch;
        }
        let due = match worker.polled {
            None => true,
            Some(at) => at + Duration::from_secs(worker.poll_interval) <= now,
        };
        if due {
            NextAction::Check
        } else {
            NextAction::Wait
        }
    } else if may_accept && has_more {
        NextAction::Start
    } else {
        NextAction::Wait
    }
}

/// Per-worker numbers for the final summary
#[derive(Debug, Clone)]
pub struct WorkerSummary {
    pub hostname: String,
    pub completed: u64,
    pub errors: u32,
    pub excluded: bool,
}

/// Result of a completed dispatch
#[derive(Debug, Clone)]
pub struct DispatchResult {
    /// Blocks fetched successfully
    pub completed: u64,

    /// Blocks abandoned because every worker was excluded
    pub lost: u64,

    /// Output bytes written locally
    pub bytes_fetched: u64,

    /// Workers excluded during the run (including init drops)
    pub excluded: usize,

    /// Wall time of the whole dispatch
    pub duration: Duration,

    /// Per-worker breakdown
    pub workers: Vec<WorkerSummary>,
}

/// Drives blocks from the source across the worker fleet
pub struct Dispatcher {
    key: RunKey,
    task: String,
    task_success_code: i32,
    concurrency: usize,
    cleanup_remote: bool,
    init_file: Option<PathBuf>,
    init_script: Option<PathBuf>,
    policy: Policy,
    workers: Vec<WorkerNode>,
    source: BlockSource,
    workspace: Workspace,
    completed: u64,
    lost: u64,
    bytes_fetched: u64,
    started: Instant,
}

impl Dispatcher {
    /// Build the dispatcher from a validated configuration: run key,
    /// workspace, block source, worker fleet, and distribution policy.
    pub fn new(config: DispatchConfig) -> Result<Self> {
        let key = RunKey::generate();

        let mut workspace = match config.input_mode {
            InputMode::Lines => {
                Workspace::for_lines(&config.temp_directory, config.output.as_deref(), &key)?
            }
            InputMode::Files => {
                let dir = config
                    .output
                    .as_ref()
                    .ok_or(ConfigError::OutputDirRequired)?;
                Workspace::for_files(&config.temp_directory, dir)?
            }
        };

        let source = match config.input_mode {
            InputMode::Files => BlockSource::files(config.input_files.clone()),
            InputMode::Lines => {
                let input = config.line_input.as_ref().ok_or(ConfigError::EmptyInput {
                    input: "<stdin>".to_string(),
                })?;
                BlockSource::lines(input, config.blocksize, config.shuffle, &mut workspace)?
            }
        };

        let policy = match config.distribution_mode {
            DistributionMode::Performance => Policy::Performance,
            DistributionMode::Failover => {
                let total_blocks = source.len().map_err(|e| match e {
                    DispatchError::Source(SourceError::LenUnavailable) => {
                        DispatchError::Config(ConfigError::FailoverNeedsLength)
                    }
                    other => other,
                })?;
                Policy::Failover { total_blocks }
            }
        };

        let workers = config
            .machines
            .iter()
            .map(WorkerNode::from_config)
            .collect();

        Ok(Self {
            key,
            task: config.task,
            task_success_code: config.task_success_code,
            concurrency: config.concurrency,
            cleanup_remote: config.cleanup_remote,
            init_file: config.init_file,
            init_script: config.init_script,
            policy,
            workers,
            source,
            workspace,
            completed: 0,
            lost: 0,
            bytes_fetched: 0,
            started: Instant::now(),
        })
    }

    /// Run identifier used to namespace remote and local temp files
    pub fn key(&self) -> &RunKey {
        &self.key
    }

    /// Run initialization and the scan loop to completion
    pub fn run(mut self) -> Result<DispatchResult> {
        self.started = Instant::now();
        info!(
            host = "localhost",
            key = %self.key,
            workers = self.workers.len(),
            "Dispatch starting"
        );

        self.initialize()?;
        let outcome = self.scan_loop();

        if self.cleanup_remote {
            self.cleanup_workers();
        }
        self.source.close();
        self.workspace.cleanup();
        outcome?;

        let result = self.result();
        info!(
            host = "localhost",
            completed = result.completed,
            lost = result.lost,
            "Dispatch finished"
        );
        Ok(result)
    }

    // ----- initialization phase -----

    /// Broadcast the optional init payloads, dropping workers that fail
    fn initialize(&mut self) -> Result<()> {
        if let Some(path) = self.init_file.clone() {
            self.broadcast(&path, false);
        }
        if let Some(path) = self.init_script.clone() {
            self.broadcast(&path, true);
        }
        if self.workers.iter().all(|w| w.excluded()) {
            return Err(DispatchError::NoWorkers {
                reason: "every worker failed initialization".to_string(),
            });
        }
        Ok(())
    }

    fn broadcast(&mut self, payload: &Path, execute: bool) {
        let name = payload
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "init".to_string());
        let name = quote(&name);

        info!(
            host = "localhost",
            payload = %payload.display(),
            execute,
            "Broadcasting initialization payload"
        );

        let finished = many(&self.workers, self.concurrency, |i, w| {
            if w.excluded() {
                return None;
            }
            let wd = quote(&w.wd);
            let cmd = if execute {
                format!(
                    "mkdir -p {wd} && cd {wd} && cat > {name} && chmod a+x {name} && ./{name}"
                )
            } else {
                format!("mkdir -p {wd} && cd {wd} && cat > {name}")
            };
            Some(
                Transaction::for_worker(i, w, cmd, Duration::from_secs(w.init_timeout), TxKind::Init)
                    .stdin(payload.to_path_buf())
                    .retries(1),
            )
        });

        for trans in finished {
            if trans.status == TxStatus::Success {
                debug!(host = %trans.hostname, "Worker initialized");
            } else {
                warn!(
                    host = %trans.hostname,
                    status = ?trans.status,
                    "Initialization failed; dropping worker"
                );
                self.workers[trans.worker].exclude();
            }
        }
    }

    // ----- scan loop -----

    fn scan_loop(&mut self) -> Result<()> {
        loop {
            if self.workers.iter().all(|w| w.excluded()) {
                let lost = self.source.abandon(&mut self.workspace);
                self.lost += lost;
                if lost > 0 {
                    warn!(
                        host = "localhost",
                        lost,
                        "All workers excluded; abandoning remaining blocks"
                    );
                }
                return Ok(());
            }

            let now = Instant::now();
            let good = self.workers.iter().filter(|w| !w.excluded()).count();

            let mut batch = Vec::new();
            for index in 0..self.workers.len() {
                let has_more = self.source.has_more();
                let worker = &self.workers[index];
                let may_accept = self.policy.may_accept(worker, good);
                match decide(worker, now, may_accept, has_more) {
                    NextAction::Fetch => batch.push(self.fetch_transaction(index)),
                    NextAction::Check => batch.push(self.check_transaction(index)),
                    NextAction::Start => {
                        if let Some(trans) = self.start_transaction(index)? {
                            batch.push(trans);
                        }
                    }
                    NextAction::Wait => {}
                }
            }

            let finished = sync(batch, self.concurrency);
            for trans in finished {
                self.apply(trans)?;
            }

            let busy = self
                .workers
                .iter()
                .any(|w| !w.excluded() && w.block.is_some());
            if !busy && !self.source.has_more() {
                return Ok(());
            }

            self.sleep_until_next_wake();
        }
    }

    /// Sleep until the earliest worker needs attention. A worker with no
    /// poll timestamp forces an immediate re-scan.
    fn sleep_until_next_wake(&mut self) {
        let has_more = self.source.has_more();
        let now = Instant::now();
        let mut wake = now + SCAN_WAKE_CAP;

        for worker in &self.workers {
            if worker.excluded() {
                continue;
            }
            // Idle workers only matter while blocks remain to hand out.
            if worker.block.is_none() && !has_more {
                continue;
            }
            match worker.polled {
                None => return,
                Some(at) => {
                    wake = wake.min(at + Duration::from_secs(worker.poll_interval));
                }
            }
        }

        let sleep = wake.saturating_duration_since(now).max(MIN_SLEEP);
        trace!(host = "localhost", seconds = sleep.as_secs(), "Sleeping until next scan");
        thread::sleep(sleep);
    }

    // ----- transaction construction -----

    fn start_transaction(&mut self, index: usize) -> Result<Option<Transaction>> {
        let block = match self.source.next(&mut self.workspace) {
            Ok(block) => block,
            Err(DispatchError::Source(SourceError::Exhausted)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let worker = &self.workers[index];
        let cmd = remote::start_command(&worker.wd, &self.key, &self.task);
        let timeout = worker.scaled_upload_timeout(block.size());
        let stdin = block.input().to_path_buf();
        debug!(
            host = %worker.hostname,
            block = %block.desc(),
            bytes = block.size(),
            "Starting block"
        );
        Ok(Some(
            Transaction::for_worker(index, worker, cmd, timeout, TxKind::Start { block })
                .stdin(stdin),
        ))
    }

    fn check_transaction(&self, index: usize) -> Transaction {
        let worker = &self.workers[index];
        let cmd = remote::check_command(&worker.wd, &self.key);
        Transaction::for_worker(
            index,
            worker,
            cmd,
            Duration::from_secs(worker.poll_timeout),
            TxKind::Check,
        )
    }

    fn fetch_transaction(&mut self, index: usize) -> Transaction {
        let out_tmp = self.workspace.create_temp();
        let err_tmp = self.workspace.create_temp();
        let worker = &self.workers[index];
        let cmd = remote::fetch_command(&worker.wd, &self.key);
        let block_size = worker.block.as_ref().map(|b| b.size()).unwrap_or(0);
        Transaction::for_worker(
            index,
            worker,
            cmd,
            worker.scaled_download_timeout(block_size),
            TxKind::Fetch {
                out_tmp: out_tmp.clone(),
                err_tmp: err_tmp.clone(),
            },
        )
        .stdout(out_tmp)
        .stderr(err_tmp)
    }

    // ----- post handlers -----

    fn apply(&mut self, trans: Transaction) -> Result<()> {
        let Transaction {
            worker,
            kind,
            status,
            output,
            elapsed,
            ..
        } = trans;
        match kind {
            TxKind::Start { block } => {
                self.start_post(worker, status, &output, elapsed, block);
                Ok(())
            }
            TxKind::Check => {
                self.check_post(worker, status, &output, elapsed);
                Ok(())
            }
            TxKind::Fetch { out_tmp, err_tmp } => {
                self.fetch_post(worker, status, elapsed, &out_tmp, &err_tmp)
            }
            // Init and cleanup batches consume their own results.
            TxKind::Init | TxKind::Cleanup => Ok(()),
        }
    }

    fn start_post(
        &mut self,
        index: usize,
        status: TxStatus,
        output: &str,
        elapsed: Duration,
        block: Block,
    ) {
        let now = Instant::now();
        match status {
            TxStatus::Success => match output.trim().parse::<u64>() {
                Ok(mtime) => {
                    let worker = &mut self.workers[index];
                    worker.upload_timeout = wma(elapsed.as_secs_f64(), Some(worker.upload_timeout));
                    worker.upload_size = block.size();
                    worker.start = mtime;
                    worker.heartbeat = 0;
                    worker.remote_size = None;
                    worker.done = false;
                    worker.polled = Some(now);
                    info!(host = %worker.hostname, block = %block.desc(), "Task started");
                    worker.block = Some(block);
                }
                Err(_) => {
                    // A "successful" START with no usable timestamp cannot
                    // be tracked; treat it like any other failed start.
                    warn!(
                        host = %self.workers[index].hostname,
                        output = %output.trim(),
                        "START returned no usable timestamp"
                    );
                    self.fail_start(index, block);
                }
            },
            TxStatus::Timeout => {
                self.workers[index].double_upload_timeout();
                warn!(host = %self.workers[index].hostname, block = %block.desc(), "START timed out");
                self.fail_start(index, block);
            }
            _ => {
                warn!(host = %self.workers[index].hostname, block = %block.desc(), "START failed");
                self.fail_start(index, block);
            }
        }
    }

    fn fail_start(&mut self, index: usize, block: Block) {
        self.source.retry(block);
        if self.workers[index].error() {
            self.note_excluded(index);
        }
    }

    fn check_post(&mut self, index: usize, status: TxStatus, output: &str, elapsed: Duration) {
        let now = Instant::now();
        match status {
            TxStatus::Success => {
                match remote::parse_check(output) {
                    Some(report) => match report.state {
                        TaskState::Done { exit_code, size }
                            if exit_code == Some(self.task_success_code) =>
                        {
                            let worker = &mut self.workers[index];
                            let run_secs = report.heartbeat.saturating_sub(worker.start) as f64;
                            worker.poll_interval =
                                wma(run_secs * POLL_TUNE_FACTOR, Some(worker.poll_interval));
                            worker.heartbeat = report.heartbeat;
                            worker.remote_size = size;
                            worker.done = true;
                            worker.polled = None;
                            debug!(host = %worker.hostname, "Task complete; fetch pending");
                        }
                        TaskState::Done { exit_code, .. } => {
                            warn!(
                                host = %self.workers[index].hostname,
                                code = ?exit_code,
                                expected = self.task_success_code,
                                "Task finished with unexpected exit code; retrying block"
                            );
                            let worker = &mut self.workers[index];
                            let block = worker.block.take();
                            worker.done = false;
                            worker.polled = None;
                            if let Some(block) = block {
                                self.source.retry(block);
                            }
                            if self.workers[index].error() {
                                self.note_excluded(index);
                            }
                        }
                        TaskState::Running(_) => {
                            let worker = &mut self.workers[index];
                            if report.heartbeat != worker.heartbeat {
                                trace!(host = %worker.hostname, heartbeat = report.heartbeat, "Task alive");
                                worker.heartbeat = report.heartbeat;
                                worker.polled = Some(now);
                            } else {
                                warn!(
                                    host = %worker.hostname,
                                    heartbeat = worker.heartbeat,
                                    "Heartbeat frozen; remote monitor presumed dead"
                                );
                                self.remote_failure(index, now);
                            }
                        }
                    },
                    None => {
                        warn!(
                            host = %self.workers[index].hostname,
                            output = %output.trim(),
                            "Malformed CHECK response"
                        );
                        self.remote_failure(index, now);
                    }
                }
                let worker = &mut self.workers[index];
                worker.poll_timeout = wma(
                    elapsed.as_secs_f64() * POLL_TIMEOUT_FACTOR,
                    Some(worker.poll_timeout),
                );
            }
            TxStatus::Timeout => {
                self.workers[index].double_poll_timeout();
                warn!(host = %self.workers[index].hostname, "CHECK timed out");
                self.remote_failure(index, now);
            }
            _ => {
                warn!(host = %self.workers[index].hostname, "CHECK failed");
                self.remote_failure(index, now);
            }
        }
    }

    /// A failed or implausible CHECK: charge the worker an error. An
    /// excluded worker gives its block back; otherwise the block stays
    /// assigned and the next poll will tell.
    fn remote_failure(&mut self, index: usize, now: Instant) {
        if self.workers[index].error() {
            self.note_excluded(index);
            let worker = &mut self.workers[index];
            worker.done = false;
            if let Some(block) = worker.block.take() {
                self.source.retry(block);
            }
        } else {
            self.workers[index].polled = Some(now);
        }
    }

    fn fetch_post(
        &mut self,
        index: usize,
        status: TxStatus,
        elapsed: Duration,
        out_tmp: &Path,
        err_tmp: &Path,
    ) -> Result<()> {
        match status {
            TxStatus::Success => {
                let Some(block) = self.workers[index].block.take() else {
                    warn!(host = %self.workers[index].hostname, "Fetch completed with no block assigned");
                    self.workspace.remove_temp(out_tmp);
                    self.workspace.remove_temp(err_tmp);
                    return Ok(());
                };
                let hostname = self.workers[index].hostname.clone();
                let written = self.workspace.write(&hostname, &block, out_tmp, err_tmp)?;

                let worker = &mut self.workers[index];
                worker.download_timeout =
                    wma(elapsed.as_secs_f64(), Some(worker.download_timeout));
                worker.download_size = block.size();
                worker.completed += 1;
                worker.reset_errors();
                worker.done = false;
                worker.polled = None;
                worker.remote_size = None;

                info!(host = %hostname, block = %block.desc(), bytes = written, "Block fetched");
                self.completed += 1;
                self.bytes_fetched += written;
                self.source.done(block, &mut self.workspace);
            }
            TxStatus::Timeout => {
                self.workers[index].double_download_timeout();
                warn!(host = %self.workers[index].hostname, "FETCH timed out");
                self.fail_fetch(index, out_tmp, err_tmp);
            }
            _ => {
                warn!(host = %self.workers[index].hostname, "FETCH failed");
                self.fail_fetch(index, out_tmp, err_tmp);
            }
        }
        Ok(())
    }

    fn fail_fetch(&mut self, index: usize, out_tmp: &Path, err_tmp: &Path) {
        self.workspace.remove_temp(out_tmp);
        self.workspace.remove_temp(err_tmp);

        let worker = &mut self.workers[index];
        worker.done = false;
        worker.polled = None;
        if let Some(block) = worker.block.take() {
            self.source.retry(block);
        }
        if self.workers[index].error() {
            self.note_excluded(index);
        }
    }

    fn note_excluded(&self, index: usize) {
        let worker = &self.workers[index];
        warn!(
            host = %worker.hostname,
            errors = worker.errors(),
            "Worker excluded after repeated failures"
        );
    }

    // ----- teardown -----

    /// Opt-in destructive sweep of each surviving worker's working directory
    fn cleanup_workers(&mut self) {
        info!(host = "localhost", "Cleaning up remote working directories");
        let finished = many(&self.workers, self.concurrency, |i, w| {
            if w.excluded() {
                return None;
            }
            let cmd = remote::cleanup_command(&w.wd);
            Some(Transaction::for_worker(
                i,
                w,
                cmd,
                Duration::from_secs(w.init_timeout),
                TxKind::Cleanup,
            ))
        });
        for trans in finished {
            if trans.status != TxStatus::Success {
                warn!(host = %trans.hostname, status = ?trans.status, "Remote cleanup failed");
            }
        }
    }

    fn result(&self) -> DispatchResult {
        DispatchResult {
            completed: self.completed,
            lost: self.lost,
            bytes_fetched: self.bytes_fetched,
            excluded: self.workers.iter().filter(|w| w.excluded()).count(),
            duration: self.started.elapsed(),
            workers: self
                .workers
                .iter()
                .map(|w| WorkerSummary {
                    hostname: w.hostname.clone(),
                    completed: w.completed,
                    errors: w.errors(),
                    excluded: w.excluded(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineConfig;

    fn node() -> WorkerNode {
        WorkerNode::from_config(&MachineConfig {
            hostname: "w".to_string(),
            username: None,
            wd: ".".to_string(),
            connect_cmd: "ssh".to_string(),
            poll_interval: 10,
            poll_timeout: 5,
            upload_timeout: 20,
            download_timeout: 20,
            init_timeout: 20,
        })
    }

    #[test]
    fn test_decide_idle_starts_when_admitted() {
        let w = node();
        let now = Instant::now();
        assert_eq!(decide(&w, now, true, true), NextAction::Start);
        assert_eq!(decide(&w, now, false, true), NextAction::Wait);
        assert_eq!(decide(&w, now, true, false), NextAction::Wait);
    }

    #[test]
    fn test_decide_done_fetches_regardless_of_poll_schedule() {
        let mut w = node();
        w.block = Some(Block::for_file(PathBuf::from("x")));
        w.done = true;
        w.polled = Some(Instant::now());
        assert_eq!(decide(&w, Instant::now(), true, true), NextAction::Fetch);
    }

    #[test]
    fn test_decide_running_checks_when_due() {
        let mut w = node();
        w.block = Some(Block::for_file(PathBuf::from("x")));
        w.poll_interval = 1000;

        let now = Instant::now();
        w.polled = Some(now);
        assert_eq!(decide(&w, now, true, true), NextAction::Wait);

        // No poll timestamp means "act immediately".
        w.polled = None;
        assert_eq!(decide(&w, now, true, true), NextAction::Check);

        w.poll_interval = 0;
        w.polled = Some(now);
        assert_eq!(decide(&w, now, true, true), NextAction::Check);
    }

    #[test]
    fn test_decide_excluded_never_acts() {
        let mut w = node();
        for _ in 0..10 {
            w.error();
        }
        assert!(w.excluded());
        assert_eq!(decide(&w, Instant::now(), true, true), NextAction::Wait);
    }
}
