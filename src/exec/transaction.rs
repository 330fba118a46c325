//! One remote command attempt, and the pool that runs batches of them
//!
//! A transaction assembles a local shell line of the form
//!
//! ```text
//!   [< stdin] <connect_cmd> [user@]host '<remote command>' [> stdout] [2> stderr]
//! ```
//!
//! (each redirection present only when that stream targets a file), runs it
//! under `sh -c`, polls the child once per second against a deadline, and
//! kills it on expiry. All outcomes are reported through `TxStatus`; the
//! executor itself never fails. Timeouts are retried up to the transaction's
//! retry budget; a non-zero exit is terminal for the attempt.

use crate::dispatch::worker::WorkerNode;
use crate::remote::quote;
use crate::source::Block;
use crossbeam_channel::bounded;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Granularity of the child-exit poll
const POLL_TICK: Duration = Duration::from_secs(1);

/// Outcome of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Not yet run
    Incomplete,
    /// Child exited with the transaction's success code
    Success,
    /// Deadline expired on the final attempt; the child was killed
    Timeout,
    /// Child exited with any other code, or could not be run at all
    Error,
}

/// Dispatcher state carried through the executor.
///
/// The scan loop matches on this tag after `sync` returns to run the right
/// post handler; executor threads never touch it.
#[derive(Debug)]
pub enum TxKind {
    /// Initialization broadcast
    Init,
    /// Block upload + task start; owns the block until the worker accepts it
    Start { block: Block },
    /// Liveness / completion poll
    Check,
    /// Output download into two local temp files
    Fetch { out_tmp: PathBuf, err_tmp: PathBuf },
    /// Destructive remote cleanup
    Cleanup,
}

impl TxKind {
    /// Short tag for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Start { .. } => "start",
            Self::Check => "check",
            Self::Fetch { .. } => "fetch",
            Self::Cleanup => "cleanup",
        }
    }
}

/// One attempt at one remote shell command
#[derive(Debug)]
pub struct Transaction {
    /// Index of the target worker in the dispatcher's fleet
    pub worker: usize,

    /// Hostname, for log tagging
    pub hostname: String,

    /// Opaque transport prefix
    transport: String,

    /// `user@host` or bare `host`
    destination: String,

    /// The remote command, not yet quoted
    remote_command: String,

    /// Wall-clock budget per attempt
    pub timeout: Duration,

    /// Extra attempts allowed after a timeout
    retries: u32,

    /// Exit code counted as success
    success_code: i32,

    /// Local file fed to the remote command's stdin
    stdin_path: Option<PathBuf>,

    /// Local file capturing remote stdout (piped and captured when absent)
    stdout_path: Option<PathBuf>,

    /// Local file capturing remote stderr (piped into the log when absent)
    stderr_path: Option<PathBuf>,

    /// Dispatcher state tag
    pub kind: TxKind,

    /// Resolved outcome
    pub status: TxStatus,

    /// Captured stdout of the final attempt (empty when redirected)
    pub output: String,

    /// Wall time of the final attempt
    pub elapsed: Duration,
}

impl Transaction {
    /// Build a transaction against one worker
    pub fn for_worker(
        index: usize,
        worker: &WorkerNode,
        remote_command: String,
        timeout: Duration,
        kind: TxKind,
    ) -> Self {
        Self {
            worker: index,
            hostname: worker.hostname.clone(),
            transport: worker.connect_cmd.clone(),
            destination: worker.destination(),
            remote_command,
            timeout,
            retries: 0,
            success_code: 0,
            stdin_path: None,
            stdout_path: None,
            stderr_path: None,
            kind,
            status: TxStatus::Incomplete,
            output: String::new(),
            elapsed: Duration::ZERO,
        }
    }

    /// Extra attempts after a timeout
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Feed this local file to the remote command's stdin
    pub fn stdin(mut self, path: PathBuf) -> Self {
        self.stdin_path = Some(path);
        self
    }

    /// Redirect remote stdout into this local file
    pub fn stdout(mut self, path: PathBuf) -> Self {
        self.stdout_path = Some(path);
        self
    }

    /// Redirect remote stderr into this local file
    pub fn stderr(mut self, path: PathBuf) -> Self {
        self.stderr_path = Some(path);
        self
    }

    /// The full local shell line
    fn local_command(&self) -> String {
        let mut cmd = String::new();
        if let Some(p) = &self.stdin_path {
            cmd.push_str(&format!("< {} ", quote(&p.to_string_lossy())));
        }
        cmd.push_str(&self.transport);
        cmd.push(' ');
        cmd.push_str(&self.destination);
        cmd.push(' ');
        cmd.push_str(&quote(&self.remote_command));
        if let Some(p) = &self.stdout_path {
            cmd.push_str(&format!(" > {}", quote(&p.to_string_lossy())));
        }
        if let Some(p) = &self.stderr_path {
            cmd.push_str(&format!(" 2> {}", quote(&p.to_string_lossy())));
        }
        cmd
    }

    /// Run to resolution, retrying timeouts while the budget allows
    pub fn run(&mut self) {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.run_once();
            if self.status == TxStatus::Timeout && attempt <= self.retries {
                debug!(
                    host = %self.hostname,
                    kind = self.kind.name(),
                    attempt,
                    "Transaction timed out, retrying"
                );
                continue;
            }
            break;
        }
    }

    /// One attempt: spawn, poll at 1s ticks, kill on deadline
    fn run_once(&mut self) {
        let local = self.local_command();
        trace!(host = %self.hostname, kind = self.kind.name(), command = %local, "Running transaction");

        let started = Instant::now();
        let mut child = match Command::new("sh")
            .arg("-c")
            .arg(&local)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(host = %self.hostname, kind = self.kind.name(), error = %e, "Failed to spawn transport");
                self.status = TxStatus::Error;
                self.elapsed = started.elapsed();
                return;
            }
        };

        // Drain the pipes from their own threads so a chatty command can
        // never fill a pipe buffer and wedge the child.
        let stdout_reader = child.stdout.take().map(spawn_reader);
        let stderr_reader = child.stderr.take().map(spawn_reader);

        let deadline = started + self.timeout;
        let exit = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        let _ = child.kill();
                        let _ = child.wait();
                        break None;
                    }
                    thread::sleep(POLL_TICK.min(remaining));
                }
                Err(e) => {
                    warn!(host = %self.hostname, kind = self.kind.name(), error = %e, "Failed to poll transport");
                    let _ = child.kill();
                    let _ = child.wait();
                    break None;
                }
            }
        };

        // A killed transport can leave descendants holding the pipe ends;
        // joining the readers would block until those die. The threads are
        // abandoned to drain the pipes on their own.
        let (output, stderr_text) = if exit.is_some() {
            (
                stdout_reader.map(join_reader).unwrap_or_default(),
                stderr_reader.map(join_reader).unwrap_or_default(),
            )
        } else {
            (String::new(), String::new())
        };
        self.output = output;
        self.elapsed = started.elapsed();

        self.status = match exit {
            Some(status) if status.code() == Some(self.success_code) => TxStatus::Success,
            Some(status) => {
                debug!(
                    host = %self.hostname,
                    kind = self.kind.name(),
                    code = ?status.code(),
                    stderr = %stderr_text.trim(),
                    "Transaction failed"
                );
                TxStatus::Error
            }
            None => TxStatus::Timeout,
        };
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut stream: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = String::new();
        let _ = stream.read_to_string(&mut buf);
        buf
    })
}

fn join_reader(handle: thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

/// Run a batch of transactions with at most `concurrency` in flight.
///
/// Returns only when every member is resolved. There is no ordering
/// guarantee between transactions within a batch.
pub fn sync(batch: Vec<Transaction>, concurrency: usize) -> Vec<Transaction> {
    let total = batch.len();
    if total == 0 {
        return batch;
    }

    let pool_size = concurrency.clamp(1, total);
    let (work_tx, work_rx) = bounded::<Transaction>(total);
    let (done_tx, done_rx) = bounded::<Transaction>(total);

    for trans in batch {
        // Both channel sides are held locally; sending cannot fail here.
        let _ = work_tx.send(trans);
    }
    drop(work_tx);

    let mut slots = Vec::with_capacity(pool_size);
    for slot in 0..pool_size {
        let rx = work_rx.clone();
        let tx = done_tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("kssh-tx-{slot}"))
            .spawn(move || {
                while let Ok(mut trans) = rx.recv() {
                    trans.run();
                    if tx.send(trans).is_err() {
                        break;
                    }
                }
            });
        match spawned {
            Ok(handle) => slots.push(handle),
            Err(e) => warn!(host = "localhost", error = %e, "Failed to spawn executor thread"),
        }
    }

    // Degraded fallback: with no pool at all, resolve the batch inline.
    if slots.is_empty() {
        let mut finished = Vec::with_capacity(total);
        while let Ok(mut trans) = work_rx.try_recv() {
            trans.run();
            finished.push(trans);
        }
        return finished;
    }
    drop(done_tx);

    let mut finished = Vec::with_capacity(total);
    while let Ok(trans) = done_rx.recv() {
        finished.push(trans);
    }
    for handle in slots {
        let _ = handle.join();
    }
    finished
}

/// Build one transaction per worker and run them as a batch. Workers the
/// builder skips (returns `None` for) get no transaction.
pub fn many<F>(workers: &[WorkerNode], concurrency: usize, mut build: F) -> Vec<Transaction>
where
    F: FnMut(usize, &WorkerNode) -> Option<Transaction>,
{
    let batch: Vec<Transaction> = workers
        .iter()
        .enumerate()
        .filter_map(|(i, w)| build(i, w))
        .collect();
    sync(batch, concurrency)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineConfig;

    /// Transport stand-in: a shell one-liner that drops the destination
    /// argument ($1) and runs the quoted remote command ($2) locally.
    const LOCAL_TRANSPORT: &str = r#"sh -c 'exec sh -c "$2"' --"#;

    fn local_worker() -> WorkerNode {
        WorkerNode::from_config(&MachineConfig {
            hostname: "testhost".to_string(),
            username: None,
            wd: ".".to_string(),
            connect_cmd: LOCAL_TRANSPORT.to_string(),
            poll_interval: 1,
            poll_timeout: 5,
            upload_timeout: 5,
            download_timeout: 5,
            init_timeout: 5,
        })
    }

    #[test]
    fn test_local_command_shape() {
        let w = local_worker();
        let t = Transaction::for_worker(
            0,
            &w,
            "echo hi".to_string(),
            Duration::from_secs(5),
            TxKind::Check,
        )
        .stdin(PathBuf::from("/tmp/in"))
        .stdout(PathBuf::from("/tmp/out"))
        .stderr(PathBuf::from("/tmp/err"));

        let cmd = t.local_command();
        assert!(cmd.starts_with(&format!("< /tmp/in {LOCAL_TRANSPORT} testhost ")));
        assert!(cmd.ends_with(" > /tmp/out 2> /tmp/err"));
        // The remote command is quoted exactly once, as a single argument.
        assert!(cmd.contains("'echo hi'"));
    }

    #[test]
    fn test_success_captures_stdout() {
        let w = local_worker();
        let mut t = Transaction::for_worker(
            0,
            &w,
            "echo captured".to_string(),
            Duration::from_secs(10),
            TxKind::Check,
        );
        t.run();

        assert_eq!(t.status, TxStatus::Success);
        assert_eq!(t.output.trim(), "captured");
        assert!(t.elapsed < Duration::from_secs(10));
    }

    #[test]
    fn test_nonzero_exit_is_error() {
        let w = local_worker();
        let mut t = Transaction::for_worker(
            0,
            &w,
            "exit 7".to_string(),
            Duration::from_secs(10),
            TxKind::Check,
        );
        t.run();
        assert_eq!(t.status, TxStatus::Error);
    }

    #[test]
    fn test_deadline_kills_child() {
        let w = local_worker();
        let mut t = Transaction::for_worker(
            0,
            &w,
            "sleep 30".to_string(),
            Duration::from_secs(1),
            TxKind::Check,
        );
        let started = Instant::now();
        t.run();

        assert_eq!(t.status, TxStatus::Timeout);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_stdout_redirection() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("captured.txt");

        let w = local_worker();
        let mut t = Transaction::for_worker(
            0,
            &w,
            "echo redirected".to_string(),
            Duration::from_secs(10),
            TxKind::Check,
        )
        .stdout(out.clone());
        t.run();

        assert_eq!(t.status, TxStatus::Success);
        assert_eq!(t.output, "");
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "redirected\n");
    }

    #[test]
    fn test_sync_resolves_every_member() {
        let w = local_worker();
        let batch: Vec<Transaction> = (0..8)
            .map(|i| {
                Transaction::for_worker(
                    i,
                    &w,
                    format!("echo {i}"),
                    Duration::from_secs(10),
                    TxKind::Check,
                )
            })
            .collect();

        let finished = sync(batch, 3);
        assert_eq!(finished.len(), 8);
        assert!(finished.iter().all(|t| t.status == TxStatus::Success));

        let mut seen: Vec<usize> = finished.iter().map(|t| t.worker).collect();
        seen.sort();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_sync_bounds_parallelism() {
        let dir = tempfile::tempdir().unwrap();

        // Each transaction records its own start/end instants; the maximum
        // interval overlap is the peak concurrency.
        let w = local_worker();
        let batch: Vec<Transaction> = (0..6)
            .map(|i| {
                let script = format!(
                    "date +%s.%N > {d}/start_{i}; sleep 1; date +%s.%N > {d}/end_{i}",
                    d = dir.path().display()
                );
                Transaction::for_worker(i, &w, script, Duration::from_secs(30), TxKind::Check)
            })
            .collect();

        let finished = sync(batch, 2);
        assert_eq!(finished.len(), 6);
        assert!(finished.iter().all(|t| t.status == TxStatus::Success));

        let stamp = |name: String| -> f64 {
            std::fs::read_to_string(dir.path().join(name))
                .unwrap()
                .trim()
                .parse()
                .unwrap()
        };
        let mut events: Vec<(f64, i32)> = Vec::new();
        for i in 0..6 {
            events.push((stamp(format!("start_{i}")), 1));
            events.push((stamp(format!("end_{i}")), -1));
        }
        events.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut live = 0;
        let mut peak = 0;
        for (_, delta) in events {
            live += delta;
            peak = peak.max(live);
        }
        assert!(peak <= 2, "peak concurrency {peak} exceeded the bound");
    }
}
