//! Remote execution protocol
//!
//! Each run owns a short KEY that namespaces four files in a worker's
//! working directory:
//!
//! ```text
//!   kssh_<KEY>_in    block input, uploaded by START
//!   kssh_<KEY>_out   task stdout
//!   kssh_<KEY>_err   task stderr
//!   kssh_<KEY>_pid   heartbeat / completion record
//! ```
//!
//! The protocol is four POSIX-sh wrappers around the user task:
//! - START saves stdin as the in-file, daemonizes a monitor that runs the
//!   task and heartbeats the pid file every second while it is alive, then
//!   records `Done,<exit_code>` on exit. START prints the pid file's
//!   initial mtime.
//! - CHECK prints `<mtime>,<pid-file-content>`. A changing mtime means the
//!   monitor is alive; a frozen one means it died.
//! - FETCH concatenates the out-file to stdout and the err-file to stderr.
//! - CLEANUP removes everything in the working directory (opt-in only).
//!
//! Filename and KEY substitution happens before the whole script is quoted
//! once as the transport's single command argument.

use shell_escape::escape;
use std::borrow::Cow;
use std::fmt;
use uuid::Uuid;

/// Short per-run identifier: 8 hex digits truncated from a UUID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunKey(String);

impl RunKey {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string()[..8].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Quote an arbitrary string for safe embedding in a POSIX-sh script
pub fn quote(s: &str) -> String {
    escape(Cow::Borrowed(s)).into_owned()
}

/// Name of one of the run's remote files
fn remote_file(key: &RunKey, suffix: &str) -> String {
    format!("kssh_{key}_{suffix}")
}

/// The START wrapper.
///
/// The monitor starts the task in the background to learn its PID, then
/// heartbeats that PID from a sibling loop while the monitor's foreground
/// `wait` collects the exit code (polling the PID directly would spin
/// forever on the zombie). The heartbeat loop is killed and reaped before
/// the terminal `Done,<code>` record is written so a late beat cannot
/// overwrite it.
pub fn start_command(wd: &str, key: &RunKey, task: &str) -> String {
    let f_in = remote_file(key, "in");
    let f_out = remote_file(key, "out");
    let f_err = remote_file(key, "err");
    let f_pid = remote_file(key, "pid");

    format!(
        "cd {wd} || exit 1; \
         cat > {f_in} || exit 1; \
         : > {f_pid}; \
         ( ( {task} ) < {f_in} > {f_out} 2> {f_err} & pid=$!; \
           ( while :; do printf '%s\\n' \"$pid\" > {f_pid}; sleep 1; done ) & hb=$!; \
           wait \"$pid\"; code=$?; \
           kill \"$hb\" 2>/dev/null; wait \"$hb\" 2>/dev/null; \
           printf 'Done,%s\\n' \"$code\" > {f_pid} \
         ) < /dev/null > /dev/null 2>&1 & \
         stat -c %Y {f_pid}",
        wd = quote(wd),
    )
}

/// The CHECK wrapper. Fails (non-zero exit) when the pid file is missing.
pub fn check_command(wd: &str, key: &RunKey) -> String {
    let f_pid = remote_file(key, "pid");
    format!(
        "cd {wd} || exit 1; \
         stat -c %Y {f_pid} 2>/dev/null | tr '\\n' ','; \
         cat {f_pid}",
        wd = quote(wd),
    )
}

/// The FETCH wrapper
pub fn fetch_command(wd: &str, key: &RunKey) -> String {
    let f_out = remote_file(key, "out");
    let f_err = remote_file(key, "err");
    format!(
        "cd {wd} || exit 1; cat {f_out}; cat {f_err} >&2",
        wd = quote(wd),
    )
}

/// The destructive CLEANUP wrapper. Only issued under `--cleanup-remote`.
/// The extra globs pick up dot-files, which `*` alone skips in POSIX sh.
pub fn cleanup_command(wd: &str) -> String {
    format!(
        "cd {wd} || exit 0; rm -rf -- ./* ./.[!.]* ./..?* 2>/dev/null; true",
        wd = quote(wd)
    )
}

/// What the pid file said the task is doing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// The monitor is still heartbeating; the payload is the task's PID
    Running(String),
    /// The task finished. START only ever writes the exit code, but the
    /// record format allows a trailing output size; missing fields stay
    /// `None` rather than failing the parse.
    Done {
        exit_code: Option<i32>,
        size: Option<u64>,
    },
}

/// One parsed CHECK response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    /// mtime of the pid file (seconds since epoch on the remote host)
    pub heartbeat: u64,
    pub state: TaskState,
}

/// Parse a CHECK response line: `<mtime>,<pid-or-Done[,exit_code[,size]]>`.
/// Returns `None` for anything that cannot carry a heartbeat and a state.
pub fn parse_check(line: &str) -> Option<CheckReport> {
    let mut fields = line.trim().split(',');

    let heartbeat = fields.next()?.trim().parse::<u64>().ok()?;
    let tag = fields.next()?.trim();
    if tag.is_empty() {
        return None;
    }

    let state = if tag == "Done" {
        TaskState::Done {
            exit_code: fields.next().and_then(|f| f.trim().parse().ok()),
            size: fields.next().and_then(|f| f.trim().parse().ok()),
        }
    } else {
        TaskState::Running(tag.to_string())
    };

    Some(CheckReport { heartbeat, state })
}
