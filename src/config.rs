//! Configuration types for kssh
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - Machines-file (JSON) loading, including the `"default"` template entry
//! - Runtime configuration with validation

use crate::error::{ConfigError, ConfigResult};
use clap::Parser;
use rand::seq::SliceRandom;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Maximum reasonable transaction concurrency
const MAX_CONCURRENCY: usize = 256;

/// Default per-worker poll interval (seconds)
pub const DEFAULT_POLL_INTERVAL: u64 = 10;

/// Default CHECK transaction timeout (seconds)
pub const DEFAULT_POLL_TIMEOUT: u64 = 5;

/// Default START/FETCH/init transaction timeouts (seconds)
pub const DEFAULT_OP_TIMEOUT: u64 = 20;

/// Default transport prefix
const DEFAULT_CONNECT_CMD: &str = "ssh";

/// Dispatch a bulk workload across a fleet of remote machines
#[derive(Parser, Debug, Clone)]
#[command(
    name = "kssh",
    version,
    about = "Dispatch a bulk workload across remote machines over a shell transport",
    long_about = "Splits an input stream into line blocks (or takes whole files), uploads each \
                  block to a remote worker, runs a task on it there, and collects the outputs \
                  locally.\n\n\
                  Workers are described in a JSON machines file and reached through an opaque \
                  transport prefix (ssh by default). Blocks are retried on transient failure \
                  and chronically failing workers are quarantined.",
    after_help = "EXAMPLES:\n    \
        kssh -i urls.txt -b 100 -t './crawl.sh' -o results.txt\n    \
        kssh -i logs/ -t 'grep ERROR' -o hits/\n    \
        cat data.csv | kssh -i - -t 'cut -d, -f2' --machines fleet.json\n    \
        kssh -i '*.pcap' --distribution-mode failover -o decoded/"
)]
pub struct CliArgs {
    /// Input files, directories, glob patterns, or "-" for stdin
    #[arg(short = 'i', long = "input", value_name = "PATH", required = true, num_args = 1..)]
    pub input: Vec<String>,

    /// Lines per block in line mode (ignored in file mode)
    #[arg(short = 'b', long, default_value = "1000", value_name = "N")]
    pub blocksize: usize,

    /// Shuffle the input ordering before dispatch
    #[arg(long)]
    pub shuffle: bool,

    /// Path to the machines JSON file
    #[arg(short = 'm', long, default_value = ".machines", value_name = "PATH")]
    pub machines: PathBuf,

    /// Task shell fragment, or path to a file containing one
    #[arg(short = 't', long, default_value = "cat -", value_name = "CMD|PATH")]
    pub task: String,

    /// Exit code the task reports on success
    #[arg(long = "task-success-code", default_value = "0", value_name = "N")]
    pub task_success_code: i32,

    /// Block distribution policy
    #[arg(long = "distribution-mode", value_enum, default_value = "performance")]
    pub distribution_mode: DistributionMode,

    /// Directory for local temp files
    #[arg(long = "temp-directory", default_value = ".", value_name = "PATH")]
    pub temp_directory: PathBuf,

    /// Output file (line mode) or directory (file mode); stdout if omitted
    #[arg(short = 'o', long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Maximum transactions in flight
    #[arg(short = 'c', long, default_value = "10", value_name = "N")]
    pub concurrency: usize,

    /// File uploaded into every worker's working directory before dispatch
    #[arg(long = "init-file", value_name = "PATH")]
    pub init_file: Option<PathBuf>,

    /// Script uploaded to and executed on every worker before dispatch
    #[arg(long = "init-script", value_name = "PATH")]
    pub init_script: Option<PathBuf>,

    /// After dispatch, remove every file in each worker's working directory
    #[arg(long = "cleanup-remote")]
    pub cleanup_remote: bool,

    /// Verbose output (per-block progress and worker events)
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Quiet mode - suppress the header and summary
    #[arg(short = 'q', long)]
    pub quiet: bool,
}

/// How fresh blocks are offered to idle workers
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionMode {
    /// Any idle worker may take the next block; fast workers take more
    Performance,
    /// Bound each worker's share so the load stays proportional
    Failover,
}

/// How the input is cut into blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    /// A single stream split into blocks of `blocksize` lines
    Lines,
    /// A set of whole files, one block each
    Files,
}

/// One element of the machines JSON array, as written by the user.
///
/// All fields are optional here; `hostname` is enforced during resolution so
/// that the `"default"` template entry can omit it too.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MachineEntry {
    pub hostname: Option<String>,
    pub username: Option<String>,
    pub wd: Option<String>,
    pub connect_cmd: Option<String>,
    pub poll_interval: Option<u64>,
    pub poll_timeout: Option<u64>,
    pub upload_timeout: Option<u64>,
    pub download_timeout: Option<u64>,
    pub init_timeout: Option<u64>,
}

/// A fully resolved worker machine description
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Hostname the transport connects to
    pub hostname: String,

    /// Login name; the transport's own default applies when absent
    pub username: Option<String>,

    /// Remote working directory for this run's files
    pub wd: String,

    /// Opaque transport prefix, e.g. `ssh -o StrictHostKeyChecking=no`
    pub connect_cmd: String,

    /// Seconds between liveness polls
    pub poll_interval: u64,

    /// Initial CHECK timeout (seconds)
    pub poll_timeout: u64,

    /// Initial START timeout (seconds)
    pub upload_timeout: u64,

    /// Initial FETCH timeout (seconds)
    pub download_timeout: u64,

    /// Initialization transaction timeout (seconds)
    pub init_timeout: u64,
}

impl MachineConfig {
    /// Resolve a raw entry against the optional `"default"` template entry.
    fn resolve(index: usize, entry: &MachineEntry, template: &MachineEntry) -> ConfigResult<Self> {
        let hostname = entry
            .hostname
            .clone()
            .ok_or(ConfigError::MissingHostname { index })?;

        let pick = |own: &Option<u64>, tpl: &Option<u64>, fallback: u64| {
            own.or(*tpl).unwrap_or(fallback)
        };

        Ok(Self {
            hostname,
            username: entry.username.clone().or_else(|| template.username.clone()),
            wd: entry
                .wd
                .clone()
                .or_else(|| template.wd.clone())
                .unwrap_or_else(|| ".".to_string()),
            connect_cmd: entry
                .connect_cmd
                .clone()
                .or_else(|| template.connect_cmd.clone())
                .unwrap_or_else(|| DEFAULT_CONNECT_CMD.to_string()),
            poll_interval: pick(&entry.poll_interval, &template.poll_interval, DEFAULT_POLL_INTERVAL),
            poll_timeout: pick(&entry.poll_timeout, &template.poll_timeout, DEFAULT_POLL_TIMEOUT),
            upload_timeout: pick(&entry.upload_timeout, &template.upload_timeout, DEFAULT_OP_TIMEOUT),
            download_timeout: pick(
                &entry.download_timeout,
                &template.download_timeout,
                DEFAULT_OP_TIMEOUT,
            ),
            init_timeout: pick(&entry.init_timeout, &template.init_timeout, DEFAULT_OP_TIMEOUT),
        })
    }
}

/// Load and resolve the machines file.
///
/// The file is a JSON array of machine objects. An element whose hostname is
/// the literal `"default"` supplies values for keys the other elements omit
/// and is not itself a worker.
pub fn load_machines(path: &Path) -> ConfigResult<Vec<MachineConfig>> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::MachinesUnreadable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let entries: Vec<MachineEntry> =
        serde_json::from_str(&raw).map_err(|e| ConfigError::MachinesInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    let template = entries
        .iter()
        .find(|e| e.hostname.as_deref() == Some("default"))
        .cloned()
        .unwrap_or_default();

    let machines = entries
        .iter()
        .enumerate()
        .filter(|(_, e)| e.hostname.as_deref() != Some("default"))
        .map(|(i, e)| MachineConfig::resolve(i, e, &template))
        .collect::<ConfigResult<Vec<_>>>()?;

    if machines.is_empty() {
        return Err(ConfigError::NoMachines {
            path: path.to_path_buf(),
        });
    }

    Ok(machines)
}

/// Where line-mode input comes from
#[derive(Debug, Clone)]
pub enum LineInput {
    /// The process's standard input
    Stdin,
    /// A regular file
    File(PathBuf),
}

/// Validated runtime configuration
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Input mode (line blocks vs whole files)
    pub input_mode: InputMode,

    /// Line-mode input stream
    pub line_input: Option<LineInput>,

    /// File-mode input paths, expansion already applied
    pub input_files: Vec<PathBuf>,

    /// Lines per block (line mode)
    pub blocksize: usize,

    /// Shuffle input ordering
    pub shuffle: bool,

    /// Resolved worker machines
    pub machines: Vec<MachineConfig>,

    /// The task shell fragment run on each worker
    pub task: String,

    /// Exit code the task reports on success
    pub task_success_code: i32,

    /// Distribution policy selection
    pub distribution_mode: DistributionMode,

    /// Local temp-file directory
    pub temp_directory: PathBuf,

    /// Output file/directory; `None` means stdout (line mode only)
    pub output: Option<PathBuf>,

    /// Transaction executor concurrency
    pub concurrency: usize,

    /// Optional file broadcast to workers before dispatch
    pub init_file: Option<PathBuf>,

    /// Optional script broadcast to and run on workers before dispatch
    pub init_script: Option<PathBuf>,

    /// Run the destructive remote CLEANUP after dispatch
    pub cleanup_remote: bool,

    /// Print the header and summary blocks
    pub show_summary: bool,

    /// Verbose logging requested
    pub verbose: bool,
}

impl DispatchConfig {
    /// Create and validate configuration from CLI arguments
    pub fn from_args(args: CliArgs) -> ConfigResult<Self> {
        if args.blocksize == 0 {
            return Err(ConfigError::InvalidBlocksize { size: args.blocksize });
        }
        if args.concurrency == 0 || args.concurrency > MAX_CONCURRENCY {
            return Err(ConfigError::InvalidConcurrency {
                value: args.concurrency,
                max: MAX_CONCURRENCY,
            });
        }

        let machines = load_machines(&args.machines)?;
        let task = resolve_task(&args.task)?;

        for payload in [&args.init_file, &args.init_script].into_iter().flatten() {
            if !payload.is_file() {
                return Err(ConfigError::InitPayloadMissing {
                    path: payload.clone(),
                });
            }
        }

        if !args.temp_directory.is_dir() {
            return Err(ConfigError::InvalidTempDir {
                path: args.temp_directory.clone(),
                reason: "not a directory".to_string(),
            });
        }

        let (input_mode, line_input, mut input_files) = classify_inputs(&args.input)?;

        match input_mode {
            InputMode::Files => {
                // Per-input outputs need somewhere to land.
                let dir = args.output.as_ref().ok_or(ConfigError::OutputDirRequired)?;
                if dir.exists() && !dir.is_dir() {
                    return Err(ConfigError::InvalidOutput {
                        path: dir.clone(),
                        reason: "exists and is not a directory".to_string(),
                    });
                }
                if args.shuffle {
                    input_files.shuffle(&mut rand::rng());
                }
            }
            InputMode::Lines => {
                if let Some(out) = &args.output {
                    if let Some(parent) = out.parent() {
                        if !parent.as_os_str().is_empty() && !parent.exists() {
                            return Err(ConfigError::InvalidOutput {
                                path: out.clone(),
                                reason: format!(
                                    "parent directory '{}' does not exist",
                                    parent.display()
                                ),
                            });
                        }
                    }
                }
                // A shuffled stream is spilled to a countable temp file, so
                // only the unshuffled-stdin case lacks a length oracle.
                if args.distribution_mode == DistributionMode::Failover
                    && matches!(line_input, Some(LineInput::Stdin))
                    && !args.shuffle
                {
                    return Err(ConfigError::FailoverNeedsLength);
                }
            }
        }

        Ok(Self {
            input_mode,
            line_input,
            input_files,
            blocksize: args.blocksize,
            shuffle: args.shuffle,
            machines,
            task,
            task_success_code: args.task_success_code,
            distribution_mode: args.distribution_mode,
            temp_directory: args.temp_directory,
            output: args.output,
            concurrency: args.concurrency,
            init_file: args.init_file,
            init_script: args.init_script,
            cleanup_remote: args.cleanup_remote,
            show_summary: !args.quiet,
            verbose: args.verbose,
        })
    }
}

/// Read the task from a file when the argument names one; otherwise the
/// argument itself is the shell fragment.
fn resolve_task(task: &str) -> ConfigResult<String> {
    let candidate = Path::new(task);
    if candidate.is_file() {
        let text = std::fs::read_to_string(candidate).map_err(|e| ConfigError::TaskUnreadable {
            path: candidate.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(text.trim_end().to_string())
    } else {
        Ok(task.to_string())
    }
}

/// Decide the input mode and expand the input arguments.
///
/// Exactly one argument naming stdin (`-`) or a single regular file selects
/// line mode. Anything else is file mode: directories expand to their
/// immediate children, other strings are treated as glob patterns.
fn classify_inputs(
    inputs: &[String],
) -> ConfigResult<(InputMode, Option<LineInput>, Vec<PathBuf>)> {
    if inputs.len() == 1 {
        let only = &inputs[0];
        if only == "-" {
            return Ok((InputMode::Lines, Some(LineInput::Stdin), Vec::new()));
        }
        let path = Path::new(only);
        if path.is_file() {
            return Ok((
                InputMode::Lines,
                Some(LineInput::File(path.to_path_buf())),
                Vec::new(),
            ));
        }
    }

    let mut files = Vec::new();
    for input in inputs {
        let path = Path::new(input);
        if path.is_file() {
            files.push(path.to_path_buf());
        } else if path.is_dir() {
            let mut children: Vec<PathBuf> = std::fs::read_dir(path)
                .map_err(|_| ConfigError::InputMissing {
                    path: path.to_path_buf(),
                })?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file())
                .collect();
            children.sort();
            if children.is_empty() {
                return Err(ConfigError::EmptyInput {
                    input: input.clone(),
                });
            }
            files.extend(children);
        } else {
            let mut matched: Vec<PathBuf> = glob::glob(input)
                .map_err(|_| ConfigError::EmptyInput {
                    input: input.clone(),
                })?
                .filter_map(|m| m.ok())
                .filter(|p| p.is_file())
                .collect();
            matched.sort();
            if matched.is_empty() {
                return Err(ConfigError::EmptyInput {
                    input: input.clone(),
                });
            }
            files.extend(matched);
        }
    }

    Ok((InputMode::Files, None, files))
}
