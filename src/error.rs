//! Error types for kssh
//!
//! This module defines the error hierarchy for the dispatcher:
//! - Configuration and CLI errors (fatal at startup)
//! - Block source errors
//! - Local workspace errors (temp files, output writing)
//!
//! Design philosophy:
//! - Use thiserror for structured error types in library code
//! - Remote failures are *data*, not errors: a transaction resolves to a
//!   status and the dispatcher reacts to it. Only local problems the
//!   dispatcher cannot work around surface as `Err`.
//! - Errors should be actionable - include context about what to do

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the kssh application
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Block source errors
    #[error("Block source error: {0}")]
    Source(#[from] SourceError),

    /// Workspace errors
    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    /// I/O errors (file operations, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Every configured worker was dropped before dispatch could begin
    #[error("No usable workers: {reason}")]
    NoWorkers { reason: String },
}

/// Configuration and CLI errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Machines file could not be read
    #[error("Cannot read machines file '{path}': {reason}")]
    MachinesUnreadable { path: PathBuf, reason: String },

    /// Machines file is not valid JSON
    #[error("Cannot parse machines file '{path}': {reason}")]
    MachinesInvalid { path: PathBuf, reason: String },

    /// A machines entry is missing its hostname
    #[error("Machines entry {index} has no hostname")]
    MissingHostname { index: usize },

    /// The machines file configures no workers
    #[error("Machines file '{path}' configures no workers")]
    NoMachines { path: PathBuf },

    /// An input argument matched nothing
    #[error("Input '{input}' matched no files")]
    EmptyInput { input: String },

    /// An input path does not exist
    #[error("Input path '{path}' does not exist")]
    InputMissing { path: PathBuf },

    /// Invalid blocksize
    #[error("Invalid blocksize {size}: must be at least 1")]
    InvalidBlocksize { size: usize },

    /// Invalid concurrency
    #[error("Invalid concurrency {value}: must be between 1 and {max}")]
    InvalidConcurrency { value: usize, max: usize },

    /// File mode needs a directory to place per-input outputs in
    #[error("File-mode input requires --output to name a directory")]
    OutputDirRequired,

    /// The output path exists but has the wrong kind
    #[error("Invalid output path '{path}': {reason}")]
    InvalidOutput { path: PathBuf, reason: String },

    /// Task file was named but cannot be read
    #[error("Cannot read task file '{path}': {reason}")]
    TaskUnreadable { path: PathBuf, reason: String },

    /// Init payload missing
    #[error("Initialization payload '{path}' does not exist")]
    InitPayloadMissing { path: PathBuf },

    /// Failover distribution needs to know the total block count up front
    #[error("Failover distribution requires a countable input (not an unshuffled stream)")]
    FailoverNeedsLength,

    /// Temp directory problems
    #[error("Invalid temp directory '{path}': {reason}")]
    InvalidTempDir { path: PathBuf, reason: String },
}

/// Block source errors
#[derive(Error, Debug)]
pub enum SourceError {
    /// The source has no more blocks to hand out
    #[error("Block source exhausted")]
    Exhausted,

    /// Reading the underlying stream failed
    #[error("Failed to read input '{path}': {reason}")]
    Read { path: PathBuf, reason: String },

    /// Block count requested from a source that cannot provide one
    #[error("Block count unavailable for a stream-backed source")]
    LenUnavailable,
}

/// Local workspace errors (temp registry and output writing)
#[derive(Error, Debug)]
pub enum WorkspaceError {
    /// Output destination could not be prepared
    #[error("Failed to prepare output '{path}': {reason}")]
    PrepareOutput { path: PathBuf, reason: String },

    /// Writing a fetched block to the output failed
    #[error("Failed to write output '{path}': {reason}")]
    WriteOutput { path: PathBuf, reason: String },

    /// A temp file could not be created or written
    #[error("Failed to write temp file '{path}': {reason}")]
    WriteTemp { path: PathBuf, reason: String },
}

/// Result type alias for DispatchError
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Result type alias for ConfigError
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for SourceError
pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Result type alias for WorkspaceError
pub type WorkspaceResult<T> = std::result::Result<T, WorkspaceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let src_err = SourceError::Exhausted;
        let top: DispatchError = src_err.into();
        assert!(matches!(top, DispatchError::Source(SourceError::Exhausted)));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::MissingHostname { index: 3 };
        assert_eq!(err.to_string(), "Machines entry 3 has no hostname");
    }
}
