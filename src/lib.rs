//! kssh - Distributed Work Dispatcher
//!
//! Splits a bulk workload across a fleet of remote machines reachable over
//! a shell transport. The input is either a single stream cut into blocks
//! of lines or a set of whole files; each block is uploaded to a worker,
//! run through a user-specified task there, polled to completion, and
//! fetched back into local output.
//!
//! # Features
//!
//! - **Transport-agnostic**: every remote operation is one invocation of an
//!   opaque transport prefix (ssh by default); nothing is multiplexed.
//!
//! - **Adaptive scheduling**: per-worker upload/poll/download timeouts and
//!   poll intervals are tuned by a weighted moving average of observed
//!   behavior, scaled by block size.
//!
//! - **Fault tolerant**: blocks are retried on transient failure through a
//!   FIFO queue, and workers that keep failing are quarantined while their
//!   blocks are redistributed to the rest of the fleet.
//!
//! - **Two distribution policies**: performance (greedy; fast workers take
//!   more) and failover (bounded per-worker share, rebalanced when a
//!   worker is excluded).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   blocks   ┌──────────────────────────────────────────┐
//! │ Block source │──────────▶│             Dispatcher scan loop          │
//! │ lines | files│◀──────────│  decide() per worker ─ one action each:   │
//! │ + retry queue│  retries   │  START / CHECK / FETCH                   │
//! └──────────────┘            └──────────────┬───────────────────────────┘
//!                                            │ batch
//!                                            ▼
//!                             ┌──────────────────────────┐
//!                             │   Transaction executor   │
//!                             │ bounded pool, 1s polls,  │
//!                             │ per-transaction timeouts │
//!                             └──────┬───────────┬───────┘
//!                                    │           │
//!                          ssh ──────┘           └────── ssh
//!                           ▼                             ▼
//!                  ┌─────────────────┐          ┌─────────────────┐
//!                  │    Worker A     │   ...    │    Worker N     │
//!                  │ kssh_<KEY>_in   │          │ kssh_<KEY>_in   │
//!                  │ kssh_<KEY>_out  │          │ kssh_<KEY>_out  │
//!                  │ kssh_<KEY>_err  │          │ kssh_<KEY>_err  │
//!                  │ kssh_<KEY>_pid  │          │ kssh_<KEY>_pid  │
//!                  └─────────────────┘          └─────────────────┘
//! ```
//!
//! # Example
//!
//! ```bash
//! # Split a word list into 100-line blocks and crawl them on the fleet
//! kssh -i urls.txt -b 100 -t './crawl.sh' -o results.txt
//!
//! # Uppercase every file in a directory, one output file per input
//! kssh -i corpus/ -t 'tr a-z A-Z' -o upper/
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod exec;
pub mod remote;
pub mod source;
pub mod summary;
pub mod workspace;

pub use config::{CliArgs, DispatchConfig, DistributionMode, InputMode};
pub use dispatch::{DispatchResult, Dispatcher, WorkerSummary};
pub use error::{DispatchError, Result};
pub use remote::RunKey;
