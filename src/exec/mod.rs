//! Non-blocking transaction executor
//!
//! One `Transaction` is one attempt at one remote shell command: the local
//! transport subprocess, its timeout, retries, stream redirections, and the
//! resolved outcome. `sync` runs a batch with bounded parallelism and
//! returns only when every member is resolved.

pub mod transaction;

pub use transaction::{many, sync, Transaction, TxKind, TxStatus};
