//! The dispatcher: per-worker state machines driven by a scan loop
//!
//! Each scan decides at most one action per worker (start a block, poll for
//! liveness, or fetch results), runs the whole batch through the transaction
//! executor, then applies the outcomes to the workers and the block source.
//! Worker, source, and workspace state are only ever touched between
//! batches, on the driver thread.

pub mod policy;
pub mod scan;
pub mod worker;

pub use policy::Policy;
pub use scan::{DispatchResult, Dispatcher, WorkerSummary};
pub use worker::{WorkerNode, WorkerState};
