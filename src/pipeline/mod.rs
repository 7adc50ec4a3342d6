//! Polling pipeline.
//!
//! - `diff`: change detection between snapshots
//! - `backoff`: polling backoff and retry delays
//! - `rate_limit`: per-host request spacing shared by all workers
//! - `poller`: the per-target worker and its state machine
//! - `scheduler`: builds workers from configuration and runs them

pub mod backoff;
pub mod diff;
pub mod poller;
pub mod rate_limit;
pub mod scheduler;

pub use diff::{SlotDiff, diff};
pub use poller::{CycleOutcome, CycleSummary, PollState, TargetWorker, WorkerContext};
pub use scheduler::{Scheduler, TargetStatus, collect_status, orphaned_keys};
