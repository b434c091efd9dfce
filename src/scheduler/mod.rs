//! Masternode scheduling.
//!
//! - [`Task`]: a compilation or match with its attempt bookkeeping
//! - [`WorkerHandle`]: a worker's capacity and the tasks it holds
//! - [`WorkerRegistry`]: the known workers and the placement policy
//! - [`MasterNode`]: the RPC handlers, the janitor and the dbwatchers
//!
//! # Task lifecycle
//!
//! 1. The dbwatcher fetches `new` jobs and places each on the least loaded
//!    worker with enough free slots, stopping at the first job that fits
//!    nowhere.
//! 2. Placement starts an attempt and calls the worker; once the worker
//!    accepts, the job is marked `pending`.
//! 3. The worker reports back; the task is detached and the result stored.
//! 4. Meanwhile the janitor resubmits timed out or errored attempts until the
//!    try budget is spent, then fails the job. Jobs held by a worker that
//!    stops heartbeating go back to `new`.

pub mod master;
pub mod outcome;
pub mod registry;
pub mod task;
pub mod worker;

pub use master::{MasterNode, SweepReport};
pub use outcome::{CompilationOutcome, MatchOutcome, PlayerOutcome};
pub use registry::WorkerRegistry;
pub use task::{JobKind, Task, TaskContext, TaskKey, TaskRef};
pub use worker::{WorkerHandle, WorkerInfo, WorkerKey, WorkerSnapshot};
