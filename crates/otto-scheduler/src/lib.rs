//! # Otto Scheduler
//!
//! The coordination core of the Otto runtime: task mutation with audit,
//! lease-based claiming of due jobs, durable retryable chat delivery, and
//! policy-gated notification timing.
//!
//! ## Architecture
//! ```text
//! Mutation Service ──▶ jobs table ◀── Watchdog/Heartbeat bootstrap
//!                         │
//!            Scheduler Kernel (tick + lease claim)
//!                         │  fire-and-forget
//!                 JobExecutor hook ──▶ run rows, reschedule, release
//!                         │
//!  Watchdog / Heartbeat ──▶ Outbound Queue ──▶ Delivery Processor
//!                              (dedupe)          (backoff retry)
//!                                  │
//!                        Notification Policy Gate
//! ```
//!
//! Correctness of "one executor per job" rests on the lease acquired inside the
//! store's claim transaction, never on an in-process mutex — a crashed executor
//! simply loses its lease and the job becomes reclaimable.

pub mod executor;
pub mod heartbeat;
pub mod kernel;
pub mod mutation;
pub mod policy;
pub mod queue;
pub mod watchdog;

use otto_core::traits::{AuditStore, JobStore, OutboundStore, ProfileStore, RunStore};

/// The full set of repository contracts the runtime wires together.
/// Implemented by `otto_store::SqliteStore`; blanket so any complete store
/// qualifies.
pub trait Store: JobStore + RunStore + OutboundStore + AuditStore + ProfileStore {}

impl<T: JobStore + RunStore + OutboundStore + AuditStore + ProfileStore> Store for T {}

pub use executor::RuntimeExecutor;
pub use heartbeat::{
    ensure_heartbeat_task, Heartbeat, HeartbeatOutcome, RunDigest, HEARTBEAT_TASK_ID,
};
pub use kernel::{KernelHandle, SchedulerKernel};
pub use mutation::{
    CreateTaskInput, DeleteOutcome, MutationContext, MutationFailure, TaskMutationError,
    TaskMutationService, TaskPatch,
};
pub use policy::{gate, EffectiveProfile, GateAction, GateDecision, GateReason, NotificationPolicy};
pub use queue::{DeliveryProcessor, EnqueueInput, EnqueueResult, OutboundQueue};
pub use watchdog::{
    ensure_watchdog_task, NotificationStatus, Watchdog, WatchdogOutcome, WATCHDOG_TASK_ID,
};
