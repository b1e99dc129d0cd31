//! Reliable dequeue-and-promote protocol over Redis lists.
//!
//! ```text
//!   submit ──LPUSH──▶ pm_queue ──BLMOVE──▶ pm_queue:inflight
//!                                              │ promote.lua
//!                        validation_queue ◀────┘
//!                              │ BLMOVE
//!                              ▼
//!                  validation_queue:inflight ──promote.lua──▶ integration_queue
//!                                                                  │ ...
//!                                                                  ▼
//!                                                         state = complete
//! ```
//!
//! - **StageQueue**: claim, promote, requeue, release for one stage
//! - **Watchdog**: recovers jobs whose claim outlived the inflight timeout
//! - **RetryPolicy**: bounded retries; exhausted jobs go to the
//!   dead-letter list with `state = failed`

pub mod job;
pub mod queue;
pub mod scripts;
pub mod stage;
pub mod watchdog;

pub use job::{ClaimedJob, RetryPolicy, DEFAULT_MAX_RETRIES};
pub use queue::{
    connect_manager, ClaimOutcome, PromoteOutcome, QueueError, QueueStats, RequeueOutcome,
    StageQueue,
};
pub use stage::Stage;
pub use watchdog::{is_expired, SweepReport, Watchdog};
