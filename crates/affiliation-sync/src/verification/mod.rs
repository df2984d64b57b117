//! The verification pipeline: queue, throttled three-stage resolution,
//! identity reconciliation, and the scheduler that drives them.

pub mod context;
pub mod display_name;
pub mod lookup;
pub mod queue;
pub mod rate_limit;
pub mod reconcile;
pub mod report;
pub mod resolver;
pub mod schedule;
pub mod scheduler;

#[cfg(test)]
mod tests;

pub use context::{Collaborators, PipelineSettings, VerificationContext};
pub use display_name::{abbreviate, DisplayNamePolicy};
pub use lookup::{AffiliationDirectory, FailureReason, HttpLookupClient, LookupClient, LookupStage};
pub use queue::{VerificationQueue, WorkQueue};
pub use rate_limit::{RateLimiter, SharedRateLimiter};
pub use reconcile::{Change, ChangeRecord, IdentityReconciler, ReconcilePolicy, ReconcileReport};
pub use report::{BulkEnqueueSummary, UserOutcome};
pub use resolver::{Resolution, ResolutionFailure, ResolutionOutcome, Resolver};
pub use schedule::WeeklySchedule;
pub use scheduler::{BatchScheduler, DrainSummary, EnqueueOutcome, SchedulerInfo};
