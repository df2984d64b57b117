use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, TimeDelta, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::context::VerificationContext;
use super::queue::VerificationQueue;
use super::report::{
    bulk_summary_report, bulk_unconfigured_report, failure_digests, success_report,
    BulkEnqueueSummary, UserOutcome,
};
use super::resolver::ResolutionOutcome;
use crate::platform::{ChannelId, GroupId, PlatformError, Report, UserId};

/// Result of asking for one identifier to be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Added,
    AlreadyQueued,
    Excepted,
}

/// Everything one drain produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub outcomes: Vec<UserOutcome>,
    pub remaining: usize,
}

impl DrainSummary {
    pub fn processed_ids(&self) -> Vec<UserId> {
        self.outcomes
            .iter()
            .filter(|outcome| !matches!(outcome, UserOutcome::Excepted { .. }))
            .map(UserOutcome::user_id)
            .collect()
    }
}

/// Status snapshot for operators.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerInfo {
    pub running: bool,
    pub queue_size: usize,
    pub draining: bool,
    pub batch_size: usize,
    pub drain_interval_secs: u64,
    pub estimated_completion_secs: u64,
    pub next_drain_in_secs: Option<u64>,
    pub next_drain: Option<DateTime<Utc>>,
    pub next_bulk_enqueue: DateTime<FixedOffset>,
    pub bulk_groups: Vec<GroupId>,
}

/// `ceil(queue_size / batch_size) * interval`.
pub fn estimated_completion(queue_size: usize, batch_size: usize, interval: Duration) -> Duration {
    let batches = queue_size.div_ceil(batch_size.max(1));
    interval.saturating_mul(u32::try_from(batches).unwrap_or(u32::MAX))
}

#[derive(Debug, Default)]
struct Timers {
    next_drain: Option<Instant>,
    next_bulk: Option<DateTime<FixedOffset>>,
}

/// Moves a drain deadline past `now`, dropping ticks that were missed.
fn skip_missed(mut due: Instant, interval: Duration, now: Instant) -> Instant {
    if interval.is_zero() {
        return now;
    }
    while due <= now {
        due += interval;
    }
    due
}

/// Clears the drain guard and the queue's draining flag however the drain ends.
struct DrainGuard<'a> {
    running: &'a AtomicBool,
    queue: &'a VerificationQueue,
}

impl<'a> DrainGuard<'a> {
    fn acquire(running: &'a AtomicBool, queue: &'a VerificationQueue) -> Option<Self> {
        running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(Self { running, queue })
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.queue.set_draining(false);
        self.running.store(false, Ordering::Release);
    }
}

/// Drains the queue on a fixed interval and bulk-enqueues groups weekly.
pub struct BatchScheduler {
    context: Arc<VerificationContext>,
    running: AtomicBool,
    drain_running: AtomicBool,
    timers: Mutex<Timers>,
}

impl BatchScheduler {
    pub fn new(context: Arc<VerificationContext>) -> Self {
        Self {
            context,
            running: AtomicBool::new(false),
            drain_running: AtomicBool::new(false),
            timers: Mutex::new(Timers::default()),
        }
    }

    pub fn context(&self) -> &Arc<VerificationContext> {
        &self.context
    }

    /// Queues one identifier unless it is excepted or already present.
    pub fn enqueue_user(&self, id: UserId) -> EnqueueOutcome {
        if self.context.exceptions.is_excepted(id) {
            debug!(user_id = %id, "excepted user not enqueued");
            return EnqueueOutcome::Excepted;
        }
        if self.context.queue.enqueue(id) {
            info!(user_id = %id, queue_size = self.context.queue.size(), "user enqueued");
            EnqueueOutcome::Added
        } else {
            EnqueueOutcome::AlreadyQueued
        }
    }

    /// Queues every current holder of `group`.
    pub async fn enqueue_group(&self, group: GroupId) -> Result<BulkEnqueueSummary, PlatformError> {
        let members = self.context.platform.group_members(group).await?;
        let mut summary = BulkEnqueueSummary {
            groups: vec![group],
            ..BulkEnqueueSummary::default()
        };
        for id in members {
            match self.enqueue_user(id) {
                EnqueueOutcome::Added => summary.enqueued += 1,
                EnqueueOutcome::AlreadyQueued => summary.already_queued += 1,
                EnqueueOutcome::Excepted => summary.excluded += 1,
            }
        }
        summary.queue_size = self.context.queue.size();
        info!(
            group_id = %group,
            enqueued = summary.enqueued,
            already_queued = summary.already_queued,
            excluded = summary.excluded,
            "group enqueued"
        );
        Ok(summary)
    }

    /// Join-event trigger. Returns `None` when automatic enqueueing is off.
    pub async fn on_member_join(&self, id: UserId) -> Option<EnqueueOutcome> {
        if !self.context.settings.auto_enqueue_new_members {
            return None;
        }
        let outcome = self.enqueue_user(id);
        if outcome == EnqueueOutcome::Added {
            if let Some(channel) = self.context.settings.welcome_channel {
                let text = format!(
                    "Welcome <@{id}>! You have been added to the verification queue to link your game account. Please wait a moment."
                );
                if let Err(err) = self.context.publisher.send_text(channel, &text).await {
                    warn!(user_id = %id, error = %err, "welcome message failed");
                }
            }
        }
        Some(outcome)
    }

    /// Enqueues every configured bulk group and publishes a summary.
    pub async fn bulk_enqueue(&self) -> BulkEnqueueSummary {
        let settings = &self.context.settings;
        if settings.bulk_groups.is_empty() {
            warn!("bulk enqueue requested with no configured groups");
            self.publish(settings.failure_channel, bulk_unconfigured_report())
                .await;
            return BulkEnqueueSummary {
                queue_size: self.context.queue.size(),
                ..BulkEnqueueSummary::default()
            };
        }

        let mut total = BulkEnqueueSummary {
            groups: settings.bulk_groups.clone(),
            ..BulkEnqueueSummary::default()
        };
        for group in &settings.bulk_groups {
            match self.enqueue_group(*group).await {
                Ok(summary) => {
                    total.enqueued += summary.enqueued;
                    total.already_queued += summary.already_queued;
                    total.excluded += summary.excluded;
                }
                Err(err) => {
                    warn!(group_id = %group, error = %err, "group members unavailable");
                    total.failed_groups.push(*group);
                }
            }
        }
        total.queue_size = self.context.queue.size();

        info!(
            enqueued = total.enqueued,
            excluded = total.excluded,
            queue_size = total.queue_size,
            "bulk enqueue finished"
        );
        self.publish(settings.success_channel, bulk_summary_report(&total))
            .await;
        total
    }

    /// Processes up to `batch_size` identifiers. Returns `None` when another
    /// drain is still in progress.
    pub async fn drain_once(&self) -> Option<DrainSummary> {
        let queue = &self.context.queue;
        let _guard = DrainGuard::acquire(&self.drain_running, queue)?;
        if queue.size() == 0 {
            return Some(DrainSummary::default());
        }

        queue.set_draining(true);
        let settings = &self.context.settings;
        let batch = queue.dequeue_batch(settings.batch_size);
        info!(batch = batch.len(), remaining = queue.size(), "drain started");

        let mut outcomes: Vec<UserOutcome> = Vec::with_capacity(batch.len());
        for id in batch {
            let previous_hit_upstream = matches!(
                outcomes.last(),
                Some(UserOutcome::Verified { .. } | UserOutcome::Failed { .. })
            );
            if previous_hit_upstream && !settings.inter_user_delay.is_zero() {
                tokio::time::sleep(settings.inter_user_delay).await;
            }

            let outcome = self.process(id).await;
            if let UserOutcome::Verified {
                resolution,
                reconcile,
            } = &outcome
            {
                let report = success_report(&settings.home_affiliation, resolution, reconcile);
                self.publish(settings.success_channel, report).await;
            }
            outcomes.push(outcome);
        }

        let failures: Vec<String> = outcomes
            .iter()
            .filter_map(UserOutcome::failure_line)
            .collect();
        for report in failure_digests(&failures) {
            self.publish(settings.failure_channel, report).await;
        }

        let summary = DrainSummary {
            outcomes,
            remaining: queue.size(),
        };
        info!(
            processed = summary.outcomes.len(),
            failures = failures.len(),
            remaining = summary.remaining,
            "drain finished"
        );
        Some(summary)
    }

    async fn process(&self, id: UserId) -> UserOutcome {
        let context = &self.context;
        if context.exceptions.is_excepted(id) {
            info!(user_id = %id, "skipping excepted user");
            return UserOutcome::Excepted { user_id: id };
        }

        let member = match context.platform.member(id).await {
            Ok(Some(member)) => member,
            Ok(None) => {
                warn!(user_id = %id, "queued user is no longer a member");
                return UserOutcome::MemberMissing { user_id: id };
            }
            Err(error) => {
                warn!(user_id = %id, error = %error, "member lookup failed");
                return UserOutcome::PlatformUnavailable { user_id: id, error };
            }
        };

        match context.resolver.resolve(id).await {
            ResolutionOutcome::Success(resolution) => {
                let reconcile = context.reconciler.reconcile(&member, &resolution).await;
                info!(
                    user_id = %id,
                    account = %resolution.account,
                    affiliation = %resolution.affiliation,
                    "user verified"
                );
                UserOutcome::Verified {
                    resolution,
                    reconcile,
                }
            }
            ResolutionOutcome::Failure(failure) => {
                let lockout = context.reconciler.lockout(&member).await;
                warn!(
                    user_id = %id,
                    stage = %failure.stage,
                    reason = %failure.reason,
                    "user verification failed"
                );
                UserOutcome::Failed {
                    user_id: id,
                    failure,
                    lockout,
                }
            }
        }
    }

    async fn publish(&self, channel: ChannelId, report: Report) {
        let title = report.title.clone();
        if let Err(err) = self.context.publisher.publish(channel, report).await {
            warn!(report = %title, error = %err, "report could not be published");
        }
    }

    pub fn info(&self) -> SchedulerInfo {
        let settings = &self.context.settings;
        let queue_size = self.context.queue.size();
        let timers = match self.timers.lock() {
            Ok(timers) => (timers.next_drain, timers.next_bulk),
            Err(poisoned) => {
                let timers = poisoned.into_inner();
                (timers.next_drain, timers.next_bulk)
            }
        };
        let drain_in = timers
            .0
            .map(|due| due.saturating_duration_since(Instant::now()));

        SchedulerInfo {
            running: self.running.load(Ordering::Acquire),
            queue_size,
            draining: self.context.queue.is_draining(),
            batch_size: settings.batch_size,
            drain_interval_secs: settings.drain_interval.as_secs(),
            estimated_completion_secs: estimated_completion(
                queue_size,
                settings.batch_size,
                settings.drain_interval,
            )
            .as_secs(),
            next_drain_in_secs: drain_in.map(|wait| wait.as_secs()),
            next_drain: drain_in.map(|wait| {
                Utc::now() + TimeDelta::from_std(wait).unwrap_or_else(|_| TimeDelta::zero())
            }),
            next_bulk_enqueue: timers
                .1
                .unwrap_or_else(|| settings.bulk_schedule.next_after(Utc::now())),
            bulk_groups: settings.bulk_groups.clone(),
        }
    }

    fn set_timers(&self, next_drain: Option<Instant>, next_bulk: Option<DateTime<FixedOffset>>) {
        let mut timers = match self.timers.lock() {
            Ok(timers) => timers,
            Err(poisoned) => poisoned.into_inner(),
        };
        timers.next_drain = next_drain;
        timers.next_bulk = next_bulk;
    }

    /// Runs both timers until `shutdown` fires. An in-flight drain or bulk
    /// enqueue always finishes before this returns.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let settings = &self.context.settings;
        let interval = settings.drain_interval;
        let mut drain_due = Instant::now() + interval;
        let mut next_bulk = settings.bulk_schedule.next_after(Utc::now());

        self.running.store(true, Ordering::Release);
        info!(
            interval_secs = interval.as_secs(),
            batch_size = settings.batch_size,
            next_bulk_enqueue = %next_bulk.to_rfc3339(),
            "scheduler started"
        );

        loop {
            self.set_timers(Some(drain_due), Some(next_bulk));
            let bulk_wait = (next_bulk.with_timezone(&Utc) - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(bulk_wait) => {
                    next_bulk = settings.bulk_schedule.next_after(next_bulk.with_timezone(&Utc));
                    self.bulk_enqueue().await;
                }
                _ = tokio::time::sleep_until(drain_due) => {
                    drain_due = skip_missed(drain_due, interval, Instant::now());
                    self.set_timers(Some(drain_due), Some(next_bulk));
                    if self.context.queue.size() > 0 && self.drain_once().await.is_none() {
                        debug!("previous drain still running, tick skipped");
                    }
                    drain_due = skip_missed(drain_due, interval, Instant::now());
                }
            }
        }

        self.running.store(false, Ordering::Release);
        self.set_timers(None, None);
        info!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_estimate_rounds_batches_up() {
        let minute = Duration::from_secs(60);
        assert_eq!(estimated_completion(0, 3, minute), Duration::ZERO);
        assert_eq!(estimated_completion(1, 3, minute), minute);
        assert_eq!(estimated_completion(7, 3, minute), Duration::from_secs(180));
        assert_eq!(estimated_completion(6, 3, minute), Duration::from_secs(120));
    }

    #[test]
    fn missed_drain_ticks_are_skipped() {
        let start = Instant::from_std(std::time::Instant::now());
        let minute = Duration::from_secs(60);
        assert_eq!(skip_missed(start + minute, minute, start), start + minute);
        assert_eq!(
            skip_missed(start + minute, minute, start + Duration::from_secs(150)),
            start + Duration::from_secs(180)
        );
        assert_eq!(
            skip_missed(start + minute, minute, start + Duration::from_secs(120)),
            start + Duration::from_secs(180)
        );
    }
}
