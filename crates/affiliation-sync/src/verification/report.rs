use serde::Serialize;

use super::reconcile::ReconcileReport;
use super::resolver::{Resolution, ResolutionFailure};
use crate::platform::{GroupId, PlatformError, Report, ReportTone, UserId};

/// Failure entries carried by a single digest message.
pub const FAILURE_DIGEST_LIMIT: usize = 10;

/// What happened to one drained identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserOutcome {
    Verified {
        resolution: Resolution,
        reconcile: ReconcileReport,
    },
    Failed {
        user_id: UserId,
        failure: ResolutionFailure,
        lockout: Option<ReconcileReport>,
    },
    /// The identifier is no longer a member of the community.
    MemberMissing { user_id: UserId },
    /// The member record could not be loaded from the platform.
    PlatformUnavailable { user_id: UserId, error: PlatformError },
    /// Added to the exception set after it was queued.
    Excepted { user_id: UserId },
}

impl UserOutcome {
    pub fn user_id(&self) -> UserId {
        match self {
            UserOutcome::Verified { reconcile, .. } => reconcile.user_id,
            UserOutcome::Failed { user_id, .. }
            | UserOutcome::MemberMissing { user_id }
            | UserOutcome::PlatformUnavailable { user_id, .. }
            | UserOutcome::Excepted { user_id } => *user_id,
        }
    }

    pub fn is_verified(&self) -> bool {
        matches!(self, UserOutcome::Verified { .. })
    }

    /// One digest line, for outcomes that belong on the failure channel.
    pub fn failure_line(&self) -> Option<String> {
        match self {
            UserOutcome::Failed {
                user_id,
                failure,
                lockout,
            } => {
                let mut line = format!(
                    "<@{user_id}> failed at {} ({})",
                    failure.stage,
                    failure.reason.label()
                );
                if let Some(account) = &failure.account {
                    line.push_str(&format!(", account `{account}`"));
                }
                if let Some(settlement) = &failure.settlement {
                    line.push_str(&format!(", settlement `{settlement}`"));
                }
                if let Some(lockout) = lockout {
                    line.push_str(&format!(", lockout applied {} change(s)", lockout.applied()));
                }
                Some(line)
            }
            UserOutcome::MemberMissing { user_id } => {
                Some(format!("<@{user_id}> is no longer a member"))
            }
            UserOutcome::PlatformUnavailable { user_id, error } => {
                Some(format!("<@{user_id}> could not be loaded: {error}"))
            }
            UserOutcome::Verified { .. } | UserOutcome::Excepted { .. } => None,
        }
    }
}

/// Per-member report for the success channel.
pub fn success_report(
    home_affiliation: &str,
    resolution: &Resolution,
    reconcile: &ReconcileReport,
) -> Report {
    let (title, tone) = if reconcile.is_home {
        (format!("{home_affiliation} member verified"), ReportTone::Success)
    } else {
        ("Foreign member verified".to_string(), ReportTone::Warning)
    };

    let changes = if reconcile.changes.is_empty() {
        "no changes needed".to_string()
    } else {
        reconcile
            .changes
            .iter()
            .map(|record| record.summary())
            .collect::<Vec<_>>()
            .join("\n")
    };

    let mut report = Report::new(title, tone)
        .with_description(format!("<@{}>", reconcile.user_id))
        .field("Account", resolution.account.as_str())
        .field("Settlement", resolution.settlement.as_str())
        .field("Affiliation", resolution.affiliation.as_str());
    if let Some(name) = &reconcile.target_name {
        report = report.field("Display name", name.as_str());
    }
    report.field("Changes", changes)
}

/// Splits failure lines into digests of at most [`FAILURE_DIGEST_LIMIT`].
pub fn failure_digests(lines: &[String]) -> Vec<Report> {
    let pages = lines.len().div_ceil(FAILURE_DIGEST_LIMIT);
    lines
        .chunks(FAILURE_DIGEST_LIMIT)
        .enumerate()
        .map(|(index, chunk)| {
            let title = if pages > 1 {
                format!("Verification failures ({}/{pages})", index + 1)
            } else {
                "Verification failures".to_string()
            };
            Report::new(title, ReportTone::Failure).with_description(chunk.join("\n"))
        })
        .collect()
}

/// Aggregate counts from one bulk-enqueue run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkEnqueueSummary {
    pub groups: Vec<GroupId>,
    pub enqueued: usize,
    pub already_queued: usize,
    pub excluded: usize,
    /// Groups whose member listing failed.
    pub failed_groups: Vec<GroupId>,
    pub queue_size: usize,
}

impl BulkEnqueueSummary {
    pub fn scanned(&self) -> usize {
        self.enqueued + self.already_queued + self.excluded
    }
}

pub fn bulk_summary_report(summary: &BulkEnqueueSummary) -> Report {
    let tone = if summary.failed_groups.is_empty() {
        ReportTone::Success
    } else {
        ReportTone::Warning
    };
    let mut report = Report::new("Weekly bulk enqueue", tone)
        .field("Groups", summary.groups.len().to_string())
        .field("Enqueued", summary.enqueued.to_string())
        .field("Already queued", summary.already_queued.to_string())
        .field("Excluded", summary.excluded.to_string())
        .field("Queue size", summary.queue_size.to_string());
    if !summary.failed_groups.is_empty() {
        let failed = summary
            .failed_groups
            .iter()
            .map(|group| format!("<@&{group}>"))
            .collect::<Vec<_>>()
            .join(", ");
        report = report.field("Unreadable groups", failed);
    }
    report
}

pub fn bulk_unconfigured_report() -> Report {
    Report::new("Weekly bulk enqueue skipped", ReportTone::Failure)
        .with_description("no bulk-enqueue groups are configured")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verification::lookup::{FailureReason, LookupStage};
    use crate::verification::reconcile::{Change, ChangeRecord};

    fn failed(id: u64) -> UserOutcome {
        UserOutcome::Failed {
            user_id: UserId(id),
            failure: ResolutionFailure {
                stage: LookupStage::SettlementLookup,
                reason: FailureReason::EmptyResult,
                account: Some("Steve".to_string()),
                settlement: None,
            },
            lockout: None,
        }
    }

    #[test]
    fn failure_line_names_stage_reason_and_partial_data() {
        let line = failed(7).failure_line().expect("failures produce a line");
        assert_eq!(
            line,
            "<@7> failed at settlement-lookup (empty-result), account `Steve`"
        );
        assert!(UserOutcome::Excepted { user_id: UserId(7) }
            .failure_line()
            .is_none());
    }

    #[test]
    fn digests_hold_at_most_ten_entries() {
        let lines: Vec<String> = (0..23).map(|id| format!("line {id}")).collect();
        let digests = failure_digests(&lines);
        assert_eq!(digests.len(), 3);
        assert_eq!(digests[0].title, "Verification failures (1/3)");
        let last = digests[2].description.as_deref().unwrap_or_default();
        assert_eq!(last.lines().count(), 3);
        assert!(failure_digests(&[]).is_empty());
    }

    #[test]
    fn success_report_lists_changes() {
        let resolution = Resolution {
            account: "Steve2".to_string(),
            settlement: "Harbor".to_string(),
            affiliation: "Red_Mafia".to_string(),
        };
        let reconcile = ReconcileReport {
            user_id: UserId(1),
            is_home: true,
            target_name: Some("Steve2 ㅣ Falcon".to_string()),
            changes: vec![ChangeRecord::Applied(Change::AddGroup { group: GroupId(30) })],
        };
        let report = success_report("Red_Mafia", &resolution, &reconcile);
        assert_eq!(report.title, "Red_Mafia member verified");
        assert_eq!(report.tone, ReportTone::Success);
        let changes = report
            .fields
            .iter()
            .find(|field| field.name == "Changes")
            .expect("changes field");
        assert_eq!(changes.value, "• group <@&30> added");
    }
}
