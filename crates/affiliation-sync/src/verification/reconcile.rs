use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use super::display_name::DisplayNamePolicy;
use super::resolver::Resolution;
use crate::platform::{GroupId, Member, MembershipPlatform, PlatformError, UserId};
use crate::stores::{AliasStore, SettlementGroupStore};

/// Group and lockout policy applied after resolution.
#[derive(Debug, Clone)]
pub struct ReconcilePolicy {
    pub home_affiliation: String,
    pub home_group: GroupId,
    pub foreign_group: Option<GroupId>,
    pub strip_group_on_mismatch: bool,
    pub lockout_on_failure: bool,
}

/// One platform mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Change {
    DisplayName { from: String, to: Option<String> },
    AddGroup { group: GroupId },
    RemoveGroup { group: GroupId },
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::DisplayName { to: Some(to), .. } => write!(f, "display name set to `{to}`"),
            Change::DisplayName { to: None, .. } => write!(f, "display name reset"),
            Change::AddGroup { group } => write!(f, "group <@&{group}> added"),
            Change::RemoveGroup { group } => write!(f, "group <@&{group}> removed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeRecord {
    Applied(Change),
    Failed { change: Change, error: PlatformError },
}

impl ChangeRecord {
    pub fn is_applied(&self) -> bool {
        matches!(self, ChangeRecord::Applied(_))
    }

    pub fn summary(&self) -> String {
        match self {
            ChangeRecord::Applied(change) => format!("• {change}"),
            ChangeRecord::Failed { change, error } => format!("• ⚠️ {change} failed: {error}"),
        }
    }
}

/// Result of reconciling one member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub user_id: UserId,
    pub is_home: bool,
    pub target_name: Option<String>,
    pub changes: Vec<ChangeRecord>,
}

impl ReconcileReport {
    pub fn applied(&self) -> usize {
        self.changes.iter().filter(|record| record.is_applied()).count()
    }

    pub fn failed(&self) -> usize {
        self.changes.len() - self.applied()
    }
}

/// Computes and applies display-name and group deltas for resolved members.
pub struct IdentityReconciler {
    platform: Arc<dyn MembershipPlatform>,
    aliases: Arc<AliasStore>,
    settlements: Arc<SettlementGroupStore>,
    names: DisplayNamePolicy,
    policy: ReconcilePolicy,
}

impl IdentityReconciler {
    pub fn new(
        platform: Arc<dyn MembershipPlatform>,
        aliases: Arc<AliasStore>,
        settlements: Arc<SettlementGroupStore>,
        names: DisplayNamePolicy,
        policy: ReconcilePolicy,
    ) -> Self {
        Self {
            platform,
            aliases,
            settlements,
            names,
            policy,
        }
    }

    pub fn is_home(&self, affiliation: &str) -> bool {
        affiliation == self.policy.home_affiliation
    }

    /// Display name the member should carry for this resolution.
    pub fn target_name(&self, member: &Member, resolution: &Resolution) -> String {
        let label = if self.is_home(&resolution.affiliation) {
            self.alias_for(member.id)
                .or_else(|| {
                    self.names
                        .existing_label(member.display_name())
                        .map(str::to_string)
                })
                .unwrap_or_else(|| self.policy.home_affiliation.clone())
        } else {
            resolution.affiliation.clone()
        };
        self.names.compose(&resolution.account, &label)
    }

    fn alias_for(&self, id: UserId) -> Option<String> {
        self.aliases.get(id).unwrap_or_else(|err| {
            warn!(user_id = %id, error = %err, "alias store unreadable, ignoring alias");
            None
        })
    }

    fn settlement_group(&self, settlement: &str) -> Option<GroupId> {
        self.settlements.get(settlement).unwrap_or_else(|err| {
            warn!(settlement, error = %err, "settlement group store unreadable");
            None
        })
    }

    /// Mutations needed to bring `member` in line with `resolution`.
    pub fn plan(&self, member: &Member, resolution: &Resolution) -> Vec<Change> {
        let mut changes = Vec::new();

        let target = self.target_name(member, resolution);
        if member.display_name() != target {
            changes.push(Change::DisplayName {
                from: member.display_name().to_string(),
                to: Some(target),
            });
        }

        let add = |group: GroupId, changes: &mut Vec<Change>| {
            if !member.has_group(group) {
                changes.push(Change::AddGroup { group });
            }
        };

        if self.is_home(&resolution.affiliation) {
            add(self.policy.home_group, &mut changes);
            if let Some(group) = self.settlement_group(&resolution.settlement) {
                add(group, &mut changes);
            }
            if let Some(foreign) = self.policy.foreign_group {
                if member.has_group(foreign) {
                    changes.push(Change::RemoveGroup { group: foreign });
                }
            }
        } else {
            if let Some(foreign) = self.policy.foreign_group {
                add(foreign, &mut changes);
            }
            if self.policy.strip_group_on_mismatch && member.has_group(self.policy.home_group) {
                changes.push(Change::RemoveGroup {
                    group: self.policy.home_group,
                });
            }
        }

        changes
    }

    pub async fn reconcile(&self, member: &Member, resolution: &Resolution) -> ReconcileReport {
        let changes = self.plan(member, resolution);
        let target_name = changes
            .iter()
            .find_map(|change| match change {
                Change::DisplayName { to, .. } => to.clone(),
                _ => None,
            })
            .unwrap_or_else(|| member.display_name().to_string());
        let records = self.apply(member.id, changes).await;
        let report = ReconcileReport {
            user_id: member.id,
            is_home: self.is_home(&resolution.affiliation),
            target_name: Some(target_name),
            changes: records,
        };
        info!(
            user_id = %member.id,
            applied = report.applied(),
            failed = report.failed(),
            home = report.is_home,
            "member reconciled"
        );
        report
    }

    /// Strips removable groups and resets the display name when the lockout
    /// policy is enabled. Returns `None` when it is disabled.
    pub async fn lockout(&self, member: &Member) -> Option<ReconcileReport> {
        if !self.policy.lockout_on_failure {
            return None;
        }

        let mut changes = Vec::new();
        match self.platform.managed_groups().await {
            Ok(managed) => changes.extend(
                member
                    .groups
                    .iter()
                    .filter(|group| !managed.contains(*group))
                    .map(|group| Change::RemoveGroup { group: *group }),
            ),
            Err(err) => {
                warn!(user_id = %member.id, error = %err, "managed groups unavailable, keeping groups");
            }
        }
        if member.nickname.is_some() {
            changes.push(Change::DisplayName {
                from: member.display_name().to_string(),
                to: None,
            });
        }

        let records = self.apply(member.id, changes).await;
        info!(user_id = %member.id, changes = records.len(), "lockout applied");
        Some(ReconcileReport {
            user_id: member.id,
            is_home: false,
            target_name: None,
            changes: records,
        })
    }

    /// Applies each change independently; one failure never skips the rest.
    async fn apply(&self, id: UserId, changes: Vec<Change>) -> Vec<ChangeRecord> {
        let mut records = Vec::with_capacity(changes.len());
        for change in changes {
            let result = match &change {
                Change::DisplayName { to, .. } => {
                    self.platform.set_display_name(id, to.as_deref()).await
                }
                Change::AddGroup { group } => self.platform.add_group(id, *group).await,
                Change::RemoveGroup { group } => self.platform.remove_group(id, *group).await,
            };
            match result {
                Ok(()) => records.push(ChangeRecord::Applied(change)),
                Err(error) => {
                    warn!(user_id = %id, change = %change, error = %error, "platform change failed");
                    records.push(ChangeRecord::Failed { change, error });
                }
            }
        }
        records
    }
}
