//! Capability interfaces over the community platform the verifier manages.
//!
//! The pipeline only talks to these traits. `discord` provides the production
//! adapter; tests supply in-memory fakes.

pub mod discord;

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use discord::DiscordPlatform;

/// Platform account id of a member. The queue's unique key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Platform role / group id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub u64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GuildId(pub u64);

/// Snapshot of a member as the platform reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: UserId,
    pub username: String,
    /// Server-specific display name, if one is set.
    pub nickname: Option<String>,
    pub groups: BTreeSet<GroupId>,
}

impl Member {
    pub fn display_name(&self) -> &str {
        self.nickname.as_deref().unwrap_or(&self.username)
    }

    pub fn has_group(&self, group: GroupId) -> bool {
        self.groups.contains(&group)
    }

    pub fn mention(&self) -> String {
        format!("<@{}>", self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    #[error("missing permission for {0}")]
    Forbidden(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("platform api returned status {status}: {message}")]
    Api { status: u16, message: String },
    #[error("platform transport failed: {0}")]
    Transport(String),
}

/// Member and group operations the reconciler and scheduler depend on.
#[async_trait]
pub trait MembershipPlatform: Send + Sync {
    /// Returns `None` when the user is not a member of the community.
    async fn member(&self, id: UserId) -> Result<Option<Member>, PlatformError>;

    /// `None` clears the server-specific name.
    async fn set_display_name(&self, id: UserId, name: Option<&str>) -> Result<(), PlatformError>;

    async fn add_group(&self, id: UserId, group: GroupId) -> Result<(), PlatformError>;

    async fn remove_group(&self, id: UserId, group: GroupId) -> Result<(), PlatformError>;

    async fn group_members(&self, group: GroupId) -> Result<Vec<UserId>, PlatformError>;

    /// Groups the platform itself manages and which can never be removed from a member.
    async fn managed_groups(&self) -> Result<BTreeSet<GroupId>, PlatformError>;
}

/// Severity tint applied to an outbound report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportTone {
    Success,
    Warning,
    Failure,
}

impl ReportTone {
    pub fn color(self) -> u32 {
        match self {
            ReportTone::Success => 0x00ff00,
            ReportTone::Warning => 0xff9900,
            ReportTone::Failure => 0xff0000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportField {
    pub name: String,
    pub value: String,
}

/// Channel message summarising verification activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub title: String,
    pub description: Option<String>,
    pub tone: ReportTone,
    pub fields: Vec<ReportField>,
    pub timestamp: DateTime<Utc>,
}

impl Report {
    pub fn new(title: impl Into<String>, tone: ReportTone) -> Self {
        Self {
            title: title.into(),
            description: None,
            tone,
            fields: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push(ReportField {
            name: name.into(),
            value: value.into(),
        });
        self
    }
}

#[async_trait]
pub trait ReportPublisher: Send + Sync {
    async fn publish(&self, channel: ChannelId, report: Report) -> Result<(), PlatformError>;

    async fn send_text(&self, channel: ChannelId, text: &str) -> Result<(), PlatformError>;
}
