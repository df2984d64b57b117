use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use crate::config::AppConfig;
use crate::platform::{
    ChannelId, GroupId, Member, MembershipPlatform, PlatformError, Report, ReportPublisher, UserId,
};
use crate::verification::context::{Collaborators, VerificationContext};
use crate::verification::lookup::{FailureReason, LookupClient, LookupStage};
use crate::verification::scheduler::BatchScheduler;

pub(super) const HOME: &str = "Red_Mafia";
pub(super) const HOME_GROUP: GroupId = GroupId(30);
pub(super) const FOREIGN_GROUP: GroupId = GroupId(31);
pub(super) const SUCCESS_CHANNEL: ChannelId = ChannelId(20);
pub(super) const FAILURE_CHANNEL: ChannelId = ChannelId(21);
pub(super) const WELCOME_CHANNEL: ChannelId = ChannelId(22);

pub(super) fn member(id: u64, nickname: Option<&str>, groups: &[u64]) -> Member {
    Member {
        id: UserId(id),
        username: format!("user{id}"),
        nickname: nickname.map(str::to_string),
        groups: groups.iter().copied().map(GroupId).collect(),
    }
}

#[derive(Default)]
struct PlatformState {
    members: BTreeMap<UserId, Member>,
    managed: BTreeSet<GroupId>,
    forbid_display_name: bool,
    unavailable: BTreeSet<UserId>,
    mutations: Vec<String>,
}

/// In-memory platform that applies mutations to its own member records.
#[derive(Default)]
pub(super) struct FakePlatform {
    state: Mutex<PlatformState>,
}

impl FakePlatform {
    pub(super) fn with_members(members: impl IntoIterator<Item = Member>) -> Self {
        let platform = Self::default();
        {
            let mut state = platform.state.lock().expect("platform state");
            for member in members {
                state.members.insert(member.id, member);
            }
        }
        platform
    }

    pub(super) fn snapshot(&self, id: u64) -> Member {
        self.state
            .lock()
            .expect("platform state")
            .members
            .get(&UserId(id))
            .cloned()
            .expect("member exists")
    }

    pub(super) fn mutations(&self) -> Vec<String> {
        self.state.lock().expect("platform state").mutations.clone()
    }

    pub(super) fn forbid_display_names(&self) {
        self.state.lock().expect("platform state").forbid_display_name = true;
    }

    pub(super) fn set_managed(&self, groups: &[u64]) {
        self.state.lock().expect("platform state").managed =
            groups.iter().copied().map(GroupId).collect();
    }

    pub(super) fn make_unavailable(&self, id: u64) {
        self.state
            .lock()
            .expect("platform state")
            .unavailable
            .insert(UserId(id));
    }
}

#[async_trait]
impl MembershipPlatform for FakePlatform {
    async fn member(&self, id: UserId) -> Result<Option<Member>, PlatformError> {
        let state = self.state.lock().expect("platform state");
        if state.unavailable.contains(&id) {
            return Err(PlatformError::Transport("connection reset".to_string()));
        }
        Ok(state.members.get(&id).cloned())
    }

    async fn set_display_name(&self, id: UserId, name: Option<&str>) -> Result<(), PlatformError> {
        let mut state = self.state.lock().expect("platform state");
        if state.forbid_display_name {
            return Err(PlatformError::Forbidden("nickname".to_string()));
        }
        let member = state
            .members
            .get_mut(&id)
            .ok_or_else(|| PlatformError::NotFound(format!("member {id}")))?;
        member.nickname = name.map(str::to_string);
        state.mutations.push(format!("nick {id} {name:?}"));
        Ok(())
    }

    async fn add_group(&self, id: UserId, group: GroupId) -> Result<(), PlatformError> {
        let mut state = self.state.lock().expect("platform state");
        let member = state
            .members
            .get_mut(&id)
            .ok_or_else(|| PlatformError::NotFound(format!("member {id}")))?;
        member.groups.insert(group);
        state.mutations.push(format!("add {id} {group}"));
        Ok(())
    }

    async fn remove_group(&self, id: UserId, group: GroupId) -> Result<(), PlatformError> {
        let mut state = self.state.lock().expect("platform state");
        let member = state
            .members
            .get_mut(&id)
            .ok_or_else(|| PlatformError::NotFound(format!("member {id}")))?;
        member.groups.remove(&group);
        state.mutations.push(format!("remove {id} {group}"));
        Ok(())
    }

    async fn group_members(&self, group: GroupId) -> Result<Vec<UserId>, PlatformError> {
        let state = self.state.lock().expect("platform state");
        Ok(state
            .members
            .values()
            .filter(|member| member.has_group(group))
            .map(|member| member.id)
            .collect())
    }

    async fn managed_groups(&self) -> Result<BTreeSet<GroupId>, PlatformError> {
        Ok(self.state.lock().expect("platform state").managed.clone())
    }
}

/// Scripted lookup service. Unknown keys answer with an empty result.
#[derive(Default)]
pub(super) struct FakeLookup {
    answers: Mutex<HashMap<(LookupStage, String), Result<String, FailureReason>>>,
    calls: Mutex<Vec<(LookupStage, String)>>,
    latency: Mutex<Option<Duration>>,
}

impl FakeLookup {
    pub(super) fn answer(&self, stage: LookupStage, key: &str, result: Result<&str, FailureReason>) {
        self.answers
            .lock()
            .expect("answers")
            .insert((stage, key.to_string()), result.map(str::to_string));
    }

    pub(super) fn resolves(&self, id: u64, account: &str, settlement: &str, affiliation: &str) {
        self.answer(LookupStage::AccountLookup, &id.to_string(), Ok(account));
        self.answer(LookupStage::SettlementLookup, account, Ok(settlement));
        self.answer(LookupStage::AffiliationLookup, settlement, Ok(affiliation));
    }

    pub(super) fn set_latency(&self, latency: Duration) {
        *self.latency.lock().expect("latency") = Some(latency);
    }

    pub(super) fn calls(&self) -> Vec<(LookupStage, String)> {
        self.calls.lock().expect("calls").clone()
    }

    pub(super) fn looked_up_ids(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(stage, _)| *stage == LookupStage::AccountLookup)
            .map(|(_, key)| key)
            .collect()
    }
}

#[async_trait]
impl LookupClient for FakeLookup {
    async fn lookup(&self, stage: LookupStage, key: &str) -> Result<String, FailureReason> {
        self.calls
            .lock()
            .expect("calls")
            .push((stage, key.to_string()));
        let latency = *self.latency.lock().expect("latency");
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.answers
            .lock()
            .expect("answers")
            .get(&(stage, key.to_string()))
            .cloned()
            .unwrap_or(Err(FailureReason::EmptyResult))
    }
}

#[derive(Default)]
pub(super) struct RecordingPublisher {
    reports: Mutex<Vec<(ChannelId, Report)>>,
    texts: Mutex<Vec<(ChannelId, String)>>,
}

impl RecordingPublisher {
    pub(super) fn reports_to(&self, channel: ChannelId) -> Vec<Report> {
        self.reports
            .lock()
            .expect("reports")
            .iter()
            .filter(|(target, _)| *target == channel)
            .map(|(_, report)| report.clone())
            .collect()
    }

    pub(super) fn texts(&self) -> Vec<(ChannelId, String)> {
        self.texts.lock().expect("texts").clone()
    }
}

#[async_trait]
impl ReportPublisher for RecordingPublisher {
    async fn publish(&self, channel: ChannelId, report: Report) -> Result<(), PlatformError> {
        self.reports.lock().expect("reports").push((channel, report));
        Ok(())
    }

    async fn send_text(&self, channel: ChannelId, text: &str) -> Result<(), PlatformError> {
        self.texts
            .lock()
            .expect("texts")
            .push((channel, text.to_string()));
        Ok(())
    }
}

/// A fully wired pipeline over fakes and a temporary data directory.
pub(super) struct Harness {
    pub(super) _dir: TempDir,
    pub(super) platform: Arc<FakePlatform>,
    pub(super) lookup: Arc<FakeLookup>,
    pub(super) publisher: Arc<RecordingPublisher>,
    pub(super) context: Arc<VerificationContext>,
    pub(super) scheduler: Arc<BatchScheduler>,
}

pub(super) fn config(dir: &TempDir, overrides: &[(&str, &str)]) -> AppConfig {
    let data_dir = dir.path().to_string_lossy().to_string();
    let mut values: HashMap<String, String> = [
        ("DISCORD_TOKEN", "token"),
        ("GUILD_ID", "10"),
        ("SUCCESS_CHANNEL_ID", "20"),
        ("FAILURE_CHANNEL_ID", "21"),
        ("HOME_GROUP_ID", "30"),
        ("FOREIGN_GROUP_ID", "31"),
        ("HOME_AFFILIATION", HOME),
        ("LOCKOUT_ON_FAILURE", "false"),
        ("INTER_STAGE_DELAY_SECS", "0"),
        ("INTER_USER_DELAY_SECS", "0"),
        ("DATA_DIR", data_dir.as_str()),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_string(), value.to_string()))
    .collect();
    for (key, value) in overrides {
        values.insert(key.to_string(), value.to_string());
    }
    AppConfig::from_map(&values).expect("test config loads")
}

impl Harness {
    pub(super) fn new(members: Vec<Member>) -> Self {
        Self::with_config(members, &[])
    }

    pub(super) fn with_config(members: Vec<Member>, overrides: &[(&str, &str)]) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = config(&dir, overrides);
        let platform = Arc::new(FakePlatform::with_members(members));
        let lookup = Arc::new(FakeLookup::default());
        let publisher = Arc::new(RecordingPublisher::default());

        let context = Arc::new(
            VerificationContext::new(
                &config,
                Collaborators {
                    platform: platform.clone(),
                    publisher: publisher.clone(),
                    lookup: lookup.clone(),
                    directory: None,
                },
            )
            .expect("context builds"),
        );
        let scheduler = Arc::new(BatchScheduler::new(context.clone()));

        Self {
            _dir: dir,
            platform,
            lookup,
            publisher,
            context,
            scheduler,
        }
    }
}
