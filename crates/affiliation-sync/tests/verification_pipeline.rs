//! End-to-end drains through the public context and scheduler, with the lookup
//! service served over HTTP and the platform held in memory.

mod common {
    use std::collections::{BTreeMap, BTreeSet, HashMap};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use affiliation_sync::config::AppConfig;
    use affiliation_sync::platform::{
        ChannelId, GroupId, Member, MembershipPlatform, PlatformError, Report, ReportPublisher,
        UserId,
    };
    use affiliation_sync::verification::{
        BatchScheduler, Collaborators, HttpLookupClient, VerificationContext,
    };

    #[derive(Default)]
    pub(super) struct MemoryPlatform {
        members: Mutex<BTreeMap<UserId, Member>>,
    }

    impl MemoryPlatform {
        pub(super) fn insert(&self, id: u64, nickname: Option<&str>, groups: &[u64]) {
            self.members.lock().expect("members").insert(
                UserId(id),
                Member {
                    id: UserId(id),
                    username: format!("user{id}"),
                    nickname: nickname.map(str::to_string),
                    groups: groups.iter().copied().map(GroupId).collect(),
                },
            );
        }

        pub(super) fn get(&self, id: u64) -> Member {
            self.members
                .lock()
                .expect("members")
                .get(&UserId(id))
                .cloned()
                .expect("member present")
        }

        fn update(&self, id: UserId, apply: impl FnOnce(&mut Member)) -> Result<(), PlatformError> {
            let mut members = self.members.lock().expect("members");
            let member = members
                .get_mut(&id)
                .ok_or_else(|| PlatformError::NotFound(format!("member {id}")))?;
            apply(member);
            Ok(())
        }
    }

    #[async_trait]
    impl MembershipPlatform for MemoryPlatform {
        async fn member(&self, id: UserId) -> Result<Option<Member>, PlatformError> {
            Ok(self.members.lock().expect("members").get(&id).cloned())
        }

        async fn set_display_name(
            &self,
            id: UserId,
            name: Option<&str>,
        ) -> Result<(), PlatformError> {
            self.update(id, |member| member.nickname = name.map(str::to_string))
        }

        async fn add_group(&self, id: UserId, group: GroupId) -> Result<(), PlatformError> {
            self.update(id, |member| {
                member.groups.insert(group);
            })
        }

        async fn remove_group(&self, id: UserId, group: GroupId) -> Result<(), PlatformError> {
            self.update(id, |member| {
                member.groups.remove(&group);
            })
        }

        async fn group_members(&self, group: GroupId) -> Result<Vec<UserId>, PlatformError> {
            Ok(self
                .members
                .lock()
                .expect("members")
                .values()
                .filter(|member| member.has_group(group))
                .map(|member| member.id)
                .collect())
        }

        async fn managed_groups(&self) -> Result<BTreeSet<GroupId>, PlatformError> {
            Ok(BTreeSet::from([GroupId(10)]))
        }
    }

    #[derive(Default)]
    pub(super) struct MemoryReports {
        reports: Mutex<Vec<(ChannelId, Report)>>,
    }

    impl MemoryReports {
        pub(super) fn titles(&self, channel: u64) -> Vec<String> {
            self.reports
                .lock()
                .expect("reports")
                .iter()
                .filter(|(target, _)| *target == ChannelId(channel))
                .map(|(_, report)| report.title.clone())
                .collect()
        }

        pub(super) fn descriptions(&self, channel: u64) -> Vec<String> {
            self.reports
                .lock()
                .expect("reports")
                .iter()
                .filter(|(target, _)| *target == ChannelId(channel))
                .filter_map(|(_, report)| report.description.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ReportPublisher for MemoryReports {
        async fn publish(&self, channel: ChannelId, report: Report) -> Result<(), PlatformError> {
            self.reports.lock().expect("reports").push((channel, report));
            Ok(())
        }

        async fn send_text(&self, _channel: ChannelId, _text: &str) -> Result<(), PlatformError> {
            Ok(())
        }
    }

    pub(super) struct Pipeline {
        pub(super) _dir: TempDir,
        pub(super) platform: Arc<MemoryPlatform>,
        pub(super) reports: Arc<MemoryReports>,
        pub(super) scheduler: BatchScheduler,
    }

    pub(super) fn pipeline(lookup_base: &str, lockout: bool) -> Pipeline {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().to_string_lossy().to_string();
        let values: HashMap<String, String> = [
            ("DISCORD_TOKEN", "token"),
            ("GUILD_ID", "10"),
            ("SUCCESS_CHANNEL_ID", "20"),
            ("FAILURE_CHANNEL_ID", "21"),
            ("HOME_GROUP_ID", "30"),
            ("FOREIGN_GROUP_ID", "31"),
            ("HOME_AFFILIATION", "Red_Mafia"),
            ("LOCKOUT_ON_FAILURE", if lockout { "true" } else { "false" }),
            ("INTER_STAGE_DELAY_SECS", "0"),
            ("INTER_USER_DELAY_SECS", "0"),
            ("LOOKUP_API_BASE", lookup_base),
            ("DATA_DIR", data_dir.as_str()),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
        let config = AppConfig::from_map(&values).expect("config loads");

        let platform = Arc::new(MemoryPlatform::default());
        let reports = Arc::new(MemoryReports::default());
        let lookup = Arc::new(
            HttpLookupClient::new(lookup_base, Duration::from_secs(5)).expect("lookup client"),
        );
        let context = VerificationContext::new(
            &config,
            Collaborators {
                platform: platform.clone(),
                publisher: reports.clone(),
                lookup: lookup.clone(),
                directory: Some(lookup),
            },
        )
        .expect("context builds");

        Pipeline {
            _dir: dir,
            platform,
            reports,
            scheduler: BatchScheduler::new(Arc::new(context)),
        }
    }
}

use affiliation_sync::platform::{GroupId, UserId};
use affiliation_sync::verification::{EnqueueOutcome, UserOutcome};
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn serve(server: &MockServer, route: &str, key: &str, value: &str, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path(route))
        .and(query_param(key, value))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn drain_verifies_home_member_and_digests_failures() {
    let server = MockServer::start().await;
    serve(&server, "/discord", "discord", "1", json!({ "data": [{ "name": "Steve2" }] })).await;
    serve(&server, "/resident", "name", "Steve2", json!({ "data": [{ "town": "Harbor" }] })).await;
    serve(&server, "/town", "name", "Harbor", json!({ "data": [{ "nation": "Red_Mafia" }] })).await;
    serve(&server, "/discord", "discord", "2", json!({ "data": [{ "name": "Ghost" }] })).await;
    serve(&server, "/resident", "name", "Ghost", json!({ "data": [] })).await;

    let pipeline = common::pipeline(&server.uri(), false);
    pipeline.platform.insert(1, Some("Steve ㅣ Falcon"), &[31]);
    pipeline.platform.insert(2, None, &[30]);
    let context = pipeline.scheduler.context();
    context
        .settlements
        .set("Harbor", GroupId(40))
        .expect("settlement mapped");

    assert_eq!(pipeline.scheduler.enqueue_user(UserId(1)), EnqueueOutcome::Added);
    assert_eq!(pipeline.scheduler.enqueue_user(UserId(2)), EnqueueOutcome::Added);
    assert_eq!(
        pipeline.scheduler.enqueue_user(UserId(1)),
        EnqueueOutcome::AlreadyQueued
    );

    let summary = pipeline.scheduler.drain_once().await.expect("drain ran");

    assert!(summary.outcomes[0].is_verified());
    assert!(matches!(summary.outcomes[1], UserOutcome::Failed { .. }));
    let steve = pipeline.platform.get(1);
    assert_eq!(steve.display_name(), "Steve2 ㅣ Falcon");
    assert!(steve.has_group(GroupId(30)));
    assert!(steve.has_group(GroupId(40)));
    assert!(!steve.has_group(GroupId(31)));

    assert_eq!(pipeline.reports.titles(20), vec!["Red_Mafia member verified"]);
    let digests = pipeline.reports.descriptions(21);
    assert_eq!(digests.len(), 1);
    assert!(digests[0].contains("settlement-lookup (empty-result)"));
    assert!(digests[0].contains("account `Ghost`"));
    assert!(pipeline.platform.get(2).has_group(GroupId(30)));
}

#[tokio::test]
async fn lockout_policy_strips_failed_member() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/discord"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let pipeline = common::pipeline(&server.uri(), true);
    pipeline.platform.insert(2, Some("Ghost ㅣ Falcon"), &[10, 30, 40]);
    pipeline.scheduler.enqueue_user(UserId(2));

    let summary = pipeline.scheduler.drain_once().await.expect("drain ran");

    match &summary.outcomes[0] {
        UserOutcome::Failed {
            failure, lockout, ..
        } => {
            assert_eq!(failure.reason.label(), "upstream-error");
            assert_eq!(lockout.as_ref().map(|report| report.applied()), Some(3));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    let ghost = pipeline.platform.get(2);
    assert_eq!(ghost.groups.len(), 1);
    assert!(ghost.nickname.is_none());
}

#[tokio::test]
async fn unmapped_settlements_come_from_the_directory() {
    let server = MockServer::start().await;
    serve(
        &server,
        "/nation",
        "name",
        "Red_Mafia",
        json!({ "data": [{ "towns": ["Harbor", "Ridge"] }] }),
    )
    .await;

    let pipeline = common::pipeline(&server.uri(), false);
    let context = pipeline.scheduler.context();
    context
        .settlements
        .set("Harbor", GroupId(40))
        .expect("settlement mapped");

    let unmapped = context
        .unmapped_settlements()
        .await
        .expect("directory answers");

    assert_eq!(unmapped, vec!["Ridge".to_string()]);
}
