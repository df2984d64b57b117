use std::sync::Arc;
use std::time::Duration;

use super::display_name::DisplayNamePolicy;
use super::lookup::{AffiliationDirectory, HttpLookupClient, LookupClient};
use super::queue::VerificationQueue;
use super::rate_limit::{RateLimiter, SharedRateLimiter};
use super::reconcile::{IdentityReconciler, ReconcilePolicy};
use super::resolver::Resolver;
use super::schedule::WeeklySchedule;
use crate::config::{AppConfig, ConfigError};
use crate::error::AppError;
use crate::platform::{ChannelId, DiscordPlatform, GroupId, MembershipPlatform, ReportPublisher};
use crate::stores::{AliasStore, ExceptionStore, SettlementGroupStore};

/// Scheduler-facing settings derived from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub home_affiliation: String,
    pub success_channel: ChannelId,
    pub failure_channel: ChannelId,
    pub welcome_channel: Option<ChannelId>,
    pub auto_enqueue_new_members: bool,
    pub drain_interval: Duration,
    pub batch_size: usize,
    pub inter_user_delay: Duration,
    pub bulk_groups: Vec<GroupId>,
    pub bulk_schedule: WeeklySchedule,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        let schedule = &config.schedule;
        let bulk_schedule = WeeklySchedule::new(
            schedule.bulk_weekday,
            schedule.bulk_hour,
            schedule.bulk_minute,
            schedule.utc_offset,
        )
        .ok_or_else(|| ConfigError::Invalid {
            key: "BULK_ENQUEUE_HOUR",
            value: format!("{}:{}", schedule.bulk_hour, schedule.bulk_minute),
        })?;

        Ok(Self {
            home_affiliation: config.verification.home_affiliation.clone(),
            success_channel: config.platform.success_channel,
            failure_channel: config.platform.failure_channel,
            welcome_channel: config.platform.welcome_channel,
            auto_enqueue_new_members: config.verification.auto_enqueue_new_members,
            drain_interval: schedule.drain_interval,
            batch_size: schedule.batch_size,
            inter_user_delay: schedule.inter_user_delay,
            bulk_groups: schedule.bulk_groups.clone(),
            bulk_schedule,
        })
    }
}

/// External services the pipeline talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub platform: Arc<dyn MembershipPlatform>,
    pub publisher: Arc<dyn ReportPublisher>,
    pub lookup: Arc<dyn LookupClient>,
    pub directory: Option<Arc<dyn AffiliationDirectory>>,
}

/// Everything the pipeline shares, built once at startup.
pub struct VerificationContext {
    pub settings: PipelineSettings,
    pub queue: Arc<VerificationQueue>,
    pub exceptions: Arc<ExceptionStore>,
    pub aliases: Arc<AliasStore>,
    pub settlements: Arc<SettlementGroupStore>,
    pub resolver: Resolver,
    pub reconciler: IdentityReconciler,
    pub platform: Arc<dyn MembershipPlatform>,
    pub publisher: Arc<dyn ReportPublisher>,
    pub directory: Option<Arc<dyn AffiliationDirectory>>,
}

impl VerificationContext {
    pub fn new(config: &AppConfig, collaborators: Collaborators) -> Result<Self, ConfigError> {
        let settings = PipelineSettings::from_config(config)?;
        let exceptions = Arc::new(ExceptionStore::new(config.storage.exceptions_path()));
        let aliases = Arc::new(AliasStore::new(
            config.storage.aliases_path(),
            config.verification.separator.clone(),
        ));
        let settlements = Arc::new(SettlementGroupStore::new(
            config.storage.settlement_groups_path(),
        ));

        let limiter = Arc::new(SharedRateLimiter::new(RateLimiter::new(
            config.lookup.max_requests,
            config.lookup.window,
        )));
        let resolver = Resolver::new(
            collaborators.lookup,
            limiter,
            config.lookup.timeout,
            config.lookup.inter_stage_delay,
        );

        let verification = &config.verification;
        let reconciler = IdentityReconciler::new(
            collaborators.platform.clone(),
            aliases.clone(),
            settlements.clone(),
            DisplayNamePolicy::new(
                verification.separator.clone(),
                verification.max_display_name_len,
            ),
            ReconcilePolicy {
                home_affiliation: verification.home_affiliation.clone(),
                home_group: verification.home_group,
                foreign_group: verification.foreign_group,
                strip_group_on_mismatch: verification.strip_group_on_mismatch,
                lockout_on_failure: verification.lockout_on_failure,
            },
        );

        Ok(Self {
            settings,
            queue: Arc::new(VerificationQueue::new()),
            exceptions,
            aliases,
            settlements,
            resolver,
            reconciler,
            platform: collaborators.platform,
            publisher: collaborators.publisher,
            directory: collaborators.directory,
        })
    }

    /// Production wiring: Discord for the platform and reports, HTTP for lookups.
    pub fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        let discord = Arc::new(DiscordPlatform::new(
            config.platform.api_base.clone(),
            config.platform.token.clone(),
            config.platform.guild_id,
            config.lookup.timeout,
        )?);
        // The resolver enforces the per-call timeout; the client timeout is a backstop.
        let lookup = Arc::new(HttpLookupClient::new(
            config.lookup.api_base.clone(),
            config.lookup.timeout + Duration::from_secs(1),
        )?);

        let collaborators = Collaborators {
            platform: discord.clone(),
            publisher: discord,
            lookup: lookup.clone(),
            directory: Some(lookup),
        };
        Ok(Self::new(config, collaborators)?)
    }

    /// Settlements of the home affiliation that have no mapped group yet.
    pub async fn unmapped_settlements(&self) -> Result<Vec<String>, AppError> {
        let directory = self
            .directory
            .as_ref()
            .ok_or_else(|| AppError::NotFound("affiliation directory".to_string()))?;
        let settlements = directory
            .settlements_in(&self.settings.home_affiliation)
            .await?;
        let mapped = self.settlements.list()?;
        Ok(settlements
            .into_iter()
            .filter(|settlement| !mapped.contains_key(settlement))
            .collect())
    }
}
