use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::lookup::{FailureReason, LookupClient, LookupStage};
use super::rate_limit::SharedRateLimiter;
use crate::platform::UserId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub account: String,
    pub settlement: String,
    pub affiliation: String,
}

/// Where resolution stopped, plus whatever was learned before it did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolutionFailure {
    pub stage: LookupStage,
    pub reason: FailureReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResolutionOutcome {
    Success(Resolution),
    Failure(ResolutionFailure),
}

impl ResolutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ResolutionOutcome::Success(_))
    }
}

/// Runs the three dependent lookups for one identifier.
///
/// Every call goes through the shared rate limiter and carries its own
/// timeout. A fixed pause follows each successful stage that has a successor.
/// Resolutions never overlap: a second caller waits until the first one has
/// finished all of its stages.
pub struct Resolver {
    client: Arc<dyn LookupClient>,
    limiter: Arc<SharedRateLimiter>,
    call_timeout: Duration,
    inter_stage_delay: Duration,
    in_flight: Mutex<()>,
}

impl Resolver {
    pub fn new(
        client: Arc<dyn LookupClient>,
        limiter: Arc<SharedRateLimiter>,
        call_timeout: Duration,
        inter_stage_delay: Duration,
    ) -> Self {
        Self {
            client,
            limiter,
            call_timeout,
            inter_stage_delay,
            in_flight: Mutex::new(()),
        }
    }

    async fn call(&self, stage: LookupStage, key: &str) -> Result<String, FailureReason> {
        self.limiter.acquire().await;
        match tokio::time::timeout(self.call_timeout, self.client.lookup(stage, key)).await {
            Ok(result) => result,
            Err(_) => Err(FailureReason::Timeout),
        }
    }

    async fn pause_between_stages(&self) {
        if !self.inter_stage_delay.is_zero() {
            tokio::time::sleep(self.inter_stage_delay).await;
        }
    }

    pub async fn resolve(&self, id: UserId) -> ResolutionOutcome {
        let _turn = self.in_flight.lock().await;
        let failure = |stage: LookupStage,
                       reason: FailureReason,
                       account: Option<&str>,
                       settlement: Option<&str>| {
            warn!(user_id = %id, %stage, reason = %reason, "resolution failed");
            ResolutionOutcome::Failure(ResolutionFailure {
                stage,
                reason,
                account: account.map(str::to_string),
                settlement: settlement.map(str::to_string),
            })
        };

        let account = match self.call(LookupStage::AccountLookup, &id.to_string()).await {
            Ok(account) => account,
            Err(reason) => return failure(LookupStage::AccountLookup, reason, None, None),
        };
        debug!(user_id = %id, account = %account, "account resolved");
        self.pause_between_stages().await;

        let settlement = match self.call(LookupStage::SettlementLookup, &account).await {
            Ok(settlement) => settlement,
            Err(reason) => {
                return failure(LookupStage::SettlementLookup, reason, Some(account.as_str()), None)
            }
        };
        debug!(user_id = %id, settlement = %settlement, "settlement resolved");
        self.pause_between_stages().await;

        let affiliation = match self.call(LookupStage::AffiliationLookup, &settlement).await {
            Ok(affiliation) => affiliation,
            Err(reason) => {
                return failure(
                    LookupStage::AffiliationLookup,
                    reason,
                    Some(account.as_str()),
                    Some(settlement.as_str()),
                )
            }
        };
        debug!(user_id = %id, affiliation = %affiliation, "affiliation resolved");

        ResolutionOutcome::Success(Resolution {
            account,
            settlement,
            affiliation,
        })
    }
}
