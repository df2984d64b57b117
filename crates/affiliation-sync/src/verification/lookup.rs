//! Read-only client for the upstream account/settlement/affiliation service.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The three dependent lookups, in resolution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LookupStage {
    AccountLookup,
    SettlementLookup,
    AffiliationLookup,
}

impl LookupStage {
    pub const ALL: [LookupStage; 3] = [
        LookupStage::AccountLookup,
        LookupStage::SettlementLookup,
        LookupStage::AffiliationLookup,
    ];

    pub fn label(self) -> &'static str {
        match self {
            LookupStage::AccountLookup => "account-lookup",
            LookupStage::SettlementLookup => "settlement-lookup",
            LookupStage::AffiliationLookup => "affiliation-lookup",
        }
    }

    fn path(self) -> &'static str {
        match self {
            LookupStage::AccountLookup => "/discord",
            LookupStage::SettlementLookup => "/resident",
            LookupStage::AffiliationLookup => "/town",
        }
    }

    fn query_key(self) -> &'static str {
        match self {
            LookupStage::AccountLookup => "discord",
            LookupStage::SettlementLookup | LookupStage::AffiliationLookup => "name",
        }
    }

    fn field(self) -> &'static str {
        match self {
            LookupStage::AccountLookup => "name",
            LookupStage::SettlementLookup => "town",
            LookupStage::AffiliationLookup => "nation",
        }
    }
}

impl fmt::Display for LookupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why a single lookup did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "kebab-case")]
pub enum FailureReason {
    #[error("upstream returned HTTP {0}")]
    UpstreamStatus(u16),
    #[error("upstream returned no data")]
    EmptyResult,
    #[error("upstream record has no value for the requested field")]
    MissingField,
    #[error("upstream call timed out")]
    Timeout,
    #[error("upstream call failed: {0}")]
    Transport(String),
}

impl FailureReason {
    pub fn label(&self) -> &'static str {
        match self {
            FailureReason::UpstreamStatus(_) => "upstream-error",
            FailureReason::EmptyResult => "empty-result",
            FailureReason::MissingField => "missing-field",
            FailureReason::Timeout => "timeout",
            FailureReason::Transport(_) => "error",
        }
    }
}

/// One outbound lookup. Implementations must not retry or throttle; the
/// resolver owns both concerns.
#[async_trait]
pub trait LookupClient: Send + Sync {
    async fn lookup(&self, stage: LookupStage, key: &str) -> Result<String, FailureReason>;
}

/// Settlements belonging to an affiliation. Only some lookup backends offer it.
#[async_trait]
pub trait AffiliationDirectory: Send + Sync {
    async fn settlements_in(&self, affiliation: &str) -> Result<Vec<String>, FailureReason>;
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Option<Vec<Value>>,
}

/// `reqwest` implementation speaking the lookup service's `{ data: [...] }` format.
#[derive(Debug, Clone)]
pub struct HttpLookupClient {
    client: Client,
    api_base: String,
}

impl HttpLookupClient {
    pub fn new(api_base: impl Into<String>, timeout: Duration) -> Result<Self, FailureReason> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| FailureReason::Transport(err.to_string()))?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        })
    }

    async fn first_record(&self, path: &str, key: &str, value: &str) -> Result<Value, FailureReason> {
        let response = self
            .client
            .get(format!("{}{}", self.api_base, path))
            .query(&[(key, value)])
            .send()
            .await
            .map_err(classify_transport)?;

        if response.status() != StatusCode::OK {
            return Err(FailureReason::UpstreamStatus(response.status().as_u16()));
        }

        let envelope: Envelope = response.json().await.map_err(classify_transport)?;
        envelope
            .data
            .and_then(|records| records.into_iter().next())
            .ok_or(FailureReason::EmptyResult)
    }
}

fn classify_transport(err: reqwest::Error) -> FailureReason {
    if err.is_timeout() {
        FailureReason::Timeout
    } else {
        FailureReason::Transport(err.to_string())
    }
}

fn non_empty_str(record: &Value, field: &str) -> Option<String> {
    record
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl LookupClient for HttpLookupClient {
    async fn lookup(&self, stage: LookupStage, key: &str) -> Result<String, FailureReason> {
        let record = self.first_record(stage.path(), stage.query_key(), key).await?;
        non_empty_str(&record, stage.field()).ok_or(FailureReason::MissingField)
    }
}

#[async_trait]
impl AffiliationDirectory for HttpLookupClient {
    async fn settlements_in(&self, affiliation: &str) -> Result<Vec<String>, FailureReason> {
        let record = self.first_record("/nation", "name", affiliation).await?;
        let towns = record
            .get("towns")
            .and_then(Value::as_array)
            .ok_or(FailureReason::MissingField)?;
        Ok(towns
            .iter()
            .filter_map(|town| match town {
                Value::String(name) => Some(name.clone()),
                Value::Object(_) => non_empty_str(town, "name"),
                _ => None,
            })
            .collect())
    }
}
