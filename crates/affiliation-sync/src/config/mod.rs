use std::collections::HashMap;
use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use chrono::{FixedOffset, Weekday};

use crate::platform::{ChannelId, GroupId, GuildId};

const DEFAULT_LOOKUP_API_BASE: &str = "https://api.planetearth.kr";
const DEFAULT_DISCORD_API_BASE: &str = "https://discord.com/api/v10";

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub storage: StorageConfig,
    pub platform: PlatformConfig,
    pub lookup: LookupConfig,
    pub verification: VerificationConfig,
    pub schedule: ScheduleConfig,
}

impl AppConfig {
    /// Reads `.env` (when present) and then the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_source(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_source<F>(source: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { source: &source };

        let environment = AppEnvironment::from_str(
            &vars.string("APP_ENV").unwrap_or_else(|| "development".to_string()),
        );

        let server = server_config(&vars)?;
        let log_level = vars.string("APP_LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        let storage = storage_config(&vars);

        let token = vars
            .string("DISCORD_TOKEN")
            .or_else(|| vars.string("BOT_TOKEN"))
            .ok_or(ConfigError::Missing("DISCORD_TOKEN"))?;

        let platform = PlatformConfig {
            token,
            api_base: vars
                .string("DISCORD_API_BASE")
                .unwrap_or_else(|| DEFAULT_DISCORD_API_BASE.to_string()),
            guild_id: GuildId(vars.required_u64("GUILD_ID")?),
            success_channel: ChannelId(vars.required_u64("SUCCESS_CHANNEL_ID")?),
            failure_channel: ChannelId(vars.required_u64("FAILURE_CHANNEL_ID")?),
            welcome_channel: vars.optional_id("WELCOME_CHANNEL_ID")?.map(ChannelId),
        };

        let lookup = LookupConfig {
            api_base: vars
                .string("LOOKUP_API_BASE")
                .unwrap_or_else(|| DEFAULT_LOOKUP_API_BASE.to_string()),
            timeout: Duration::from_secs(vars.u64_or("LOOKUP_TIMEOUT_SECS", 10)?),
            inter_stage_delay: Duration::from_secs(vars.u64_or("INTER_STAGE_DELAY_SECS", 5)?),
            max_requests: vars.positive_u32_or("RATE_LIMIT_MAX_REQUESTS", 70)?,
            window: Duration::from_secs(vars.positive_u64_or("RATE_LIMIT_WINDOW_SECS", 900)?),
        };

        let max_display_name_len = vars.u64_or("DISPLAY_NAME_MAX_LEN", 32)?;
        let verification = VerificationConfig {
            home_affiliation: vars
                .string("HOME_AFFILIATION")
                .unwrap_or_else(|| "Red_Mafia".to_string()),
            home_group: GroupId(vars.required_u64("HOME_GROUP_ID")?),
            foreign_group: vars.optional_id("FOREIGN_GROUP_ID")?.map(GroupId),
            strip_group_on_mismatch: vars.bool_or("STRIP_GROUP_ON_MISMATCH", true)?,
            lockout_on_failure: vars
                .bool("LOCKOUT_ON_FAILURE")?
                .ok_or(ConfigError::Missing("LOCKOUT_ON_FAILURE"))?,
            auto_enqueue_new_members: vars.bool_or("AUTO_ENQUEUE_NEW_MEMBERS", true)?,
            separator: separator(&vars),
            max_display_name_len: usize::try_from(max_display_name_len)
                .map_err(|_| ConfigError::invalid("DISPLAY_NAME_MAX_LEN", max_display_name_len))?,
        };

        let batch_size = vars.positive_u64_or("DRAIN_BATCH_SIZE", 3)?;
        let weekday_index = vars.u64_or("BULK_ENQUEUE_DAY", 6)?;
        let hour = vars.u64_or("BULK_ENQUEUE_HOUR", 2)?;
        let minute = vars.u64_or("BULK_ENQUEUE_MINUTE", 0)?;
        let offset_hours = vars.i64_or("SCHEDULE_UTC_OFFSET_HOURS", 9)?;

        let schedule = ScheduleConfig {
            drain_interval: Duration::from_secs(vars.positive_u64_or("DRAIN_INTERVAL_SECS", 60)?),
            batch_size: usize::try_from(batch_size)
                .map_err(|_| ConfigError::invalid("DRAIN_BATCH_SIZE", batch_size))?,
            inter_user_delay: Duration::from_secs(vars.u64_or("INTER_USER_DELAY_SECS", 10)?),
            bulk_groups: vars.id_list("BULK_ENQUEUE_GROUP_IDS")?,
            bulk_weekday: weekday_from_index(weekday_index)
                .ok_or_else(|| ConfigError::invalid("BULK_ENQUEUE_DAY", weekday_index))?,
            bulk_hour: bounded(hour, 23).ok_or_else(|| ConfigError::invalid("BULK_ENQUEUE_HOUR", hour))?,
            bulk_minute: bounded(minute, 59)
                .ok_or_else(|| ConfigError::invalid("BULK_ENQUEUE_MINUTE", minute))?,
            utc_offset: i32::try_from(offset_hours)
                .ok()
                .and_then(|hours| FixedOffset::east_opt(hours * 3600))
                .ok_or_else(|| ConfigError::invalid("SCHEDULE_UTC_OFFSET_HOURS", offset_hours))?,
        };

        Ok(Self {
            environment,
            server,
            telemetry: TelemetryConfig { log_level },
            storage,
            platform,
            lookup,
            verification,
            schedule,
        })
    }

    /// Builds the configuration from a fixed set of key/value pairs.
    pub fn from_map(values: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_source(|key| values.get(key).cloned())
    }
}

/// The slice of configuration needed to edit the stores or talk to a running
/// server. Loads without platform credentials or verification policy.
#[derive(Debug, Clone)]
pub struct LocalConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub separator: String,
}

impl LocalConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_source(|key| env::var(key).ok())
    }

    pub fn from_source<F>(source: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { source: &source };
        Ok(Self {
            server: server_config(&vars)?,
            storage: storage_config(&vars),
            separator: separator(&vars),
        })
    }

    pub fn from_map(values: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_source(|key| values.get(key).cloned())
    }
}

fn server_config<F>(vars: &Vars<'_, F>) -> Result<ServerConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let host = vars.string("APP_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
    let port = vars
        .string("APP_PORT")
        .unwrap_or_else(|| "3000".to_string())
        .parse::<u16>()
        .map_err(|_| ConfigError::InvalidPort)?;
    Ok(ServerConfig { host, port })
}

fn storage_config<F>(vars: &Vars<'_, F>) -> StorageConfig
where
    F: Fn(&str) -> Option<String>,
{
    StorageConfig {
        data_dir: PathBuf::from(vars.string("DATA_DIR").unwrap_or_else(|| ".".to_string())),
    }
}

fn separator<F>(vars: &Vars<'_, F>) -> String
where
    F: Fn(&str) -> Option<String>,
{
    vars.raw("DISPLAY_NAME_SEPARATOR")
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| " ㅣ ".to_string())
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// Location of the JSON documents backing the persisted stores.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl StorageConfig {
    pub fn exceptions_path(&self) -> PathBuf {
        self.data_dir.join("exceptions.json")
    }

    pub fn aliases_path(&self) -> PathBuf {
        self.data_dir.join("aliases.json")
    }

    pub fn settlement_groups_path(&self) -> PathBuf {
        self.data_dir.join("settlement_groups.json")
    }
}

/// Credentials and well-known ids on the membership platform.
#[derive(Clone)]
pub struct PlatformConfig {
    pub token: String,
    pub api_base: String,
    pub guild_id: GuildId,
    pub success_channel: ChannelId,
    pub failure_channel: ChannelId,
    pub welcome_channel: Option<ChannelId>,
}

impl fmt::Debug for PlatformConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformConfig")
            .field("token", &"<redacted>")
            .field("api_base", &self.api_base)
            .field("guild_id", &self.guild_id)
            .field("success_channel", &self.success_channel)
            .field("failure_channel", &self.failure_channel)
            .field("welcome_channel", &self.welcome_channel)
            .finish()
    }
}

/// Upstream lookup service endpoint and throttling.
#[derive(Debug, Clone)]
pub struct LookupConfig {
    pub api_base: String,
    pub timeout: Duration,
    pub inter_stage_delay: Duration,
    pub max_requests: u32,
    pub window: Duration,
}

/// Policy knobs for identity reconciliation.
#[derive(Debug, Clone)]
pub struct VerificationConfig {
    pub home_affiliation: String,
    pub home_group: GroupId,
    pub foreign_group: Option<GroupId>,
    pub strip_group_on_mismatch: bool,
    pub lockout_on_failure: bool,
    pub auto_enqueue_new_members: bool,
    pub separator: String,
    pub max_display_name_len: usize,
}

/// Drain cadence and the weekly bulk-enqueue slot.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub drain_interval: Duration,
    pub batch_size: usize,
    pub inter_user_delay: Duration,
    pub bulk_groups: Vec<GroupId>,
    pub bulk_weekday: Weekday,
    pub bulk_hour: u32,
    pub bulk_minute: u32,
    pub utc_offset: FixedOffset,
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    Missing(&'static str),
    Invalid { key: &'static str, value: String },
}

impl ConfigError {
    fn invalid(key: &'static str, value: impl fmt::Display) -> Self {
        Self::Invalid {
            key,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::Missing(key) => write!(f, "{key} is required"),
            ConfigError::Invalid { key, value } => write!(f, "{key} has invalid value '{value}'"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidHost { source } => Some(source),
            ConfigError::InvalidPort | ConfigError::Missing(_) | ConfigError::Invalid { .. } => {
                None
            }
        }
    }
}

struct Vars<'a, F> {
    source: &'a F,
}

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        (self.source)(key)
    }

    fn string(&self, key: &str) -> Option<String> {
        self.raw(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn u64(&self, key: &'static str) -> Result<Option<u64>, ConfigError> {
        self.string(key)
            .map(|value| value.parse::<u64>().map_err(|_| ConfigError::invalid(key, value)))
            .transpose()
    }

    fn u64_or(&self, key: &'static str, default: u64) -> Result<u64, ConfigError> {
        Ok(self.u64(key)?.unwrap_or(default))
    }

    fn positive_u64_or(&self, key: &'static str, default: u64) -> Result<u64, ConfigError> {
        match self.u64_or(key, default)? {
            0 => Err(ConfigError::invalid(key, 0)),
            value => Ok(value),
        }
    }

    fn positive_u32_or(&self, key: &'static str, default: u32) -> Result<u32, ConfigError> {
        let value = self.positive_u64_or(key, u64::from(default))?;
        u32::try_from(value).map_err(|_| ConfigError::invalid(key, value))
    }

    fn i64_or(&self, key: &'static str, default: i64) -> Result<i64, ConfigError> {
        self.string(key)
            .map(|value| value.parse::<i64>().map_err(|_| ConfigError::invalid(key, value)))
            .transpose()
            .map(|value| value.unwrap_or(default))
    }

    fn required_u64(&self, key: &'static str) -> Result<u64, ConfigError> {
        self.u64(key)?.ok_or(ConfigError::Missing(key))
    }

    /// Zero is treated as "not configured".
    fn optional_id(&self, key: &'static str) -> Result<Option<u64>, ConfigError> {
        Ok(self.u64(key)?.filter(|id| *id != 0))
    }

    fn bool(&self, key: &'static str) -> Result<Option<bool>, ConfigError> {
        let Some(value) = self.string(key) else {
            return Ok(None);
        };
        match value.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::invalid(key, value)),
        }
    }

    fn bool_or(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        Ok(self.bool(key)?.unwrap_or(default))
    }

    fn id_list(&self, key: &'static str) -> Result<Vec<GroupId>, ConfigError> {
        let Some(value) = self.string(key) else {
            return Ok(Vec::new());
        };
        value
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                entry
                    .parse::<u64>()
                    .map(GroupId)
                    .map_err(|_| ConfigError::invalid(key, entry))
            })
            .collect()
    }
}

fn bounded(value: u64, max: u32) -> Option<u32> {
    u32::try_from(value).ok().filter(|value| *value <= max)
}

fn weekday_from_index(index: u64) -> Option<Weekday> {
    match index {
        0 => Some(Weekday::Mon),
        1 => Some(Weekday::Tue),
        2 => Some(Weekday::Wed),
        3 => Some(Weekday::Thu),
        4 => Some(Weekday::Fri),
        5 => Some(Weekday::Sat),
        6 => Some(Weekday::Sun),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn required() -> HashMap<String, String> {
        [
            ("DISCORD_TOKEN", "token"),
            ("GUILD_ID", "10"),
            ("SUCCESS_CHANNEL_ID", "20"),
            ("FAILURE_CHANNEL_ID", "21"),
            ("HOME_GROUP_ID", "30"),
            ("LOCKOUT_ON_FAILURE", "false"),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
    }

    #[test]
    fn load_uses_defaults_when_optional_values_missing() {
        let config = AppConfig::from_map(&required()).expect("config loads with defaults");
        assert_eq!(config.environment, AppEnvironment::Development);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.telemetry.log_level, "info");
        assert_eq!(config.lookup.api_base, DEFAULT_LOOKUP_API_BASE);
        assert_eq!(config.lookup.max_requests, 70);
        assert_eq!(config.lookup.window, Duration::from_secs(900));
        assert_eq!(config.schedule.batch_size, 3);
        assert_eq!(config.schedule.drain_interval, Duration::from_secs(60));
        assert_eq!(config.schedule.bulk_weekday, Weekday::Sun);
        assert_eq!(config.schedule.bulk_hour, 2);
        assert_eq!(config.verification.separator, " ㅣ ");
        assert_eq!(config.verification.max_display_name_len, 32);
        assert!(config.verification.strip_group_on_mismatch);
        assert!(!config.verification.lockout_on_failure);
        assert!(config.verification.foreign_group.is_none());
    }

    #[test]
    fn local_config_needs_no_credentials() {
        let values: HashMap<String, String> = [("DATA_DIR", "/srv/sync"), ("APP_PORT", "8080")]
            .into_iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();

        let local = LocalConfig::from_map(&values).expect("local config loads");

        assert_eq!(
            local.storage.exceptions_path(),
            PathBuf::from("/srv/sync/exceptions.json")
        );
        assert_eq!(local.server.port, 8080);
        assert_eq!(local.separator, " ㅣ ");
        assert!(AppConfig::from_map(&values).is_err());
    }

    #[test]
    fn lockout_policy_must_be_explicit() {
        let mut values = required();
        values.remove("LOCKOUT_ON_FAILURE");
        match AppConfig::from_map(&values) {
            Err(ConfigError::Missing("LOCKOUT_ON_FAILURE")) => {}
            other => panic!("expected missing lockout flag, got {other:?}"),
        }
    }

    #[test]
    fn bot_token_is_accepted_as_fallback() {
        let mut values = required();
        values.remove("DISCORD_TOKEN");
        values.insert("BOT_TOKEN".to_string(), "fallback".to_string());
        let config = AppConfig::from_map(&values).expect("config loads");
        assert_eq!(config.platform.token, "fallback");
    }

    #[test]
    fn rejects_out_of_range_schedule() {
        let mut values = required();
        values.insert("BULK_ENQUEUE_HOUR".to_string(), "24".to_string());
        assert!(matches!(
            AppConfig::from_map(&values),
            Err(ConfigError::Invalid {
                key: "BULK_ENQUEUE_HOUR",
                ..
            })
        ));
    }

    #[test]
    fn rejects_zero_batch_size() {
        let mut values = required();
        values.insert("DRAIN_BATCH_SIZE".to_string(), "0".to_string());
        assert!(AppConfig::from_map(&values).is_err());
    }

    #[test]
    fn parses_group_list_and_zero_foreign_group() {
        let mut values = required();
        values.insert("BULK_ENQUEUE_GROUP_IDS".to_string(), "1, 2,,3".to_string());
        values.insert("FOREIGN_GROUP_ID".to_string(), "0".to_string());
        let config = AppConfig::from_map(&values).expect("config loads");
        assert_eq!(
            config.schedule.bulk_groups,
            vec![GroupId(1), GroupId(2), GroupId(3)]
        );
        assert!(config.verification.foreign_group.is_none());

        values.insert("BULK_ENQUEUE_GROUP_IDS".to_string(), "1,abc".to_string());
        assert!(AppConfig::from_map(&values).is_err());
    }

    #[test]
    fn accepts_localhost_host() {
        let mut values = required();
        values.insert("APP_HOST".to_string(), "localhost".to_string());
        let config = AppConfig::from_map(&values).expect("config loads");
        let addr = config.server.socket_addr().expect("localhost resolves");
        assert_eq!(addr, SocketAddr::new(IpAddr::from([127, 0, 0, 1]), 3000));
    }
}
