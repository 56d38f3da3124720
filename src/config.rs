//! Process and shard configuration
//!
//! `GatewayConfig` is the process configuration, loaded from `.env` and the
//! environment. `ShardConfig` is the static configuration every shard is
//! constructed with.

use crate::error::GatewayError;
use crate::protocol::IdentifyProperties;
use crate::ratelimit::SendQuota;
use crate::shard::{BackoffPolicy, ClusterConfig, DEFAULT_IDENTIFY_COOLDOWN, SHARDS_PER_POOL};
use config::{Config, Environment};
use serde::Deserialize;
use std::time::Duration;
use tokio_tungstenite::tungstenite::http::{HeaderMap, HeaderValue};
use twilight_model::gateway::payload::outgoing::update_presence::UpdatePresencePayload;
use twilight_model::gateway::presence::Status;
use twilight_model::gateway::Intents;

/// Gateway endpoint used when none is configured or discovered
pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg";

fn default_shards_per_pool() -> u64 {
    SHARDS_PER_POOL
}

fn default_intents() -> u64 {
    (Intents::GUILDS | Intents::GUILD_MEMBERS).bits()
}

fn default_presence_status() -> String {
    "online".to_string()
}

fn default_http_port() -> u16 {
    9090
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_identify_cooldown_secs() -> u64 {
    DEFAULT_IDENTIFY_COOLDOWN.as_secs()
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_backoff_max_elapsed_secs() -> u64 {
    180
}

/// Process configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Bot token sent in Identify and Resume
    #[serde(alias = "discord_bot_token")]
    pub discord_token: String,

    /// Which pool of shards this process runs
    /// Each pool manages `shards_per_pool` shards
    #[serde(default, alias = "shard_id")]
    pub pool_id: u64,

    #[serde(default = "default_shards_per_pool")]
    pub shards_per_pool: u64,

    /// Total number of shards across all pools; discovered when unset
    #[serde(default)]
    pub total_shards: Option<u64>,

    /// Sessions that may start concurrently; discovered when unset
    #[serde(default)]
    pub max_concurrency: Option<u64>,

    /// Gateway endpoint; discovered when unset
    #[serde(default)]
    pub gateway_url: Option<String>,

    /// Intents bitmask
    #[serde(default = "default_intents")]
    pub intents: u64,

    /// Initial presence status (online, idle, dnd, invisible)
    #[serde(default = "default_presence_status")]
    pub presence_status: String,

    /// Comma-separated NATS servers; unset logs events locally
    #[serde(default)]
    pub nats_url: Option<String>,

    /// Port of the health and metrics server
    #[serde(default = "default_http_port", alias = "metrics_port")]
    pub http_port: u16,

    /// Level for the crate's own tracing directive
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_identify_cooldown_secs")]
    pub identify_cooldown_secs: u64,

    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    #[serde(default = "default_backoff_max_elapsed_secs")]
    pub connect_backoff_max_elapsed_secs: u64,
}

impl GatewayConfig {
    /// Load configuration from `.env` and environment variables
    pub fn from_env() -> Result<Self, GatewayError> {
        dotenvy::dotenv().ok();
        Self::load(Environment::default().try_parsing(true))
    }

    /// Load configuration from an explicit environment source
    pub fn load(source: Environment) -> Result<Self, GatewayError> {
        let config: Self = Config::builder()
            .add_source(source)
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|e| match e {
                config::ConfigError::NotFound(_) => GatewayError::Config(
                    "DISCORD_TOKEN or DISCORD_BOT_TOKEN must be set".to_string(),
                ),
                other => GatewayError::Config(other.to_string()),
            })?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), GatewayError> {
        if self.discord_token.trim().is_empty() {
            return Err(GatewayError::Config(
                "DISCORD_TOKEN or DISCORD_BOT_TOKEN must be set".to_string(),
            ));
        }
        if self.shards_per_pool == 0 {
            return Err(GatewayError::Config("SHARDS_PER_POOL must be at least 1".to_string()));
        }
        if self.total_shards == Some(0) {
            return Err(GatewayError::Config("TOTAL_SHARDS must be at least 1".to_string()));
        }
        if self.max_concurrency == Some(0) {
            return Err(GatewayError::Config("MAX_CONCURRENCY must be at least 1".to_string()));
        }
        self.presence()?;
        Ok(())
    }

    /// Configured intents; unknown bits are dropped
    pub fn intents(&self) -> Intents {
        Intents::from_bits_truncate(self.intents)
    }

    /// Initial presence sent with Identify
    pub fn presence(&self) -> Result<UpdatePresencePayload, GatewayError> {
        let status: Status =
            serde_json::from_value(serde_json::Value::String(self.presence_status.to_lowercase()))
                .map_err(|_| {
                    GatewayError::Config(format!(
                        "PRESENCE_STATUS '{}' is not a valid status",
                        self.presence_status
                    ))
                })?;

        Ok(UpdatePresencePayload {
            activities: Vec::new(),
            afk: false,
            since: None,
            status,
        })
    }

    /// Static configuration for every shard of this process
    pub fn shard_config(&self, gateway_url: String) -> Result<ShardConfig, GatewayError> {
        let mut config = ShardConfig::new(self.discord_token.clone());
        config.gateway_url = gateway_url;
        config.intents = self.intents();
        config.presence = Some(self.presence()?);
        config.reconnect_delay = Duration::from_millis(self.reconnect_delay_ms);
        config.backoff.max_elapsed = Duration::from_secs(self.connect_backoff_max_elapsed_secs);
        Ok(config)
    }

    /// Cluster layout for this pool once the shard count and concurrency are known
    pub fn cluster_config(
        &self,
        total_shards: u64,
        concurrency: u64,
        shard: ShardConfig,
    ) -> ClusterConfig {
        ClusterConfig {
            pool_id: self.pool_id,
            shards_per_pool: self.shards_per_pool,
            total_shards,
            concurrency,
            identify_cooldown: Duration::from_secs(self.identify_cooldown_secs),
            shard,
        }
    }
}

/// Static configuration a shard is constructed with
#[derive(Clone)]
pub struct ShardConfig {
    pub token: String,
    pub intents: Intents,
    pub presence: Option<UpdatePresencePayload>,
    /// Base gateway URL for fresh sessions
    pub gateway_url: String,
    /// Extra headers sent with the connection upgrade
    pub headers: HeaderMap,
    pub properties: IdentifyProperties,
    /// Member count above which guilds are sent without offline members
    pub large_threshold: u64,
    /// Ask for per-message zlib compression
    pub compress: bool,
    pub send_quota: SendQuota,
    pub backoff: BackoffPolicy,
    /// Bound on a single connect attempt
    pub connect_timeout: Duration,
    /// Pause between a lost connection and the next connect
    pub reconnect_delay: Duration,
    /// Frames buffered between the read loop and the consumer
    pub frame_queue_capacity: usize,
    /// Dispatcher deliveries allowed in flight at once
    pub dispatch_concurrency: usize,
    /// Bound on a single dispatcher delivery
    pub dispatch_timeout: Duration,
}

impl ShardConfig {
    pub fn new(token: impl Into<String>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            "user-agent",
            HeaderValue::from_static(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"))),
        );

        Self {
            token: token.into(),
            intents: Intents::GUILDS | Intents::GUILD_MEMBERS,
            presence: None,
            gateway_url: DEFAULT_GATEWAY_URL.to_string(),
            headers,
            properties: IdentifyProperties::default(),
            large_threshold: 250,
            compress: false,
            send_quota: SendQuota::gateway(),
            backoff: BackoffPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(1),
            frame_queue_capacity: 128,
            dispatch_concurrency: 256,
            dispatch_timeout: Duration::from_secs(10),
        }
    }
}

impl std::fmt::Debug for ShardConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardConfig")
            .field("token", &"<redacted>")
            .field("intents", &self.intents)
            .field("gateway_url", &self.gateway_url)
            .field("large_threshold", &self.large_threshold)
            .field("compress", &self.compress)
            .field("send_quota", &self.send_quota)
            .field("backoff", &self.backoff)
            .field("reconnect_delay", &self.reconnect_delay)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> Environment {
        let source: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Environment::default().try_parsing(true).source(Some(source))
    }

    #[test]
    fn test_intents_are_minimal() {
        let config = GatewayConfig::load(env(&[("DISCORD_TOKEN", "abc")])).unwrap();
        let intents = config.intents();

        assert!(intents.contains(Intents::GUILDS));
        assert!(intents.contains(Intents::GUILD_MEMBERS));

        // privileged
        assert!(!intents.contains(Intents::MESSAGE_CONTENT));
    }

    #[test]
    fn test_default_values() {
        let config = GatewayConfig::load(env(&[("DISCORD_TOKEN", "abc")])).unwrap();
        assert_eq!(config.pool_id, 0);
        assert_eq!(config.shards_per_pool, 25);
        assert_eq!(config.total_shards, None);
        assert_eq!(config.max_concurrency, None);
        assert_eq!(config.http_port, 9090);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.identify_cooldown_secs, 5);
        assert!(config.nats_url.is_none());
    }

    #[test]
    fn test_overrides_and_aliases() {
        let config = GatewayConfig::load(env(&[
            ("DISCORD_BOT_TOKEN", "abc"),
            ("SHARD_ID", "3"),
            ("TOTAL_SHARDS", "100"),
            ("MAX_CONCURRENCY", "4"),
            ("METRICS_PORT", "9100"),
            ("INTENTS", "513"),
            ("PRESENCE_STATUS", "DND"),
        ]))
        .unwrap();

        assert_eq!(config.discord_token, "abc");
        assert_eq!(config.pool_id, 3);
        assert_eq!(config.total_shards, Some(100));
        assert_eq!(config.max_concurrency, Some(4));
        assert_eq!(config.http_port, 9100);
        assert_eq!(config.intents(), Intents::GUILDS | Intents::GUILD_MESSAGES);
        assert_eq!(config.presence().unwrap().status, Status::DoNotDisturb);
    }

    #[test]
    fn test_missing_token_is_config_error() {
        let err = GatewayConfig::load(env(&[("POOL_ID", "1")])).unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        for vars in [
            [("DISCORD_TOKEN", "abc"), ("TOTAL_SHARDS", "0")],
            [("DISCORD_TOKEN", "abc"), ("PRESENCE_STATUS", "busy")],
            [("DISCORD_TOKEN", "abc"), ("HTTP_PORT", "not-a-port")],
        ] {
            assert!(GatewayConfig::load(env(&vars)).is_err(), "{vars:?} should be rejected");
        }
    }

    #[test]
    fn test_shard_config_carries_process_settings() {
        let config = GatewayConfig::load(env(&[
            ("DISCORD_TOKEN", "abc"),
            ("RECONNECT_DELAY_MS", "250"),
            ("CONNECT_BACKOFF_MAX_ELAPSED_SECS", "30"),
        ]))
        .unwrap();
        let shard = config.shard_config("wss://gateway.test".to_string()).unwrap();

        assert_eq!(shard.token, "abc");
        assert_eq!(shard.gateway_url, "wss://gateway.test");
        assert_eq!(shard.reconnect_delay, Duration::from_millis(250));
        assert_eq!(shard.backoff.max_elapsed, Duration::from_secs(30));
        assert_eq!(shard.presence.as_ref().map(|p| p.status.clone()), Some(Status::Online));
        assert!(!format!("{shard:?}").contains("abc"), "token must not be logged");
    }
}
