//! Process settings, read from the environment.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use instapay_infra::consumer::ConsumerConfig;
use instapay_infra::outbox::{Backoff, PumpConfig};
use instapay_observability::LogFormat;

const DEV_SECRET: &str = "dev-secret";

#[derive(Debug, Error)]
#[error("invalid value for {var}: {reason}")]
pub struct ConfigError {
    var: &'static str,
    reason: String,
}

/// Broker consumption and outbox tuning shared by every channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTuning {
    pub batch_size: usize,
    pub block: Duration,
    pub max_pending_age: Duration,
    pub ack_timeout: Duration,
    pub outbox_poll: Duration,
    pub outbox_backoff_initial: Duration,
    pub outbox_backoff_max: Duration,
}

impl Default for StreamTuning {
    fn default() -> Self {
        Self {
            batch_size: 32,
            block: Duration::from_millis(2_000),
            max_pending_age: Duration::from_millis(30_000),
            ack_timeout: Duration::from_millis(30_000),
            outbox_poll: Duration::from_millis(500),
            outbox_backoff_initial: Duration::from_millis(100),
            outbox_backoff_max: Duration::from_millis(30_000),
        }
    }
}

impl StreamTuning {
    pub fn consumer(&self, group: impl Into<String>, consumer: impl Into<String>) -> ConsumerConfig {
        ConsumerConfig::new(group, consumer)
            .with_batch_size(self.batch_size)
            .with_block(self.block)
            .with_max_pending_age(self.max_pending_age)
    }

    pub fn pump(&self) -> PumpConfig {
        PumpConfig::default()
            .with_poll_interval(self.outbox_poll)
            .with_backoff(Backoff::new(self.outbox_backoff_initial, self.outbox_backoff_max))
    }
}

/// Server settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: SocketAddr,
    pub jwt_secret: String,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub log_format: LogFormat,
    pub tuning: StreamTuning,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars(&lookup);
        let defaults = StreamTuning::default();

        let jwt_secret = vars.string("JWT_SECRET").unwrap_or_else(|| {
            warn!("JWT_SECRET not set; using insecure dev default");
            DEV_SECRET.to_string()
        });

        Ok(Self {
            bind_addr: vars.parse("BIND_ADDR")?.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080))),
            jwt_secret,
            database_url: vars.string("DATABASE_URL"),
            redis_url: vars.string("REDIS_URL"),
            log_format: vars.parse("LOG_FORMAT")?.unwrap_or_default(),
            tuning: StreamTuning {
                batch_size: vars.parse("STREAM_BATCH_SIZE")?.unwrap_or(defaults.batch_size),
                block: vars.millis("STREAM_BLOCK_MS")?.unwrap_or(defaults.block),
                max_pending_age: vars.millis("STREAM_MAX_PENDING_MS")?.unwrap_or(defaults.max_pending_age),
                ack_timeout: vars.millis("STREAM_ACK_TIMEOUT_MS")?.unwrap_or(defaults.ack_timeout),
                outbox_poll: vars.millis("OUTBOX_POLL_MS")?.unwrap_or(defaults.outbox_poll),
                outbox_backoff_initial: vars
                    .millis("OUTBOX_BACKOFF_INITIAL_MS")?
                    .unwrap_or(defaults.outbox_backoff_initial),
                outbox_backoff_max: vars
                    .millis("OUTBOX_BACKOFF_MAX_MS")?
                    .unwrap_or(defaults.outbox_backoff_max),
            },
        })
    }
}

/// Settings of the `instapay-agent` binary.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Base `ws://` or `wss://` URL of the settlement server.
    pub server_url: String,
    pub token: String,
    pub reconnect: Duration,
    pub log_format: LogFormat,
}

impl AgentSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars(&lookup);
        Ok(Self {
            server_url: vars
                .string("AGENT_SERVER_URL")
                .unwrap_or_else(|| "ws://127.0.0.1:8080".to_string()),
            token: vars.string("AGENT_TOKEN").ok_or(ConfigError {
                var: "AGENT_TOKEN",
                reason: "must be set".to_string(),
            })?,
            reconnect: vars
                .millis("AGENT_RECONNECT_MS")?
                .unwrap_or(Duration::from_millis(5_000)),
            log_format: vars.parse("LOG_FORMAT")?.unwrap_or_default(),
        })
    }
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, var: &'static str) -> Option<String> {
        (self.0)(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, var: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        self.string(var)
            .map(|raw| {
                raw.parse::<T>().map_err(|e| ConfigError {
                    var,
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    fn millis(&self, var: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(var)?.map(Duration::from_millis))
    }
}
