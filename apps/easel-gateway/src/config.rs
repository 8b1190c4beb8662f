use std::env;
use std::fmt;
use std::net::{AddrParseError, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use easel_bridge::BridgeConfig;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8098";
const DEFAULT_SERVICE_NAME: &str = "easel-gateway";
const DEFAULT_RESULT_TIMEOUT_SECONDS: u64 = 8;
const DEFAULT_DEDUPE_COOLDOWN_SECONDS: u64 = 10;
const DEFAULT_HEARTBEAT_IDLE_SECONDS: u64 = 30;
const DEFAULT_PARKED_RESULTS_CAP: usize = 256;
const DEFAULT_SESSION_IDLE_EVICT_SECONDS: u64 = 900;

/// Gateway settings, all overridable through `EASEL_*` environment
/// variables. Out-of-range numbers are clamped rather than refused;
/// only unparseable input is an error.
#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    pub bind_addr: SocketAddr,
    pub result_timeout_seconds: u64,
    pub dedupe_cooldown_seconds: u64,
    pub heartbeat_idle_seconds: u64,
    pub parked_results_cap: usize,
    pub session_idle_evict_seconds: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid EASEL_BIND_ADDR: {0}")]
    BindAddrParse(#[from] AddrParseError),
    #[error("invalid EASEL_RESULT_TIMEOUT_SECONDS: {0}")]
    InvalidResultTimeoutSeconds(String),
    #[error("invalid EASEL_DEDUPE_COOLDOWN_SECONDS: {0}")]
    InvalidDedupeCooldownSeconds(String),
    #[error("invalid EASEL_HEARTBEAT_IDLE_SECONDS: {0}")]
    InvalidHeartbeatIdleSeconds(String),
    #[error("invalid EASEL_PARKED_RESULTS_CAP: {0}")]
    InvalidParkedResultsCap(String),
    #[error("invalid EASEL_SESSION_IDLE_EVICT_SECONDS: {0}")]
    InvalidSessionIdleEvictSeconds(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr = env::var("EASEL_BIND_ADDR")
            .unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string())
            .parse()?;
        let service_name =
            env::var("EASEL_SERVICE_NAME").unwrap_or_else(|_| DEFAULT_SERVICE_NAME.to_string());
        let result_timeout_seconds = clamped(
            env::var("EASEL_RESULT_TIMEOUT_SECONDS"),
            DEFAULT_RESULT_TIMEOUT_SECONDS,
            1,
            300,
            ConfigError::InvalidResultTimeoutSeconds,
        )?;
        let dedupe_cooldown_seconds = clamped(
            env::var("EASEL_DEDUPE_COOLDOWN_SECONDS"),
            DEFAULT_DEDUPE_COOLDOWN_SECONDS,
            1,
            600,
            ConfigError::InvalidDedupeCooldownSeconds,
        )?;
        let heartbeat_idle_seconds = clamped(
            env::var("EASEL_HEARTBEAT_IDLE_SECONDS"),
            DEFAULT_HEARTBEAT_IDLE_SECONDS,
            5,
            600,
            ConfigError::InvalidHeartbeatIdleSeconds,
        )?;
        let parked_results_cap = clamped(
            env::var("EASEL_PARKED_RESULTS_CAP"),
            DEFAULT_PARKED_RESULTS_CAP,
            16,
            65_536,
            ConfigError::InvalidParkedResultsCap,
        )?;
        let session_idle_evict_seconds = clamped(
            env::var("EASEL_SESSION_IDLE_EVICT_SECONDS"),
            DEFAULT_SESSION_IDLE_EVICT_SECONDS,
            60,
            86_400,
            ConfigError::InvalidSessionIdleEvictSeconds,
        )?;
        Ok(Self {
            service_name,
            bind_addr,
            result_timeout_seconds,
            dedupe_cooldown_seconds,
            heartbeat_idle_seconds,
            parked_results_cap,
            session_idle_evict_seconds,
        })
    }

    /// The per-session tunables handed to every new bridge.
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            result_timeout: Duration::from_secs(self.result_timeout_seconds),
            dedupe_cooldown: Duration::from_secs(self.dedupe_cooldown_seconds),
            heartbeat_after: Duration::from_secs(self.heartbeat_idle_seconds),
            parked_results_cap: self.parked_results_cap,
        }
    }

    pub fn session_idle_evict(&self) -> Duration {
        Duration::from_secs(self.session_idle_evict_seconds)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8098)),
            result_timeout_seconds: DEFAULT_RESULT_TIMEOUT_SECONDS,
            dedupe_cooldown_seconds: DEFAULT_DEDUPE_COOLDOWN_SECONDS,
            heartbeat_idle_seconds: DEFAULT_HEARTBEAT_IDLE_SECONDS,
            parked_results_cap: DEFAULT_PARKED_RESULTS_CAP,
            session_idle_evict_seconds: DEFAULT_SESSION_IDLE_EVICT_SECONDS,
        }
    }
}

fn clamped<T>(
    raw: Result<String, env::VarError>,
    default: T,
    min: T,
    max: T,
    invalid: fn(String) -> ConfigError,
) -> Result<T, ConfigError>
where
    T: FromStr + Ord,
    T::Err: fmt::Display,
{
    let value = match raw {
        Ok(text) => text
            .trim()
            .parse::<T>()
            .map_err(|error| invalid(error.to_string()))?,
        Err(_) => default,
    };
    Ok(value.clamp(min, max))
}
