use std::env;
use std::time::Duration;
use crate::error::AppError;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppSettings {
    pub terminal: ListenerConfig,
    pub admin: AdminConfig,
    pub relay: RelayConfig,
    pub session: SessionConfig,
    pub dispatch: DispatchConfig,
    pub log_sink: LogSinkConfig,
    pub trace: TraceConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdminConfig {
    pub listener: ListenerConfig,
    pub authorization_key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayConfig {
    pub enabled: bool,
    /// None selects the in-process backend
    pub redis_url: Option<String>,
    pub key_prefix: String,
    pub out_suffix: String,
    pub in_suffix: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateSessionPolicy {
    /// Both connections stay live; the newest one owns the registry entry
    Allow,
    /// The newcomer is closed once its identity is known
    Reject,
    /// The older connection is closed
    Evict,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    pub new_message_timeout: Duration,
    /// 0 disables idle termination
    pub max_idle_cycles: u32,
    pub duplicate_policy: DuplicateSessionPolicy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchLockMode {
    PerDevice,
    Global,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub wait_timeout: Duration,
    pub lock_timeout: Duration,
    pub lock_mode: DispatchLockMode,
    pub poll_interval: Duration,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogSinkConfig {
    pub enabled: bool,
    pub database_url: Option<String>,
    pub table: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TraceConfig {
    pub log_path: Option<String>,
    pub dump_dir: Option<String>,
    pub server_prefix: String,
    pub client_prefix: String,
}

impl AppSettings {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds settings from an arbitrary key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let optional = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        // Listeners
        let terminal = ListenerConfig {
            host: var("TERMINAL_HOST", "0.0.0.0"),
            port: parse_var(&lookup, "TERMINAL_PORT", 7788u16)?,
        };

        let admin_listener = ListenerConfig {
            host: var("ADMIN_HOST", "0.0.0.0"),
            port: parse_var(&lookup, "ADMIN_PORT", 5000u16)?,
        };

        let authorization_key = optional("ADMIN_AUTHORIZATION_KEY")
            .ok_or_else(|| AppError::Configuration("ADMIN_AUTHORIZATION_KEY must be set".to_string()))?;

        // Relay queue
        let relay = RelayConfig {
            enabled: parse_bool(&lookup, "RELAY_ENABLED", true)?,
            redis_url: optional("REDIS_URL"),
            key_prefix: var("REDIS_DB_PREFIX", "aiface"),
            out_suffix: var("REDIS_OUT_KEY", "OUT"),
            in_suffix: var("REDIS_IN_KEY", "IN"),
        };

        if relay.out_suffix == relay.in_suffix {
            return Err(AppError::Configuration(
                "REDIS_OUT_KEY and REDIS_IN_KEY must differ".to_string(),
            ));
        }

        // Session policy
        let new_message_timeout = parse_millis(&lookup, "SESSION_NEW_MESSAGE_TIMEOUT_MS", 1_000)?;
        if new_message_timeout.is_zero() {
            return Err(AppError::Configuration(
                "SESSION_NEW_MESSAGE_TIMEOUT_MS must be greater than zero".to_string(),
            ));
        }

        let duplicate_policy = match var("SESSION_DUPLICATE_POLICY", "allow").to_lowercase().as_str() {
            "allow" => DuplicateSessionPolicy::Allow,
            "reject" => DuplicateSessionPolicy::Reject,
            "evict" => DuplicateSessionPolicy::Evict,
            other => {
                return Err(AppError::Configuration(format!(
                    "SESSION_DUPLICATE_POLICY must be one of allow, reject, evict (got {})",
                    other
                )))
            }
        };

        let session = SessionConfig {
            new_message_timeout,
            max_idle_cycles: parse_var(&lookup, "SESSION_MAX_IDLE_CYCLES", 300u32)?,
            duplicate_policy,
        };

        // Dispatch bridge
        let lock_mode = match var("DISPATCH_LOCK_MODE", "per_device").to_lowercase().as_str() {
            "per_device" => DispatchLockMode::PerDevice,
            "global" => DispatchLockMode::Global,
            other => {
                return Err(AppError::Configuration(format!(
                    "DISPATCH_LOCK_MODE must be per_device or global (got {})",
                    other
                )))
            }
        };

        let dispatch = DispatchConfig {
            wait_timeout: parse_millis(&lookup, "DISPATCH_WAIT_TIMEOUT_MS", 10_000)?,
            lock_timeout: parse_millis(&lookup, "DISPATCH_LOCK_TIMEOUT_MS", 30_000)?,
            lock_mode,
            poll_interval: parse_millis(&lookup, "DISPATCH_POLL_INTERVAL_MS", 100)?,
        };

        // Log sink
        let log_sink = LogSinkConfig {
            enabled: parse_bool(&lookup, "LOG_SINK_ENABLED", false)?,
            database_url: optional("DATABASE_URL"),
            table: var("LOG_SINK_TABLE", "terminal_records"),
        };

        if log_sink.enabled && log_sink.database_url.is_none() {
            return Err(AppError::Configuration(
                "DATABASE_URL must be set when LOG_SINK_ENABLED is true".to_string(),
            ));
        }

        if !is_valid_identifier(&log_sink.table) {
            return Err(AppError::Configuration(format!(
                "LOG_SINK_TABLE must be a plain SQL identifier (got {})",
                log_sink.table
            )));
        }

        let trace = TraceConfig {
            log_path: optional("TRACE_LOG_PATH"),
            dump_dir: optional("TRACE_DUMP_DIR"),
            server_prefix: var("LOG_SERVER_PREFIX", "SERVER"),
            client_prefix: var("LOG_CLIENT_PREFIX", "CLIENT"),
        };

        Ok(Self {
            terminal,
            admin: AdminConfig {
                listener: admin_listener,
                authorization_key,
            },
            relay,
            session,
            dispatch,
            log_sink,
            trace,
        })
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::Configuration(format!("{} must be a valid number", key))),
        None => Ok(default),
    }
}

fn parse_millis<F>(lookup: &F, key: &str, default_ms: u64) -> Result<Duration, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    parse_var(lookup, key, default_ms).map(Duration::from_millis)
}

fn parse_bool<F>(lookup: &F, key: &str, default: bool) -> Result<bool, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|v| v.trim().to_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(AppError::Configuration(format!("{} must be a boolean", key))),
        },
    }
}

fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
