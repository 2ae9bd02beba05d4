//! Runtime tuning loaded from `FLOCK_*` environment variables.

use std::collections::HashMap;
use std::time::Duration as StdDuration;

use chrono::Duration;

use flock_kernel::{FlockError, RetryPolicy, DEFAULT_MAX_MESSAGE_LEN};

const ENV_KEYS: [&str; 10] = [
    "FLOCK_DELETE_MAX_RETRIES",
    "FLOCK_DELETE_RETRY_BACKOFF_SECS",
    "FLOCK_PORTLOCK_MAX_AGE_DAYS",
    "FLOCK_BUILD_WAIT_TTL_SECS",
    "FLOCK_BUILD_EXPIRATION_DAYS",
    "FLOCK_BUILD_EXPIRATION_COUNT",
    "FLOCK_EVENT_MAX_MESSAGE_LEN",
    "FLOCK_REQUIRE_COMPILE_LOG",
    "FLOCK_PROC_USER",
    "FLOCK_DEBUG_EVENTS",
];

#[derive(Clone, Debug)]
pub struct FlockConfig {
    pub delete_max_retries: u32,
    pub delete_retry_backoff: StdDuration,
    pub portlock_max_age: Duration,
    pub build_wait_ttl: Duration,
    /// `None` disables the build retention sweep.
    pub build_expiration_days: Option<i64>,
    /// Newest builds per app that the retention sweep always keeps.
    pub build_expiration_count: usize,
    pub event_max_message_len: usize,
    pub require_compile_log: bool,
    pub proc_user: String,
    pub debug_events: bool,
}

impl Default for FlockConfig {
    fn default() -> Self {
        Self {
            delete_max_retries: 3,
            delete_retry_backoff: StdDuration::from_secs(60),
            portlock_max_age: Duration::days(7),
            build_wait_ttl: Duration::seconds(3600),
            build_expiration_days: None,
            build_expiration_count: 10,
            event_max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            require_compile_log: false,
            proc_user: "nobody".to_string(),
            debug_events: false,
        }
    }
}

impl FlockConfig {
    pub fn from_env() -> Result<Self, FlockError> {
        let mut envs = HashMap::new();
        for key in ENV_KEYS {
            if let Ok(value) = std::env::var(key) {
                envs.insert(key.to_string(), value);
            }
        }
        Self::from_env_map(&envs)
    }

    pub fn from_env_map(envs: &HashMap<String, String>) -> Result<Self, FlockError> {
        let defaults = Self::default();
        let get = |key: &str| {
            envs.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let delete_max_retries = match get("FLOCK_DELETE_MAX_RETRIES") {
            Some(raw) => parse_number::<u32>("FLOCK_DELETE_MAX_RETRIES", &raw)?,
            None => defaults.delete_max_retries,
        };
        let delete_retry_backoff = match get("FLOCK_DELETE_RETRY_BACKOFF_SECS") {
            Some(raw) => StdDuration::from_secs(parse_number::<u64>(
                "FLOCK_DELETE_RETRY_BACKOFF_SECS",
                &raw,
            )?),
            None => defaults.delete_retry_backoff,
        };
        let portlock_max_age = match get("FLOCK_PORTLOCK_MAX_AGE_DAYS") {
            Some(raw) => Duration::days(parse_number::<i64>("FLOCK_PORTLOCK_MAX_AGE_DAYS", &raw)?),
            None => defaults.portlock_max_age,
        };
        let build_wait_ttl = match get("FLOCK_BUILD_WAIT_TTL_SECS") {
            Some(raw) => Duration::seconds(parse_number::<i64>("FLOCK_BUILD_WAIT_TTL_SECS", &raw)?),
            None => defaults.build_wait_ttl,
        };
        let build_expiration_days = get("FLOCK_BUILD_EXPIRATION_DAYS")
            .map(|raw| parse_number::<i64>("FLOCK_BUILD_EXPIRATION_DAYS", &raw))
            .transpose()?;
        let build_expiration_count = match get("FLOCK_BUILD_EXPIRATION_COUNT") {
            Some(raw) => parse_number::<usize>("FLOCK_BUILD_EXPIRATION_COUNT", &raw)?,
            None => defaults.build_expiration_count,
        };
        let event_max_message_len = match get("FLOCK_EVENT_MAX_MESSAGE_LEN") {
            Some(raw) => parse_number::<usize>("FLOCK_EVENT_MAX_MESSAGE_LEN", &raw)?,
            None => defaults.event_max_message_len,
        };
        let require_compile_log = get("FLOCK_REQUIRE_COMPILE_LOG")
            .map(|v| parse_bool(&v))
            .unwrap_or(defaults.require_compile_log);
        let proc_user = get("FLOCK_PROC_USER").unwrap_or(defaults.proc_user);
        let debug_events = get("FLOCK_DEBUG_EVENTS")
            .map(|v| parse_bool(&v))
            .unwrap_or(defaults.debug_events);

        if portlock_max_age <= Duration::zero() {
            return Err(FlockError::Config(
                "FLOCK_PORTLOCK_MAX_AGE_DAYS must be positive".to_string(),
            ));
        }
        if event_max_message_len < 2 {
            return Err(FlockError::Config(
                "FLOCK_EVENT_MAX_MESSAGE_LEN must be at least 2".to_string(),
            ));
        }

        Ok(Self {
            delete_max_retries,
            delete_retry_backoff,
            portlock_max_age,
            build_wait_ttl,
            build_expiration_days,
            build_expiration_count,
            event_max_message_len,
            require_compile_log,
            proc_user,
            debug_events,
        })
    }

    /// Retry policy for proc deletion. Deploys are never retried.
    pub fn delete_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.delete_max_retries, self.delete_retry_backoff)
    }
}

fn parse_number<T>(key: &str, raw: &str) -> Result<T, FlockError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| FlockError::Config(format!("invalid {}='{}': {}", key, raw, e)))
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
