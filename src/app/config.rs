use std::time::Duration;

use crate::app::AppError;

/// Runtime configuration, read from the environment. Every option has a
/// sensible default except nothing: the logger can start against an empty
/// environment and wait for a token to appear in the token file.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_path: String,
    pub http_bind: String,

    pub cloud_api_host: String,
    pub cloud_auth_host: String,
    pub token_file: String,

    pub poll_interval_online: Duration,
    pub poll_interval_driving: Duration,
    pub poll_interval_charging: Duration,
    pub poll_interval_asleep: Duration,
    pub poll_backoff_initial: Duration,
    pub poll_backoff_max: Duration,
    pub poll_backoff_factor: f64,

    pub suspend_after_idle_min: u64,
    pub suspend_poll_interval_min: u64,
    pub require_not_unlocked: bool,

    pub use_streaming_api: bool,
    pub streaming_host: String,
    pub streaming_reconnect_delay: Duration,

    pub geocoding_provider: String,
    pub amap_api_key: String,

    pub nominal_battery_capacity_kwh: f64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            database_path: string_or_default(
                &lookup,
                "DATABASE_PATH",
                "/var/lib/fleetgazer/fleetgazer.db",
            ),
            http_bind: string_or_default(&lookup, "HTTP_BIND", "0.0.0.0:4000"),
            cloud_api_host: string_or_default(
                &lookup,
                "CLOUD_API_HOST",
                "https://owner-api.vendor.example",
            ),
            cloud_auth_host: string_or_default(
                &lookup,
                "CLOUD_AUTH_HOST",
                "https://auth.vendor.example",
            ),
            token_file: string_or_default(&lookup, "TOKEN_FILE", "tokens.json"),
            poll_interval_online: secs_or_default(&lookup, "POLL_INTERVAL_ONLINE_SECS", 15)?,
            poll_interval_driving: secs_or_default(&lookup, "POLL_INTERVAL_DRIVING_SECS", 3)?,
            poll_interval_charging: secs_or_default(&lookup, "POLL_INTERVAL_CHARGING_SECS", 5)?,
            poll_interval_asleep: secs_or_default(&lookup, "POLL_INTERVAL_ASLEEP_SECS", 30)?,
            poll_backoff_initial: secs_or_default(&lookup, "POLL_BACKOFF_INITIAL_SECS", 1)?,
            poll_backoff_max: secs_or_default(&lookup, "POLL_BACKOFF_MAX_SECS", 30)?,
            poll_backoff_factor: parse_or_default(&lookup, "POLL_BACKOFF_FACTOR", 2.0_f64)?,
            suspend_after_idle_min: parse_or_default(&lookup, "SUSPEND_AFTER_IDLE_MIN", 15_u64)?,
            suspend_poll_interval_min: parse_or_default(
                &lookup,
                "SUSPEND_POLL_INTERVAL_MIN",
                21_u64,
            )?,
            require_not_unlocked: bool_or_default(&lookup, "REQUIRE_NOT_UNLOCKED", false)?,
            use_streaming_api: bool_or_default(&lookup, "USE_STREAMING_API", true)?,
            streaming_host: string_or_default(
                &lookup,
                "STREAMING_HOST",
                "wss://streaming.vendor.example/streaming/",
            ),
            streaming_reconnect_delay: secs_or_default(
                &lookup,
                "STREAMING_RECONNECT_DELAY_SECS",
                1,
            )?,
            geocoding_provider: string_or_default(&lookup, "GEOCODING_PROVIDER", "amap"),
            amap_api_key: string_or_default(&lookup, "AMAP_API_KEY", ""),
            nominal_battery_capacity_kwh: parse_or_default(
                &lookup,
                "NOMINAL_BATTERY_CAPACITY_KWH",
                75.0_f64,
            )?,
        })
    }
}

fn string_or_default<F>(lookup: &F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_or_default<T, F>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr + Copy,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::config(format!("{key} must be a valid number"))),
        None => Ok(default),
    }
}

fn secs_or_default<F>(lookup: &F, key: &str, default_secs: u64) -> Result<Duration, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(Duration::from_secs(parse_or_default(
        lookup,
        key,
        default_secs,
    )?))
}

fn bool_or_default<F>(lookup: &F, key: &str, default: bool) -> Result<bool, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(AppError::config(format!("{key} must be a boolean"))),
        },
        None => Ok(default),
    }
}
