use std::env;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub max_candidates: usize,
    pub offer_ttl_secs: u64,
    pub search_backoff_base_ms: u64,
    pub search_backoff_cap_ms: u64,
    pub presence_ttl_secs: u64,
    pub otp_ttl_secs: u64,
    pub otp_max_attempts: u32,
    pub location_min_interval_ms: u64,
    pub delivery_fee: i64,
    pub event_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 3000,
            log_level: "info".to_string(),
            max_candidates: 5,
            offer_ttl_secs: 120,
            search_backoff_base_ms: 10_000,
            search_backoff_cap_ms: 40_000,
            presence_ttl_secs: 300,
            otp_ttl_secs: 600,
            otp_max_attempts: 5,
            location_min_interval_ms: 1_000,
            delivery_fee: 40,
            event_buffer_size: 1024,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", defaults.http_port)?,
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            max_candidates: parse_or_default("MAX_CANDIDATES", defaults.max_candidates)?,
            offer_ttl_secs: parse_or_default("OFFER_TTL_SECS", defaults.offer_ttl_secs)?,
            search_backoff_base_ms: parse_or_default(
                "SEARCH_BACKOFF_BASE_MS",
                defaults.search_backoff_base_ms,
            )?,
            search_backoff_cap_ms: parse_or_default(
                "SEARCH_BACKOFF_CAP_MS",
                defaults.search_backoff_cap_ms,
            )?,
            presence_ttl_secs: parse_or_default("PRESENCE_TTL_SECS", defaults.presence_ttl_secs)?,
            otp_ttl_secs: parse_or_default("OTP_TTL_SECS", defaults.otp_ttl_secs)?,
            otp_max_attempts: parse_or_default("OTP_MAX_ATTEMPTS", defaults.otp_max_attempts)?,
            location_min_interval_ms: parse_or_default(
                "LOCATION_MIN_INTERVAL_MS",
                defaults.location_min_interval_ms,
            )?,
            delivery_fee: parse_or_default("DELIVERY_FEE", defaults.delivery_fee)?,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", defaults.event_buffer_size)?,
        })
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
