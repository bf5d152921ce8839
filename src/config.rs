use std::time::Duration;

use crate::error::{AppError, Result};

pub const REMOTE_URL: &str = "http://127.0.0.1:8686";

/// Cache lifetimes per endpoint volatility class (milliseconds).
pub mod ttl {
    /// Real-time quotes.
    pub const QUOTE_MS: u64 = 3_000;
    /// Intraday timeline points.
    pub const TIMELINE_MS: u64 = 5_000;
    pub const FUND_FLOW_MS: u64 = 10_000;
    pub const KLINE_MS: u64 = 30_000;
    /// Industry / concept board lists.
    pub const BOARD_LIST_MS: u64 = 60_000;
    pub const CONSTITUENTS_MS: u64 = 60_000;
    /// Trading calendar.
    pub const CALENDAR_MS: u64 = 3_600_000;
}

/// Board store background refresh interval (seconds).
pub const BOARD_REFRESH_SECS: u64 = 60;

/// Non-forced board refreshes closer than this to the last success are ignored.
/// Must stay below BOARD_REFRESH_SECS or the periodic refresh would be throttled.
pub const BOARD_MIN_INTERVAL_SECS: u64 = 10;

/// Watch-list quote polling interval (seconds).
pub const QUOTE_REFRESH_SECS: u64 = 5;

/// Remote request timeout (seconds).
pub const REMOTE_TIMEOUT_SECS: u64 = 10;

/// Picker defaults.
pub const PICKER_PAGE_SIZE: usize = 500;
pub const PICKER_FETCH_CONCURRENCY: usize = 4;
pub const PICKER_BATCH_SIZE: usize = 10;

/// Bounded preference lists.
pub const RECENT_FILTERS_MAX: usize = 10;
pub const SEARCH_HISTORY_MAX: usize = 20;

/// Capacity of the storage-change broadcast channel.
pub const CHANGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct Config {
    pub remote_url: String,
    pub log_level: String,
    pub db_path: String,
    pub remote_timeout: Duration,
    pub board_refresh: Duration,
    pub board_min_interval: Duration,
    pub quote_refresh: Duration,
    pub picker: PickerConfig,
}

/// Batch sizing for the end-of-day picker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PickerConfig {
    /// Quotes requested per stage 1 page (PICKER_PAGE_SIZE)
    pub page_size: usize,
    /// Concurrent page requests per stage 1 batch (PICKER_FETCH_CONCURRENCY)
    pub fetch_concurrency: usize,
    /// Symbols enriched concurrently per stage 3 batch (PICKER_BATCH_SIZE)
    pub batch_size: usize,
}

impl Default for PickerConfig {
    fn default() -> Self {
        Self {
            page_size: PICKER_PAGE_SIZE,
            fetch_concurrency: PICKER_FETCH_CONCURRENCY,
            batch_size: PICKER_BATCH_SIZE,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let board_refresh = env_secs("BOARD_REFRESH_SECS", BOARD_REFRESH_SECS)?;
        let board_min_interval = env_secs("BOARD_MIN_INTERVAL_SECS", BOARD_MIN_INTERVAL_SECS)?;
        if board_min_interval >= board_refresh {
            return Err(AppError::Config(
                "BOARD_MIN_INTERVAL_SECS must be shorter than BOARD_REFRESH_SECS".to_string(),
            ));
        }

        Ok(Self {
            remote_url: std::env::var("REMOTE_URL").unwrap_or_else(|_| REMOTE_URL.to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "desk.db".to_string()),
            remote_timeout: env_secs("REMOTE_TIMEOUT_SECS", REMOTE_TIMEOUT_SECS)?,
            board_refresh,
            board_min_interval,
            quote_refresh: env_secs("QUOTE_REFRESH_SECS", QUOTE_REFRESH_SECS)?,
            picker: PickerConfig {
                page_size: env_count("PICKER_PAGE_SIZE", PICKER_PAGE_SIZE),
                fetch_concurrency: env_count("PICKER_FETCH_CONCURRENCY", PICKER_FETCH_CONCURRENCY),
                batch_size: env_count("PICKER_BATCH_SIZE", PICKER_BATCH_SIZE),
            },
        })
    }
}

fn env_secs(name: &str, default: u64) -> Result<Duration> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .ok_or_else(|| AppError::Config(format!("{name} must be a positive number of seconds"))),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

/// Counts fall back to the default on garbage rather than failing startup.
fn env_count(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(default)
}
