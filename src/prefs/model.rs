use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::picker::FilterConditions;
use crate::types::{Adjust, Period};

/// Storage keys. Every persisted preference lives under exactly one of these.
pub mod keys {
    pub const WATCHLIST: &str = "watchlist";
    pub const ALERTS: &str = "alerts";
    pub const SETTINGS: &str = "settings";
    pub const COLUMNS: &str = "columns";
    pub const SEARCH_HISTORY: &str = "search_history";
    pub const FILTER_SCHEMES: &str = "filter_schemes";
    pub const RECENT_FILTERS: &str = "recent_filters";
    pub const CURRENT_FILTERS: &str = "current_filters";
}

pub const DEFAULT_GROUP_ID: &str = "default";

// ---------------------------------------------------------------------------
// Watch list
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchlistGroup {
    pub id: String,
    pub name: String,
    /// Bare six-digit codes, in insertion order.
    #[serde(default)]
    pub codes: Vec<String>,
}

impl WatchlistGroup {
    pub fn default_group() -> Self {
        Self {
            id: DEFAULT_GROUP_ID.to_string(),
            name: "自选".to_string(),
            codes: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AlertKind {
    PriceAbove(f64),
    PriceBelow(f64),
    ChangeAbove(f64),
    ChangeBelow(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub code: String,
    pub kind: AlertKind,
    #[serde(default = "enabled")]
    pub enabled: bool,
}

fn enabled() -> bool {
    true
}

/// code → rules for that symbol
pub type AlertBook = HashMap<String, Vec<AlertRule>>;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Red-up (mainland convention) or green-up colouring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorMode {
    #[default]
    RedUp,
    GreenUp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Overrides QUOTE_REFRESH_SECS when set.
    pub quote_refresh_secs: Option<u64>,
    /// Overrides BOARD_REFRESH_SECS when set.
    pub board_refresh_secs: Option<u64>,
    pub color_mode: ColorMode,
    pub default_period: Period,
    pub default_adjust: Adjust,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            quote_refresh_secs: None,
            board_refresh_secs: None,
            color_mode: ColorMode::default(),
            default_period: Period::Day,
            default_adjust: Adjust::default(),
        }
    }
}

/// page → visible column ids
pub type ColumnVisibility = HashMap<String, Vec<String>>;

// ---------------------------------------------------------------------------
// Search / filters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchEntry {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterScheme {
    pub name: String,
    pub conditions: FilterConditions,
}
