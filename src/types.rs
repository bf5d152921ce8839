use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Quotes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    /// Bare 6-digit code (`600519`) or fully-qualified (`sh600519`).
    pub code: String,
    pub name: String,
    pub price: f64,
    /// Percent, e.g. `4.0` for +4%.
    pub change_percent: f64,
    pub volume_ratio: f64,
    /// Percent of float shares traded today.
    pub turnover_rate: f64,
    /// Total market cap in 亿 (100 million) units.
    pub market_cap: f64,
    #[serde(default)]
    pub volume: f64,
    #[serde(default)]
    pub amount: f64,
}

/// One page of the full-market quote list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotePage {
    /// Total number of quotes across all pages.
    pub total: usize,
    pub items: Vec<Quote>,
}

// ---------------------------------------------------------------------------
// Boards
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoardKind {
    Industry,
    Concept,
}

impl std::fmt::Display for BoardKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BoardKind::Industry => write!(f, "industry"),
            BoardKind::Concept => write!(f, "concept"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Board {
    pub code: String,
    pub name: String,
    pub change_percent: f64,
    #[serde(default)]
    pub turnover_rate: f64,
    #[serde(default)]
    pub up_count: u32,
    #[serde(default)]
    pub down_count: u32,
    /// Name of the best-performing constituent.
    #[serde(default)]
    pub leader: Option<String>,
}

// ---------------------------------------------------------------------------
// Candles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Period {
    #[serde(rename = "1m")]
    Min1,
    #[serde(rename = "5m")]
    Min5,
    #[serde(rename = "15m")]
    Min15,
    #[serde(rename = "30m")]
    Min30,
    #[serde(rename = "60m")]
    Min60,
    #[serde(rename = "day")]
    Day,
    #[serde(rename = "week")]
    Week,
    #[serde(rename = "month")]
    Month,
}

impl Period {
    pub fn is_intraday(self) -> bool {
        matches!(
            self,
            Period::Min1 | Period::Min5 | Period::Min15 | Period::Min30 | Period::Min60
        )
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Period::Min1 => "1m",
            Period::Min5 => "5m",
            Period::Min15 => "15m",
            Period::Min30 => "30m",
            Period::Min60 => "60m",
            Period::Day => "day",
            Period::Week => "week",
            Period::Month => "month",
        };
        write!(f, "{s}")
    }
}

/// Price adjustment for corporate actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Adjust {
    None,
    #[default]
    Forward,
    Backward,
}

/// Inclusive `YYYYMMDD` date bounds; either end may be open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    /// `YYYY-MM-DD` for daily and above, `YYYY-MM-DD HH:MM` intraday.
    pub time: String,
    pub open: f64,
    pub close: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
    #[serde(default)]
    pub amount: f64,
}

// ---------------------------------------------------------------------------
// Intraday / flows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelinePoint {
    /// `HH:MM`
    pub time: String,
    pub price: f64,
    /// Running session average price as reported by the provider.
    #[serde(default)]
    pub avg_price: Option<f64>,
    #[serde(default)]
    pub volume: f64,
}

/// Net inflow by order size bucket, in yuan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FundFlow {
    pub main_net: f64,
    pub super_large_net: f64,
    pub large_net: f64,
    pub medium_net: f64,
    pub small_net: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BigOrderStats {
    pub buy_count: u32,
    pub sell_count: u32,
    pub buy_amount: f64,
    pub sell_amount: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradingDay {
    /// `YYYY-MM-DD`
    pub date: String,
    pub is_open: bool,
}

// ---------------------------------------------------------------------------
// Exchange prefix inference
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    /// Shanghai
    Sh,
    /// Shenzhen
    Sz,
    /// Beijing
    Bj,
}

impl Exchange {
    pub fn prefix(self) -> &'static str {
        match self {
            Exchange::Sh => "sh",
            Exchange::Sz => "sz",
            Exchange::Bj => "bj",
        }
    }

    /// Exchange for a bare code, by its leading digit.
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().as_bytes().first()? {
            b'6' | b'9' => Some(Exchange::Sh),
            b'0' | b'3' => Some(Exchange::Sz),
            b'4' | b'8' => Some(Exchange::Bj),
            _ => None,
        }
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.prefix())
    }
}

/// `600519` → `sh600519`. Already-qualified codes are returned lowercased.
/// Returns None when the leading digit maps to no exchange.
pub fn qualify_code(code: &str) -> Option<String> {
    let code = code.trim();
    let lower = code.to_ascii_lowercase();
    if ["sh", "sz", "bj"].iter().any(|p| lower.starts_with(p)) {
        return Some(lower);
    }
    let exchange = Exchange::from_code(code)?;
    Some(format!("{}{}", exchange.prefix(), code))
}

// ---------------------------------------------------------------------------
// Picker output
// ---------------------------------------------------------------------------

/// A quote that survived both picker filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PickedStock {
    pub quote: Quote,
    /// Percent of intraday samples at or above the running average price.
    pub above_avg_ratio: f64,
}
