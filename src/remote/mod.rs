//! Boundary to the external market data provider.
//!
//! Everything above this module talks to a `MarketDataSource`; the production
//! implementation is `RpcClient`, tests use a scripted fake.

pub mod client;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    Adjust, BigOrderStats, Board, BoardKind, DateRange, FundFlow, Kline, Period, Quote, QuotePage,
    TimelinePoint, TradingDay,
};

pub use client::RpcClient;

/// Provider method names. Also used as cache endpoint identities.
pub mod method {
    pub const QUOTES: &str = "quotes";
    pub const MARKET_QUOTES: &str = "market_quotes";
    pub const BOARDS: &str = "boards";
    pub const BOARD_CONSTITUENTS: &str = "board_constituents";
    pub const KLINES: &str = "klines";
    pub const TIMELINE: &str = "timeline";
    pub const FUND_FLOW: &str = "fund_flow";
    pub const BIG_ORDERS: &str = "big_orders";
    pub const TRADE_CALENDAR: &str = "trade_calendar";
}

/// Asynchronous market data calls. Errors surface as `Err`; no retries are
/// expected from implementors.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn quotes(&self, codes: &[String]) -> Result<Vec<Quote>>;

    /// One page (1-based) of the full-market quote list.
    async fn market_quotes(&self, page: usize, page_size: usize) -> Result<QuotePage>;

    async fn boards(&self, kind: BoardKind) -> Result<Vec<Board>>;

    async fn board_constituents(&self, board_code: &str) -> Result<Vec<Quote>>;

    async fn klines(
        &self,
        code: &str,
        period: Period,
        adjust: Adjust,
        range: &DateRange,
    ) -> Result<Vec<Kline>>;

    /// Today's intraday timeline. Expects a qualified code (`sh600519`).
    async fn timeline(&self, code: &str) -> Result<Vec<TimelinePoint>>;

    async fn fund_flow(&self, code: &str) -> Result<FundFlow>;

    async fn big_orders(&self, code: &str) -> Result<BigOrderStats>;

    async fn trade_calendar(&self, year: i32) -> Result<Vec<TradingDay>>;
}
