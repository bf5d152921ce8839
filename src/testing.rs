//! Scripted `MarketDataSource` used by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::{AppError, Result};
use crate::remote::{method, MarketDataSource};
use crate::types::{
    Adjust, BigOrderStats, Board, BoardKind, DateRange, FundFlow, Kline, Period, Quote, QuotePage,
    TimelinePoint, TradingDay,
};

pub fn quote(code: &str, name: &str, market_cap: f64, volume_ratio: f64, change: f64, turnover: f64) -> Quote {
    Quote {
        code: code.to_string(),
        name: name.to_string(),
        price: 10.0,
        change_percent: change,
        volume_ratio,
        turnover_rate: turnover,
        market_cap,
        volume: 0.0,
        amount: 0.0,
    }
}

pub fn board(code: &str, name: &str) -> Board {
    Board {
        code: code.to_string(),
        name: name.to_string(),
        change_percent: 1.0,
        turnover_rate: 0.0,
        up_count: 0,
        down_count: 0,
        leader: None,
    }
}

/// Timeline whose price is at/above the running average at the given indices.
pub fn timeline(strong: &[bool]) -> Vec<TimelinePoint> {
    strong
        .iter()
        .enumerate()
        .map(|(i, &above)| TimelinePoint {
            time: format!("09:{:02}", 30 + i),
            price: if above { 10.5 } else { 9.5 },
            avg_price: Some(10.0),
            volume: 100.0,
        })
        .collect()
}

#[derive(Default)]
pub struct FakeSource {
    calls: DashMap<&'static str, usize>,
    universe: Mutex<Vec<Quote>>,
    industry: Mutex<Vec<Board>>,
    concept: Mutex<Vec<Board>>,
    timelines: Mutex<HashMap<String, Vec<TimelinePoint>>>,
    /// Timeline codes that always fail.
    failing_codes: Mutex<HashSet<String>>,
    /// method → number of upcoming calls that fail.
    fail_next: Mutex<HashMap<&'static str, usize>>,
    delays: Mutex<HashMap<&'static str, Duration>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_universe(self, quotes: Vec<Quote>) -> Self {
        *self.universe.lock().unwrap() = quotes;
        self
    }

    pub fn with_boards(self, industry: Vec<Board>, concept: Vec<Board>) -> Self {
        *self.industry.lock().unwrap() = industry;
        *self.concept.lock().unwrap() = concept;
        self
    }

    pub fn with_timeline(self, code: &str, points: Vec<TimelinePoint>) -> Self {
        self.timelines.lock().unwrap().insert(code.to_string(), points);
        self
    }

    pub fn with_failing_timeline(self, code: &str) -> Self {
        self.failing_codes.lock().unwrap().insert(code.to_string());
        self
    }

    pub fn with_delay(self, method: &'static str, delay: Duration) -> Self {
        self.delays.lock().unwrap().insert(method, delay);
        self
    }

    pub fn fail_next(&self, method: &'static str, times: usize) {
        self.fail_next.lock().unwrap().insert(method, times);
    }

    pub fn set_industry(&self, boards: Vec<Board>) {
        *self.industry.lock().unwrap() = boards;
    }

    pub fn calls(&self, method: &str) -> usize {
        self.calls.get(method).map(|c| *c).unwrap_or(0)
    }

    /// Highest number of concurrently running timeline calls seen.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn enter(&self, method: &'static str) -> Result<()> {
        *self.calls.entry(method).or_insert(0) += 1;
        let delay = self.delays.lock().unwrap().get(method).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut fail_next = self.fail_next.lock().unwrap();
        if let Some(remaining) = fail_next.get_mut(method) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(AppError::remote(method, "scripted failure"));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MarketDataSource for FakeSource {
    async fn quotes(&self, codes: &[String]) -> Result<Vec<Quote>> {
        self.enter(method::QUOTES).await?;
        let universe = self.universe.lock().unwrap();
        Ok(universe.iter().filter(|q| codes.contains(&q.code)).cloned().collect())
    }

    async fn market_quotes(&self, page: usize, page_size: usize) -> Result<QuotePage> {
        self.enter(method::MARKET_QUOTES).await?;
        let universe = self.universe.lock().unwrap();
        let start = (page.saturating_sub(1)) * page_size;
        let items = universe.iter().skip(start).take(page_size).cloned().collect();
        Ok(QuotePage {
            total: universe.len(),
            items,
        })
    }

    async fn boards(&self, kind: BoardKind) -> Result<Vec<Board>> {
        self.enter(method::BOARDS).await?;
        let boards = match kind {
            BoardKind::Industry => self.industry.lock().unwrap().clone(),
            BoardKind::Concept => self.concept.lock().unwrap().clone(),
        };
        Ok(boards)
    }

    async fn board_constituents(&self, _board_code: &str) -> Result<Vec<Quote>> {
        self.enter(method::BOARD_CONSTITUENTS).await?;
        Ok(self.universe.lock().unwrap().clone())
    }

    async fn klines(
        &self,
        _code: &str,
        _period: Period,
        _adjust: Adjust,
        _range: &DateRange,
    ) -> Result<Vec<Kline>> {
        self.enter(method::KLINES).await?;
        Ok(Vec::new())
    }

    async fn timeline(&self, code: &str) -> Result<Vec<TimelinePoint>> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let result = self.enter(method::TIMELINE).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result?;

        if self.failing_codes.lock().unwrap().contains(code) {
            return Err(AppError::remote(method::TIMELINE, format!("no data for {code}")));
        }
        Ok(self.timelines.lock().unwrap().get(code).cloned().unwrap_or_default())
    }

    async fn fund_flow(&self, _code: &str) -> Result<FundFlow> {
        self.enter(method::FUND_FLOW).await?;
        Ok(FundFlow::default())
    }

    async fn big_orders(&self, _code: &str) -> Result<BigOrderStats> {
        self.enter(method::BIG_ORDERS).await?;
        Ok(BigOrderStats::default())
    }

    async fn trade_calendar(&self, year: i32) -> Result<Vec<TradingDay>> {
        self.enter(method::TRADE_CALENDAR).await?;
        Ok(vec![TradingDay {
            date: format!("{year}-01-02"),
            is_open: true,
        }])
    }
}
