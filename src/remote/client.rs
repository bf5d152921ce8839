use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::{AppError, Result};
use crate::remote::{method, MarketDataSource};
use crate::types::{
    Adjust, BigOrderStats, Board, BoardKind, DateRange, FundFlow, Kline, Period, Quote, QuotePage,
    TimelinePoint, TradingDay,
};

/// JSON RPC client for the market data gateway.
///
/// Every call is `POST {base_url}/rpc` with `{"method": .., "params": ..}`;
/// the gateway answers `{"data": ..}` or `{"error": ".."}`.
pub struct RpcClient {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct RpcRequest<'a, P> {
    method: &'a str,
    params: P,
}

#[derive(Deserialize)]
struct RpcEnvelope<T> {
    data: Option<T>,
    error: Option<String>,
}

impl RpcClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    async fn call<P: Serialize, T: DeserializeOwned>(&self, method: &str, params: P) -> Result<T> {
        let url = format!("{}/rpc", self.base_url);
        debug!(method, "rpc call");

        let envelope: RpcEnvelope<T> = self
            .http
            .post(&url)
            .json(&RpcRequest { method, params })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        match (envelope.data, envelope.error) {
            (_, Some(message)) => Err(AppError::remote(method, message)),
            (Some(data), None) => Ok(data),
            (None, None) => Err(AppError::remote(method, "response carried neither data nor error")),
        }
    }
}

#[async_trait]
impl MarketDataSource for RpcClient {
    async fn quotes(&self, codes: &[String]) -> Result<Vec<Quote>> {
        self.call(method::QUOTES, json!({ "codes": codes })).await
    }

    async fn market_quotes(&self, page: usize, page_size: usize) -> Result<QuotePage> {
        self.call(
            method::MARKET_QUOTES,
            json!({ "page": page, "page_size": page_size }),
        )
        .await
    }

    async fn boards(&self, kind: BoardKind) -> Result<Vec<Board>> {
        self.call(method::BOARDS, json!({ "kind": kind })).await
    }

    async fn board_constituents(&self, board_code: &str) -> Result<Vec<Quote>> {
        self.call(method::BOARD_CONSTITUENTS, json!({ "board_code": board_code }))
            .await
    }

    async fn klines(
        &self,
        code: &str,
        period: Period,
        adjust: Adjust,
        range: &DateRange,
    ) -> Result<Vec<Kline>> {
        self.call(
            method::KLINES,
            json!({
                "code": code,
                "period": period,
                "adjust": adjust,
                "start": range.start,
                "end": range.end,
            }),
        )
        .await
    }

    async fn timeline(&self, code: &str) -> Result<Vec<TimelinePoint>> {
        self.call(method::TIMELINE, json!({ "code": code })).await
    }

    async fn fund_flow(&self, code: &str) -> Result<FundFlow> {
        self.call(method::FUND_FLOW, json!({ "code": code })).await
    }

    async fn big_orders(&self, code: &str) -> Result<BigOrderStats> {
        self.call(method::BIG_ORDERS, json!({ "code": code })).await
    }

    async fn trade_calendar(&self, year: i32) -> Result<Vec<TradingDay>> {
        self.call(method::TRADE_CALENDAR, json!({ "year": year })).await
    }
}
