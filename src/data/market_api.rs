use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::debug;

use crate::cache::{cache_key, TtlCache};
use crate::config::ttl;
use crate::error::{AppError, Result};
use crate::remote::{method, MarketDataSource};
use crate::types::{
    Adjust, BigOrderStats, Board, BoardKind, DateRange, FundFlow, Kline, Period, Quote, QuotePage,
    TimelinePoint, TradingDay,
};

/// Cached payloads are type-erased; each endpoint always stores the same type.
type Payload = Arc<dyn Any + Send + Sync>;

/// What a leader hands to the callers waiting on the same key.
type Outcome = std::result::Result<Payload, Arc<AppError>>;

/// One remote call in progress. Waiters clone `outcome` and wait for `Some`.
struct Flight {
    id: u64,
    outcome: watch::Receiver<Option<Outcome>>,
}

enum Role {
    Lead(u64, watch::Sender<Option<Outcome>>),
    Follow(watch::Receiver<Option<Outcome>>),
}

/// Removes the leader's in-flight entry when dropped, including when the
/// leader's future is dropped mid-fetch.
struct FlightRelease<'a> {
    in_flight: &'a DashMap<String, Flight>,
    key: &'a str,
    id: u64,
}

impl Drop for FlightRelease<'_> {
    fn drop(&mut self) {
        self.in_flight.remove_if(self.key, |_, flight| flight.id == self.id);
    }
}

/// Cache lifetime class, chosen by how fast the underlying data changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlClass {
    Quote,
    Timeline,
    FundFlow,
    Kline,
    BoardList,
    Constituents,
    Calendar,
}

impl TtlClass {
    pub fn ttl(self) -> Duration {
        let ms = match self {
            TtlClass::Quote => ttl::QUOTE_MS,
            TtlClass::Timeline => ttl::TIMELINE_MS,
            TtlClass::FundFlow => ttl::FUND_FLOW_MS,
            TtlClass::Kline => ttl::KLINE_MS,
            TtlClass::BoardList => ttl::BOARD_LIST_MS,
            TtlClass::Constituents => ttl::CONSTITUENTS_MS,
            TtlClass::Calendar => ttl::CALENDAR_MS,
        };
        Duration::from_millis(ms)
    }
}

/// Cached access to every remote endpoint.
///
/// Concurrent misses on the same key share one remote call and its outcome:
/// the first caller fetches, later callers wait for its result, success or
/// failure. Failures are never cached. If the fetching caller goes away
/// before finishing, one of the waiters takes over.
pub struct MarketApi {
    source: Arc<dyn MarketDataSource>,
    cache: TtlCache<Payload>,
    /// cache key → remote call currently running for it
    in_flight: DashMap<String, Flight>,
    next_flight: AtomicU64,
}

impl MarketApi {
    pub fn new(source: Arc<dyn MarketDataSource>) -> Arc<Self> {
        Arc::new(Self {
            source,
            cache: TtlCache::new(),
            in_flight: DashMap::new(),
            next_flight: AtomicU64::new(0),
        })
    }

    /// Returns the cached value for `(endpoint, args)` or runs `fetch` once and caches its result.
    pub async fn fetch_cached<A, T, F, Fut>(
        &self,
        endpoint: &str,
        args: &A,
        class: TtlClass,
        fetch: F,
    ) -> Result<Arc<T>>
    where
        A: Serialize + Sync + ?Sized,
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let key = cache_key(endpoint, args)?;
        loop {
            if let Some(hit) = self.lookup::<T>(&key) {
                return Ok(hit);
            }

            let role = match self.in_flight.entry(key.clone()) {
                Entry::Occupied(flight) => Role::Follow(flight.get().outcome.clone()),
                Entry::Vacant(slot) => {
                    let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = watch::channel(None);
                    slot.insert(Flight { id, outcome: rx });
                    Role::Lead(id, tx)
                }
            };

            match role {
                Role::Lead(id, tx) => return self.lead(&key, id, tx, class, fetch).await,
                Role::Follow(rx) => {
                    if let Some(result) = follow::<T>(rx).await {
                        return result;
                    }
                    debug!(key = %key, "leader went away, retrying");
                }
            }
        }
    }

    async fn lead<T, F, Fut>(
        &self,
        key: &str,
        id: u64,
        tx: watch::Sender<Option<Outcome>>,
        class: TtlClass,
        fetch: F,
    ) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let release = FlightRelease {
            in_flight: &self.in_flight,
            key,
            id,
        };

        debug!(key = %key, "cache miss");
        match fetch().await {
            Ok(value) => {
                let value = Arc::new(value);
                let payload: Payload = value.clone();
                // Cache before releasing so no caller can slip in between and refetch.
                self.cache.set(key.to_string(), payload.clone(), class.ttl());
                drop(release);
                tx.send_replace(Some(Ok(payload)));
                Ok(value)
            }
            Err(e) => {
                drop(release);
                // Nobody waiting: hand the error back untouched.
                if tx.receiver_count() == 0 {
                    return Err(e);
                }
                let shared = Arc::new(e);
                tx.send_replace(Some(Err(Arc::clone(&shared))));
                Err(AppError::Shared(shared))
            }
        }
    }

    fn lookup<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        self.cache.get(key)?.downcast::<T>().ok()
    }

    /// Drops cached entries whose key starts with `prefix`, e.g. `endpoint_prefix(method::BOARDS)`.
    pub fn invalidate(&self, prefix: &str) -> usize {
        let removed = self.cache.invalidate(prefix);
        debug!(prefix, removed, "cache invalidated");
        removed
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    // -----------------------------------------------------------------------
    // Endpoints
    // -----------------------------------------------------------------------

    pub async fn quotes(&self, codes: &[String]) -> Result<Arc<Vec<Quote>>> {
        self.fetch_cached(method::QUOTES, codes, TtlClass::Quote, || {
            self.source.quotes(codes)
        })
        .await
    }

    pub async fn market_quotes(&self, page: usize, page_size: usize) -> Result<Arc<QuotePage>> {
        let args = json!({ "page": page, "page_size": page_size });
        self.fetch_cached(method::MARKET_QUOTES, &args, TtlClass::Quote, || {
            self.source.market_quotes(page, page_size)
        })
        .await
    }

    pub async fn boards(&self, kind: BoardKind) -> Result<Arc<Vec<Board>>> {
        let args = json!({ "kind": kind });
        self.fetch_cached(method::BOARDS, &args, TtlClass::BoardList, || {
            self.source.boards(kind)
        })
        .await
    }

    pub async fn board_constituents(&self, board_code: &str) -> Result<Arc<Vec<Quote>>> {
        self.fetch_cached(
            method::BOARD_CONSTITUENTS,
            board_code,
            TtlClass::Constituents,
            || self.source.board_constituents(board_code),
        )
        .await
    }

    pub async fn klines(
        &self,
        code: &str,
        period: Period,
        adjust: Adjust,
        range: &DateRange,
    ) -> Result<Arc<Vec<Kline>>> {
        let args = json!({ "code": code, "period": period, "adjust": adjust, "range": range });
        self.fetch_cached(method::KLINES, &args, TtlClass::Kline, || {
            self.source.klines(code, period, adjust, range)
        })
        .await
    }

    pub async fn timeline(&self, code: &str) -> Result<Arc<Vec<TimelinePoint>>> {
        self.fetch_cached(method::TIMELINE, code, TtlClass::Timeline, || {
            self.source.timeline(code)
        })
        .await
    }

    pub async fn fund_flow(&self, code: &str) -> Result<Arc<FundFlow>> {
        self.fetch_cached(method::FUND_FLOW, code, TtlClass::FundFlow, || {
            self.source.fund_flow(code)
        })
        .await
    }

    pub async fn big_orders(&self, code: &str) -> Result<Arc<BigOrderStats>> {
        self.fetch_cached(method::BIG_ORDERS, code, TtlClass::FundFlow, || {
            self.source.big_orders(code)
        })
        .await
    }

    pub async fn trade_calendar(&self, year: i32) -> Result<Arc<Vec<TradingDay>>> {
        self.fetch_cached(method::TRADE_CALENDAR, &year, TtlClass::Calendar, || {
            self.source.trade_calendar(year)
        })
        .await
    }
}

/// Waits for the leader's outcome. None means the leader was dropped before
/// finishing and the caller should try again.
async fn follow<T: Send + Sync + 'static>(
    mut outcome: watch::Receiver<Option<Outcome>>,
) -> Option<Result<Arc<T>>> {
    let settled = outcome.wait_for(Option::is_some).await.ok()?.clone()?;
    match settled {
        Ok(payload) => payload.downcast::<T>().ok().map(Ok),
        Err(e) => Some(Err(AppError::Shared(e))),
    }
}

/// Prefix matching every cached key of `endpoint`.
pub fn endpoint_prefix(endpoint: &str) -> String {
    format!("{endpoint}:")
}
