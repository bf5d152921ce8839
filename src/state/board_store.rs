use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::data::{endpoint_prefix, MarketApi};
use crate::error::Result;
use crate::polling::{Poller, PollingOptions, VisibilitySignal};
use crate::remote::method;
use crate::types::{Board, BoardKind};

// ---------------------------------------------------------------------------
// BoardSnapshot
// ---------------------------------------------------------------------------

/// The two board lists every view shares.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoardSnapshot {
    pub industry_list: Arc<Vec<Board>>,
    pub concept_list: Arc<Vec<Board>>,
    /// Unix millis of the last successful refresh.
    pub last_updated_ms: Option<i64>,
    /// True only until the first refresh settles; background refreshes never set it again.
    pub loading: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    /// Another refresh was already running; no remote call was made.
    SkippedInFlight,
    /// Last success is more recent than the minimum interval.
    Throttled,
}

/// Holds the in-flight flag for one refresh and clears it on drop.
struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// BoardStore
// ---------------------------------------------------------------------------

/// Session-wide cache of the industry and concept board lists.
///
/// Many views mount at once and all want the same two lists; they read the
/// shared snapshot (or subscribe to it) instead of fetching themselves.
/// At most one refresh runs at a time, and non-forced refreshes inside
/// `min_interval` of the last success are dropped.
pub struct BoardStore {
    api: Arc<MarketApi>,
    snapshot: watch::Sender<BoardSnapshot>,
    in_flight: AtomicBool,
    last_success: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl BoardStore {
    pub fn new(api: Arc<MarketApi>, min_interval: Duration) -> Arc<Self> {
        let (snapshot, _rx) = watch::channel(BoardSnapshot {
            loading: true,
            ..BoardSnapshot::default()
        });
        Arc::new(Self {
            api,
            snapshot,
            in_flight: AtomicBool::new(false),
            last_success: Mutex::new(None),
            min_interval,
        })
    }

    pub fn snapshot(&self) -> BoardSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<BoardSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn is_refreshing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Fetches both lists concurrently and replaces the snapshot.
    ///
    /// `force` skips the throttle. A refresh that runs always refetches both
    /// lists from the provider. On failure the previous lists stay in place and
    /// the error is returned.
    pub async fn refresh(&self, force: bool) -> Result<RefreshOutcome> {
        if !force && self.within_min_interval() {
            debug!("[BOARDS] refresh throttled");
            return Ok(RefreshOutcome::Throttled);
        }

        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            debug!("[BOARDS] refresh already in flight");
            return Ok(RefreshOutcome::SkippedInFlight);
        };

        // Past the throttle every refresh goes to the provider, not the façade cache.
        self.api.invalidate(&endpoint_prefix(method::BOARDS));

        let (industry, concept) = tokio::join!(
            self.api.boards(BoardKind::Industry),
            self.api.boards(BoardKind::Concept),
        );

        match (industry, concept) {
            (Ok(industry_list), Ok(concept_list)) => {
                let industry_count = industry_list.len();
                let concept_count = concept_list.len();
                self.snapshot.send_modify(|s| {
                    s.industry_list = industry_list;
                    s.concept_list = concept_list;
                    s.last_updated_ms = Some(now_ms());
                    s.loading = false;
                });
                *self.last_success.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
                info!(
                    industry = industry_count,
                    concept = concept_count,
                    force,
                    "[BOARDS] refreshed: {industry_count} industry, {concept_count} concept",
                );
                Ok(RefreshOutcome::Refreshed)
            }
            (Err(e), _) | (_, Err(e)) => {
                self.snapshot.send_if_modified(|s| std::mem::replace(&mut s.loading, false));
                warn!("[BOARDS] refresh failed, keeping previous lists: {e}");
                Err(e)
            }
        }
    }

    /// Background refresh every `interval`, gated by `visibility`.
    /// The returned poller owns the schedule; dropping it stops refreshing.
    pub fn start_auto_refresh(
        self: &Arc<Self>,
        interval: Duration,
        visibility: &VisibilitySignal,
    ) -> Poller<RefreshOutcome> {
        let store = Arc::clone(self);
        Poller::spawn("boards", PollingOptions::every(interval), visibility, move || {
            let store = Arc::clone(&store);
            async move { store.refresh(false).await }
        })
    }

    fn within_min_interval(&self) -> bool {
        self.last_success
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some_and(|at| at.elapsed() < self.min_interval)
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{board, FakeSource};

    fn store_with(source: FakeSource) -> (Arc<BoardStore>, Arc<FakeSource>) {
        let source = Arc::new(source);
        let api = MarketApi::new(source.clone());
        (BoardStore::new(api, Duration::from_secs(10)), source)
    }

    fn boards() -> FakeSource {
        FakeSource::new().with_boards(
            vec![board("BK0475", "银行"), board("BK0478", "有色金属")],
            vec![board("BK0891", "国产芯片")],
        )
    }

    #[test]
    fn starts_loading_and_empty() {
        let (store, _) = store_with(boards());
        let snap = store.snapshot();
        assert!(snap.loading);
        assert!(snap.industry_list.is_empty());
        assert_eq!(snap.last_updated_ms, None);
    }

    #[tokio::test]
    async fn refresh_fills_both_lists() {
        let (store, source) = store_with(boards());

        let outcome = store.refresh(false).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::Refreshed);

        let snap = store.snapshot();
        assert!(!snap.loading);
        assert_eq!(snap.industry_list.len(), 2);
        assert_eq!(snap.concept_list[0].name, "国产芯片");
        assert!(snap.last_updated_ms.is_some());
        assert_eq!(source.calls(method::BOARDS), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_refreshes_share_one_round_trip() {
        let (store, source) = store_with(boards().with_delay(method::BOARDS, Duration::from_millis(300)));

        let (a, b) = tokio::join!(store.refresh(false), store.refresh(false));
        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| *o as u8);
        assert_eq!(outcomes, vec![RefreshOutcome::Refreshed, RefreshOutcome::SkippedInFlight]);
        assert_eq!(source.calls(method::BOARDS), 2, "exactly one industry + one concept call");
        assert!(!store.is_refreshing());
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_applies_unless_forced() {
        let (store, source) = store_with(boards());

        store.refresh(false).await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(store.refresh(false).await.unwrap(), RefreshOutcome::Throttled);
        assert_eq!(source.calls(method::BOARDS), 2);

        assert_eq!(store.refresh(true).await.unwrap(), RefreshOutcome::Refreshed);
        assert_eq!(source.calls(method::BOARDS), 4);
        assert_eq!(store.refresh(true).await.unwrap(), RefreshOutcome::Refreshed);
        assert_eq!(source.calls(method::BOARDS), 6);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(store.refresh(false).await.unwrap(), RefreshOutcome::Refreshed);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_past_the_throttle_refetches_within_cache_ttl() {
        let (store, source) = store_with(boards());

        store.refresh(false).await.unwrap();
        source.set_industry(vec![board("BK0473", "证券")]);
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(store.refresh(false).await.unwrap(), RefreshOutcome::Refreshed);
        assert_eq!(source.calls(method::BOARDS), 4);
        assert_eq!(store.snapshot().industry_list[0].name, "证券");
    }

    #[tokio::test]
    async fn failure_keeps_previous_lists_and_clears_loading() {
        let (store, source) = store_with(boards());

        source.fail_next(method::BOARDS, 1);
        assert!(store.refresh(false).await.is_err());
        let snap = store.snapshot();
        assert!(!snap.loading, "a failed first load still ends the loading state");
        assert!(snap.industry_list.is_empty());

        store.refresh(true).await.unwrap();
        source.fail_next(method::BOARDS, 1);
        assert!(store.refresh(true).await.is_err());
        let snap = store.snapshot();
        assert_eq!(snap.industry_list.len(), 2);
        assert!(!snap.loading);
    }

    #[tokio::test(start_paused = true)]
    async fn background_refresh_never_shows_loading() {
        let (store, _source) = store_with(boards().with_delay(method::BOARDS, Duration::from_millis(500)));
        store.refresh(false).await.unwrap();

        let background = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.refresh(true).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.is_refreshing());
        assert!(!store.snapshot().loading);

        background.await.unwrap().unwrap();
        assert!(!store.snapshot().loading);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_refresh_picks_up_new_lists() {
        let (store, source) = store_with(boards());
        let visibility = VisibilitySignal::new(true);
        let poller = store.start_auto_refresh(Duration::from_secs(60), &visibility);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(store.snapshot().industry_list.len(), 2);
        assert_eq!(poller.data(), Some(RefreshOutcome::Refreshed));

        source.set_industry(vec![board("BK0001", "证券")]);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(store.snapshot().industry_list[0].name, "证券");

        visibility.set_visible(false);
        source.set_industry(vec![]);
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(store.snapshot().industry_list.len(), 1, "no refresh while hidden");
    }
}
