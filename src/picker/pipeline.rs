use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PickerConfig;
use crate::data::MarketApi;
use crate::error::{AppError, Result};
use crate::picker::filter::{basic_filter, FilterConditions};
use crate::picker::strength::above_average_ratio;
use crate::prefs::Preferences;
use crate::types::{qualify_code, PickedStock, Quote};

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Stage {
    /// Paging through the full market quote list.
    #[default]
    Fetch,
    /// Applying the basic conditions.
    Filter,
    /// Fetching timelines and scoring intraday strength.
    Enrich,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub stage: Stage,
    pub completed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ScreeningRun {
    /// Stage 2 survivors, strongest change first.
    pub basic_candidates: Vec<Quote>,
    /// Stage 3 survivors in candidate order. Always empty when aborted.
    pub enriched_results: Vec<PickedStock>,
    pub progress: Progress,
    pub aborted: bool,
}

impl ScreeningRun {
    fn aborted(basic_candidates: Vec<Quote>, progress: Progress) -> Self {
        Self {
            basic_candidates,
            enriched_results: Vec::new(),
            progress,
            aborted: true,
        }
    }
}

pub type ProgressFn = dyn Fn(Progress) + Send + Sync;

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Runs the three screening stages once.
///
/// `cancel` is checked between batches only: work already in flight finishes,
/// but nothing from it is committed and no progress is reported afterwards.
/// A stage 1 failure fails the whole run; stage 3 failures drop the symbol.
pub async fn run_screening(
    api: &MarketApi,
    conditions: &FilterConditions,
    cfg: PickerConfig,
    cancel: &CancellationToken,
    on_progress: &ProgressFn,
) -> Result<ScreeningRun> {
    // Stage 1
    let Some((universe, fetch_progress)) = fetch_universe(api, cfg, cancel, on_progress).await?
    else {
        info!("[PICKER] cancelled during market fetch");
        return Ok(ScreeningRun::aborted(Vec::new(), Progress::default()));
    };

    // Stage 2
    let (candidates, stats) = basic_filter(&universe, conditions);
    info!(
        "[FILTER] {} of {} quotes passed; rejected: st={} market_cap={} volume_ratio={} change={} turnover={}",
        stats.passed,
        stats.scanned,
        stats.rejected_st,
        stats.rejected_market_cap,
        stats.rejected_volume_ratio,
        stats.rejected_change,
        stats.rejected_turnover,
    );
    if cancel.is_cancelled() {
        return Ok(ScreeningRun::aborted(candidates, fetch_progress));
    }
    let filter_progress = Progress {
        stage: Stage::Filter,
        completed: stats.passed,
        total: stats.scanned,
    };
    on_progress(filter_progress);

    if candidates.is_empty() {
        return Ok(ScreeningRun {
            progress: filter_progress,
            ..ScreeningRun::default()
        });
    }

    // Stage 3
    let total = candidates.len();
    let mut enriched = Vec::new();
    let mut progress = Progress {
        stage: Stage::Enrich,
        completed: 0,
        total,
    };
    for batch in candidates.chunks(cfg.batch_size.max(1)) {
        if cancel.is_cancelled() {
            info!(completed = progress.completed, total, "[PICKER] cancelled before batch");
            return Ok(ScreeningRun::aborted(candidates, progress));
        }

        let scored = join_all(
            batch
                .iter()
                .map(|q| enrich(api, q, conditions.strength_min)),
        )
        .await;

        // The batch ran to completion but the run is stale; commit nothing.
        if cancel.is_cancelled() {
            info!(completed = progress.completed, total, "[PICKER] cancelled during batch");
            return Ok(ScreeningRun::aborted(candidates, progress));
        }

        enriched.extend(scored.into_iter().flatten());
        progress.completed += batch.len();
        on_progress(progress);
    }

    info!(
        candidates = total,
        picked = enriched.len(),
        "[PICKER] done: {} of {total} candidates above {:.0}%",
        enriched.len(),
        conditions.strength_min,
    );
    Ok(ScreeningRun {
        basic_candidates: candidates,
        enriched_results: enriched,
        progress,
        aborted: false,
    })
}

/// Pages through the whole market. None means cancelled.
async fn fetch_universe(
    api: &MarketApi,
    cfg: PickerConfig,
    cancel: &CancellationToken,
    on_progress: &ProgressFn,
) -> Result<Option<(Vec<Quote>, Progress)>> {
    let page_size = cfg.page_size.max(1);
    let first = api
        .market_quotes(1, page_size)
        .await
        .map_err(|e| AppError::BulkFetch(Box::new(e)))?;

    let pages = first.total.div_ceil(page_size).max(1);
    let mut quotes = first.items.clone();
    let mut progress = Progress {
        stage: Stage::Fetch,
        completed: 1,
        total: pages,
    };
    if cancel.is_cancelled() {
        return Ok(None);
    }
    on_progress(progress);
    debug!(total = first.total, pages, "[PICKER] market list size known");

    let remaining: Vec<usize> = (2..=pages).collect();
    for chunk in remaining.chunks(cfg.fetch_concurrency.max(1)) {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        let results = join_all(chunk.iter().map(|&page| api.market_quotes(page, page_size))).await;
        for result in results {
            let page = result.map_err(|e| AppError::BulkFetch(Box::new(e)))?;
            quotes.extend(page.items.iter().cloned());
        }
        if cancel.is_cancelled() {
            return Ok(None);
        }
        progress.completed += chunk.len();
        on_progress(progress);
    }

    info!(quotes = quotes.len(), pages, "[PICKER] market list fetched");
    Ok(Some((quotes, progress)))
}

async fn enrich(api: &MarketApi, quote: &Quote, strength_min: f64) -> Option<PickedStock> {
    let Some(symbol) = qualify_code(&quote.code) else {
        warn!(code = %quote.code, "[PICKER] no exchange for code, skipping");
        return None;
    };

    let points = match api.timeline(&symbol).await {
        Ok(points) => points,
        Err(e) => {
            warn!(symbol = %symbol, "[PICKER] timeline failed, skipping: {e}");
            return None;
        }
    };

    let ratio = above_average_ratio(&points);
    if ratio < strength_min {
        debug!(symbol = %symbol, ratio, "[PICKER] below strength floor");
        return None;
    }
    Some(PickedStock {
        quote: quote.clone(),
        above_avg_ratio: ratio,
    })
}

// ---------------------------------------------------------------------------
// Picker session
// ---------------------------------------------------------------------------

/// Owns the currently running screening, if any.
///
/// Starting a run cancels the previous one, so a stale run never overwrites
/// a newer one's results.
pub struct Picker {
    api: Arc<MarketApi>,
    prefs: Arc<Preferences>,
    config: PickerConfig,
    /// (run id, token) of the run in progress
    current: Mutex<Option<(u64, CancellationToken)>>,
    next_id: AtomicU64,
    /// Latest fire-and-forget preference write. Each write waits for the one
    /// before it, so they land in run order.
    last_write: Mutex<Option<JoinHandle<()>>>,
}

impl Picker {
    pub fn new(api: Arc<MarketApi>, prefs: Arc<Preferences>, config: PickerConfig) -> Arc<Self> {
        Arc::new(Self {
            api,
            prefs,
            config,
            current: Mutex::new(None),
            next_id: AtomicU64::new(1),
            last_write: Mutex::new(None),
        })
    }

    pub async fn run(&self, conditions: FilterConditions, on_progress: &ProgressFn) -> Result<ScreeningRun> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let previous = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace((id, token.clone()));
        if let Some((prev_id, prev_token)) = previous {
            info!(run = id, superseded = prev_id, "[PICKER] superseding previous run");
            prev_token.cancel();
        }

        self.remember(&conditions);
        info!(run = id, "[PICKER] run started");

        let result = run_screening(&self.api, &conditions, self.config, &token, on_progress).await;

        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref().is_some_and(|(cur, _)| *cur == id) {
            *current = None;
        }
        result
    }

    /// Cancels the run in progress. No-op when idle.
    pub fn cancel(&self) {
        if let Some((id, token)) = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            info!(run = id, "[PICKER] cancel requested");
            token.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Waits for the preference writes started by earlier runs.
    pub async fn wait_persisted(&self) {
        let last = self
            .last_write
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = last {
            if let Err(e) = handle.await {
                warn!("[PICKER] preference write task failed: {e}");
            }
        }
    }

    fn remember(&self, conditions: &FilterConditions) {
        let prefs = Arc::clone(&self.prefs);
        let conditions = conditions.clone();

        let mut last = self.last_write.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = last.take();
        *last = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                if let Err(e) = previous.await {
                    warn!("[PICKER] preference write task failed: {e}");
                }
            }
            prefs.push_recent_filter(conditions.clone()).await;
            prefs.save_current_filters(&conditions).await;
        }));
    }
}
