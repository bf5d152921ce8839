use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use market_desk::config::Config;
use market_desk::data::{endpoint_prefix, MarketApi};
use market_desk::error::{AppError, Result};
use market_desk::picker::{FilterConditions, Picker, Progress};
use market_desk::polling::{Poller, PollingOptions, VisibilitySignal};
use market_desk::prefs::model::keys;
use market_desk::prefs::{KvStore, MemoryKv, Preferences, SqliteKv, DEFAULT_GROUP_ID};
use market_desk::remote::{method, RpcClient};
use market_desk::state::BoardStore;

#[derive(Debug)]
enum Command {
    /// `desk watch [code...]`: keep boards and watch-list quotes fresh until Ctrl-C.
    Watch { add_codes: Vec<String> },
    /// `desk pick [scheme]`: one end-of-day screening pass.
    Pick { scheme: Option<String> },
}

impl Command {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self> {
        match args.next().as_deref() {
            None | Some("watch") => Ok(Command::Watch {
                add_codes: args.collect(),
            }),
            Some("pick") => Ok(Command::Pick { scheme: args.next() }),
            Some(other) => Err(AppError::Config(format!(
                "unknown command '{other}' (expected 'watch' or 'pick')"
            ))),
        }
    }
}

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    let command = match Command::parse(std::env::args().skip(1)) {
        Ok(c) => c,
        Err(e) => {
            error!("{e}");
            std::process::exit(2);
        }
    };

    if let Err(e) = run(cfg, command).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config, command: Command) -> Result<()> {
    // --- Preferences ---
    let kv: Arc<dyn KvStore> = match SqliteKv::connect(&cfg.db_path).await {
        Ok(kv) => {
            info!("Preferences database ready at {}", cfg.db_path);
            Arc::new(kv)
        }
        Err(e) => {
            warn!("Preferences database unavailable, nothing will persist: {e}");
            Arc::new(MemoryKv::new())
        }
    };
    let prefs = Preferences::new(kv);

    // --- Remote data ---
    let source = Arc::new(RpcClient::new(&cfg.remote_url, cfg.remote_timeout)?);
    let api = MarketApi::new(source);
    info!("Market data source: {}", cfg.remote_url);

    match command {
        Command::Watch { add_codes } => watch(&cfg, api, prefs, add_codes).await,
        Command::Pick { scheme } => pick(&cfg, api, prefs, scheme).await,
    }
}

// ---------------------------------------------------------------------------
// watch
// ---------------------------------------------------------------------------

async fn watch(
    cfg: &Config,
    api: Arc<MarketApi>,
    prefs: Arc<Preferences>,
    add_codes: Vec<String>,
) -> Result<()> {
    let settings = prefs.settings().await;
    let quote_refresh = settings
        .quote_refresh_secs
        .filter(|s| *s > 0)
        .map(Duration::from_secs)
        .unwrap_or(cfg.quote_refresh);
    let board_refresh = match settings.board_refresh_secs.map(Duration::from_secs) {
        Some(d) if d > cfg.board_min_interval => d,
        Some(d) => {
            warn!(
                "Saved board refresh {:?} is not above the {:?} minimum; using {:?}",
                d, cfg.board_min_interval, cfg.board_refresh
            );
            cfg.board_refresh
        }
        None => cfg.board_refresh,
    };

    // No window to hide in a terminal: always visible.
    let visibility = VisibilitySignal::default();

    // --- Board store ---
    let boards = BoardStore::new(Arc::clone(&api), cfg.board_min_interval);
    let board_poller = boards.start_auto_refresh(board_refresh, &visibility);
    info!("[BOARDS] auto refresh every {:?}", board_refresh);

    let mut snapshots = boards.subscribe();
    tokio::spawn(async move {
        while snapshots.changed().await.is_ok() {
            let snap = snapshots.borrow_and_update().clone();
            if let Some(top) = snap.industry_list.iter().max_by(|a, b| a.change_percent.total_cmp(&b.change_percent)) {
                info!(
                    "[BOARDS] {} industry / {} concept boards; strongest industry {} {:+.2}%",
                    snap.industry_list.len(),
                    snap.concept_list.len(),
                    top.name,
                    top.change_percent,
                );
            }
        }
    });

    // --- Watch-list quotes ---
    let quote_poller = {
        let api = Arc::clone(&api);
        let prefs = Arc::clone(&prefs);
        Arc::new(Poller::spawn(
            "watchlist",
            PollingOptions::every(quote_refresh),
            &visibility,
            move || {
                let api = Arc::clone(&api);
                let prefs = Arc::clone(&prefs);
                async move {
                    let codes = prefs.watchlist_codes().await;
                    if codes.is_empty() {
                        return Ok(Arc::new(Vec::new()));
                    }
                    api.quotes(&codes).await
                }
            },
        ))
    };
    info!("[POLL] watch-list quotes every {:?}", quote_refresh);

    let mut quotes = quote_poller.subscribe_data();
    tokio::spawn(async move {
        while quotes.changed().await.is_ok() {
            let latest = quotes.borrow_and_update().clone();
            for q in latest.iter().flat_map(|list| list.iter()) {
                info!("[QUOTE] {} {} {:.2} {:+.2}%", q.code, q.name, q.price, q.change_percent);
            }
        }
    });

    // A watch-list edit must not wait out the quote TTL.
    let mut changes = prefs.subscribe();
    {
        let api = Arc::clone(&api);
        let quote_poller = Arc::clone(&quote_poller);
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) if change.key == keys::WATCHLIST => {
                        api.invalidate(&endpoint_prefix(method::QUOTES));
                        quote_poller.refresh();
                    }
                    Ok(change) => debug!(key = %change.key, "preference changed"),
                    Err(RecvError::Lagged(n)) => warn!("Missed {n} preference changes"),
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    for code in add_codes {
        if prefs.add_to_watchlist(DEFAULT_GROUP_ID, &code).await {
            info!("Added {code} to the watch list");
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    board_poller.stop();
    quote_poller.stop();
    Ok(())
}

// ---------------------------------------------------------------------------
// pick
// ---------------------------------------------------------------------------

async fn pick(
    cfg: &Config,
    api: Arc<MarketApi>,
    prefs: Arc<Preferences>,
    scheme: Option<String>,
) -> Result<()> {
    let conditions: FilterConditions = match scheme {
        Some(name) => prefs
            .filter_schemes()
            .await
            .into_iter()
            .find(|s| s.name == name)
            .map(|s| s.conditions)
            .ok_or_else(|| AppError::Config(format!("no saved filter scheme named '{name}'")))?,
        None => prefs.current_filters().await,
    };
    info!("[PICKER] conditions: {conditions:?}");

    let picker = Picker::new(api, Arc::clone(&prefs), cfg.picker);

    let interrupt = {
        let picker = Arc::clone(&picker);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("[PICKER] interrupted; stopping after the current batch");
                picker.cancel();
            }
        })
    };

    let on_progress = |p: Progress| {
        info!("[PICKER] {:?} {}/{}", p.stage, p.completed, p.total);
    };
    let result = picker.run(conditions, &on_progress).await;
    interrupt.abort();
    picker.wait_persisted().await;

    let run = match result {
        Ok(run) => run,
        Err(e @ AppError::BulkFetch(_)) => {
            error!("[PICKER] could not load the market list, try again later");
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    if run.aborted {
        info!(
            "[PICKER] aborted with {} basic candidates; no results kept",
            run.basic_candidates.len()
        );
        return Ok(());
    }

    info!(
        "[PICKER] {} picks from {} basic candidates",
        run.enriched_results.len(),
        run.basic_candidates.len()
    );
    for p in &run.enriched_results {
        let q = &p.quote;
        info!(
            "[PICK] {} {} change={:+.2}% turnover={:.2}% vr={:.2} cap={:.0}亿 strength={:.0}%",
            q.code, q.name, q.change_percent, q.turnover_rate, q.volume_ratio, q.market_cap, p.above_avg_ratio,
        );
    }
    Ok(())
}
