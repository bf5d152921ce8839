use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::polling::VisibilitySignal;

/// Observable state of one polling subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollingState {
    pub is_loading: bool,
    /// Unix millis of the last successful run.
    pub last_refresh_ms: Option<i64>,
    pub is_paused: bool,
    /// Message of the most recent failure; cleared by the next success.
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingOptions {
    /// Delay between one run settling and the next starting.
    pub interval: Duration,
    /// Run as soon as the subscription starts instead of one interval later.
    pub immediate: bool,
    /// Stop the timer while the visibility signal reads hidden.
    pub pause_when_hidden: bool,
}

impl PollingOptions {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            immediate: true,
            pause_when_hidden: true,
        }
    }

    pub fn deferred(mut self) -> Self {
        self.immediate = false;
        self
    }

    pub fn ignore_visibility(mut self) -> Self {
        self.pause_when_hidden = false;
        self
    }
}

#[derive(Debug)]
enum Command {
    Refresh,
    Pause,
    Resume,
}

/// Handle to a background task that re-runs a producer on an interval.
///
/// Runs never overlap: the next one is scheduled only after the previous one
/// settles. A failing run is logged and recorded in `last_error`; it never
/// stops the schedule. Dropping the handle (or `stop`) ends the subscription;
/// a run that is already in flight finishes but its result is discarded.
pub struct Poller<T> {
    name: String,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<PollingState>,
    data: watch::Receiver<Option<T>>,
    cancel: CancellationToken,
}

impl<T> Poller<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Starts polling on the current tokio runtime.
    pub fn spawn<F, Fut>(
        name: impl Into<String>,
        options: PollingOptions,
        visibility: &VisibilitySignal,
        producer: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let name = name.into();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(PollingState::default());
        let (data_tx, data_rx) = watch::channel(None);
        let cancel = CancellationToken::new();

        let poll_loop = PollLoop {
            name: name.clone(),
            options,
            producer,
            paused: false,
            hidden_since: None,
            last_settled: None,
            visibility: visibility.watch(),
            commands: command_rx,
            state_tx,
            data_tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(poll_loop.run());

        Self {
            name,
            commands: command_tx,
            state: state_rx,
            data: data_rx,
            cancel,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> PollingState {
        self.state.borrow().clone()
    }

    /// Latest successful result, if any run has succeeded yet.
    pub fn data(&self) -> Option<T> {
        self.data.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PollingState> {
        self.state.clone()
    }

    pub fn subscribe_data(&self) -> watch::Receiver<Option<T>> {
        self.data.clone()
    }

    /// Run now, out of band, even while paused or hidden.
    pub fn refresh(&self) {
        self.send(Command::Refresh);
    }

    pub fn pause(&self) {
        self.send(Command::Pause);
    }

    /// Re-arms the timer one interval out; does not run immediately.
    pub fn resume(&self) {
        self.send(Command::Resume);
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!(poller = %self.name, "[POLL] command ignored, poller stopped");
        }
    }
}

impl<T> Drop for Poller<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct PollLoop<T, F> {
    name: String,
    options: PollingOptions,
    producer: F,
    paused: bool,
    /// When the loop first saw the signal go hidden; None while visible.
    hidden_since: Option<Instant>,
    /// When the most recent run settled.
    last_settled: Option<Instant>,
    visibility: watch::Receiver<bool>,
    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<PollingState>,
    data_tx: watch::Sender<Option<T>>,
    cancel: CancellationToken,
}

impl<T, F, Fut> PollLoop<T, F>
where
    T: Send + Sync + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    async fn run(mut self) {
        let interval = self.options.interval;
        let first_delay = if self.options.immediate { Duration::ZERO } else { interval };
        let mut next_run = Instant::now() + first_delay;

        loop {
            let armed = (self.is_visible() && !self.paused).then_some(next_run);

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                command = self.commands.recv() => match command {
                    Some(Command::Refresh) => {
                        if !self.invoke().await {
                            break;
                        }
                        next_run = Instant::now() + interval;
                    }
                    Some(Command::Pause) => {
                        self.paused = true;
                        self.state_tx.send_modify(|s| s.is_paused = true);
                    }
                    Some(Command::Resume) => {
                        if self.paused {
                            self.paused = false;
                            self.state_tx.send_modify(|s| s.is_paused = false);
                            next_run = Instant::now() + interval;
                        }
                    }
                    // Every handle is gone.
                    None => break,
                },

                changed = self.visibility.changed(), if self.options.pause_when_hidden => {
                    if changed.is_err() {
                        // Signal owner dropped; nothing can hide us any more.
                        self.options.pause_when_hidden = false;
                        continue;
                    }
                    let visible = *self.visibility.borrow_and_update();
                    debug!(poller = %self.name, visible, "[POLL] visibility changed");
                    if !visible {
                        self.hidden_since.get_or_insert_with(Instant::now);
                        continue;
                    }
                    // A hide that came and went during a run never reaches here
                    // as hidden, and a run that settled after the hide is fresh.
                    let stale = match (self.hidden_since.take(), self.last_settled) {
                        (Some(hidden), Some(settled)) => settled < hidden,
                        (Some(_), None) => true,
                        (None, _) => false,
                    };
                    if stale && !self.paused {
                        if !self.invoke().await {
                            break;
                        }
                        next_run = Instant::now() + interval;
                    }
                }

                _ = sleep_until_armed(armed) => {
                    if !self.invoke().await {
                        break;
                    }
                    next_run = Instant::now() + interval;
                }
            }
        }

        debug!(poller = %self.name, "[POLL] stopped");
    }

    fn is_visible(&self) -> bool {
        !self.options.pause_when_hidden || *self.visibility.borrow()
    }

    /// Runs the producer once. Returns false when the subscription was torn
    /// down while the run was in flight; its result is then dropped.
    async fn invoke(&mut self) -> bool {
        self.state_tx.send_modify(|s| s.is_loading = true);
        let outcome = (self.producer)().await;

        if self.cancel.is_cancelled() {
            return false;
        }
        self.last_settled = Some(Instant::now());

        match outcome {
            Ok(value) => {
                self.data_tx.send_replace(Some(value));
                self.state_tx.send_modify(|s| {
                    s.is_loading = false;
                    s.last_refresh_ms = Some(now_ms());
                    s.last_error = None;
                });
            }
            Err(e) => {
                warn!(poller = %self.name, "[POLL] run failed, retrying in {:?}: {e}", self.options.interval);
                self.state_tx.send_modify(|s| {
                    s.is_loading = false;
                    s.last_error = Some(e.to_string());
                });
            }
        }
        true
    }
}

async fn sleep_until_armed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::error::AppError;

    fn counting(calls: &Arc<AtomicUsize>) -> impl FnMut() -> std::future::Ready<Result<usize>> + Send + 'static {
        let calls = Arc::clone(calls);
        move || std::future::ready(Ok(calls.fetch_add(1, Ordering::SeqCst) + 1))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_run_then_reschedules_after_each_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let poller = Poller::spawn(
            "test",
            PollingOptions::every(Duration::from_secs(1)),
            &VisibilitySignal::new(true),
            counting(&calls),
        );

        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(poller.data(), Some(1));
        assert!(poller.state().last_refresh_ms.is_some());

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_waits_one_interval() {
        let calls = Arc::new(AtomicUsize::new(0));
        let _poller = Poller::spawn(
            "test",
            PollingOptions::every(Duration::from_secs(5)).deferred(),
            &VisibilitySignal::new(true),
            counting(&calls),
        );

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_producer_never_overlaps() {
        let calls = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let producer = {
            let (calls, active, peak) = (calls.clone(), active.clone(), peak.clone());
            move || {
                let (calls, active, peak) = (calls.clone(), active.clone(), peak.clone());
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        };
        let _poller = Poller::spawn(
            "slow",
            PollingOptions::every(Duration::from_secs(1)),
            &VisibilitySignal::new(true),
            producer,
        );

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        // runs start at 0, 4, 8, 12, 16 (and maybe 20)
        let n = calls.load(Ordering::SeqCst);
        assert!((5..=6).contains(&n), "unexpected call count {n}");
    }

    #[tokio::test(start_paused = true)]
    async fn failure_does_not_stop_the_schedule() {
        let calls = Arc::new(AtomicUsize::new(0));
        let producer = {
            let calls = calls.clone();
            move || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n == 1 {
                        Err(AppError::remote("quotes", "boom"))
                    } else {
                        Ok(n)
                    }
                }
            }
        };
        let poller = Poller::spawn(
            "flaky",
            PollingOptions::every(Duration::from_secs(2)),
            &VisibilitySignal::new(true),
            producer,
        );

        settle().await;
        let state = poller.state();
        assert!(!state.is_loading);
        assert!(state.last_error.as_deref().unwrap_or("").contains("boom"));
        assert_eq!(poller.data(), None);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(poller.data(), Some(2));
        assert_eq!(poller.state().last_error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_stops_timer_and_visible_runs_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let visibility = VisibilitySignal::new(true);
        let _poller = Poller::spawn(
            "vis",
            PollingOptions::every(Duration::from_secs(1)),
            &visibility,
            counting(&calls),
        );
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        visibility.set_visible(false);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        visibility.set_visible(true);
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn hide_and_show_during_a_run_does_not_rerun() {
        let calls = Arc::new(AtomicUsize::new(0));
        let producer = {
            let calls = calls.clone();
            move || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok(())
                }
            }
        };
        let visibility = VisibilitySignal::new(true);
        let _poller = Poller::spawn(
            "flicker",
            PollingOptions::every(Duration::from_secs(10)),
            &visibility,
            producer,
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        visibility.set_visible(false);
        tokio::time::sleep(Duration::from_millis(300)).await;
        visibility.set_visible(true);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1, "the run that settled after the hide is fresh");

        // next run one interval after the first settled (t = 11s)
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_while_hidden_skips_the_catch_up_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let visibility = VisibilitySignal::new(true);
        let poller = Poller::spawn(
            "hidden-refresh",
            PollingOptions::every(Duration::from_secs(10)),
            &visibility,
            counting(&calls),
        );
        settle().await;
        visibility.set_visible(false);
        settle().await;

        poller.refresh();
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        visibility.set_visible(true);
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn visibility_can_be_ignored() {
        let calls = Arc::new(AtomicUsize::new(0));
        let visibility = VisibilitySignal::new(false);
        let _poller = Poller::spawn(
            "always",
            PollingOptions::every(Duration::from_secs(1)).ignore_visibility(),
            &visibility,
            counting(&calls),
        );
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_and_resume() {
        let calls = Arc::new(AtomicUsize::new(0));
        let visibility = VisibilitySignal::new(true);
        let poller = Poller::spawn(
            "pausable",
            PollingOptions::every(Duration::from_secs(1)),
            &visibility,
            counting(&calls),
        );
        settle().await;
        poller.pause();
        settle().await;
        assert!(poller.state().is_paused);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // becoming visible while paused must not run
        visibility.set_visible(false);
        visibility.set_visible(true);
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        poller.resume();
        settle().await;
        assert!(!poller.state().is_paused);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "resume reschedules, it does not run");

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_runs_out_of_band() {
        let calls = Arc::new(AtomicUsize::new(0));
        let poller = Poller::spawn(
            "manual",
            PollingOptions::every(Duration::from_secs(60)),
            &VisibilitySignal::new(true),
            counting(&calls),
        );
        settle().await;
        poller.refresh();
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        poller.pause();
        poller.refresh();
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_discards_in_flight_result() {
        let producer = || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(7u32)
        };
        let poller = Poller::spawn(
            "teardown",
            PollingOptions::every(Duration::from_secs(1)),
            &VisibilitySignal::new(true),
            producer,
        );
        let state = poller.subscribe_state();
        let data = poller.subscribe_data();

        settle().await;
        assert!(state.borrow().is_loading);
        drop(poller);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(*data.borrow(), None);
        assert_eq!(state.borrow().last_refresh_ms, None);
    }
}
