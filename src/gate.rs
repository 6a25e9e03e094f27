//! Timed download gate.
//!
//! A gate counts down from a whole number of seconds in 0.1 s steps, unlocks once,
//! and then lets the visitor try to open the file. If the automatic attempt is
//! blocked the gate falls back to a manual link; it never locks again.

use std::time::Duration;

use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle, time};

use crate::errors::GateError;

/// Interval between countdown steps; each step removes one tenth of a second.
pub const TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    Counting,
    Ready,
    Attempting,
    ManualFallback,
    Done,
}

impl GateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateState::Counting => "counting",
            GateState::Ready => "ready",
            GateState::Attempting => "attempting",
            GateState::ManualFallback => "manual_fallback",
            GateState::Done => "done",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateEvent {
    /// Re-check the countdown without advancing it.
    Evaluate,
    /// One countdown step elapsed.
    Tick,
    /// The visitor asked for the file.
    Open,
    /// The browser returned a live window.
    Opened,
    /// No window, a closed window, or the open call failed.
    Blocked,
}

impl GateEvent {
    fn as_str(&self) -> &'static str {
        match self {
            GateEvent::Evaluate => "evaluate",
            GateEvent::Tick => "tick",
            GateEvent::Open => "open",
            GateEvent::Opened => "confirm opened",
            GateEvent::Blocked => "report blocked",
        }
    }
}

/// Result of trying to open the download in a new browsing context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenOutcome {
    Opened,
    Closed,
    Blocked,
    Failed,
}

/// Window whose liveness the browser has already reported.
struct ReportedWindow {
    closed: bool,
}

impl WindowHandle for ReportedWindow {
    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// The browser makes the actual open call; its report replays that call here.
impl Opener for OpenOutcome {
    fn open(&self, _url: &str) -> anyhow::Result<Option<Box<dyn WindowHandle>>> {
        match self {
            OpenOutcome::Opened => Ok(Some(Box::new(ReportedWindow { closed: false }))),
            OpenOutcome::Closed => Ok(Some(Box::new(ReportedWindow { closed: true }))),
            OpenOutcome::Blocked => Ok(None),
            OpenOutcome::Failed => Err(anyhow::anyhow!("browser reported the open call failed")),
        }
    }
}

impl From<OpenOutcome> for GateEvent {
    fn from(outcome: OpenOutcome) -> Self {
        match outcome {
            OpenOutcome::Opened => GateEvent::Opened,
            OpenOutcome::Closed | OpenOutcome::Blocked | OpenOutcome::Failed => GateEvent::Blocked,
        }
    }
}

pub trait WindowHandle: Send {
    fn is_closed(&self) -> bool;
}

/// Opens a URL in a new browsing context.
pub trait Opener {
    fn open(&self, url: &str) -> anyhow::Result<Option<Box<dyn WindowHandle>>>;
}

/// Percentage of the countdown that has elapsed, clamped to `[0, 100]`.
/// A zero-length countdown is always complete.
pub fn progress_at(duration_secs: f64, elapsed_secs: f64) -> f64 {
    if duration_secs <= 0.0 {
        return 100.0;
    }
    let pct = elapsed_secs / duration_secs * 100.0;
    if pct.is_nan() {
        return 0.0;
    }
    pct.clamp(0.0, 100.0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadGate {
    duration_tenths: u32,
    remaining_tenths: u32,
    state: GateState,
    download_url: String,
}

impl DownloadGate {
    pub fn new(duration_secs: u32, download_url: impl Into<String>) -> Self {
        let duration_tenths = duration_secs.saturating_mul(10);
        Self {
            duration_tenths,
            remaining_tenths: duration_tenths,
            state: GateState::Counting,
            download_url: download_url.into(),
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn remaining_secs(&self) -> f64 {
        f64::from(self.remaining_tenths) / 10.0
    }

    /// Whole seconds shown to the visitor: the ceiling of the remaining time.
    pub fn display_seconds(&self) -> u32 {
        self.remaining_tenths.div_ceil(10)
    }

    pub fn progress(&self) -> f64 {
        let duration = f64::from(self.duration_tenths) / 10.0;
        progress_at(duration, duration - self.remaining_secs())
    }

    /// The file URL, once the visitor has been let through.
    pub fn revealed_url(&self) -> Option<&str> {
        match self.state {
            GateState::Attempting | GateState::ManualFallback | GateState::Done => Some(&self.download_url),
            GateState::Counting | GateState::Ready => None,
        }
    }

    /// Always-clickable link shown after a blocked attempt.
    pub fn manual_link(&self) -> Option<&str> {
        (self.state == GateState::ManualFallback).then_some(self.download_url.as_str())
    }

    pub fn apply(&mut self, event: GateEvent) -> Result<GateState, GateError> {
        use GateEvent::*;
        use GateState::*;

        let next = match (self.state, event) {
            (Counting, Evaluate) => self.countdown_state(),
            (Counting, Tick) => {
                self.remaining_tenths = self.remaining_tenths.saturating_sub(1);
                self.countdown_state()
            }
            (_, Evaluate | Tick) => self.state,
            (Ready, Open) => Attempting,
            // The manual link can be followed any number of times.
            (ManualFallback, Open) => ManualFallback,
            (Attempting, Opened) => Done,
            (Attempting, Blocked) => ManualFallback,
            (state, event) => {
                return Err(GateError::InvalidTransition {
                    state: state.as_str(),
                    event: event.as_str(),
                });
            }
        };

        if next != self.state {
            tracing::debug!(from = self.state.as_str(), to = next.as_str(), "Gate: transition");
        }
        self.state = next;
        Ok(next)
    }

    /// Settles an attempt started by [`GateEvent::Open`]: a live window finishes the
    /// gate, anything else falls back to the manual link.
    pub fn resolve_open(&mut self, opener: &dyn Opener) -> Result<GateState, GateError> {
        if self.state != GateState::Attempting {
            return Err(GateError::InvalidTransition {
                state: self.state.as_str(),
                event: "resolve open",
            });
        }

        let outcome = match opener.open(&self.download_url) {
            Ok(Some(handle)) if !handle.is_closed() => OpenOutcome::Opened,
            Ok(Some(_)) => OpenOutcome::Closed,
            Ok(None) => OpenOutcome::Blocked,
            Err(e) => {
                tracing::warn!(error = %e, "Gate: open attempt failed");
                OpenOutcome::Failed
            }
        };
        self.apply(outcome.into())
    }

    fn countdown_state(&self) -> GateState {
        if self.remaining_tenths == 0 {
            GateState::Ready
        } else {
            GateState::Counting
        }
    }
}

/// Drives a gate in real time on the tokio runtime.
///
/// The countdown task stops by itself once the gate unlocks and is aborted when the
/// `Countdown` is dropped, so no timer outlives its gate.
#[derive(Debug)]
pub struct Countdown {
    gate: std::sync::Arc<watch::Sender<DownloadGate>>,
    task: JoinHandle<()>,
}

impl Countdown {
    pub fn start(gate: DownloadGate) -> Self {
        let (tx, _) = watch::channel(gate);
        let gate = std::sync::Arc::new(tx);
        let ticker = std::sync::Arc::clone(&gate);

        // Evaluate before returning so a zero-length gate is ready in the first snapshot.
        let unlocked = step(&gate, GateEvent::Evaluate);
        let task = tokio::spawn(async move {
            if unlocked {
                return;
            }
            let mut interval = time::interval_at(time::Instant::now() + TICK, TICK);
            loop {
                interval.tick().await;
                if step(&ticker, GateEvent::Tick) {
                    break;
                }
            }
        });

        Self { gate, task }
    }

    pub fn snapshot(&self) -> DownloadGate {
        self.gate.borrow().clone()
    }

    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<DownloadGate> {
        self.gate.subscribe()
    }

    pub fn apply(&self, event: GateEvent) -> Result<GateState, GateError> {
        let mut result = Ok(GateState::Counting);
        self.gate.send_if_modified(|gate| {
            result = gate.apply(event);
            result.is_ok()
        });
        result
    }

    pub fn resolve_open(&self, opener: &dyn Opener) -> Result<GateState, GateError> {
        let mut result = Ok(GateState::Counting);
        self.gate.send_if_modified(|gate| {
            result = gate.resolve_open(opener);
            result.is_ok()
        });
        result
    }

    /// Resolves once the countdown has unlocked the gate.
    #[cfg(test)]
    pub async fn ready(&self) {
        let mut rx = self.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|gate| gate.state() != GateState::Counting).await;
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for Countdown {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Applies one countdown event; returns true once the gate has left `Counting`.
fn step(gate: &watch::Sender<DownloadGate>, event: GateEvent) -> bool {
    let mut unlocked = false;
    gate.send_if_modified(|g| {
        let before = g.clone();
        // Countdown events are always valid, whatever the state.
        let _ = g.apply(event);
        unlocked = g.state() != GateState::Counting;
        *g != before
    });
    unlocked
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    const URL: &str = "https://drive.google.com/uc?id=d2&export=download";

    struct Window {
        closed: bool,
    }

    impl WindowHandle for Window {
        fn is_closed(&self) -> bool {
            self.closed
        }
    }

    enum FakeOpener {
        Live,
        Closed,
        Blocked,
        Throws,
    }

    impl Opener for FakeOpener {
        fn open(&self, _url: &str) -> anyhow::Result<Option<Box<dyn WindowHandle>>> {
            match self {
                FakeOpener::Live => Ok(Some(Box::new(Window { closed: false }))),
                FakeOpener::Closed => Ok(Some(Box::new(Window { closed: true }))),
                FakeOpener::Blocked => Ok(None),
                FakeOpener::Throws => Err(anyhow::anyhow!("popup threw")),
            }
        }
    }

    fn run_down(gate: &mut DownloadGate) -> usize {
        let mut unlocks = 0;
        for _ in 0..1_000 {
            let before = gate.state();
            gate.apply(GateEvent::Tick).unwrap();
            if before == GateState::Counting && gate.state() == GateState::Ready {
                unlocks += 1;
            }
        }
        unlocks
    }

    #[test]
    fn countdown_unlocks_exactly_once() {
        for duration in [1, 2, 8, 30] {
            let mut gate = DownloadGate::new(duration, URL);
            assert_eq!(run_down(&mut gate), 1, "duration {duration}");
            assert_eq!(gate.state(), GateState::Ready);
        }
    }

    #[test]
    fn zero_duration_is_ready_on_first_evaluation() {
        let mut gate = DownloadGate::new(0, URL);
        assert_eq!(gate.apply(GateEvent::Evaluate).unwrap(), GateState::Ready);
        assert_eq!(gate.display_seconds(), 0);
        assert_eq!(gate.progress(), 100.0);
    }

    #[test]
    fn display_is_ceiling_of_remaining() {
        let mut gate = DownloadGate::new(2, URL);
        assert_eq!(gate.display_seconds(), 2);
        gate.apply(GateEvent::Tick).unwrap();
        assert_eq!(gate.display_seconds(), 2);
        for _ in 0..9 {
            gate.apply(GateEvent::Tick).unwrap();
        }
        assert_eq!(gate.remaining_secs(), 1.0);
        assert_eq!(gate.display_seconds(), 1);
        assert!((gate.progress() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn progress_is_always_clamped() {
        for elapsed in [0.0, 0.05, 1.0, 7.9, 8.0, 8.1, 1_000.0] {
            let p = progress_at(8.0, elapsed);
            assert!((0.0..=100.0).contains(&p), "elapsed {elapsed} gave {p}");
        }
        assert_eq!(progress_at(8.0, -1.0), 0.0);
        assert_eq!(progress_at(8.0, 16.0), 100.0);
        assert_eq!(progress_at(0.0, 3.0), 100.0);
    }

    #[test]
    fn open_before_ready_is_rejected() {
        let mut gate = DownloadGate::new(8, URL);
        let err = gate.apply(GateEvent::Open).unwrap_err();
        assert_eq!(
            err,
            GateError::InvalidTransition {
                state: "counting",
                event: "open"
            }
        );
        assert_eq!(gate.state(), GateState::Counting);
        assert!(gate.revealed_url().is_none());
    }

    fn attempt(gate: &mut DownloadGate, opener: &dyn Opener) -> Result<GateState, GateError> {
        gate.apply(GateEvent::Open)?;
        gate.resolve_open(opener)
    }

    #[test]
    fn live_window_finishes_the_gate() {
        let mut gate = DownloadGate::new(1, URL);
        run_down(&mut gate);
        assert_eq!(attempt(&mut gate, &FakeOpener::Live).unwrap(), GateState::Done);
        assert!(gate.manual_link().is_none());
        assert_eq!(gate.revealed_url(), Some(URL));
    }

    #[test]
    fn failed_attempts_fall_back_to_manual_link() {
        for opener in [FakeOpener::Closed, FakeOpener::Blocked, FakeOpener::Throws] {
            let mut gate = DownloadGate::new(1, URL);
            run_down(&mut gate);
            assert_eq!(attempt(&mut gate, &opener).unwrap(), GateState::ManualFallback);
            assert_eq!(gate.manual_link(), Some(URL));
        }
    }

    #[test]
    fn manual_fallback_never_relocks() {
        let mut gate = DownloadGate::new(1, URL);
        run_down(&mut gate);
        attempt(&mut gate, &FakeOpener::Blocked).unwrap();

        for _ in 0..5 {
            assert_eq!(gate.apply(GateEvent::Open).unwrap(), GateState::ManualFallback);
            assert_eq!(gate.apply(GateEvent::Tick).unwrap(), GateState::ManualFallback);
        }
        assert_eq!(gate.manual_link(), Some(URL));
    }

    #[test]
    fn done_is_terminal() {
        let mut gate = DownloadGate::new(0, URL);
        gate.apply(GateEvent::Evaluate).unwrap();
        attempt(&mut gate, &FakeOpener::Live).unwrap();
        assert!(gate.apply(GateEvent::Open).is_err());
        assert!(gate.apply(GateEvent::Blocked).is_err());
        assert_eq!(gate.state(), GateState::Done);
    }

    #[test]
    fn opener_is_not_called_before_ready() {
        struct CountingOpener(Cell<u32>);
        impl Opener for CountingOpener {
            fn open(&self, _url: &str) -> anyhow::Result<Option<Box<dyn WindowHandle>>> {
                self.0.set(self.0.get() + 1);
                Ok(None)
            }
        }

        let opener = CountingOpener(Cell::new(0));
        let mut gate = DownloadGate::new(3, URL);
        assert!(attempt(&mut gate, &opener).is_err());
        assert!(gate.resolve_open(&opener).is_err());
        assert_eq!(opener.0.get(), 0);
    }

    #[test]
    fn reported_outcomes_settle_like_real_windows() {
        let cases = [
            (OpenOutcome::Opened, GateState::Done),
            (OpenOutcome::Closed, GateState::ManualFallback),
            (OpenOutcome::Blocked, GateState::ManualFallback),
            (OpenOutcome::Failed, GateState::ManualFallback),
        ];
        for (outcome, expected) in cases {
            let mut gate = DownloadGate::new(0, URL);
            gate.apply(GateEvent::Evaluate).unwrap();
            assert_eq!(attempt(&mut gate, &outcome).unwrap(), expected, "{outcome:?}");
        }
    }

    #[tokio::test]
    async fn countdown_starts_ready_when_duration_is_zero() {
        // No await before the snapshot: the spawned task has not run yet.
        let countdown = Countdown::start(DownloadGate::new(0, URL));
        assert_eq!(countdown.snapshot().state(), GateState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn two_second_gate_with_blocked_popup() {
        let countdown = Countdown::start(DownloadGate::new(2, URL));

        time::sleep(Duration::from_millis(1_950)).await;
        assert_eq!(countdown.snapshot().state(), GateState::Counting);

        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(countdown.snapshot().state(), GateState::Ready);
        assert!(!countdown.is_running());

        countdown.apply(GateEvent::Open).unwrap();
        let state = countdown.resolve_open(&FakeOpener::Blocked).unwrap();
        assert_eq!(state, GateState::ManualFallback);
        assert_eq!(countdown.snapshot().manual_link(), Some(URL));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_second_countdown_is_ready_without_ticking() {
        let countdown = Countdown::start(DownloadGate::new(0, URL));
        countdown.ready().await;
        assert_eq!(countdown.snapshot().state(), GateState::Ready);
        assert_eq!(countdown.snapshot().progress(), 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_countdown_stops_ticking() {
        let countdown = Countdown::start(DownloadGate::new(8, URL));
        let rx = countdown.subscribe();

        time::sleep(Duration::from_millis(1_050)).await;
        let remaining = rx.borrow().remaining_secs();
        drop(countdown);

        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(rx.borrow().state(), GateState::Counting);
        assert_eq!(rx.borrow().remaining_secs(), remaining);
        assert!(rx.has_changed().is_err());
    }
}
