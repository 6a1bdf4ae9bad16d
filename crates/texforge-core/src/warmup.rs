//! Background engine verification
//!
//! Warmup runs the Compile-Test for every statically available engine on a
//! single background task. Requests never run a Compile-Test themselves;
//! they only poll or wait on the completion signal, which is raised as soon
//! as the first engine passes so early requests are not held up by slow
//! engines (lualatex can spend minutes building its font cache).
//!
//! Phase: `NotStarted -> Running -> Done`. The signal is monotonic: once
//! raised it is never cleared.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::engine::{EngineCandidate, EngineKind};
use crate::harness::{CompileTester, TestReport};

/// Lifecycle of the warmup worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmupPhase {
    /// `start` has not been called
    NotStarted,
    /// Worker is testing engines
    Running,
    /// Every candidate has been handled
    Done,
}

/// What warmup learned about one engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct EngineHealth {
    /// A Compile-Test ran to completion
    pub tested: bool,
    /// The Compile-Test passed
    pub verified: bool,
    /// Duration of the Compile-Test
    pub latency_ms: Option<u64>,
}

#[derive(Default)]
struct EngineSlot {
    tested: AtomicBool,
    verified: AtomicBool,
    latency_ms: AtomicU64,
}

/// Shared warmup record
///
/// Only the warmup worker writes. Per-engine flags are stored before the
/// signal is raised, so a reader that sees the signal also sees them.
pub struct WarmupState {
    slots: [EngineSlot; 3],
    signal: watch::Sender<bool>,
    phase: watch::Sender<WarmupPhase>,
}

impl Default for WarmupState {
    fn default() -> Self {
        Self::new()
    }
}

impl WarmupState {
    /// Fresh state in the `NotStarted` phase
    pub fn new() -> Self {
        Self {
            slots: Default::default(),
            signal: watch::channel(false).0,
            phase: watch::channel(WarmupPhase::NotStarted).0,
        }
    }

    /// Current phase
    pub fn phase(&self) -> WarmupPhase {
        *self.phase.borrow()
    }

    /// Whether the completion signal is raised
    pub fn is_done(&self) -> bool {
        *self.signal.borrow()
    }

    /// Wait up to `timeout` for the completion signal
    ///
    /// Returns false immediately when warmup was never started.
    pub async fn wait(&self, timeout: Duration) -> bool {
        if self.phase() == WarmupPhase::NotStarted {
            return self.is_done();
        }
        let mut rx = self.signal.subscribe();
        let signaled = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|done| *done)).await,
            Ok(Ok(_))
        );
        signaled || self.is_done()
    }

    /// Verification state of one engine
    pub fn health(&self, kind: EngineKind) -> EngineHealth {
        let slot = &self.slots[kind.index()];
        let tested = slot.tested.load(Ordering::Acquire);
        EngineHealth {
            tested,
            verified: slot.verified.load(Ordering::Acquire),
            latency_ms: tested.then(|| slot.latency_ms.load(Ordering::Acquire)),
        }
    }

    /// Whether the engine passed its Compile-Test
    pub fn is_verified(&self, kind: EngineKind) -> bool {
        self.slots[kind.index()].verified.load(Ordering::Acquire)
    }

    pub(crate) fn record(&self, report: &TestReport) {
        let slot = &self.slots[report.engine.index()];
        slot.latency_ms
            .store(report.elapsed.as_millis() as u64, Ordering::Release);
        slot.verified.store(report.passed(), Ordering::Release);
        slot.tested.store(true, Ordering::Release);
    }

    fn raise_signal(&self) -> bool {
        !self.signal.send_replace(true)
    }

    fn set_phase(&self, phase: WarmupPhase) {
        self.phase.send_replace(phase);
    }
}

/// Owns the warmup worker and guarantees it starts at most once
pub struct WarmupScheduler {
    state: Arc<WarmupState>,
    candidates: Vec<EngineCandidate>,
    tester: Arc<dyn CompileTester>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WarmupScheduler {
    /// Scheduler over `candidates`, tested in engine priority order
    pub fn new(
        state: Arc<WarmupState>,
        mut candidates: Vec<EngineCandidate>,
        tester: Arc<dyn CompileTester>,
    ) -> Self {
        candidates.sort_by_key(|c| c.kind.priority());
        Self {
            state,
            candidates,
            tester,
            worker: Mutex::new(None),
        }
    }

    /// Shared state read by requests
    pub fn state(&self) -> &Arc<WarmupState> {
        &self.state
    }

    /// Start the background worker
    ///
    /// Returns true for the one call that actually spawned it. Must be
    /// called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return false;
        }

        self.state.set_phase(WarmupPhase::Running);
        let state = self.state.clone();
        let candidates = self.candidates.clone();
        let tester = self.tester.clone();
        *worker = Some(tokio::spawn(async move {
            let started = Instant::now();
            let tests = tokio::spawn(run_tests(state.clone(), candidates, tester));
            if let Err(e) = tests.await {
                error!(error = %e, "warmup worker aborted");
            }
            // Re-affirmed at full completion, even when nothing passed.
            state.raise_signal();
            state.set_phase(WarmupPhase::Done);
            info!(elapsed_ms = started.elapsed().as_millis() as u64, "warmup finished");
        }));
        true
    }

    /// Whether the completion signal is raised
    pub fn is_done(&self) -> bool {
        self.state.is_done()
    }

    /// Wait up to `timeout` for the completion signal
    pub async fn wait(&self, timeout: Duration) -> bool {
        self.state.wait(timeout).await
    }

    /// Wait for the worker to handle every candidate, up to `timeout`
    pub async fn wait_finished(&self, timeout: Duration) -> bool {
        if self.state.phase() == WarmupPhase::NotStarted {
            return false;
        }
        let mut rx = self.state.phase.subscribe();
        let finished = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|phase| *phase == WarmupPhase::Done)).await,
            Ok(Ok(_))
        );
        finished
    }
}

async fn run_tests(
    state: Arc<WarmupState>,
    candidates: Vec<EngineCandidate>,
    tester: Arc<dyn CompileTester>,
) {
    for candidate in &candidates {
        if !candidate.available {
            debug!(engine = %candidate.kind, missing = ?candidate.missing, "skipping compile test");
            continue;
        }

        let report = tester.test_engine(candidate).await;
        state.record(&report);
        if report.passed() && state.raise_signal() {
            info!(engine = %candidate.kind, "first engine verified; releasing waiting requests");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::TestOutcome;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct InstantTester {
        pass: Vec<EngineKind>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CompileTester for InstantTester {
        async fn test_engine(&self, candidate: &EngineCandidate) -> TestReport {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let outcome = if self.pass.contains(&candidate.kind) {
                TestOutcome::Passed
            } else {
                TestOutcome::Rejected { exit_code: 1 }
            };
            TestReport {
                engine: candidate.kind,
                outcome,
                elapsed: Duration::from_millis(7),
            }
        }
    }

    fn candidates() -> Vec<EngineCandidate> {
        EngineKind::ALL
            .into_iter()
            .map(|k| EngineCandidate::available(k, k.name()))
            .collect()
    }

    fn scheduler(pass: Vec<EngineKind>, candidates: Vec<EngineCandidate>) -> (WarmupScheduler, Arc<InstantTester>) {
        let tester = Arc::new(InstantTester {
            pass,
            calls: AtomicUsize::new(0),
        });
        let scheduler = WarmupScheduler::new(Arc::new(WarmupState::new()), candidates, tester.clone());
        (scheduler, tester)
    }

    #[tokio::test]
    async fn test_wait_before_start_returns_false() {
        let (scheduler, _) = scheduler(vec![EngineKind::PdfLatex], candidates());
        assert_eq!(scheduler.state().phase(), WarmupPhase::NotStarted);
        assert!(!scheduler.wait(Duration::from_millis(10)).await);
        assert!(!scheduler.wait_finished(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_records_health() {
        let (scheduler, tester) = scheduler(vec![EngineKind::XeLatex], candidates());
        assert!(scheduler.start());
        assert!(scheduler.wait_finished(Duration::from_secs(5)).await);

        let state = scheduler.state();
        assert!(state.is_done());
        assert_eq!(state.phase(), WarmupPhase::Done);
        assert!(state.is_verified(EngineKind::XeLatex));
        assert!(!state.is_verified(EngineKind::PdfLatex));
        assert_eq!(state.health(EngineKind::LuaLatex).latency_ms, Some(7));
        assert_eq!(tester.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unavailable_engines_are_skipped() {
        let mut list = candidates();
        list[2] = EngineCandidate::new(EngineKind::LuaLatex, "lualatex".into(), false, Vec::new());
        let (scheduler, tester) = scheduler(Vec::new(), list);
        scheduler.start();
        assert!(scheduler.wait_finished(Duration::from_secs(5)).await);

        assert_eq!(tester.calls.load(Ordering::SeqCst), 2);
        assert!(!scheduler.state().health(EngineKind::LuaLatex).tested);
    }

    #[tokio::test]
    async fn test_all_failing_still_completes() {
        let (scheduler, _) = scheduler(Vec::new(), candidates());
        scheduler.start();
        assert!(scheduler.wait(Duration::from_secs(5)).await);
        assert!(scheduler.wait_finished(Duration::from_secs(5)).await);
        assert!(EngineKind::ALL.iter().all(|k| !scheduler.state().is_verified(*k)));
    }

    #[tokio::test]
    async fn test_waits_after_completion_return_at_once() {
        let (scheduler, _) = scheduler(vec![EngineKind::PdfLatex], candidates());
        scheduler.start();
        assert!(scheduler.wait_finished(Duration::from_secs(5)).await);

        let started = Instant::now();
        for _ in 0..3 {
            assert!(scheduler.wait(Duration::from_secs(5)).await);
            assert!(scheduler.wait_finished(Duration::from_secs(5)).await);
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_second_start_is_noop() {
        let (scheduler, tester) = scheduler(vec![EngineKind::PdfLatex], candidates());
        assert!(scheduler.start());
        assert!(!scheduler.start());
        scheduler.wait_finished(Duration::from_secs(5)).await;
        assert_eq!(tester.calls.load(Ordering::SeqCst), 3);
    }
}
