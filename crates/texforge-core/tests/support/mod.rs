//! Shared doubles for integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use texforge_core::engine::ARTIFACT_FILE;
use texforge_core::{
    CommandLocator, EngineCandidate, EngineKind, FontSelection, Invocation, ProbeReport,
    ProcessOutput, ProcessRunner, Settings, TestOutcome, TestReport, TexEnv, TexService,
};
use texforge_core::CompileTester;

type Script = Box<dyn Fn(&Invocation) -> ProcessOutput + Send + Sync>;

/// Runner answering every invocation from a closure, with overlap accounting
pub struct ScriptedRunner {
    script: Script,
    delay: Duration,
    calls: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedRunner {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&Invocation) -> ProcessOutput + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    /// Every engine produces a PDF
    pub fn always_succeeds() -> Self {
        Self::new(|inv| {
            write_pdf(inv);
            ProcessOutput::exited(0, "Output written on document.pdf (1 page).")
        })
    }

    /// Hold every invocation for `delay` before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of invocations of `program`
    pub fn calls_to(&self, program: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == program)
            .count()
    }

    /// Total invocations
    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Highest number of invocations seen running at once
    pub fn max_overlap(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(&self, invocation: &Invocation) -> ProcessOutput {
        self.calls.lock().unwrap().push(invocation.program_name());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let output = (self.script)(invocation);

        self.active.fetch_sub(1, Ordering::SeqCst);
        output
    }
}

/// Write a small PDF into the invocation's output directory
pub fn write_pdf(invocation: &Invocation) {
    let dir = invocation
        .flag_value("-output-directory")
        .expect("engine invocation has an output directory");
    std::fs::write(dir.join(ARTIFACT_FILE), b"%PDF-1.5\n%%EOF\n").unwrap();
}

/// Source text handed to an engine
pub fn source_of(invocation: &Invocation) -> String {
    let path = invocation.args.last().expect("source path argument");
    std::fs::read_to_string(path).unwrap()
}

/// Tester with scripted outcomes and per-engine delays
pub struct DelayedTester {
    pass: Vec<EngineKind>,
    delays: HashMap<EngineKind, Duration>,
    started: [AtomicUsize; 3],
    finished: [AtomicUsize; 3],
}

impl DelayedTester {
    pub fn new(pass: &[EngineKind]) -> Self {
        Self {
            pass: pass.to_vec(),
            delays: HashMap::new(),
            started: Default::default(),
            finished: Default::default(),
        }
    }

    pub fn delay(mut self, kind: EngineKind, delay: Duration) -> Self {
        self.delays.insert(kind, delay);
        self
    }

    pub fn started(&self, kind: EngineKind) -> usize {
        self.started[slot(kind)].load(Ordering::SeqCst)
    }

    pub fn finished(&self, kind: EngineKind) -> usize {
        self.finished[slot(kind)].load(Ordering::SeqCst)
    }
}

fn slot(kind: EngineKind) -> usize {
    EngineKind::ALL.iter().position(|k| *k == kind).unwrap()
}

#[async_trait]
impl CompileTester for DelayedTester {
    async fn test_engine(&self, candidate: &EngineCandidate) -> TestReport {
        let kind = candidate.kind;
        self.started[slot(kind)].fetch_add(1, Ordering::SeqCst);
        let delay = self.delays.get(&kind).copied().unwrap_or_default();
        tokio::time::sleep(delay).await;
        self.finished[slot(kind)].fetch_add(1, Ordering::SeqCst);

        let outcome = if self.pass.contains(&kind) {
            TestOutcome::Passed
        } else {
            TestOutcome::Rejected { exit_code: 1 }
        };
        TestReport {
            engine: kind,
            outcome,
            elapsed: delay,
        }
    }
}

/// Every engine found with all packages
pub fn all_available() -> Vec<EngineCandidate> {
    EngineKind::ALL
        .into_iter()
        .map(|k| EngineCandidate::available(k, k.name()))
        .collect()
}

/// Every engine found but missing its packages
pub fn none_available() -> Vec<EngineCandidate> {
    EngineKind::ALL
        .into_iter()
        .map(|k| {
            EngineCandidate::new(
                k,
                PathBuf::from(k.name()),
                true,
                k.spec().packages.iter().map(|p| p.to_string()).collect(),
            )
        })
        .collect()
}

/// Settings for tests: no warmup wait, no cold-cache extension
pub fn test_settings() -> Settings {
    Settings {
        warmup_wait_ms: 0,
        cold_cache_extra_secs: 0,
        ..Settings::default()
    }
}

/// Service over scripted doubles, with static probing skipped
pub async fn service(
    settings: Settings,
    runner: Arc<dyn ProcessRunner>,
    tester: Arc<dyn CompileTester>,
    candidates: Vec<EngineCandidate>,
) -> TexService {
    TexService::builder(settings)
        .runner(runner)
        .tester(tester)
        .locator(CommandLocator::with_dirs(None, Vec::new()))
        .env(TexEnv::from_pairs([("PATH", "/usr/bin:/bin")]))
        .probe_report(ProbeReport::from_candidates(
            candidates,
            FontSelection::overridden("IPAexMincho", None),
        ))
        .bootstrap()
        .await
}

/// Executable shell script named `name` in `dir`
#[cfg(unix)]
pub fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
