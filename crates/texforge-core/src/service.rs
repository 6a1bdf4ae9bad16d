//! Service context
//!
//! [`TexService`] owns everything that lives for the process: the frozen
//! environment, probe results, warmup state, breaker and concurrency gate.
//! Build one at startup and share it; tests build isolated instances with
//! scripted runners and testers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::info;

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::config::Settings;
use crate::driver::{CompilationDriver, CompileOutput, CompileRequest};
use crate::engine::EngineKind;
use crate::env::{TexEnv, LIBGS_CANDIDATES};
use crate::error::{CompileError, PreviewError};
use crate::fonts::FontSelection;
use crate::harness::{CompileTestHarness, CompileTester};
use crate::locate::CommandLocator;
use crate::preview::{PreviewKind, PreviewRenderer};
use crate::probe::{PackageResolution, ProbeReport};
use crate::runner::{ProcessRunner, TokioRunner};
use crate::selector::{EngineSelector, Ranking, Tier};
use crate::warmup::{WarmupPhase, WarmupScheduler, WarmupState};

/// Builder for [`TexService`]
pub struct TexServiceBuilder {
    settings: Settings,
    runner: Option<Arc<dyn ProcessRunner>>,
    tester: Option<Arc<dyn CompileTester>>,
    locator: Option<CommandLocator>,
    env: Option<TexEnv>,
    probe_report: Option<ProbeReport>,
}

impl TexServiceBuilder {
    /// Process runner for every subprocess (default: [`TokioRunner`])
    pub fn runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Compile-Test implementation used by warmup
    pub fn tester(mut self, tester: Arc<dyn CompileTester>) -> Self {
        self.tester = Some(tester);
        self
    }

    /// Executable lookup
    pub fn locator(mut self, locator: CommandLocator) -> Self {
        self.locator = Some(locator);
        self
    }

    /// Base environment instead of the process environment
    pub fn env(mut self, env: TexEnv) -> Self {
        self.env = Some(env);
        self
    }

    /// Skip static probing and use this report
    pub fn probe_report(mut self, report: ProbeReport) -> Self {
        self.probe_report = Some(report);
        self
    }

    /// Run static probing and assemble the service
    ///
    /// Warmup is not started; call [`TexService::start_warmup`].
    pub async fn bootstrap(self) -> TexService {
        let settings = self.settings;
        let runner = self
            .runner
            .unwrap_or_else(|| Arc::new(TokioRunner) as Arc<dyn ProcessRunner>);
        let locator = self.locator.unwrap_or_default();

        let mut env = self.env.unwrap_or_else(TexEnv::from_process);
        env.prepend_path_dirs(&locator.existing_known_dirs());
        env.detect_libgs(LIBGS_CANDIDATES);

        let (report, env) = match self.probe_report {
            Some(report) => (report, env),
            None => {
                ProbeReport::collect(
                    runner.clone(),
                    &locator,
                    env,
                    Some(settings.package_search_roots.clone()),
                    (settings.cjk_main_font.clone(), settings.cjk_sans_font.clone()),
                )
                .await
            }
        };
        let env = Arc::new(env);

        let warmup = Arc::new(WarmupState::new());
        let breaker = Arc::new(CircuitBreaker::new(
            settings.breaker_threshold,
            settings.breaker_cooldown(),
        ));
        let selector = Arc::new(EngineSelector::new(
            report.candidates.clone(),
            warmup.clone(),
            breaker.clone(),
        ));
        let tester = self.tester.unwrap_or_else(|| {
            Arc::new(
                CompileTestHarness::new(runner.clone(), env.clone(), report.fonts.clone())
                    .with_memory_limit(settings.memory_limit_bytes()),
            )
        });
        let scheduler = WarmupScheduler::new(warmup.clone(), selector.candidates().to_vec(), tester);

        let gate = Arc::new(Semaphore::new(settings.gate_size()));
        let driver = CompilationDriver::new(
            runner.clone(),
            env.clone(),
            gate.clone(),
            selector.clone(),
            warmup.clone(),
            breaker.clone(),
            settings.compile_limits(),
        );
        let preview = PreviewRenderer::new(
            runner,
            env.clone(),
            gate,
            &locator,
            settings.preview_cache_entries,
        )
        .with_memory_limit(settings.memory_limit_bytes());

        let ranking = selector.ranking();
        info!(
            default = ?ranking.default_engine(),
            fallbacks = ?ranking.fallbacks(),
            "initial engine ranking"
        );

        TexService {
            settings,
            env,
            report,
            warmup,
            scheduler,
            breaker,
            selector,
            driver,
            preview,
        }
    }
}

/// Process-wide engine orchestration context
pub struct TexService {
    settings: Settings,
    env: Arc<TexEnv>,
    report: ProbeReport,
    warmup: Arc<WarmupState>,
    scheduler: WarmupScheduler,
    breaker: Arc<CircuitBreaker>,
    selector: Arc<EngineSelector>,
    driver: CompilationDriver,
    preview: PreviewRenderer,
}

impl TexService {
    /// Builder with `settings`
    pub fn builder(settings: Settings) -> TexServiceBuilder {
        TexServiceBuilder {
            settings,
            runner: None,
            tester: None,
            locator: None,
            env: None,
            probe_report: None,
        }
    }

    /// Bootstrap against the real host
    pub async fn bootstrap(settings: Settings) -> Self {
        Self::builder(settings).bootstrap().await
    }

    /// Settings in effect
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Static probe results
    pub fn probe_report(&self) -> &ProbeReport {
        &self.report
    }

    /// Frozen subprocess environment
    pub fn env(&self) -> &TexEnv {
        &self.env
    }

    /// Start background warmup; only the first call has an effect
    pub fn start_warmup(&self) -> bool {
        self.scheduler.start()
    }

    /// Wait up to `timeout` for warmup to signal completion
    pub async fn wait_for_warmup(&self, timeout: Duration) -> bool {
        self.scheduler.wait(timeout).await
    }

    /// Wait up to `timeout` for warmup to test every engine
    pub async fn wait_for_warmup_finished(&self, timeout: Duration) -> bool {
        self.scheduler.wait_finished(timeout).await
    }

    /// Whether warmup signaled completion
    pub fn is_warm(&self) -> bool {
        self.warmup.is_done()
    }

    /// Current engine ranking
    pub fn ranking(&self) -> Ranking {
        self.selector.ranking()
    }

    /// Compile a source document
    pub async fn compile(&self, request: &CompileRequest) -> Result<CompileOutput, CompileError> {
        self.driver.compile(request).await
    }

    /// SVG preview of one block
    pub async fn preview(&self, code: &str, kind: PreviewKind) -> Result<String, PreviewError> {
        self.preview.render(code, kind).await
    }

    /// Read-only diagnostics snapshot
    pub fn status(&self) -> ServiceStatus {
        let ranking = self.selector.ranking();
        let engines = self
            .selector
            .candidates()
            .iter()
            .map(|candidate| {
                let health = self.warmup.health(candidate.kind);
                let packages = candidate
                    .kind
                    .spec()
                    .packages
                    .iter()
                    .map(|name| PackageStatus {
                        name: name.to_string(),
                        resolution: self
                            .report
                            .packages
                            .get(*name)
                            .cloned()
                            .unwrap_or(PackageResolution::Missing),
                    })
                    .collect();
                EngineStatus {
                    engine: candidate.kind,
                    command: candidate.command.clone(),
                    command_found: candidate.command_found,
                    available: candidate.available,
                    verified: health.verified,
                    tested: health.tested,
                    latency_ms: health.latency_ms,
                    tier: ranking.tier(candidate.kind).unwrap_or(Tier::LastResort),
                    breaker: self.breaker.state(candidate.kind),
                    missing: candidate.missing.clone(),
                    packages,
                }
            })
            .collect();

        ServiceStatus {
            warmup: self.warmup.phase(),
            warm: self.warmup.is_done(),
            default_engine: ranking.default_engine(),
            fallbacks: ranking.fallbacks(),
            engines,
            fonts: self.report.fonts.clone(),
            texinputs: self.env.get("TEXINPUTS").map(str::to_string),
            libgs: self.env.get("LIBGS").map(str::to_string),
            max_concurrent_compiles: self.settings.gate_size(),
            preview_cached: self.preview.cached(),
        }
    }
}

/// Diagnostics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    /// Warmup phase
    pub warmup: WarmupPhase,
    /// Warmup completion signal
    pub warm: bool,
    /// Current default engine
    pub default_engine: Option<EngineKind>,
    /// Current fallback order
    pub fallbacks: Vec<EngineKind>,
    /// Per-engine state, in priority order
    pub engines: Vec<EngineStatus>,
    /// Selected CJK fonts
    pub fonts: FontSelection,
    /// Package search path registered during probing
    pub texinputs: Option<String>,
    /// Ghostscript library for dvisvgm
    pub libgs: Option<String>,
    /// Size of the concurrency gate
    pub max_concurrent_compiles: usize,
    /// Previews held in the in-memory cache
    pub preview_cached: usize,
}

/// Diagnostics for one engine
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub engine: EngineKind,
    pub command: PathBuf,
    pub command_found: bool,
    pub available: bool,
    pub verified: bool,
    pub tested: bool,
    pub latency_ms: Option<u64>,
    pub tier: Tier,
    pub breaker: BreakerState,
    pub missing: Vec<String>,
    pub packages: Vec<PackageStatus>,
}

/// Resolution of one support file
#[derive(Debug, Clone, Serialize)]
pub struct PackageStatus {
    pub name: String,
    #[serde(flatten)]
    pub resolution: PackageResolution,
}
