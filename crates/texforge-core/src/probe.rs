//! Static dependency probing
//!
//! Decides, without compiling anything, which engines look usable. Each
//! support file is resolved once per process through a chain of fallbacks:
//!
//! 1. ask the package database (`kpsewhich`)
//! 2. rebuild the database (`texhash`) and ask again
//! 3. search the known TeX trees on disk (`find`) and register the hit in
//!    `TEXINPUTS`
//!
//! The third step covers distributions whose database is out of sync with
//! the files actually installed (seen on Debian 12/13 images).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::engine::{EngineCandidate, EngineKind, FontRequirement};
use crate::env::TexEnv;
use crate::fonts::{detect_fonts, FontSelection};
use crate::locate::{is_executable, CommandLocator};
use crate::runner::{ExitState, Invocation, ProcessRunner};

/// Roots searched when the package database misses a file
pub const DEFAULT_SEARCH_ROOTS: &[&str] = &[
    "/usr/share/texmf",
    "/usr/share/texlive",
    "/usr/local/texlive",
    "/opt/texlive",
];

/// Time budgets for probing subprocesses
#[derive(Debug, Clone, Copy)]
pub struct ProbeTimeouts {
    /// One `kpsewhich` query
    pub query: Duration,
    /// One database rebuild
    pub rebuild: Duration,
    /// One `find` per search root
    pub search: Duration,
}

impl Default for ProbeTimeouts {
    fn default() -> Self {
        Self {
            query: Duration::from_secs(10),
            rebuild: Duration::from_secs(30),
            search: Duration::from_secs(15),
        }
    }
}

/// How a support file was resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PackageResolution {
    /// The package database knows it
    Database { path: PathBuf },
    /// Found on disk and its directory added to `TEXINPUTS`
    Registered { path: PathBuf },
    /// Not found anywhere
    Missing,
}

impl PackageResolution {
    /// Whether engines can load the file
    pub fn is_found(&self) -> bool {
        !matches!(self, PackageResolution::Missing)
    }

    /// Directory the file lives in
    pub fn dir(&self) -> Option<&Path> {
        match self {
            PackageResolution::Database { path } | PackageResolution::Registered { path } => {
                path.parent()
            }
            PackageResolution::Missing => None,
        }
    }
}

/// Resolves support files, caching every answer for the process lifetime
pub struct PackageProber {
    runner: Arc<dyn ProcessRunner>,
    env: TexEnv,
    kpsewhich: PathBuf,
    texhash: PathBuf,
    find: PathBuf,
    search_roots: Vec<PathBuf>,
    timeouts: ProbeTimeouts,
    cache: BTreeMap<String, PackageResolution>,
    rebuilt: bool,
}

impl PackageProber {
    /// Prober that resolves its helper commands through `locator`
    pub fn new(runner: Arc<dyn ProcessRunner>, locator: &CommandLocator, env: TexEnv) -> Self {
        Self {
            runner,
            env,
            kpsewhich: locator.resolve("kpsewhich"),
            texhash: locator.resolve("texhash"),
            find: locator.resolve("find"),
            search_roots: DEFAULT_SEARCH_ROOTS.iter().map(PathBuf::from).collect(),
            timeouts: ProbeTimeouts::default(),
            cache: BTreeMap::new(),
            rebuilt: false,
        }
    }

    /// Replace the filesystem search roots
    pub fn with_search_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.search_roots = roots;
        self
    }

    /// Replace the subprocess time budgets
    pub fn with_timeouts(mut self, timeouts: ProbeTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Environment as extended so far
    pub fn env(&self) -> &TexEnv {
        &self.env
    }

    /// Every resolution made so far
    pub fn resolutions(&self) -> &BTreeMap<String, PackageResolution> {
        &self.cache
    }

    /// Hand back the extended environment and the resolutions
    pub fn into_parts(self) -> (TexEnv, BTreeMap<String, PackageResolution>) {
        (self.env, self.cache)
    }

    /// Whether `name` can be loaded by the engines
    pub async fn ensure_available(&mut self, name: &str) -> bool {
        self.resolve(name).await.is_found()
    }

    /// Resolve `name`, running the fallback chain only on the first call
    pub async fn resolve(&mut self, name: &str) -> PackageResolution {
        if let Some(cached) = self.cache.get(name) {
            return cached.clone();
        }

        let resolution = self.resolve_uncached(name).await;
        self.cache.insert(name.to_string(), resolution.clone());
        resolution
    }

    async fn resolve_uncached(&mut self, name: &str) -> PackageResolution {
        if let Some(path) = self.query_database(name).await {
            return PackageResolution::Database { path };
        }

        if !self.rebuilt {
            warn!(package = name, "not found by kpsewhich; rebuilding package database");
            self.rebuild_database().await;
            if let Some(path) = self.query_database(name).await {
                return PackageResolution::Database { path };
            }
        }

        warn!(package = name, "still not found by kpsewhich; searching filesystem");
        if let Some(path) = self.search_filesystem(name).await {
            let resolution = PackageResolution::Registered { path };
            if let Some(dir) = resolution.dir() {
                self.env.register_texinputs(dir);
            }
            return resolution;
        }

        error!(package = name, "not found anywhere on this host");
        PackageResolution::Missing
    }

    async fn query_database(&self, name: &str) -> Option<PathBuf> {
        let invocation = Invocation::new(&self.kpsewhich, Arc::new(self.env.clone()), self.timeouts.query)
            .arg(name);
        let output = self.runner.run(&invocation).await;
        if !output.success() {
            debug!(package = name, state = ?output.state, "kpsewhich miss");
            return None;
        }
        let path = output.stdout.lines().next().map(str::trim).unwrap_or("");
        if path.is_empty() {
            return None;
        }
        info!(package = name, path, "kpsewhich hit");
        Some(PathBuf::from(path))
    }

    async fn rebuild_database(&mut self) {
        // One rebuild per boot is enough; later misses go straight to the search.
        self.rebuilt = true;
        let invocation =
            Invocation::new(&self.texhash, Arc::new(self.env.clone()), self.timeouts.rebuild);
        let output = self.runner.run(&invocation).await;
        if !output.success() {
            warn!(state = ?output.state, "package database rebuild failed");
        }
    }

    async fn search_filesystem(&self, name: &str) -> Option<PathBuf> {
        for root in &self.search_roots {
            if !root.is_dir() {
                continue;
            }
            let invocation = Invocation::new(&self.find, Arc::new(self.env.clone()), self.timeouts.search)
                .arg(root.as_os_str())
                .args(["-name", name, "-type", "f"]);
            let output = self.runner.run(&invocation).await;

            // find exits nonzero on unreadable subdirectories but still prints hits.
            let hit = output
                .stdout
                .lines()
                .map(str::trim)
                .find(|line| !line.is_empty());
            match (&output.state, hit) {
                (ExitState::Exited(_), Some(line)) => {
                    info!(package = name, path = line, "found by filesystem search");
                    return Some(PathBuf::from(line));
                }
                (ExitState::Exited(0), None) => {}
                (state, _) => {
                    warn!(package = name, root = %root.display(), state = ?state, "filesystem search failed");
                }
            }
        }
        None
    }
}

/// Everything static probing learned at startup
#[derive(Debug, Clone)]
pub struct ProbeReport {
    /// Engines in priority order
    pub candidates: Vec<EngineCandidate>,
    /// Resolution of every probed support file
    pub packages: BTreeMap<String, PackageResolution>,
    /// Selected CJK fonts
    pub fonts: FontSelection,
}

impl ProbeReport {
    /// Report built from known candidates, for hosts probed elsewhere and tests
    pub fn from_candidates(candidates: Vec<EngineCandidate>, fonts: FontSelection) -> Self {
        Self {
            candidates,
            packages: BTreeMap::new(),
            fonts,
        }
    }

    /// Probe commands, packages and fonts for every engine
    ///
    /// Returns the report and the environment extended with any registered
    /// package directories.
    pub async fn collect(
        runner: Arc<dyn ProcessRunner>,
        locator: &CommandLocator,
        env: TexEnv,
        search_roots: Option<Vec<PathBuf>>,
        font_overrides: (Option<String>, Option<String>),
    ) -> (Self, TexEnv) {
        let mut prober = PackageProber::new(runner.clone(), locator, env);
        if let Some(roots) = search_roots {
            prober = prober.with_search_roots(roots);
        }

        let mut commands = Vec::new();
        for kind in EngineKind::ALL {
            let command = locator.resolve(kind.spec().command);
            let found = is_executable(&command);
            if found {
                for package in kind.spec().packages {
                    prober.ensure_available(package).await;
                }
            } else {
                warn!(engine = %kind, "executable not found; skipping package probe");
            }
            commands.push((kind, command, found));
        }

        let fonts = detect_fonts(
            &runner,
            &locator.resolve("fc-list"),
            &Arc::new(prober.env().clone()),
            font_overrides.0,
            font_overrides.1,
        )
        .await;

        let (env, packages) = prober.into_parts();
        let candidates = commands
            .into_iter()
            .map(|(kind, command, found)| assess(kind, command, found, &packages, &fonts))
            .collect::<Vec<_>>();

        for candidate in &candidates {
            info!(
                engine = %candidate.kind,
                command = %candidate.command.display(),
                available = candidate.available,
                missing = ?candidate.missing,
                "static probe"
            );
        }

        (
            Self {
                candidates,
                packages,
                fonts,
            },
            env,
        )
    }

    /// Candidate for `kind`
    pub fn candidate(&self, kind: EngineKind) -> Option<&EngineCandidate> {
        self.candidates.iter().find(|c| c.kind == kind)
    }
}

fn assess(
    kind: EngineKind,
    command: PathBuf,
    found: bool,
    packages: &BTreeMap<String, PackageResolution>,
    fonts: &FontSelection,
) -> EngineCandidate {
    let mut missing: Vec<String> = kind
        .spec()
        .packages
        .iter()
        .filter(|p| !packages.get(**p).is_some_and(PackageResolution::is_found))
        .map(|p| p.to_string())
        .collect();

    if kind.spec().font == Some(FontRequirement::CjkSystemFont) && !fonts.has_main() {
        missing.push("CJK system font".to_string());
    }

    EngineCandidate::new(kind, command, found, missing)
}
