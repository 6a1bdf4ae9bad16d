//! Engine ranking
//!
//! A ranking is recomputed on every read from the probe results, the
//! warmup state and the circuit breaker. It always holds every engine:
//! verified engines first, then statically available ones, then the rest
//! as last resorts. Tripped engines sink below all untripped ones. Ties
//! are broken by engine priority.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::breaker::CircuitBreaker;
use crate::engine::{EngineCandidate, EngineChoice, EngineKind};
use crate::warmup::WarmupState;

/// How much is known to work about an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Passed a Compile-Test in this process
    Verified,
    /// Executable and packages found
    Available,
    /// Neither; tried only when nothing better is left
    LastResort,
}

/// One position in a ranking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RankedEngine {
    /// Engine identity
    pub kind: EngineKind,
    /// Confidence tier
    pub tier: Tier,
    /// Tripped by the circuit breaker
    pub tripped: bool,
}

impl RankedEngine {
    fn sort_key(&self) -> (bool, Tier, u8) {
        (self.tripped, self.tier, self.kind.priority())
    }
}

/// Ordered engines, most preferred first
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ranking {
    entries: Vec<RankedEngine>,
}

impl Ranking {
    /// Sort entries into ranking order
    pub fn from_entries(mut entries: Vec<RankedEngine>) -> Self {
        entries.sort_by_key(RankedEngine::sort_key);
        Self { entries }
    }

    /// All entries in order
    pub fn entries(&self) -> &[RankedEngine] {
        &self.entries
    }

    /// Most preferred engine
    pub fn default_engine(&self) -> Option<EngineKind> {
        self.entries.first().map(|e| e.kind)
    }

    /// Engines after the default, in order
    pub fn fallbacks(&self) -> Vec<EngineKind> {
        self.entries.iter().skip(1).map(|e| e.kind).collect()
    }

    /// Every engine in order
    pub fn order(&self) -> Vec<EngineKind> {
        self.entries.iter().map(|e| e.kind).collect()
    }

    /// Tier of one engine
    pub fn tier(&self, kind: EngineKind) -> Option<Tier> {
        self.entries.iter().find(|e| e.kind == kind).map(|e| e.tier)
    }

    /// Engines to attempt for a request, in order
    pub fn plan(&self, choice: EngineChoice) -> Vec<EngineKind> {
        match choice {
            EngineChoice::Auto => self.order(),
            EngineChoice::Prefer(first) => std::iter::once(first)
                .chain(self.order().into_iter().filter(|k| *k != first))
                .collect(),
            EngineChoice::Require(only) => vec![only],
        }
    }
}

/// Tier from static availability and verification
pub fn tier_of(candidate: &EngineCandidate, verified: bool) -> Tier {
    if verified {
        Tier::Verified
    } else if candidate.available {
        Tier::Available
    } else {
        Tier::LastResort
    }
}

/// Computes rankings from shared state
pub struct EngineSelector {
    candidates: Vec<EngineCandidate>,
    warmup: Arc<WarmupState>,
    breaker: Arc<CircuitBreaker>,
}

impl EngineSelector {
    /// Selector over `candidates`; engines not listed are added as unavailable
    pub fn new(
        candidates: Vec<EngineCandidate>,
        warmup: Arc<WarmupState>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        let candidates = EngineKind::ALL
            .into_iter()
            .map(|kind| {
                candidates
                    .iter()
                    .find(|c| c.kind == kind)
                    .cloned()
                    .unwrap_or_else(|| {
                        EngineCandidate::new(
                            kind,
                            PathBuf::from(kind.name()),
                            false,
                            vec!["not probed".to_string()],
                        )
                    })
            })
            .collect();
        Self {
            candidates,
            warmup,
            breaker,
        }
    }

    /// Candidates in priority order
    pub fn candidates(&self) -> &[EngineCandidate] {
        &self.candidates
    }

    /// Candidate for one engine
    pub fn candidate(&self, kind: EngineKind) -> &EngineCandidate {
        &self.candidates[kind.index()]
    }

    /// Executable path for one engine
    pub fn command(&self, kind: EngineKind) -> &Path {
        &self.candidate(kind).command
    }

    /// Current ranking
    pub fn ranking(&self) -> Ranking {
        Ranking::from_entries(
            self.candidates
                .iter()
                .map(|c| RankedEngine {
                    kind: c.kind,
                    tier: tier_of(c, self.warmup.is_verified(c.kind)),
                    tripped: self.breaker.is_tripped(c.kind),
                })
                .collect(),
        )
    }
}
