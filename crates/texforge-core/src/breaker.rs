//! Per-engine circuit breaker fed by request-time failures
//!
//! Startup probes can be wrong in both directions, and an engine that
//! keeps timing out on real requests costs the full timeout every time.
//! After `threshold` consecutive environment, transient or integration
//! failures the engine is tripped: it drops to the end of the ranking for
//! the cooldown period but stays eligible, so some attempt is always made.
//! Once the cooldown ends the engine is half-open and a single failure
//! trips it again.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::engine::EngineKind;
use crate::error::ErrorCategory;

/// Observable breaker state for one engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BreakerState {
    /// Normal operation
    Closed { failures: u32 },
    /// Tripped; ranked last until the cooldown ends
    Open { remaining_secs: u64 },
    /// Cooldown over; next failure trips again
    HalfOpen,
}

#[derive(Debug, Default, Clone, Copy)]
struct Slot {
    failures: u32,
    opened_until: Option<Instant>,
}

/// Circuit breaker for all engines
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    slots: Mutex<[Slot; 3]>,
}

impl CircuitBreaker {
    /// Breaker tripping after `threshold` failures; zero disables it
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            slots: Mutex::new([Slot::default(); 3]),
        }
    }

    /// Breaker that never trips
    pub fn disabled() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Whether the engine is currently tripped
    pub fn is_tripped(&self, kind: EngineKind) -> bool {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots[kind.index()]
            .opened_until
            .is_some_and(|until| Instant::now() < until)
    }

    /// Current state of the engine's breaker
    pub fn state(&self, kind: EngineKind) -> BreakerState {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots[kind.index()];
        match slot.opened_until {
            Some(until) => {
                let now = Instant::now();
                if now < until {
                    BreakerState::Open {
                        remaining_secs: until.duration_since(now).as_secs(),
                    }
                } else {
                    BreakerState::HalfOpen
                }
            }
            None => BreakerState::Closed {
                failures: slot.failures,
            },
        }
    }

    /// Successful compile: close the breaker
    pub fn record_success(&self, kind: EngineKind) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = &mut slots[kind.index()];
        if slot.opened_until.is_some() {
            info!(engine = %kind, "engine recovered; breaker closed");
        }
        *slot = Slot::default();
    }

    /// Failed compile with the given category
    pub fn record_failure(&self, kind: EngineKind, category: ErrorCategory) {
        if category == ErrorCategory::Content {
            // The engine ran and judged the document; it is healthy.
            self.record_success(kind);
            return;
        }
        if self.threshold == 0 {
            return;
        }

        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = &mut slots[kind.index()];
        let now = Instant::now();
        slot.failures = slot.failures.saturating_add(1);

        let half_open = slot.opened_until.is_some_and(|until| now >= until);
        if half_open || slot.failures >= self.threshold {
            slot.opened_until = Some(now + self.cooldown);
            warn!(
                engine = %kind,
                failures = slot.failures,
                cooldown_secs = self.cooldown.as_secs(),
                "engine tripped; ranking it last"
            );
        }
    }
}
