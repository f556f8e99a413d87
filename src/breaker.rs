//! Per-subscriber circuit breakers for webhook delivery.
//!
//! Each subscriber gets an independent CLOSED/OPEN/HALF_OPEN state
//! machine. After `FAILURE_THRESHOLD` consecutive failures the circuit
//! opens and `allow()` denies delivery until `COOLDOWN` has elapsed,
//! then one probe is let through (half-open). State lives in process
//! memory only — lost on restart, which is acceptable because an open
//! circuit is purely a fast-fail optimization.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use uuid::Uuid;

const FAILURE_THRESHOLD: u32 = 5;
const COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct BreakerEntry {
    failures: u32,
    last_failure: Option<Instant>,
    state: BreakerState,
}

impl BreakerEntry {
    fn new() -> Self {
        Self {
            failures: 0,
            last_failure: None,
            state: BreakerState::Closed,
        }
    }
}

pub struct CircuitBreakerSet {
    entries: DashMap<Uuid, BreakerEntry>,
    threshold: u32,
    cooldown: Duration,
}

impl Default for CircuitBreakerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerSet {
    pub fn new() -> Self {
        Self::with_config(FAILURE_THRESHOLD, COOLDOWN)
    }

    /// Custom threshold/cooldown. Production uses `new()`; tests shrink
    /// the cooldown so the half-open probe is observable.
    pub fn with_config(threshold: u32, cooldown: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            threshold,
            cooldown,
        }
    }

    /// Gate check. `true` = deliver. An open circuit whose cooldown has
    /// elapsed transitions to half-open and allows a single probe.
    pub fn allow(&self, id: Uuid) -> bool {
        let mut entry = self.entries.entry(id).or_insert_with(BreakerEntry::new);
        match entry.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = entry
                    .last_failure
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed > self.cooldown {
                    entry.state = BreakerState::HalfOpen;
                    tracing::info!("breaker: {} cooldown elapsed, half-open probe allowed", id);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, id: Uuid) {
        let mut entry = self.entries.entry(id).or_insert_with(BreakerEntry::new);
        if entry.state != BreakerState::Closed || entry.failures > 0 {
            tracing::info!(
                "breaker: {} closed after success (was {} failures)",
                id,
                entry.failures
            );
        }
        entry.failures = 0;
        entry.last_failure = None;
        entry.state = BreakerState::Closed;
    }

    pub fn record_failure(&self, id: Uuid) {
        let mut entry = self.entries.entry(id).or_insert_with(BreakerEntry::new);
        match entry.state {
            BreakerState::HalfOpen => {
                entry.state = BreakerState::Open;
                entry.last_failure = Some(Instant::now());
                tracing::warn!("breaker: {} probe failed, re-opened", id);
            }
            BreakerState::Closed => {
                entry.failures += 1;
                if entry.failures >= self.threshold {
                    entry.state = BreakerState::Open;
                    entry.last_failure = Some(Instant::now());
                    tracing::warn!(
                        "breaker: {} OPEN after {} consecutive failures (cooldown {}s)",
                        id,
                        entry.failures,
                        self.cooldown.as_secs()
                    );
                }
            }
            BreakerState::Open => {
                entry.last_failure = Some(Instant::now());
            }
        }
    }

    pub fn state(&self, id: Uuid) -> BreakerState {
        self.entries
            .get(&id)
            .map(|e| e.state)
            .unwrap_or(BreakerState::Closed)
    }

    /// Forget a subscriber's breaker (on webhook delete).
    pub fn forget(&self, id: Uuid) {
        self.entries.remove(&id);
    }

    pub fn open_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state == BreakerState::Open)
            .count()
    }
}
