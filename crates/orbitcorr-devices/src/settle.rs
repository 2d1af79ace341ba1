// ─────────────────────────────────────────────────────────────────────
// Orbit Correction Kernel — Settling Strategies
// ─────────────────────────────────────────────────────────────────────
//! Wait applied after every corrector change. The machine gets a fixed
//! blocking delay; tests get `NoSettle` or `CountingSettle`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use orbitcorr_types::CorrectionConfig;

pub trait Settle: Send + Sync {
    fn settle(&self);
}

/// Unconditional blocking sleep.
#[derive(Debug, Clone, Copy)]
pub struct FixedDelay(pub Duration);

impl FixedDelay {
    pub fn from_config(config: &CorrectionConfig) -> Self {
        Self(config.settle_delay())
    }
}

impl Settle for FixedDelay {
    fn settle(&self) {
        if !self.0.is_zero() {
            std::thread::sleep(self.0);
        }
    }
}

/// Returns immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSettle;

impl Settle for NoSettle {
    fn settle(&self) {}
}

/// Returns immediately and counts calls.
#[derive(Debug, Default)]
pub struct CountingSettle {
    calls: AtomicUsize,
}

impl CountingSettle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Settle for CountingSettle {
    fn settle(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}
