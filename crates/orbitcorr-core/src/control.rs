// ─────────────────────────────────────────────────────────────────────
// Orbit Correction Kernel — Scan Control
// ─────────────────────────────────────────────────────────────────────
//! Cancellation flag and fractional progress shared between a running
//! scan and whoever observes it (usually a UI thread).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use orbitcorr_types::{CorrectionError, CorrectionResult};

/// Cheap to clone; all clones observe the same scan.
#[derive(Debug, Clone, Default)]
pub struct ScanControl {
    cancelled: Arc<AtomicBool>,
    // f64 bits
    progress: Arc<AtomicU64>,
}

impl ScanControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation at the next step boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Clear the cancel flag and progress before reusing the control.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
        self.progress.store(0f64.to_bits(), Ordering::SeqCst);
    }

    /// Fraction of the current scan completed, in [0, 1].
    pub fn progress(&self) -> f64 {
        f64::from_bits(self.progress.load(Ordering::SeqCst))
    }

    pub fn report(&self, done: usize, total: usize) {
        let fraction = if total == 0 {
            1.0
        } else {
            (done as f64 / total as f64).clamp(0.0, 1.0)
        };
        self.progress.store(fraction.to_bits(), Ordering::SeqCst);
    }

    /// Cancellation point between steps.
    pub fn checkpoint(&self) -> CorrectionResult<()> {
        if self.is_cancelled() {
            return Err(CorrectionError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_fraction() {
        let ctl = ScanControl::new();
        assert_eq!(ctl.progress(), 0.0);
        ctl.report(1, 4);
        assert!((ctl.progress() - 0.25).abs() < 1e-12);
        ctl.report(0, 0);
        assert_eq!(ctl.progress(), 1.0);
    }

    #[test]
    fn test_cancel_visible_through_clone() {
        let ctl = ScanControl::new();
        let observer = ctl.clone();
        assert!(ctl.checkpoint().is_ok());
        observer.cancel();
        assert!(matches!(ctl.checkpoint(), Err(CorrectionError::Cancelled)));
        ctl.reset();
        assert!(ctl.checkpoint().is_ok());
    }

    #[test]
    fn test_progress_from_another_thread() {
        let ctl = ScanControl::new();
        let worker = ctl.clone();
        std::thread::spawn(move || worker.report(3, 3))
            .join()
            .unwrap();
        assert_eq!(ctl.progress(), 1.0);
    }
}
