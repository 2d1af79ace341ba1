// ─────────────────────────────────────────────────────────────────────
// Orbit Correction Kernel — Error Hierarchy
// ─────────────────────────────────────────────────────────────────────

use thiserror::Error;

/// Root error type for all correction kernel failures.
#[derive(Error, Debug)]
pub enum CorrectionError {
    /// Hardware or simulation read/write failed.
    #[error("acquisition error: {0}")]
    Acquisition(String),

    /// Knob selection found nothing, or stored data does not fit the live configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Statistics requested over zero samples.
    #[error("empty trajectory: {0}")]
    EmptyTrajectory(String),

    /// Degenerate or missing linear calibration.
    #[error("calibration error: {0}")]
    Calibration(String),

    /// Device, pair or sample not found.
    #[error("lookup error: {0}")]
    Lookup(String),

    /// Scan was cancelled between steps.
    #[error("scan cancelled")]
    Cancelled,

    /// Another scan already holds the device group.
    #[error("device group busy: {0}")]
    Busy(String),

    /// Trajectory file could not be read or written.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Trajectory file or block record could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),
}

impl CorrectionError {
    /// True for failures a caller may reasonably retry (hardware hiccups, busy device group).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CorrectionError::Acquisition(_) | CorrectionError::Busy(_) | CorrectionError::Io(_)
        )
    }
}

pub type CorrectionResult<T> = Result<T, CorrectionError>;
