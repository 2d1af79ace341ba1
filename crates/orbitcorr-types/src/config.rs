// ─────────────────────────────────────────────────────────────────────
// Orbit Correction Kernel — Configuration
// ─────────────────────────────────────────────────────────────────────

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CorrectionError, CorrectionResult};

/// A reference-file line matches a BPM only if the positions differ by less than this.
pub const POSITION_MATCH_TOLERANCE: f64 = 1e-5;

/// Simulated trajectories come back in metres; columns are built in mm per field unit.
pub const SIMULATION_POSITION_SCALE: f64 = 1000.0;

/// Runtime configuration for measurement, calibration and correction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionConfig {
    /// Fixed settling delay after every corrector change, in milliseconds.
    /// Default: 2000.
    pub settle_ms: u64,

    /// Field perturbation applied to each corrector while building a response matrix.
    /// Default: 0.001.
    pub response_kick: f64,

    /// Field perturbation (±) applied to a paired corrector during 1-to-1 calibration.
    /// Default: 0.001.
    pub calibration_kick: f64,

    /// Absolute singular-value cutoff for the truncated pseudo-inverse.
    /// Default: 1e-3.
    pub svd_cutoff: f64,

    /// Fraction of the computed kick actually applied.
    /// Default: 1.0.
    pub correction_factor: f64,
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self {
            settle_ms: 2000,
            response_kick: 0.001,
            calibration_kick: 0.001,
            svd_cutoff: 1e-3,
            correction_factor: 1.0,
        }
    }
}

impl CorrectionConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> CorrectionResult<()> {
        if !(self.response_kick.is_finite() && self.response_kick > 0.0) {
            return Err(CorrectionError::Configuration(format!(
                "response_kick must be > 0, got {}",
                self.response_kick
            )));
        }
        if !(self.calibration_kick.is_finite() && self.calibration_kick > 0.0) {
            return Err(CorrectionError::Configuration(format!(
                "calibration_kick must be > 0, got {}",
                self.calibration_kick
            )));
        }
        if !(self.svd_cutoff.is_finite() && self.svd_cutoff >= 0.0) {
            return Err(CorrectionError::Configuration(format!(
                "svd_cutoff must be >= 0, got {}",
                self.svd_cutoff
            )));
        }
        if !(self.correction_factor > 0.0 && self.correction_factor <= 1.0) {
            return Err(CorrectionError::Configuration(format!(
                "correction_factor must be in (0, 1], got {}",
                self.correction_factor
            )));
        }
        Ok(())
    }

    /// Load from JSON string.
    pub fn from_json(json: &str) -> CorrectionResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| CorrectionError::Configuration(format!("JSON parse error: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(CorrectionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_default_settle_delay() {
        assert_eq!(
            CorrectionConfig::default().settle_delay(),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_zero_kick_rejected() {
        let cfg = CorrectionConfig {
            response_kick: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(CorrectionError::Configuration(_))
        ));
    }

    #[test]
    fn test_negative_cutoff_rejected() {
        let cfg = CorrectionConfig {
            svd_cutoff: -1.0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_correction_factor_bounds() {
        let too_big = CorrectionConfig {
            correction_factor: 1.5,
            ..Default::default()
        };
        assert!(too_big.validate().is_err());
        let half = CorrectionConfig {
            correction_factor: 0.5,
            ..Default::default()
        };
        assert!(half.validate().is_ok());
    }

    #[test]
    fn test_from_json() {
        let json = r#"{
            "settle_ms": 0,
            "response_kick": 0.002,
            "calibration_kick": 0.0005,
            "svd_cutoff": 0.0,
            "correction_factor": 0.8
        }"#;
        let cfg = CorrectionConfig::from_json(json).unwrap();
        assert_eq!(cfg.settle_ms, 0);
        assert!((cfg.response_kick - 0.002).abs() < 1e-12);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_from_json_garbage() {
        assert!(CorrectionConfig::from_json("{not json").is_err());
    }
}
