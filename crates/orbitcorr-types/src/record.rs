// ─────────────────────────────────────────────────────────────────────
// Orbit Correction Kernel — Block Persistence Record
// ─────────────────────────────────────────────────────────────────────
//! Serialisable form of a correction block. Devices are stored by name;
//! matrices as row/column counts plus column-major values; pair
//! calibrations as `"offset:slope"` strings.

use serde::{Deserialize, Serialize};

use crate::device::Plane;
use crate::error::{CorrectionError, CorrectionResult};

/// One plane's response matrix, flattened column-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixRecord {
    pub rows: usize,
    pub cols: usize,
    pub values: Vec<f64>,
}

impl MatrixRecord {
    pub fn check_shape(&self) -> CorrectionResult<()> {
        let expected = self.rows.checked_mul(self.cols).ok_or_else(|| {
            CorrectionError::Parse(format!(
                "matrix record dimensions {}x{} overflow",
                self.rows, self.cols
            ))
        })?;
        if self.values.len() != expected {
            return Err(CorrectionError::Parse(format!(
                "matrix record holds {} values, expected {}x{}",
                self.values.len(),
                self.rows,
                self.cols
            )));
        }
        Ok(())
    }
}

/// SVD part of a block: one matrix per plane plus the cutoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SvdRecord {
    pub cutoff: f64,
    pub horizontal: Option<MatrixRecord>,
    pub vertical: Option<MatrixRecord>,
}

/// A single 1-to-1 pair with its calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairRecord {
    pub plane: Plane,
    pub bpm: String,
    pub corrector: String,
    /// `"offset:slope"`.
    pub coefficients: String,
}

impl PairRecord {
    pub fn format_coefficients(offset: f64, slope: f64) -> String {
        format!("{offset}:{slope}")
    }

    /// Parse `"offset:slope"` back into numbers.
    pub fn parse_coefficients(&self) -> CorrectionResult<(f64, f64)> {
        let (offset, slope) = self.coefficients.split_once(':').ok_or_else(|| {
            CorrectionError::Parse(format!(
                "coefficients for {} must be \"offset:slope\", got {:?}",
                self.bpm, self.coefficients
            ))
        })?;
        let parse = |s: &str| {
            s.trim().parse::<f64>().map_err(|e| {
                CorrectionError::Parse(format!("bad coefficient {s:?} for {}: {e}", self.bpm))
            })
        };
        Ok((parse(offset)?, parse(slope)?))
    }
}

/// Persisted correction block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub name: String,
    pub bpms: Vec<String>,
    pub h_correctors: Vec<String>,
    pub v_correctors: Vec<String>,
    pub ok_svd: bool,
    pub ok_1to1: bool,
    pub svd: Option<SvdRecord>,
    #[serde(default)]
    pub pairs: Vec<PairRecord>,
}

impl BlockRecord {
    pub fn to_json(&self) -> CorrectionResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| CorrectionError::Parse(format!("JSON encode error: {e}")))
    }

    pub fn from_json(json: &str) -> CorrectionResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| CorrectionError::Parse(format!("JSON parse error: {e}")))
    }
}
