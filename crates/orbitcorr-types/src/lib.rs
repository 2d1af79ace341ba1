// ─────────────────────────────────────────────────────────────────────
// Orbit Correction Kernel — Types
// (C) 2026 The orbitcorr Authors. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
#![deny(unsafe_code)]
//! Type definitions, configuration, and error hierarchy for the
//! beam trajectory correction kernel.

pub mod config;
pub mod device;
pub mod error;
pub mod record;

pub use config::CorrectionConfig;
pub use device::{BpmId, CorrectorId, LatticeNode, Plane, SequenceScope};
pub use error::{CorrectionError, CorrectionResult};
pub use record::{BlockRecord, MatrixRecord, PairRecord, SvdRecord};
