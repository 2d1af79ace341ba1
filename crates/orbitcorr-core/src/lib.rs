// ─────────────────────────────────────────────────────────────────────
// Orbit Correction Kernel — Core Engine
// (C) 2026 The orbitcorr Authors. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
#![deny(unsafe_code)]
//! Trajectory correction engines for a charged-particle beam.
//!
//! Two strategies share one trajectory store:
//! - `ResponseMatrixEngine`: global correction through a truncated SVD
//!   pseudo-inverse of a measured or simulated response matrix.
//! - `PairingEngine`: local "1-to-1" correction, one upstream corrector
//!   per BPM with a linear calibration per pair.
//!
//! # Invariants
//!
//! 1. **Order is frozen at definition time**: matrix rows follow the BPM
//!    list, columns the corrector list, and every error vector is built in
//!    that same order.
//!
//! 2. **All-or-nothing commits**: a scan or calibration that fails or is
//!    cancelled leaves the previous matrix/pairing table untouched and
//!    tries to put the perturbed corrector back to its original field.
//!
//! 3. **One perturbation at a time**: columns and pairs are processed
//!    strictly sequentially inside a `Scan`, which holds the device group
//!    exclusively.

pub mod block;
pub mod control;
pub mod knobs;
pub mod pairing;
pub mod svd;
pub mod trajectory;

pub use block::CorrectionBlock;
pub use control::ScanControl;
pub use knobs::Window;
pub use pairing::{AppliedKick, Calibration, CalibrationSource, PairCandidate, PairingEngine};
pub use svd::{truncated_pseudo_inverse, KickSet, ResponseMatrixEngine};
pub use trajectory::{Sample, TrajectoryStore};
