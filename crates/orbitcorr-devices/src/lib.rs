// ─────────────────────────────────────────────────────────────────────
// Orbit Correction Kernel — Devices
// (C) 2026 The orbitcorr Authors. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
#![deny(unsafe_code)]
//! Device side of the correction kernel: the inventory of BPMs and
//! correctors, the proxy/simulator contracts the engines drive, and the
//! session object that serialises scans over one device group.
//!
//! # Scan invariants
//!
//! 1. **One scan per device group**: `DeviceSession::begin_scan()` takes the
//!    group's lock with `try_lock`. A second scan fails with `Busy`
//!    instead of interleaving corrector perturbations.
//!
//! 2. **Frozen inventory**: the `Lattice` is shared behind an `Arc` and is
//!    immutable once a session exists, so BPM/corrector ordering cannot
//!    change underneath a running scan.
//!
//! 3. **Injectable settling**: every wait after a field change goes through
//!    the `Settle` trait so tests can replace the fixed delay with a no-op.

pub mod lattice;
pub mod model;
pub mod proxy;
pub mod session;
pub mod settle;

pub use lattice::{BpmInfo, CorrectorInfo, Lattice};
pub use model::{LinearMachine, LinearModel, LinearModelSimulator};
pub use proxy::{DeviceProxy, Simulator};
pub use session::{DeviceSession, Scan};
pub use settle::{CountingSettle, FixedDelay, NoSettle, Settle};
