// ─────────────────────────────────────────────────────────────────────
// Orbit Correction Kernel — Device Handles
// ─────────────────────────────────────────────────────────────────────
//! Small integer handles into the device inventory, plus the transverse
//! plane and sequence-scope selectors shared by every engine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transverse plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Plane {
    Horizontal,
    Vertical,
}

impl Plane {
    pub const BOTH: [Plane; 2] = [Plane::Horizontal, Plane::Vertical];

    /// Index into per-plane arrays: 0 = horizontal, 1 = vertical.
    #[inline]
    pub fn index(self) -> usize {
        match self {
            Plane::Horizontal => 0,
            Plane::Vertical => 1,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Plane::Horizontal => "H",
            Plane::Vertical => "V",
        }
    }
}

impl fmt::Display for Plane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Handle of a beam position monitor in the inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BpmId(pub usize);

/// Handle of a steering corrector in the inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrectorId(pub usize);

impl BpmId {
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

impl CorrectorId {
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Any element a twiss simulation can report phases for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LatticeNode {
    Bpm(BpmId),
    Corrector(CorrectorId),
}

/// Which part of the accelerator a device query covers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SequenceScope {
    /// Every sequence, in accelerator order.
    #[default]
    All,
    /// A single named sequence.
    Sequence(String),
}

impl SequenceScope {
    pub fn contains(&self, sequence: &str) -> bool {
        match self {
            SequenceScope::All => true,
            SequenceScope::Sequence(name) => name == sequence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plane_index() {
        assert_eq!(Plane::Horizontal.index(), 0);
        assert_eq!(Plane::Vertical.index(), 1);
        assert_eq!(Plane::BOTH.len(), 2);
    }

    #[test]
    fn test_scope_contains() {
        assert!(SequenceScope::All.contains("MEBT"));
        let scope = SequenceScope::Sequence("MEBT".into());
        assert!(scope.contains("MEBT"));
        assert!(!scope.contains("DTL1"));
    }

    #[test]
    fn test_handles_order() {
        assert!(BpmId(1) < BpmId(2));
        assert_eq!(CorrectorId(7).index(), 7);
    }
}
