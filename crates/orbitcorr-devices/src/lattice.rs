// ─────────────────────────────────────────────────────────────────────
// Orbit Correction Kernel — Device Inventory
// ─────────────────────────────────────────────────────────────────────
//! Arena of BPMs and correctors. Engines refer to devices by
//! `BpmId`/`CorrectorId` handles; names are only used at the
//! persistence boundary.

use orbitcorr_types::{BpmId, CorrectionError, CorrectionResult, CorrectorId, Plane, SequenceScope};

#[derive(Debug, Clone)]
struct SequenceInfo {
    name: String,
    offset: f64,
}

/// A beam position monitor.
#[derive(Debug, Clone)]
pub struct BpmInfo {
    pub name: String,
    pub sequence: String,
    /// Position inside the parent sequence.
    pub local_position: f64,
    /// Absolute position: sequence offset + local position.
    pub position: f64,
}

/// A steering corrector acting in one plane.
#[derive(Debug, Clone)]
pub struct CorrectorInfo {
    pub name: String,
    pub plane: Plane,
    pub sequence: String,
    pub local_position: f64,
    pub position: f64,
}

/// Device inventory of one accelerator.
#[derive(Debug, Clone, Default)]
pub struct Lattice {
    sequences: Vec<SequenceInfo>,
    bpms: Vec<BpmInfo>,
    correctors: Vec<CorrectorInfo>,
}

impl Lattice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sequence starting at `offset` along the accelerator.
    pub fn add_sequence(&mut self, name: &str, offset: f64) -> CorrectionResult<()> {
        if self.sequences.iter().any(|s| s.name == name) {
            return Err(CorrectionError::Configuration(format!(
                "sequence {name} already defined"
            )));
        }
        self.sequences.push(SequenceInfo {
            name: name.to_string(),
            offset,
        });
        Ok(())
    }

    fn sequence_offset(&self, sequence: &str) -> CorrectionResult<f64> {
        self.sequences
            .iter()
            .find(|s| s.name == sequence)
            .map(|s| s.offset)
            .ok_or_else(|| CorrectionError::Lookup(format!("unknown sequence {sequence}")))
    }

    pub fn add_bpm(
        &mut self,
        name: &str,
        sequence: &str,
        local_position: f64,
    ) -> CorrectionResult<BpmId> {
        if self.find_bpm(name).is_some() {
            return Err(CorrectionError::Configuration(format!(
                "BPM {name} already defined"
            )));
        }
        let offset = self.sequence_offset(sequence)?;
        self.bpms.push(BpmInfo {
            name: name.to_string(),
            sequence: sequence.to_string(),
            local_position,
            position: offset + local_position,
        });
        Ok(BpmId(self.bpms.len() - 1))
    }

    pub fn add_corrector(
        &mut self,
        name: &str,
        plane: Plane,
        sequence: &str,
        local_position: f64,
    ) -> CorrectionResult<CorrectorId> {
        if self.find_corrector(name).is_some() {
            return Err(CorrectionError::Configuration(format!(
                "corrector {name} already defined"
            )));
        }
        let offset = self.sequence_offset(sequence)?;
        self.correctors.push(CorrectorInfo {
            name: name.to_string(),
            plane,
            sequence: sequence.to_string(),
            local_position,
            position: offset + local_position,
        });
        Ok(CorrectorId(self.correctors.len() - 1))
    }

    pub fn bpm_count(&self) -> usize {
        self.bpms.len()
    }

    pub fn corrector_count(&self) -> usize {
        self.correctors.len()
    }

    pub fn bpm(&self, id: BpmId) -> CorrectionResult<&BpmInfo> {
        self.bpms
            .get(id.index())
            .ok_or_else(|| CorrectionError::Lookup(format!("no BPM with handle {}", id.0)))
    }

    pub fn corrector(&self, id: CorrectorId) -> CorrectionResult<&CorrectorInfo> {
        self.correctors
            .get(id.index())
            .ok_or_else(|| CorrectionError::Lookup(format!("no corrector with handle {}", id.0)))
    }

    pub fn bpm_position(&self, id: BpmId) -> CorrectionResult<f64> {
        Ok(self.bpm(id)?.position)
    }

    pub fn corrector_position(&self, id: CorrectorId) -> CorrectionResult<f64> {
        Ok(self.corrector(id)?.position)
    }

    pub fn find_bpm(&self, name: &str) -> Option<BpmId> {
        self.bpms.iter().position(|b| b.name == name).map(BpmId)
    }

    pub fn find_corrector(&self, name: &str) -> Option<CorrectorId> {
        self.correctors
            .iter()
            .position(|c| c.name == name)
            .map(CorrectorId)
    }

    /// BPMs in `scope`, ordered by absolute position.
    pub fn bpms_in(&self, scope: &SequenceScope) -> Vec<BpmId> {
        let mut ids: Vec<BpmId> = (0..self.bpms.len())
            .filter(|&i| scope.contains(&self.bpms[i].sequence))
            .map(BpmId)
            .collect();
        ids.sort_by(|a, b| self.bpms[a.0].position.total_cmp(&self.bpms[b.0].position));
        ids
    }

    /// Correctors of `plane` in `scope`, ordered by absolute position.
    pub fn correctors_in(&self, scope: &SequenceScope, plane: Plane) -> Vec<CorrectorId> {
        let mut ids: Vec<CorrectorId> = (0..self.correctors.len())
            .filter(|&i| {
                let c = &self.correctors[i];
                c.plane == plane && scope.contains(&c.sequence)
            })
            .map(CorrectorId)
            .collect();
        ids.sort_by(|a, b| {
            self.correctors[a.0]
                .position
                .total_cmp(&self.correctors[b.0].position)
        });
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_sequences() -> Lattice {
        let mut lat = Lattice::new();
        lat.add_sequence("MEBT", 0.0).unwrap();
        lat.add_sequence("DTL", 10.0).unwrap();
        lat
    }

    #[test]
    fn test_absolute_position_includes_offset() {
        let mut lat = two_sequences();
        let b = lat.add_bpm("DTL_BPM1", "DTL", 1.5).unwrap();
        assert!((lat.bpm_position(b).unwrap() - 11.5).abs() < 1e-12);
        assert!((lat.bpm(b).unwrap().local_position - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_unknown_sequence_rejected() {
        let mut lat = two_sequences();
        assert!(matches!(
            lat.add_bpm("X", "CCL", 0.0),
            Err(CorrectionError::Lookup(_))
        ));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut lat = two_sequences();
        lat.add_corrector("DCH1", Plane::Horizontal, "MEBT", 1.0)
            .unwrap();
        assert!(lat
            .add_corrector("DCH1", Plane::Horizontal, "MEBT", 2.0)
            .is_err());
        assert!(lat.add_sequence("MEBT", 5.0).is_err());
    }

    #[test]
    fn test_bpms_in_scope_sorted() {
        let mut lat = two_sequences();
        let late = lat.add_bpm("DTL_BPM1", "DTL", 0.5).unwrap();
        let mid = lat.add_bpm("MEBT_BPM2", "MEBT", 3.0).unwrap();
        let early = lat.add_bpm("MEBT_BPM1", "MEBT", 1.0).unwrap();
        assert_eq!(lat.bpms_in(&SequenceScope::All), vec![early, mid, late]);
        assert_eq!(
            lat.bpms_in(&SequenceScope::Sequence("MEBT".into())),
            vec![early, mid]
        );
    }

    #[test]
    fn test_correctors_filtered_by_plane() {
        let mut lat = two_sequences();
        let h = lat
            .add_corrector("DCH1", Plane::Horizontal, "MEBT", 1.0)
            .unwrap();
        let v = lat
            .add_corrector("DCV1", Plane::Vertical, "MEBT", 1.2)
            .unwrap();
        assert_eq!(
            lat.correctors_in(&SequenceScope::All, Plane::Horizontal),
            vec![h]
        );
        assert_eq!(
            lat.correctors_in(&SequenceScope::All, Plane::Vertical),
            vec![v]
        );
    }

    #[test]
    fn test_lookup_by_name_and_handle() {
        let mut lat = two_sequences();
        let b = lat.add_bpm("MEBT_BPM1", "MEBT", 1.0).unwrap();
        assert_eq!(lat.find_bpm("MEBT_BPM1"), Some(b));
        assert_eq!(lat.find_bpm("nope"), None);
        assert!(lat.bpm(BpmId(42)).is_err());
        assert!(lat.corrector(CorrectorId(0)).is_err());
    }
}
