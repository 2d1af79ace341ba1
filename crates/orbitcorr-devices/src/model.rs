// ─────────────────────────────────────────────────────────────────────
// Orbit Correction Kernel — Linear Machine Model
// ─────────────────────────────────────────────────────────────────────
//! In-memory stand-ins for the machine and the lattice simulation engine.
//!
//! Both share a `LinearModel`: BPM displacement (m) is a fixed linear
//! combination of corrector fields. The machine reports mm, the simulator
//! metres, which is exactly the unit gap the simulated response path
//! bridges with its ×1000 factor.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nalgebra::DMatrix;

use orbitcorr_types::{
    BpmId, CorrectionError, CorrectionResult, CorrectorId, LatticeNode, Plane,
};

use crate::lattice::Lattice;
use crate::proxy::{DeviceProxy, Simulator};

/// BPM-by-corrector response coefficients (m per field unit), one matrix per plane.
#[derive(Debug, Clone)]
pub struct LinearModel {
    planes: [DMatrix<f64>; 2],
    /// Phase advance per metre, `(x, y)`.
    phase_rate: (f64, f64),
}

impl LinearModel {
    /// Drift-like optics: a corrector moves every downstream BPM in its
    /// plane by `gain · distance` per unit field.
    pub fn drift(lattice: &Lattice, gain: f64) -> Self {
        let (nb, nc) = (lattice.bpm_count(), lattice.corrector_count());
        let mut planes = [DMatrix::zeros(nb, nc), DMatrix::zeros(nb, nc)];
        for b in 0..nb {
            let Ok(bpm) = lattice.bpm(BpmId(b)) else {
                continue;
            };
            for c in 0..nc {
                let Ok(cor) = lattice.corrector(CorrectorId(c)) else {
                    continue;
                };
                if cor.position < bpm.position {
                    planes[cor.plane.index()][(b, c)] = gain * (bpm.position - cor.position);
                }
            }
        }
        Self {
            planes,
            phase_rate: (1.0, 1.0),
        }
    }

    /// Explicit coefficients; both matrices must be `bpm_count × corrector_count`.
    pub fn from_matrices(horizontal: DMatrix<f64>, vertical: DMatrix<f64>) -> CorrectionResult<Self> {
        if horizontal.shape() != vertical.shape() {
            return Err(CorrectionError::Configuration(format!(
                "plane matrices differ in shape: {:?} vs {:?}",
                horizontal.shape(),
                vertical.shape()
            )));
        }
        Ok(Self {
            planes: [horizontal, vertical],
            phase_rate: (1.0, 1.0),
        })
    }

    pub fn with_phase_rates(mut self, rate_x: f64, rate_y: f64) -> Self {
        self.phase_rate = (rate_x, rate_y);
        self
    }

    pub fn bpm_count(&self) -> usize {
        self.planes[0].nrows()
    }

    pub fn corrector_count(&self) -> usize {
        self.planes[0].ncols()
    }

    pub fn coefficient(&self, plane: Plane, bpm: BpmId, corrector: CorrectorId) -> f64 {
        self.planes[plane.index()][(bpm.index(), corrector.index())]
    }

    /// Displacement (m) at `bpm` for the given corrector fields.
    pub fn displacement(&self, plane: Plane, bpm: BpmId, fields: &[f64]) -> f64 {
        let m = &self.planes[plane.index()];
        m.row(bpm.index())
            .iter()
            .zip(fields)
            .map(|(k, f)| k * f)
            .sum()
    }

    /// The model must be `bpm_count × corrector_count` for `lattice`.
    pub fn check_fits(&self, lattice: &Lattice) -> CorrectionResult<()> {
        let expected = (lattice.bpm_count(), lattice.corrector_count());
        if self.planes[0].shape() != expected {
            return Err(CorrectionError::Configuration(format!(
                "model is {:?} but the lattice has {} BPMs and {} correctors",
                self.planes[0].shape(),
                expected.0,
                expected.1
            )));
        }
        Ok(())
    }

    pub fn phases_at(&self, position: f64) -> (f64, f64) {
        (self.phase_rate.0 * position, self.phase_rate.1 * position)
    }
}

/// Deterministic in-memory machine implementing `DeviceProxy`.
///
/// Supports failure injection for exercising abort paths.
pub struct LinearMachine {
    model: LinearModel,
    fields: Vec<f64>,
    design: Vec<f64>,
    offsets: Vec<[f64; 2]>,
    failing_bpms: HashSet<BpmId>,
    failing_correctors: HashSet<CorrectorId>,
    read_limit: Option<usize>,
    reads: AtomicUsize,
    writes: usize,
}

impl LinearMachine {
    pub fn new(lattice: Arc<Lattice>, model: LinearModel) -> CorrectionResult<Self> {
        model.check_fits(&lattice)?;
        let nc = lattice.corrector_count();
        let nb = lattice.bpm_count();
        Ok(Self {
            model,
            fields: vec![0.0; nc],
            design: vec![0.0; nc],
            offsets: vec![[0.0; 2]; nb],
            failing_bpms: HashSet::new(),
            failing_correctors: HashSet::new(),
            read_limit: None,
            reads: AtomicUsize::new(0),
            writes: 0,
        })
    }

    /// Static beam offset (mm) seen at a BPM with all correctors at zero.
    pub fn set_offset(&mut self, bpm: BpmId, x_mm: f64, y_mm: f64) {
        if let Some(slot) = self.offsets.get_mut(bpm.index()) {
            *slot = [x_mm, y_mm];
        }
    }

    /// Every read of `bpm` fails.
    pub fn fail_bpm(&mut self, bpm: BpmId) {
        self.failing_bpms.insert(bpm);
    }

    /// Every write to `corrector` fails.
    pub fn fail_corrector(&mut self, corrector: CorrectorId) {
        self.failing_correctors.insert(corrector);
    }

    /// All BPM reads fail once `successful` reads have been served.
    pub fn fail_after_reads(&mut self, successful: usize) {
        self.read_limit = Some(successful);
    }

    /// Number of successful live field writes.
    pub fn field_writes(&self) -> usize {
        self.writes
    }

    fn slot(&self, id: CorrectorId) -> CorrectionResult<usize> {
        if id.index() < self.fields.len() {
            Ok(id.index())
        } else {
            Err(CorrectionError::Lookup(format!(
                "no corrector with handle {}",
                id.0
            )))
        }
    }

    fn read(&self, id: BpmId, plane: Plane) -> CorrectionResult<f64> {
        if id.index() >= self.offsets.len() {
            return Err(CorrectionError::Lookup(format!("no BPM with handle {}", id.0)));
        }
        if self.failing_bpms.contains(&id) {
            return Err(CorrectionError::Acquisition(format!(
                "BPM {} did not answer",
                id.0
            )));
        }
        if let Some(limit) = self.read_limit {
            if self.reads.load(Ordering::SeqCst) >= limit {
                return Err(CorrectionError::Acquisition(format!(
                    "BPM {} read timed out",
                    id.0
                )));
            }
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.offsets[id.index()][plane.index()]
            + 1000.0 * self.model.displacement(plane, id, &self.fields))
    }
}

impl DeviceProxy for LinearMachine {
    fn field(&self, id: CorrectorId) -> CorrectionResult<f64> {
        Ok(self.fields[self.slot(id)?])
    }

    fn set_field(&mut self, id: CorrectorId, value: f64) -> CorrectionResult<()> {
        let i = self.slot(id)?;
        if self.failing_correctors.contains(&id) {
            return Err(CorrectionError::Acquisition(format!(
                "corrector {} rejected set_field",
                id.0
            )));
        }
        self.fields[i] = value;
        self.writes += 1;
        Ok(())
    }

    fn design_field(&self, id: CorrectorId) -> CorrectionResult<f64> {
        Ok(self.design[self.slot(id)?])
    }

    fn set_design_field(&mut self, id: CorrectorId, value: f64) -> CorrectionResult<()> {
        let i = self.slot(id)?;
        self.design[i] = value;
        Ok(())
    }

    fn bpm_x_avg(&self, id: BpmId) -> CorrectionResult<f64> {
        self.read(id, Plane::Horizontal)
    }

    fn bpm_y_avg(&self, id: BpmId) -> CorrectionResult<f64> {
        self.read(id, Plane::Vertical)
    }
}

/// Simulation engine backed by a `LinearModel` and the design fields.
pub struct LinearModelSimulator {
    lattice: Arc<Lattice>,
    model: LinearModel,
    dropped: HashSet<BpmId>,
}

impl LinearModelSimulator {
    pub fn new(lattice: Arc<Lattice>, model: LinearModel) -> CorrectionResult<Self> {
        model.check_fits(&lattice)?;
        Ok(Self {
            lattice,
            model,
            dropped: HashSet::new(),
        })
    }

    /// Omit `bpm` from every trajectory result.
    pub fn drop_bpm(&mut self, bpm: BpmId) {
        self.dropped.insert(bpm);
    }
}

impl Simulator for LinearModelSimulator {
    fn run_trajectory_simulation(
        &mut self,
        design: &dyn DeviceProxy,
        bpms: &[BpmId],
        plane: Plane,
    ) -> CorrectionResult<HashMap<BpmId, f64>> {
        let fields = (0..self.model.corrector_count())
            .map(|c| design.design_field(CorrectorId(c)))
            .collect::<CorrectionResult<Vec<f64>>>()?;
        let mut out = HashMap::with_capacity(bpms.len());
        for &bpm in bpms {
            if bpm.index() >= self.model.bpm_count() {
                return Err(CorrectionError::Lookup(format!(
                    "no BPM with handle {}",
                    bpm.0
                )));
            }
            if self.dropped.contains(&bpm) {
                log::warn!("simulation produced no result for BPM {}", bpm.0);
                continue;
            }
            out.insert(bpm, self.model.displacement(plane, bpm, &fields));
        }
        Ok(out)
    }

    fn run_twiss_simulation(
        &mut self,
        _design: &dyn DeviceProxy,
        nodes: &[LatticeNode],
    ) -> CorrectionResult<HashMap<LatticeNode, (f64, f64)>> {
        let mut out = HashMap::with_capacity(nodes.len());
        for &node in nodes {
            let position = match node {
                LatticeNode::Bpm(b) => self.lattice.bpm_position(b)?,
                LatticeNode::Corrector(c) => self.lattice.corrector_position(c)?,
            };
            out.insert(node, self.model.phases_at(position));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lattice() -> Arc<Lattice> {
        let mut lat = Lattice::new();
        lat.add_sequence("LINAC", 0.0).unwrap();
        lat.add_corrector("DCH1", Plane::Horizontal, "LINAC", 0.5)
            .unwrap();
        lat.add_corrector("DCV1", Plane::Vertical, "LINAC", 0.6)
            .unwrap();
        lat.add_bpm("BPM1", "LINAC", 0.2).unwrap();
        lat.add_bpm("BPM2", "LINAC", 1.5).unwrap();
        Arc::new(lat)
    }

    #[test]
    fn test_drift_model_only_downstream() {
        let lat = lattice();
        let m = LinearModel::drift(&lat, 2.0);
        assert_eq!(
            m.coefficient(Plane::Horizontal, BpmId(0), CorrectorId(0)),
            0.0
        );
        assert!((m.coefficient(Plane::Horizontal, BpmId(1), CorrectorId(0)) - 2.0).abs() < 1e-12);
        assert!((m.coefficient(Plane::Vertical, BpmId(1), CorrectorId(1)) - 1.8).abs() < 1e-12);
        // A vertical corrector never shows up in the horizontal plane.
        assert_eq!(
            m.coefficient(Plane::Horizontal, BpmId(1), CorrectorId(1)),
            0.0
        );
    }

    #[test]
    fn test_machine_reads_mm() {
        let lat = lattice();
        let mut machine = LinearMachine::new(lat.clone(), LinearModel::drift(&lat, 1.0)).unwrap();
        machine.set_offset(BpmId(1), 0.5, -0.5);
        machine.set_field(CorrectorId(0), 0.001).unwrap();
        // 0.5 mm offset + 1000 * (1.0 m/unit * 0.001 unit)
        assert!((machine.bpm_x_avg(BpmId(1)).unwrap() - 1.5).abs() < 1e-9);
        assert!((machine.bpm_y_avg(BpmId(1)).unwrap() + 0.5).abs() < 1e-9);
        assert_eq!(machine.field_writes(), 1);
    }

    #[test]
    fn test_failure_injection() {
        let lat = lattice();
        let mut machine = LinearMachine::new(lat.clone(), LinearModel::drift(&lat, 1.0)).unwrap();
        machine.fail_bpm(BpmId(0));
        machine.fail_corrector(CorrectorId(1));
        assert!(matches!(
            machine.bpm_x_avg(BpmId(0)),
            Err(CorrectionError::Acquisition(_))
        ));
        assert!(machine.bpm_x_avg(BpmId(1)).is_ok());
        assert!(machine.set_field(CorrectorId(1), 1.0).is_err());
        assert!(machine.set_field(CorrectorId(0), 1.0).is_ok());
    }

    #[test]
    fn test_read_limit() {
        let lat = lattice();
        let mut machine = LinearMachine::new(lat.clone(), LinearModel::drift(&lat, 1.0)).unwrap();
        machine.fail_after_reads(2);
        assert!(machine.bpm_x_avg(BpmId(0)).is_ok());
        assert!(machine.bpm_y_avg(BpmId(0)).is_ok());
        assert!(machine.bpm_x_avg(BpmId(1)).is_err());
    }

    #[test]
    fn test_simulator_uses_design_fields_only() {
        let lat = lattice();
        let model = LinearModel::drift(&lat, 1.0);
        let mut machine = LinearMachine::new(lat.clone(), model.clone()).unwrap();
        let mut sim = LinearModelSimulator::new(lat.clone(), model).unwrap();
        machine.set_field(CorrectorId(0), 5.0).unwrap();
        machine.set_design_field(CorrectorId(0), 0.002).unwrap();
        let out = sim
            .run_trajectory_simulation(&machine, &[BpmId(1)], Plane::Horizontal)
            .unwrap();
        assert!((out[&BpmId(1)] - 0.002).abs() < 1e-12);
    }

    #[test]
    fn test_twiss_phases_scale_with_position() {
        let lat = lattice();
        let model = LinearModel::drift(&lat, 1.0).with_phase_rates(2.0, 3.0);
        let machine = LinearMachine::new(lat.clone(), model.clone()).unwrap();
        let mut sim = LinearModelSimulator::new(lat.clone(), model).unwrap();
        let out = sim
            .run_twiss_simulation(&machine, &[LatticeNode::Bpm(BpmId(1))])
            .unwrap();
        let (px, py) = out[&LatticeNode::Bpm(BpmId(1))];
        assert!((px - 3.0).abs() < 1e-12);
        assert!((py - 4.5).abs() < 1e-12);
    }

    #[test]
    fn test_from_matrices_shape_mismatch() {
        let h = DMatrix::<f64>::identity(2, 2);
        let v = DMatrix::<f64>::zeros(2, 3);
        assert!(LinearModel::from_matrices(h, v).is_err());
    }

    #[test]
    fn test_model_must_fit_lattice() {
        let lat = lattice();
        let model = LinearModel::from_matrices(DMatrix::zeros(3, 3), DMatrix::zeros(3, 3)).unwrap();
        assert!(matches!(
            LinearMachine::new(lat.clone(), model.clone()),
            Err(CorrectionError::Configuration(_))
        ));
        assert!(matches!(
            LinearModelSimulator::new(lat.clone(), model),
            Err(CorrectionError::Configuration(_))
        ));
        assert!(LinearModel::drift(&lat, 1.0).check_fits(&lat).is_ok());
    }
}
