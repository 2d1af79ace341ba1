// ─────────────────────────────────────────────────────────────────────
// Orbit Correction Kernel — Device Proxy Contract
// ─────────────────────────────────────────────────────────────────────
//! Traits the engines drive. Real hardware, a control-system bridge or
//! the in-memory `LinearMachine` all sit behind `DeviceProxy`; the lattice
//! simulation engine sits behind `Simulator`.

use std::collections::HashMap;

use orbitcorr_types::{BpmId, CorrectionResult, CorrectorId, LatticeNode, Plane};

/// Live access to steering correctors and BPMs.
pub trait DeviceProxy: Send {
    /// Live field of a corrector.
    fn field(&self, id: CorrectorId) -> CorrectionResult<f64>;

    fn set_field(&mut self, id: CorrectorId, value: f64) -> CorrectionResult<()>;

    /// Design (nominal) field, used by design-synchronised simulation.
    fn design_field(&self, id: CorrectorId) -> CorrectionResult<f64>;

    fn set_design_field(&mut self, id: CorrectorId, value: f64) -> CorrectionResult<()>;

    /// Averaged horizontal position (mm).
    fn bpm_x_avg(&self, id: BpmId) -> CorrectionResult<f64>;

    /// Averaged vertical position (mm).
    fn bpm_y_avg(&self, id: BpmId) -> CorrectionResult<f64>;

    fn bpm_avg(&self, id: BpmId, plane: Plane) -> CorrectionResult<f64> {
        match plane {
            Plane::Horizontal => self.bpm_x_avg(id),
            Plane::Vertical => self.bpm_y_avg(id),
        }
    }
}

/// Black-box lattice simulation, always run in design synchronisation:
/// only design fields from `design` are consulted, never live state.
pub trait Simulator: Send {
    /// Simulated transverse position (m) at each requested BPM.
    fn run_trajectory_simulation(
        &mut self,
        design: &dyn DeviceProxy,
        bpms: &[BpmId],
        plane: Plane,
    ) -> CorrectionResult<HashMap<BpmId, f64>>;

    /// Betatron phase `(phase_x, phase_y)` at each requested node.
    fn run_twiss_simulation(
        &mut self,
        design: &dyn DeviceProxy,
        nodes: &[LatticeNode],
    ) -> CorrectionResult<HashMap<LatticeNode, (f64, f64)>>;
}
