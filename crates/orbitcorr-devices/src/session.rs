// ─────────────────────────────────────────────────────────────────────
// Orbit Correction Kernel — Device Session
// ─────────────────────────────────────────────────────────────────────
//! Explicit owner of one device group's mutable state. Engines never
//! touch hardware directly; they borrow a `Scan` for the duration of a
//! measurement or calibration.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use orbitcorr_types::{
    BpmId, CorrectionError, CorrectionResult, CorrectorId, LatticeNode, Plane,
};

use crate::lattice::Lattice;
use crate::proxy::{DeviceProxy, Simulator};
use crate::settle::Settle;

struct DeviceGroup {
    proxy: Box<dyn DeviceProxy>,
    simulator: Option<Box<dyn Simulator>>,
}

/// Devices, simulator and settling strategy for one device group.
///
/// Thread-safe: the group is guarded by a `parking_lot::Mutex` and at most
/// one `Scan` can exist at a time.
pub struct DeviceSession {
    name: String,
    lattice: Arc<Lattice>,
    group: Mutex<DeviceGroup>,
    settle: Arc<dyn Settle>,
}

impl DeviceSession {
    pub fn new(
        name: impl Into<String>,
        lattice: Arc<Lattice>,
        proxy: Box<dyn DeviceProxy>,
        settle: Arc<dyn Settle>,
    ) -> Self {
        Self {
            name: name.into(),
            lattice,
            group: Mutex::new(DeviceGroup {
                proxy,
                simulator: None,
            }),
            settle,
        }
    }

    /// Attach the lattice simulation engine.
    pub fn with_simulator(mut self, simulator: Box<dyn Simulator>) -> Self {
        self.group.get_mut().simulator = Some(simulator);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lattice(&self) -> &Arc<Lattice> {
        &self.lattice
    }

    /// Take exclusive use of the device group.
    ///
    /// Fails with `Busy` if another scan is running.
    pub fn begin_scan(&self) -> CorrectionResult<Scan<'_>> {
        let group = self.group.try_lock().ok_or_else(|| {
            CorrectionError::Busy(format!("a scan is already running on {}", self.name))
        })?;
        Ok(Scan {
            lattice: &self.lattice,
            group,
            settle: self.settle.as_ref(),
        })
    }
}

/// Exclusive access to a device group, released on drop.
pub struct Scan<'a> {
    lattice: &'a Lattice,
    group: MutexGuard<'a, DeviceGroup>,
    settle: &'a dyn Settle,
}

impl Scan<'_> {
    pub fn lattice(&self) -> &Lattice {
        self.lattice
    }

    pub fn field(&self, id: CorrectorId) -> CorrectionResult<f64> {
        self.group.proxy.field(id)
    }

    pub fn set_field(&mut self, id: CorrectorId, value: f64) -> CorrectionResult<()> {
        self.group.proxy.set_field(id, value)
    }

    pub fn design_field(&self, id: CorrectorId) -> CorrectionResult<f64> {
        self.group.proxy.design_field(id)
    }

    pub fn set_design_field(&mut self, id: CorrectorId, value: f64) -> CorrectionResult<()> {
        self.group.proxy.set_design_field(id, value)
    }

    pub fn read_bpm(&self, id: BpmId, plane: Plane) -> CorrectionResult<f64> {
        self.group.proxy.bpm_avg(id, plane)
    }

    /// Block until the machine has settled after a field change.
    pub fn settle(&self) {
        self.settle.settle();
    }

    pub fn has_simulator(&self) -> bool {
        self.group.simulator.is_some()
    }

    /// Design-synchronised trajectory simulation (positions in m).
    ///
    /// A BPM missing from the simulator's answer is an acquisition failure.
    pub fn simulate_trajectory(
        &mut self,
        bpms: &[BpmId],
        plane: Plane,
    ) -> CorrectionResult<HashMap<BpmId, f64>> {
        let group = &mut *self.group;
        let simulator = group.simulator.as_mut().ok_or_else(|| {
            CorrectionError::Configuration("no simulator attached to session".into())
        })?;
        let result = simulator.run_trajectory_simulation(group.proxy.as_ref(), bpms, plane)?;
        for &bpm in bpms {
            match result.get(&bpm) {
                Some(v) if v.is_finite() => {}
                Some(_) => {
                    return Err(CorrectionError::Acquisition(format!(
                        "simulation returned a non-finite {plane} position for {}",
                        self.lattice.bpm(bpm)?.name
                    )))
                }
                None => {
                    return Err(CorrectionError::Acquisition(format!(
                        "simulation returned no {plane} position for {}",
                        self.lattice.bpm(bpm)?.name
                    )))
                }
            }
        }
        Ok(result)
    }

    /// Design-synchronised twiss simulation: `(phase_x, phase_y)` per node.
    pub fn simulate_twiss(
        &mut self,
        nodes: &[LatticeNode],
    ) -> CorrectionResult<HashMap<LatticeNode, (f64, f64)>> {
        let group = &mut *self.group;
        let simulator = group.simulator.as_mut().ok_or_else(|| {
            CorrectionError::Configuration("no simulator attached to session".into())
        })?;
        let result = simulator.run_twiss_simulation(group.proxy.as_ref(), nodes)?;
        if let Some(missing) = nodes.iter().find(|n| !result.contains_key(n)) {
            return Err(CorrectionError::Acquisition(format!(
                "twiss simulation returned no phase for {missing:?}"
            )));
        }
        Ok(result)
    }
}
