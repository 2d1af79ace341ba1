// ─────────────────────────────────────────────────────────────────────
// Orbit Correction Kernel — Pairing Engine (1-to-1 correction)
// ─────────────────────────────────────────────────────────────────────
//! Local correction: every BPM is driven by one corrector upstream of it.
//!
//! Each pair carries a linear calibration `Δposition = offset + slope · Δk`
//! fitted from a symmetric two-point perturbation, and the kick for a
//! displacement is
//!
//!   kick = -((measured - target) - offset) / slope
//!
//! Tables are parallel arrays indexed by `BpmId`, one set per plane.

use orbitcorr_devices::{Lattice, Scan};
use orbitcorr_types::config::SIMULATION_POSITION_SCALE;
use orbitcorr_types::{
    BpmId, CorrectionError, CorrectionResult, CorrectorId, LatticeNode, Plane, SequenceScope,
};
use serde::{Deserialize, Serialize};

use crate::control::ScanControl;
use crate::knobs::{bpm_windows, first_in_window, plane_candidates};
use crate::svd::{apply_fields, finish_step};
use crate::trajectory::TrajectoryStore;

/// Local linear response of one BPM/corrector pair.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Calibration {
    pub offset: f64,
    pub slope: f64,
}

impl Calibration {
    pub fn is_usable(&self) -> bool {
        self.slope != 0.0 && self.slope.is_finite() && self.offset.is_finite()
    }
}

/// Where calibration samples come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationSource {
    /// Live fields and BPM readings, with settling.
    Live,
    /// Design fields and the simulator, no settling.
    Simulated,
}

/// Upstream corrector offered to a pairing editor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairCandidate {
    pub corrector: CorrectorId,
    /// Beamline distance from the corrector to the BPM.
    pub distance: f64,
    /// Betatron phase advance from the corrector to the BPM in the pair's plane.
    pub phase_advance: f64,
}

/// Result of one 1-to-1 correction step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedKick {
    pub bpm: BpmId,
    pub corrector: CorrectorId,
    pub kick: f64,
    pub new_field: f64,
}

#[derive(Debug, Clone)]
struct PlanePairs {
    corrector: Vec<Option<CorrectorId>>,
    calibration: Vec<Option<Calibration>>,
}

impl PlanePairs {
    fn empty(n: usize) -> Self {
        Self {
            corrector: vec![None; n],
            calibration: vec![None; n],
        }
    }
}

/// BPM→corrector pairing and per-pair calibration for both planes.
#[derive(Debug, Clone)]
pub struct PairingEngine {
    bpms: Vec<BpmId>,
    planes: [PlanePairs; 2],
}

/// Least-squares line through `(Δk, Δposition)` samples.
///
/// A fit with no spread in Δk or with zero slope is rejected.
pub fn linear_fit(samples: &[(f64, f64)]) -> CorrectionResult<Calibration> {
    let n = samples.len() as f64;
    let (sx, sy, sxx, sxy) = samples.iter().fold(
        (0.0, 0.0, 0.0, 0.0),
        |(sx, sy, sxx, sxy), &(x, y)| (sx + x, sy + y, sxx + x * x, sxy + x * y),
    );
    let denom = n * sxx - sx * sx;
    if samples.len() < 2 || denom == 0.0 || !denom.is_finite() {
        return Err(CorrectionError::Calibration(format!(
            "degenerate fit over {} samples",
            samples.len()
        )));
    }
    let slope = (n * sxy - sx * sy) / denom;
    let offset = (sy - slope * sx) / n;
    let fit = Calibration { offset, slope };
    if !fit.is_usable() {
        return Err(CorrectionError::Calibration(format!(
            "fit gave unusable slope {slope}"
        )));
    }
    Ok(fit)
}

impl PairingEngine {
    /// Engine over `bpms` with no pairs yet.
    pub fn empty(lattice: &Lattice, bpms: &[BpmId]) -> Self {
        let n = lattice.bpm_count();
        Self {
            bpms: bpms.to_vec(),
            planes: [PlanePairs::empty(n), PlanePairs::empty(n)],
        }
    }

    /// Pair every BPM with the first candidate corrector found in its window.
    ///
    /// Candidates are scanned in the order given (an empty list means all
    /// correctors of the plane); the first match wins, not the nearest.
    /// Every new pair starts with a zeroed calibration.
    pub fn set_pairs(
        lattice: &Lattice,
        bpms: &[BpmId],
        h_candidates: &[CorrectorId],
        v_candidates: &[CorrectorId],
        scope: &SequenceScope,
    ) -> CorrectionResult<Self> {
        if bpms.is_empty() {
            return Err(CorrectionError::Configuration(
                "pairing needs at least one BPM".into(),
            ));
        }
        let windows = bpm_windows(lattice, bpms, scope)?;
        let mut engine = Self::empty(lattice, bpms);
        for (plane, candidates) in [
            (Plane::Horizontal, h_candidates),
            (Plane::Vertical, v_candidates),
        ] {
            let candidates = plane_candidates(lattice, candidates, plane)?;
            let table = &mut engine.planes[plane.index()];
            let mut paired = 0;
            for (window, &bpm) in windows.iter().zip(bpms) {
                if let Some(c) = first_in_window(lattice, window, &candidates)? {
                    table.corrector[bpm.index()] = Some(c);
                    table.calibration[bpm.index()] = Some(Calibration::default());
                    paired += 1;
                }
            }
            log::info!("{plane}: paired {paired} of {} BPMs", bpms.len());
        }
        Ok(engine)
    }

    pub fn bpms(&self) -> &[BpmId] {
        &self.bpms
    }

    pub fn corrector_for(&self, bpm: BpmId, plane: Plane) -> Option<CorrectorId> {
        self.planes[plane.index()]
            .corrector
            .get(bpm.index())
            .copied()
            .flatten()
    }

    pub fn calibration(&self, bpm: BpmId, plane: Plane) -> Option<Calibration> {
        self.planes[plane.index()]
            .calibration
            .get(bpm.index())
            .copied()
            .flatten()
    }

    /// Pairs of one plane in BPM-list order.
    pub fn pairs(&self, plane: Plane) -> Vec<(BpmId, CorrectorId)> {
        self.bpms
            .iter()
            .filter_map(|&b| self.corrector_for(b, plane).map(|c| (b, c)))
            .collect()
    }

    fn paired(&self, bpm: BpmId, plane: Plane) -> CorrectionResult<CorrectorId> {
        self.corrector_for(bpm, plane).ok_or_else(|| {
            CorrectionError::Lookup(format!("BPM {} has no {plane} pair", bpm.0))
        })
    }

    /// Replace one plane's pairing wholesale, e.g. from a pairing editor.
    ///
    /// Pairs that keep their corrector keep their calibration; new pairs
    /// start zeroed.
    pub fn replace_pairs(
        &mut self,
        lattice: &Lattice,
        plane: Plane,
        pairs: &[(BpmId, CorrectorId)],
    ) -> CorrectionResult<()> {
        let n = self.planes[plane.index()].corrector.len();
        let mut table = PlanePairs::empty(n);
        for &(bpm, corrector) in pairs {
            lattice.bpm(bpm)?;
            if !self.bpms.contains(&bpm) || bpm.index() >= n {
                return Err(CorrectionError::Configuration(format!(
                    "BPM {} is not part of this pairing",
                    bpm.0
                )));
            }
            let info = lattice.corrector(corrector)?;
            if info.plane != plane {
                return Err(CorrectionError::Configuration(format!(
                    "{} is a {} corrector, cannot pair it in {plane}",
                    info.name, info.plane
                )));
            }
            if table.corrector[bpm.index()].is_some() {
                return Err(CorrectionError::Configuration(format!(
                    "BPM {} paired twice in {plane}",
                    bpm.0
                )));
            }
            table.corrector[bpm.index()] = Some(corrector);
            table.calibration[bpm.index()] = match self.corrector_for(bpm, plane) {
                Some(old) if old == corrector => self.calibration(bpm, plane),
                _ => Some(Calibration::default()),
            };
        }
        self.planes[plane.index()] = table;
        Ok(())
    }

    /// Overwrite the calibration of an existing pair.
    pub fn set_calibration(
        &mut self,
        bpm: BpmId,
        plane: Plane,
        calibration: Calibration,
    ) -> CorrectionResult<()> {
        self.paired(bpm, plane)?;
        self.planes[plane.index()].calibration[bpm.index()] = Some(calibration);
        Ok(())
    }

    /// Fit `[offset, slope]` for one pair from `(0,0)`, `(+Δk, Δpos₊)`, `(-Δk, Δpos₋)`.
    ///
    /// The corrector is restored afterwards whether or not the fit succeeds;
    /// the stored calibration only changes on success.
    pub fn calibrate_pair(
        &mut self,
        scan: &mut Scan<'_>,
        bpm: BpmId,
        plane: Plane,
        kick: f64,
        source: CalibrationSource,
    ) -> CorrectionResult<Calibration> {
        let corrector = self.paired(bpm, plane)?;
        let samples = match source {
            CalibrationSource::Live => sample_live(scan, bpm, corrector, plane, kick)?,
            CalibrationSource::Simulated => sample_simulated(scan, bpm, corrector, plane, kick)?,
        };
        let fit = linear_fit(&samples)?;
        self.planes[plane.index()].calibration[bpm.index()] = Some(fit);
        log::debug!(
            "{plane} pair BPM {} / corrector {}: offset {:.6}, slope {:.6}",
            bpm.0,
            corrector.0,
            fit.offset,
            fit.slope
        );
        Ok(fit)
    }

    /// Calibrate every pair of a plane, committing only if all succeed.
    pub fn calibrate_all(
        &mut self,
        scan: &mut Scan<'_>,
        plane: Plane,
        kick: f64,
        source: CalibrationSource,
        control: &ScanControl,
    ) -> CorrectionResult<()> {
        let pairs = self.pairs(plane);
        let total = pairs.len();
        log::info!("calibrating {total} {plane} pairs ({source:?}), Δk = {kick}");
        control.report(0, total);

        let mut staged = self.clone();
        for (done, &(bpm, _)) in pairs.iter().enumerate() {
            control.checkpoint()?;
            staged.calibrate_pair(scan, bpm, plane, kick, source)?;
            control.report(done + 1, total);
        }
        self.planes[plane.index()] = staged.planes[plane.index()].clone();
        log::info!("{plane} calibration complete");
        Ok(())
    }

    /// Kick that moves `bpm` from `measured` to `target`.
    pub fn compute_kick(
        &self,
        bpm: BpmId,
        plane: Plane,
        measured: f64,
        target: f64,
    ) -> CorrectionResult<f64> {
        self.paired(bpm, plane)?;
        let cal = self.calibration(bpm, plane).ok_or_else(|| {
            CorrectionError::Calibration(format!("BPM {} has no {plane} calibration", bpm.0))
        })?;
        if !cal.is_usable() {
            return Err(CorrectionError::Calibration(format!(
                "BPM {} {plane} pair has slope {}, calibrate it first",
                bpm.0, cal.slope
            )));
        }
        Ok(-((measured - target) - cal.offset) / cal.slope)
    }

    /// Apply 1-to-1 kicks to every pair of a plane.
    ///
    /// `measured` is each BPM's current sample, `target` its reference (0
    /// without one). All kicks are computed before any field is written.
    /// Kicks for BPMs sharing a corrector accumulate on that corrector, and
    /// each `new_field` is the staged value after its own kick. A failed
    /// write rolls the plane back to the fields read before the pass.
    pub fn correct_plane(
        &self,
        scan: &mut Scan<'_>,
        store: &TrajectoryStore,
        plane: Plane,
        factor: f64,
    ) -> CorrectionResult<Vec<AppliedKick>> {
        let mut applied = Vec::new();
        // (corrector, original, staged) in first-seen order.
        let mut updates: Vec<(CorrectorId, f64, f64)> = Vec::new();
        for (bpm, corrector) in self.pairs(plane) {
            let measured = store
                .current(bpm)
                .ok_or_else(|| {
                    CorrectionError::Lookup(format!("no current sample for BPM {}", bpm.0))
                })?
                .get(plane);
            let target = store.reference(bpm).map_or(0.0, |s| s.get(plane));
            let kick = self.compute_kick(bpm, plane, measured, target)?;
            let slot = match updates.iter().position(|&(c, _, _)| c == corrector) {
                Some(i) => i,
                None => {
                    let original = scan.field(corrector)?;
                    updates.push((corrector, original, original));
                    updates.len() - 1
                }
            };
            updates[slot].2 += factor * kick;
            applied.push(AppliedKick {
                bpm,
                corrector,
                kick,
                new_field: updates[slot].2,
            });
        }
        apply_fields(scan, &updates)?;
        log::info!(
            "applied {} {plane} 1-to-1 kicks on {} correctors (factor {factor})",
            applied.len(),
            updates.len()
        );
        Ok(applied)
    }

    /// Upstream correctors of `plane` that could drive `bpm`, nearest first,
    /// annotated with phase advance from the twiss simulation.
    pub fn candidate_correctors(
        scan: &mut Scan<'_>,
        bpm: BpmId,
        plane: Plane,
        candidates: &[CorrectorId],
    ) -> CorrectionResult<Vec<PairCandidate>> {
        let bpm_position = scan.lattice().bpm_position(bpm)?;
        let candidates = plane_candidates(scan.lattice(), candidates, plane)?;
        let mut upstream = Vec::new();
        for c in candidates {
            let s = scan.lattice().corrector_position(c)?;
            if s <= bpm_position {
                upstream.push((c, bpm_position - s));
            }
        }
        if upstream.is_empty() {
            return Ok(Vec::new());
        }

        let mut nodes = vec![LatticeNode::Bpm(bpm)];
        nodes.extend(upstream.iter().map(|&(c, _)| LatticeNode::Corrector(c)));
        let phases = scan.simulate_twiss(&nodes)?;
        let pick = |(x, y): (f64, f64)| match plane {
            Plane::Horizontal => x,
            Plane::Vertical => y,
        };
        let bpm_phase = pick(phases[&LatticeNode::Bpm(bpm)]);

        let mut out: Vec<PairCandidate> = upstream
            .into_iter()
            .map(|(corrector, distance)| PairCandidate {
                corrector,
                distance,
                phase_advance: bpm_phase - pick(phases[&LatticeNode::Corrector(corrector)]),
            })
            .collect();
        out.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        Ok(out)
    }
}

fn sample_live(
    scan: &mut Scan<'_>,
    bpm: BpmId,
    corrector: CorrectorId,
    plane: Plane,
    kick: f64,
) -> CorrectionResult<Vec<(f64, f64)>> {
    let base = scan.read_bpm(bpm, plane)?;
    let original = scan.field(corrector)?;

    let samples = (|| -> CorrectionResult<Vec<(f64, f64)>> {
        scan.set_field(corrector, original + kick)?;
        scan.settle();
        let plus = scan.read_bpm(bpm, plane)? - base;
        scan.set_field(corrector, original - kick)?;
        scan.settle();
        let minus = scan.read_bpm(bpm, plane)? - base;
        Ok(vec![(0.0, 0.0), (kick, plus), (-kick, minus)])
    })();
    let restored = scan.set_field(corrector, original);
    scan.settle();
    finish_step(samples, restored, scan.lattice(), corrector)
}

fn simulated_position(scan: &mut Scan<'_>, bpm: BpmId, plane: Plane) -> CorrectionResult<f64> {
    let map = scan.simulate_trajectory(&[bpm], plane)?;
    Ok(SIMULATION_POSITION_SCALE * map[&bpm])
}

fn sample_simulated(
    scan: &mut Scan<'_>,
    bpm: BpmId,
    corrector: CorrectorId,
    plane: Plane,
    kick: f64,
) -> CorrectionResult<Vec<(f64, f64)>> {
    let base = simulated_position(scan, bpm, plane)?;
    let design = scan.design_field(corrector)?;

    let samples = (|| -> CorrectionResult<Vec<(f64, f64)>> {
        scan.set_design_field(corrector, design + kick)?;
        let plus = simulated_position(scan, bpm, plane)? - base;
        scan.set_design_field(corrector, design - kick)?;
        let minus = simulated_position(scan, bpm, plane)? - base;
        Ok(vec![(0.0, 0.0), (kick, plus), (-kick, minus)])
    })();
    let restored = scan.set_design_field(corrector, design);
    finish_step(samples, restored, scan.lattice(), corrector)
}
