// ─────────────────────────────────────────────────────────────────────
// Orbit Correction Kernel — Response Matrix Engine (SVD correction)
// ─────────────────────────────────────────────────────────────────────
//! Global trajectory correction.
//!
//! `TRM[row][col] = ΔBPM_row / ΔField_col`, one matrix per plane. The
//! correction is `kicks = -pinv(TRM) · e`, where `pinv` is the
//! Moore–Penrose pseudo-inverse with singular values below an absolute
//! cutoff discarded, and `e` is the differential trajectory in BPM order.

use nalgebra::{DMatrix, DVector};

use orbitcorr_devices::{Lattice, Scan};
use orbitcorr_types::config::SIMULATION_POSITION_SCALE;
use orbitcorr_types::{
    BpmId, CorrectionError, CorrectionResult, CorrectorId, MatrixRecord, Plane, SequenceScope,
};
use serde::{Deserialize, Serialize};

use crate::control::ScanControl;
use crate::knobs::{bpm_windows, correctors_in_windows, plane_candidates};
use crate::trajectory::TrajectoryStore;

/// Corrector kicks for one plane, in corrector-list order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KickSet {
    pub plane: Plane,
    pub correctors: Vec<CorrectorId>,
    pub kicks: Vec<f64>,
}

#[derive(Debug, Clone)]
struct PlaneResponse {
    correctors: Vec<CorrectorId>,
    // Recorded explicitly so a stored matrix can be checked against them.
    rows: usize,
    cols: usize,
    matrix: DMatrix<f64>,
    built: bool,
}

impl PlaneResponse {
    fn new(rows: usize, correctors: Vec<CorrectorId>) -> Self {
        let cols = correctors.len();
        Self {
            correctors,
            rows,
            cols,
            matrix: DMatrix::zeros(rows, cols),
            built: false,
        }
    }
}

/// BPM list, per-plane corrector lists and response matrices, plus the
/// singular-value cutoff, for one correction block.
#[derive(Debug, Clone)]
pub struct ResponseMatrixEngine {
    bpms: Vec<BpmId>,
    planes: [PlaneResponse; 2],
    cutoff: f64,
}

/// Truncated Moore–Penrose pseudo-inverse.
///
/// Singular values below `cutoff` (absolute) and exact zeros are dropped.
/// A matrix with more columns than rows is transposed first and the
/// result transposed back.
pub fn truncated_pseudo_inverse(m: &DMatrix<f64>, cutoff: f64) -> CorrectionResult<DMatrix<f64>> {
    if m.nrows() == 0 || m.ncols() == 0 {
        return Err(CorrectionError::Configuration(
            "cannot invert an empty response matrix".into(),
        ));
    }
    if m.iter().any(|v| !v.is_finite()) {
        return Err(CorrectionError::Configuration(
            "response matrix contains NaN or Inf".into(),
        ));
    }
    let transposed = m.ncols() > m.nrows();
    let a = if transposed { m.transpose() } else { m.clone() };

    let svd = a.svd(true, true);
    let u = svd
        .u
        .as_ref()
        .ok_or_else(|| CorrectionError::Configuration("SVD produced no U".into()))?;
    let v_t = svd
        .v_t
        .as_ref()
        .ok_or_else(|| CorrectionError::Configuration("SVD produced no Vᵀ".into()))?;

    let k = svd.singular_values.len();
    let mut sigma_inv = DMatrix::<f64>::zeros(k, k);
    for (i, &s) in svd.singular_values.iter().enumerate() {
        if keep_singular_value(s, cutoff) {
            sigma_inv[(i, i)] = 1.0 / s;
        }
    }
    let pinv = v_t.transpose() * sigma_inv * u.transpose();
    Ok(if transposed { pinv.transpose() } else { pinv })
}

#[inline]
fn keep_singular_value(s: f64, cutoff: f64) -> bool {
    s > 0.0 && s >= cutoff
}

fn sorted_singular_values(m: &DMatrix<f64>) -> Vec<f64> {
    if m.nrows() == 0 || m.ncols() == 0 {
        return Vec::new();
    }
    let a = if m.ncols() > m.nrows() {
        m.transpose()
    } else {
        m.clone()
    };
    let mut values: Vec<f64> = a.singular_values().iter().copied().collect();
    values.sort_by(|x, y| y.total_cmp(x));
    values
}

impl ResponseMatrixEngine {
    /// Select correctors for `bpms` and allocate zeroed matrices.
    ///
    /// An empty candidate list means every corrector of that plane in the
    /// accelerator. Fails if no BPMs are given or no corrector falls in
    /// any BPM window.
    pub fn define_knobs(
        lattice: &Lattice,
        bpms: &[BpmId],
        h_candidates: &[CorrectorId],
        v_candidates: &[CorrectorId],
        scope: &SequenceScope,
        cutoff: f64,
    ) -> CorrectionResult<Self> {
        if bpms.is_empty() {
            return Err(CorrectionError::Configuration(
                "knob selection needs at least one BPM".into(),
            ));
        }
        let windows = bpm_windows(lattice, bpms, scope)?;
        let h = correctors_in_windows(
            lattice,
            &windows,
            &plane_candidates(lattice, h_candidates, Plane::Horizontal)?,
        )?;
        let v = correctors_in_windows(
            lattice,
            &windows,
            &plane_candidates(lattice, v_candidates, Plane::Vertical)?,
        )?;
        if h.is_empty() && v.is_empty() {
            return Err(CorrectionError::Configuration(format!(
                "no corrector lies upstream of the {} selected BPMs",
                bpms.len()
            )));
        }
        log::info!(
            "knobs defined: {} BPMs, {} H correctors, {} V correctors",
            bpms.len(),
            h.len(),
            v.len()
        );
        Ok(Self {
            bpms: bpms.to_vec(),
            planes: [
                PlaneResponse::new(bpms.len(), h),
                PlaneResponse::new(bpms.len(), v),
            ],
            cutoff,
        })
    }

    pub fn bpms(&self) -> &[BpmId] {
        &self.bpms
    }

    pub fn correctors(&self, plane: Plane) -> &[CorrectorId] {
        &self.planes[plane.index()].correctors
    }

    /// `(rows, cols)` = (BPM count, corrector count) recorded at definition.
    pub fn dimensions(&self, plane: Plane) -> (usize, usize) {
        let p = &self.planes[plane.index()];
        (p.rows, p.cols)
    }

    pub fn matrix(&self, plane: Plane) -> &DMatrix<f64> {
        &self.planes[plane.index()].matrix
    }

    pub fn is_built(&self, plane: Plane) -> bool {
        self.planes[plane.index()].built
    }

    pub fn cutoff(&self) -> f64 {
        self.cutoff
    }

    pub fn set_cutoff(&mut self, cutoff: f64) {
        self.cutoff = cutoff;
    }

    fn active_plane(&self, plane: Plane) -> CorrectionResult<&PlaneResponse> {
        let p = &self.planes[plane.index()];
        if p.cols == 0 {
            return Err(CorrectionError::Configuration(format!(
                "no {plane} correctors selected"
            )));
        }
        Ok(p)
    }

    /// Measure the response matrix on the machine.
    ///
    /// The current trajectory becomes the reference; each corrector in turn
    /// is moved by `+kick`, all BPMs are read after settling, and the
    /// corrector is restored. The matrix is only replaced if every column
    /// succeeds.
    pub fn measure_response(
        &mut self,
        scan: &mut Scan<'_>,
        store: &mut TrajectoryStore,
        plane: Plane,
        kick: f64,
        control: &ScanControl,
    ) -> CorrectionResult<()> {
        check_kick(kick)?;
        let correctors = self.active_plane(plane)?.correctors.clone();
        let n = correctors.len();
        log::info!(
            "measuring {plane} response: {} BPMs x {n} correctors, Δk = {kick}",
            self.bpms.len()
        );

        control.report(0, n);
        store.read_live(scan, &self.bpms)?;
        store.set_reference(&self.bpms)?;

        let mut matrix = DMatrix::zeros(self.bpms.len(), n);
        for (col, &corrector) in correctors.iter().enumerate() {
            control.checkpoint()?;
            let original = scan.field(corrector)?;

            let column = measure_column(scan, store, &self.bpms, plane, corrector, original, kick);
            let restored = scan.set_field(corrector, original);
            scan.settle();

            let column = finish_step(column, restored, scan.lattice(), corrector)?;
            matrix.set_column(col, &column);
            log::debug!("{plane} column {col} measured");
            control.report(col + 1, n);
        }

        let p = &mut self.planes[plane.index()];
        p.matrix = matrix;
        p.built = true;
        log::info!("{plane} response matrix measured");
        Ok(())
    }

    /// Build the response matrix from the design-synchronised simulator.
    ///
    /// Perturbs design fields only and scales columns to mm per field unit.
    pub fn calculate_response(
        &mut self,
        scan: &mut Scan<'_>,
        plane: Plane,
        kick: f64,
        control: &ScanControl,
    ) -> CorrectionResult<()> {
        check_kick(kick)?;
        let correctors = self.active_plane(plane)?.correctors.clone();
        let n = correctors.len();
        log::info!(
            "simulating {plane} response: {} BPMs x {n} correctors, Δk = {kick}",
            self.bpms.len()
        );

        control.report(0, n);
        let base = scan.simulate_trajectory(&self.bpms, plane)?;

        let mut matrix = DMatrix::zeros(self.bpms.len(), n);
        for (col, &corrector) in correctors.iter().enumerate() {
            control.checkpoint()?;
            let design = scan.design_field(corrector)?;

            let column = scan
                .set_design_field(corrector, design + kick)
                .and_then(|_| scan.simulate_trajectory(&self.bpms, plane))
                .map(|perturbed| {
                    DVector::from_iterator(
                        self.bpms.len(),
                        self.bpms.iter().map(|b| {
                            SIMULATION_POSITION_SCALE * (perturbed[b] - base[b]) / kick
                        }),
                    )
                });
            let restored = scan.set_design_field(corrector, design);

            let column = finish_step(column, restored, scan.lattice(), corrector)?;
            matrix.set_column(col, &column);
            control.report(col + 1, n);
        }

        let p = &mut self.planes[plane.index()];
        p.matrix = matrix;
        p.built = true;
        log::info!("{plane} response matrix simulated");
        Ok(())
    }

    /// Kicks that cancel the differential trajectory, using the block's cutoff.
    pub fn correct(&self, store: &TrajectoryStore, plane: Plane) -> CorrectionResult<KickSet> {
        self.calculate_correction(store, plane, self.cutoff)
    }

    /// Kicks that cancel the differential trajectory with an explicit cutoff.
    pub fn calculate_correction(
        &self,
        store: &TrajectoryStore,
        plane: Plane,
        cutoff: f64,
    ) -> CorrectionResult<KickSet> {
        let p = self.active_plane(plane)?;
        if !p.built {
            return Err(CorrectionError::Configuration(format!(
                "{plane} response matrix has not been built"
            )));
        }
        let mut error = DVector::zeros(self.bpms.len());
        for (row, &bpm) in self.bpms.iter().enumerate() {
            error[row] = store.diff_value(bpm, plane)?;
        }
        let pinv = truncated_pseudo_inverse(&p.matrix, cutoff)?;
        let kicks = -(pinv * error);
        Ok(KickSet {
            plane,
            correctors: p.correctors.clone(),
            kicks: kicks.iter().copied().collect(),
        })
    }

    /// Singular values of the (possibly transposed) matrix, largest first, unfiltered.
    pub fn singular_values(&self, plane: Plane) -> Vec<f64> {
        sorted_singular_values(&self.planes[plane.index()].matrix)
    }

    /// Number of singular values that survive `cutoff`.
    pub fn effective_rank(&self, plane: Plane, cutoff: f64) -> usize {
        self.singular_values(plane)
            .into_iter()
            .filter(|&s| keep_singular_value(s, cutoff))
            .count()
    }

    /// Add `factor · kick` to each corrector's live field.
    ///
    /// If a write fails, correctors already changed are put back.
    pub fn apply_correction(
        &self,
        scan: &mut Scan<'_>,
        kicks: &KickSet,
        factor: f64,
    ) -> CorrectionResult<()> {
        if kicks.correctors.len() != kicks.kicks.len() {
            return Err(CorrectionError::Configuration(format!(
                "{} correctors but {} kicks",
                kicks.correctors.len(),
                kicks.kicks.len()
            )));
        }
        let originals = kicks
            .correctors
            .iter()
            .map(|&c| scan.field(c))
            .collect::<CorrectionResult<Vec<f64>>>()?;
        let updates: Vec<(CorrectorId, f64, f64)> = kicks
            .correctors
            .iter()
            .zip(&originals)
            .zip(&kicks.kicks)
            .map(|((&c, &orig), &k)| (c, orig, orig + factor * k))
            .collect();
        apply_fields(scan, &updates)?;
        log::info!(
            "applied {} {} kicks (factor {factor})",
            kicks.kicks.len(),
            kicks.plane
        );
        Ok(())
    }

    /// Column-major export of one plane's matrix, if built.
    pub fn matrix_record(&self, plane: Plane) -> Option<MatrixRecord> {
        let p = &self.planes[plane.index()];
        p.built.then(|| MatrixRecord {
            rows: p.rows,
            cols: p.cols,
            values: p.matrix.as_slice().to_vec(),
        })
    }

    /// Reinstall a stored matrix; its shape must match the live selection.
    pub fn restore_matrix(&mut self, plane: Plane, record: &MatrixRecord) -> CorrectionResult<()> {
        record.check_shape()?;
        let p = &mut self.planes[plane.index()];
        if record.rows != p.rows || record.cols != p.cols {
            return Err(CorrectionError::Configuration(format!(
                "stored {plane} matrix is {}x{} but the block now has {} BPMs and {} correctors",
                record.rows, record.cols, p.rows, p.cols
            )));
        }
        p.matrix = DMatrix::from_column_slice(record.rows, record.cols, &record.values);
        p.built = true;
        Ok(())
    }
}

fn check_kick(kick: f64) -> CorrectionResult<()> {
    if !(kick.is_finite() && kick != 0.0) {
        return Err(CorrectionError::Configuration(format!(
            "perturbation must be finite and non-zero, got {kick}"
        )));
    }
    Ok(())
}

fn measure_column(
    scan: &mut Scan<'_>,
    store: &mut TrajectoryStore,
    bpms: &[BpmId],
    plane: Plane,
    corrector: CorrectorId,
    original: f64,
    kick: f64,
) -> CorrectionResult<DVector<f64>> {
    scan.set_field(corrector, original + kick)?;
    scan.settle();
    store.read_live(scan, bpms)?;
    let mut column = DVector::zeros(bpms.len());
    for (row, &bpm) in bpms.iter().enumerate() {
        column[row] = store.diff_value(bpm, plane)? / kick;
    }
    Ok(column)
}

/// Merge the outcome of one perturbation step with its restore.
pub(crate) fn finish_step<T>(
    step: CorrectionResult<T>,
    restored: CorrectionResult<()>,
    lattice: &Lattice,
    corrector: CorrectorId,
) -> CorrectionResult<T> {
    let name = lattice
        .corrector(corrector)
        .map(|c| c.name.clone())
        .unwrap_or_else(|_| format!("#{}", corrector.0));
    match (step, restored) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => {
            log::error!("could not restore {name}: {e}");
            Err(e)
        }
        (Err(e), restored) => {
            if let Err(re) = restored {
                log::warn!("could not restore {name} after failure: {re}");
            }
            log::error!("scan aborted at {name}: {e}");
            Err(e)
        }
    }
}

/// Write `(corrector, original, new)` fields, rolling back on failure.
pub(crate) fn apply_fields(
    scan: &mut Scan<'_>,
    updates: &[(CorrectorId, f64, f64)],
) -> CorrectionResult<()> {
    for (done, &(corrector, _, value)) in updates.iter().enumerate() {
        if let Err(e) = scan.set_field(corrector, value) {
            log::error!("field write failed, rolling back {done} correctors: {e}");
            for &(c, original, _) in updates[..done].iter().rev() {
                if let Err(re) = scan.set_field(c, original) {
                    log::warn!("rollback of corrector {} failed: {re}", c.0);
                }
            }
            return Err(e);
        }
    }
    Ok(())
}
