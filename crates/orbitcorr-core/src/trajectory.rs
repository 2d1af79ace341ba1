// ─────────────────────────────────────────────────────────────────────
// Orbit Correction Kernel — Trajectory Store
// ─────────────────────────────────────────────────────────────────────
//! Current, reference and differential BPM readings.
//!
//! Storage is three parallel arrays indexed by `BpmId`. The `diff`
//! snapshot is derived: it is recomputed whenever the current or the
//! reference sample of a BPM changes and is never written directly.
//!
//! Flat-file format, one line per BPM: `<position>;<x>;<y>`, 4 decimals.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use orbitcorr_devices::{Lattice, Scan};
use orbitcorr_types::config::{POSITION_MATCH_TOLERANCE, SIMULATION_POSITION_SCALE};
use orbitcorr_types::{BpmId, CorrectionError, CorrectionResult, Plane};
use serde::{Deserialize, Serialize};

/// One BPM reading: longitudinal position and transverse offsets (mm).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub position: f64,
    pub x: f64,
    pub y: f64,
}

impl Sample {
    #[inline]
    pub fn get(&self, plane: Plane) -> f64 {
        match plane {
            Plane::Horizontal => self.x,
            Plane::Vertical => self.y,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrajectoryStore {
    current: Vec<Option<Sample>>,
    reference: Vec<Option<Sample>>,
    diff: Vec<Option<Sample>>,
}

impl TrajectoryStore {
    /// Empty store sized for every BPM of `lattice`.
    pub fn new(lattice: &Lattice) -> Self {
        let n = lattice.bpm_count();
        Self {
            current: vec![None; n],
            reference: vec![None; n],
            diff: vec![None; n],
        }
    }

    fn check(&self, bpm: BpmId) -> CorrectionResult<usize> {
        if bpm.index() < self.current.len() {
            Ok(bpm.index())
        } else {
            Err(CorrectionError::Lookup(format!(
                "BPM handle {} outside trajectory store",
                bpm.0
            )))
        }
    }

    pub fn current(&self, bpm: BpmId) -> Option<Sample> {
        self.current.get(bpm.index()).copied().flatten()
    }

    pub fn reference(&self, bpm: BpmId) -> Option<Sample> {
        self.reference.get(bpm.index()).copied().flatten()
    }

    pub fn diff(&self, bpm: BpmId) -> Option<Sample> {
        self.diff.get(bpm.index()).copied().flatten()
    }

    /// Differential value in one plane; missing samples are a lookup error.
    pub fn diff_value(&self, bpm: BpmId, plane: Plane) -> CorrectionResult<f64> {
        self.diff(bpm)
            .map(|s| s.get(plane))
            .ok_or_else(|| CorrectionError::Lookup(format!("no trajectory sample for BPM {}", bpm.0)))
    }

    fn recompute(&mut self, i: usize) {
        self.diff[i] = match (self.current[i], self.reference[i]) {
            (Some(cur), Some(r)) => Some(Sample {
                position: cur.position,
                x: cur.x - r.x,
                y: cur.y - r.y,
            }),
            (Some(cur), None) => Some(cur),
            (None, _) => None,
        };
    }

    fn commit_current(&mut self, samples: Vec<(usize, Sample)>) {
        for (i, sample) in samples {
            self.current[i] = Some(sample);
            self.recompute(i);
        }
    }

    /// Read averaged x/y of every BPM from the machine.
    ///
    /// Fail-fast: if any read fails nothing is committed.
    pub fn read_live(&mut self, scan: &Scan<'_>, bpms: &[BpmId]) -> CorrectionResult<()> {
        let mut samples = Vec::with_capacity(bpms.len());
        for &bpm in bpms {
            let i = self.check(bpm)?;
            let position = scan.lattice().bpm_position(bpm)?;
            let x = scan.read_bpm(bpm, Plane::Horizontal)?;
            let y = scan.read_bpm(bpm, Plane::Vertical)?;
            samples.push((i, Sample { position, x, y }));
        }
        self.commit_current(samples);
        Ok(())
    }

    /// Design-synchronised simulated trajectory, converted to mm.
    pub fn read_simulated(&mut self, scan: &mut Scan<'_>, bpms: &[BpmId]) -> CorrectionResult<()> {
        for &bpm in bpms {
            self.check(bpm)?;
        }
        let xs = scan.simulate_trajectory(bpms, Plane::Horizontal)?;
        let ys = scan.simulate_trajectory(bpms, Plane::Vertical)?;
        let mut samples = Vec::with_capacity(bpms.len());
        for &bpm in bpms {
            let lookup = |plane: Plane, map: &std::collections::HashMap<BpmId, f64>| {
                map.get(&bpm).copied().ok_or_else(|| {
                    CorrectionError::Acquisition(format!(
                        "simulation returned no {plane} position for BPM {}",
                        bpm.0
                    ))
                })
            };
            samples.push((
                bpm.index(),
                Sample {
                    position: scan.lattice().bpm_position(bpm)?,
                    x: SIMULATION_POSITION_SCALE * lookup(Plane::Horizontal, &xs)?,
                    y: SIMULATION_POSITION_SCALE * lookup(Plane::Vertical, &ys)?,
                },
            ));
        }
        self.commit_current(samples);
        Ok(())
    }

    /// Store explicit current values for a BPM (manual entry or replay).
    pub fn set_current_from_values(
        &mut self,
        lattice: &Lattice,
        bpm: BpmId,
        x: f64,
        y: f64,
    ) -> CorrectionResult<()> {
        let i = self.check(bpm)?;
        let position = lattice.bpm_position(bpm)?;
        self.commit_current(vec![(i, Sample { position, x, y })]);
        Ok(())
    }

    /// Copy the current sample of each BPM into the reference.
    pub fn set_reference(&mut self, bpms: &[BpmId]) -> CorrectionResult<()> {
        let mut indices = Vec::with_capacity(bpms.len());
        for &bpm in bpms {
            let i = self.check(bpm)?;
            if self.current[i].is_none() {
                return Err(CorrectionError::Lookup(format!(
                    "no current sample for BPM {} to use as reference",
                    bpm.0
                )));
            }
            indices.push(i);
        }
        for i in indices {
            self.reference[i] = self.current[i];
            self.recompute(i);
        }
        Ok(())
    }

    pub fn set_reference_from_values(
        &mut self,
        lattice: &Lattice,
        bpm: BpmId,
        x: f64,
        y: f64,
    ) -> CorrectionResult<()> {
        let i = self.check(bpm)?;
        let position = lattice.bpm_position(bpm)?;
        self.reference[i] = Some(Sample { position, x, y });
        self.recompute(i);
        Ok(())
    }

    /// Forget every reference sample; diffs fall back to the current values.
    pub fn clear_reference(&mut self) {
        for i in 0..self.reference.len() {
            self.reference[i] = None;
            self.recompute(i);
        }
    }

    /// Load reference samples from a flat file.
    ///
    /// A line is taken for a BPM only if its position is within
    /// `POSITION_MATCH_TOLERANCE` of the BPM's; other lines are skipped.
    /// Returns how many BPMs received a reference.
    pub fn load_reference_from_file(
        &mut self,
        lattice: &Lattice,
        bpms: &[BpmId],
        path: impl AsRef<Path>,
    ) -> CorrectionResult<usize> {
        let text = fs::read_to_string(path.as_ref())?;
        let mut targets = Vec::with_capacity(bpms.len());
        for &bpm in bpms {
            targets.push((self.check(bpm)?, lattice.bpm_position(bpm)?));
        }

        let mut loaded: Vec<(usize, Sample)> = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(';').collect();
            if fields.len() < 3 {
                return Err(CorrectionError::Parse(format!(
                    "line {}: expected <position>;<x>;<y>, got {line:?}",
                    lineno + 1
                )));
            }
            let parse = |s: &str| {
                s.trim().parse::<f64>().map_err(|e| {
                    CorrectionError::Parse(format!("line {}: {s:?}: {e}", lineno + 1))
                })
            };
            let (position, x, y) = (parse(fields[0])?, parse(fields[1])?, parse(fields[2])?);

            match targets
                .iter()
                .find(|(_, s)| (position - s).abs() < POSITION_MATCH_TOLERANCE)
            {
                Some(&(i, s)) => loaded.push((i, Sample { position: s, x, y })),
                None => log::warn!("no BPM at position {position}, line {} skipped", lineno + 1),
            }
        }

        let count = loaded.len();
        for (i, sample) in loaded {
            self.reference[i] = Some(sample);
            self.recompute(i);
        }
        log::info!("loaded {count} reference samples for {} BPMs", bpms.len());
        Ok(count)
    }

    /// Write the current samples of `bpms` to a flat file.
    pub fn save(&self, bpms: &[BpmId], path: impl AsRef<Path>) -> CorrectionResult<()> {
        let mut out = String::new();
        for &bpm in bpms {
            let i = self.check(bpm)?;
            if let Some(s) = self.current[i] {
                // Writing into a String cannot fail.
                let _ = writeln!(out, "{:.4};{:.4};{:.4}", s.position, s.x, s.y);
            }
        }
        fs::write(path.as_ref(), out)?;
        Ok(())
    }

    /// RMS of the differential trajectory in one plane.
    pub fn rms(&self, plane: Plane) -> CorrectionResult<f64> {
        let values: Vec<f64> = self.diff.iter().flatten().map(|s| s.get(plane)).collect();
        if values.is_empty() {
            return Err(CorrectionError::EmptyTrajectory(format!(
                "no {plane} samples to compute RMS over"
            )));
        }
        let mean_sq = values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64;
        Ok(mean_sq.sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use orbitcorr_devices::{DeviceSession, LinearMachine, LinearModel, LinearModelSimulator, NoSettle};
    use orbitcorr_types::CorrectorId;

    fn lattice() -> Arc<Lattice> {
        let mut lat = Lattice::new();
        lat.add_sequence("MEBT", 0.0).unwrap();
        lat.add_corrector("DCH1", Plane::Horizontal, "MEBT", 0.5)
            .unwrap();
        lat.add_bpm("BPM1", "MEBT", 1.0).unwrap();
        lat.add_bpm("BPM2", "MEBT", 2.0).unwrap();
        lat.add_bpm("BPM3", "MEBT", 3.0).unwrap();
        Arc::new(lat)
    }

    fn session(lat: &Arc<Lattice>, machine: LinearMachine) -> DeviceSession {
        let model = LinearModel::drift(lat, 1.0);
        DeviceSession::new("mebt", lat.clone(), Box::new(machine), Arc::new(NoSettle))
            .with_simulator(Box::new(LinearModelSimulator::new(lat.clone(), model).unwrap()))
    }

    fn machine(lat: &Arc<Lattice>) -> LinearMachine {
        let mut m = LinearMachine::new(lat.clone(), LinearModel::drift(lat, 1.0)).unwrap();
        m.set_offset(BpmId(0), 1.0, -1.0);
        m.set_offset(BpmId(1), 2.0, -2.0);
        m.set_offset(BpmId(2), 3.0, -3.0);
        m
    }

    fn all(lat: &Lattice) -> Vec<BpmId> {
        (0..lat.bpm_count()).map(BpmId).collect()
    }

    #[test]
    fn test_read_live_without_reference() {
        let lat = lattice();
        let s = session(&lat, machine(&lat));
        let mut store = TrajectoryStore::new(&lat);
        store.read_live(&s.begin_scan().unwrap(), &all(&lat)).unwrap();
        let d = store.diff(BpmId(1)).unwrap();
        assert_eq!(d, store.current(BpmId(1)).unwrap());
        assert!((d.x - 2.0).abs() < 1e-12);
        assert!((d.position - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_read_live_against_reference() {
        let lat = lattice();
        let s = session(&lat, machine(&lat));
        let mut store = TrajectoryStore::new(&lat);
        let bpms = all(&lat);
        store.read_live(&s.begin_scan().unwrap(), &bpms).unwrap();
        store.set_reference(&bpms).unwrap();
        assert_eq!(store.diff_value(BpmId(2), Plane::Horizontal).unwrap(), 0.0);

        let mut scan = s.begin_scan().unwrap();
        scan.set_field(CorrectorId(0), 0.001).unwrap();
        store.read_live(&scan, &bpms).unwrap();
        // drift gain 1: BPM3 is 2.5 m downstream -> 2.5e-3 m = 2.5 mm
        assert!((store.diff_value(BpmId(2), Plane::Horizontal).unwrap() - 2.5).abs() < 1e-9);
        assert!(store.diff_value(BpmId(2), Plane::Vertical).unwrap().abs() < 1e-12);
    }

    #[test]
    fn test_read_live_fail_fast() {
        let lat = lattice();
        let mut m = machine(&lat);
        m.fail_bpm(BpmId(2));
        let s = session(&lat, m);
        let mut store = TrajectoryStore::new(&lat);
        let err = store.read_live(&s.begin_scan().unwrap(), &all(&lat));
        assert!(matches!(err, Err(CorrectionError::Acquisition(_))));
        // Nothing committed, not even the BPMs read before the failure.
        assert!(store.current(BpmId(0)).is_none());
        assert!(store.diff(BpmId(0)).is_none());
    }

    #[test]
    fn test_reference_only_touches_listed_bpms() {
        let lat = lattice();
        let s = session(&lat, machine(&lat));
        let mut store = TrajectoryStore::new(&lat);
        store.read_live(&s.begin_scan().unwrap(), &all(&lat)).unwrap();
        store.set_reference(&[BpmId(0)]).unwrap();
        assert_eq!(store.diff_value(BpmId(0), Plane::Horizontal).unwrap(), 0.0);
        assert!((store.diff_value(BpmId(1), Plane::Horizontal).unwrap() - 2.0).abs() < 1e-12);
        assert!(store.reference(BpmId(1)).is_none());
    }

    #[test]
    fn test_set_reference_requires_current() {
        let lat = lattice();
        let mut store = TrajectoryStore::new(&lat);
        assert!(matches!(
            store.set_reference(&[BpmId(0)]),
            Err(CorrectionError::Lookup(_))
        ));
    }

    #[test]
    fn test_reference_from_values() {
        let lat = lattice();
        let mut store = TrajectoryStore::new(&lat);
        store
            .set_current_from_values(&lat, BpmId(0), 0.5, 0.25)
            .unwrap();
        store
            .set_reference_from_values(&lat, BpmId(0), 0.25, 0.25)
            .unwrap();
        let d = store.diff(BpmId(0)).unwrap();
        assert!((d.x - 0.25).abs() < 1e-12);
        assert_eq!(d.y, 0.0);
        store.clear_reference();
        assert!((store.diff_value(BpmId(0), Plane::Horizontal).unwrap() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_rms() {
        let lat = lattice();
        let mut store = TrajectoryStore::new(&lat);
        store.set_current_from_values(&lat, BpmId(0), 3.0, 0.0).unwrap();
        store.set_current_from_values(&lat, BpmId(1), 4.0, 0.0).unwrap();
        let rms = store.rms(Plane::Horizontal).unwrap();
        assert!((rms - (12.5f64).sqrt()).abs() < 1e-12);
        assert_eq!(store.rms(Plane::Vertical).unwrap(), 0.0);
    }

    #[test]
    fn test_rms_empty() {
        let lat = lattice();
        let store = TrajectoryStore::new(&lat);
        assert!(matches!(
            store.rms(Plane::Horizontal),
            Err(CorrectionError::EmptyTrajectory(_))
        ));
    }

    #[test]
    fn test_save_then_load_reference() {
        let lat = lattice();
        let s = session(&lat, machine(&lat));
        let bpms = all(&lat);
        let mut store = TrajectoryStore::new(&lat);
        store.read_live(&s.begin_scan().unwrap(), &bpms).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reference.txt");
        store.save(&bpms, &path).unwrap();

        let mut fresh = TrajectoryStore::new(&lat);
        let n = fresh.load_reference_from_file(&lat, &bpms, &path).unwrap();
        assert_eq!(n, 3);
        for &b in &bpms {
            let want = store.current(b).unwrap();
            let got = fresh.reference(b).unwrap();
            assert!((want.x - got.x).abs() < 1e-4);
            assert!((want.y - got.y).abs() < 1e-4);
        }
    }

    #[test]
    fn test_saved_format() {
        let lat = lattice();
        let mut store = TrajectoryStore::new(&lat);
        store
            .set_current_from_values(&lat, BpmId(0), 0.123456, -2.0)
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.txt");
        store.save(&[BpmId(0), BpmId(1)], &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "1.0000;0.1235;-2.0000\n");
    }

    #[test]
    fn test_load_matches_within_tolerance_only() {
        let lat = lattice();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ref.txt");
        std::fs::write(
            &path,
            "1.000001;0.5;0.5\n2.0001;9.0;9.0\n\n7.0;1.0;1.0\n3.0;-1.0;1.5\n",
        )
        .unwrap();
        let mut store = TrajectoryStore::new(&lat);
        let n = store
            .load_reference_from_file(&lat, &all(&lat), &path)
            .unwrap();
        assert_eq!(n, 2);
        assert!((store.reference(BpmId(0)).unwrap().x - 0.5).abs() < 1e-12);
        // 1e-4 away is outside the 1e-5 tolerance.
        assert!(store.reference(BpmId(1)).is_none());
        assert!((store.reference(BpmId(2)).unwrap().y - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_load_short_line_is_parse_error() {
        let lat = lattice();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.txt");
        std::fs::write(&path, "1.0;0.5\n").unwrap();
        let mut store = TrajectoryStore::new(&lat);
        assert!(matches!(
            store.load_reference_from_file(&lat, &all(&lat), &path),
            Err(CorrectionError::Parse(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let lat = lattice();
        let mut store = TrajectoryStore::new(&lat);
        assert!(matches!(
            store.load_reference_from_file(&lat, &all(&lat), "/nonexistent/ref.txt"),
            Err(CorrectionError::Io(_))
        ));
    }

    #[test]
    fn test_read_simulated_in_mm() {
        let lat = lattice();
        let s = session(&lat, machine(&lat));
        let mut scan = s.begin_scan().unwrap();
        scan.set_design_field(CorrectorId(0), 0.001).unwrap();
        let mut store = TrajectoryStore::new(&lat);
        store.read_simulated(&mut scan, &all(&lat)).unwrap();
        // 1.5 m downstream * 1e-3 = 1.5e-3 m = 1.5 mm
        assert!((store.current(BpmId(1)).unwrap().x - 1.5).abs() < 1e-9);
    }
}
