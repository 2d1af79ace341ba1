// ─────────────────────────────────────────────────────────────────────
// Orbit Correction Kernel — Knob Windows
// ─────────────────────────────────────────────────────────────────────
//! Every selected BPM owns the stretch of beamline `(previous, this]`
//! upstream of it. The first window starts at the BPM that precedes the
//! first selection in accelerator order, or at 0 if there is none.
//! Both correction strategies pick correctors from these windows.

use orbitcorr_devices::Lattice;
use orbitcorr_types::{BpmId, CorrectionError, CorrectionResult, CorrectorId, Plane, SequenceScope};

/// Half-open interval `(lower, upper]` along the beamline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Window {
    pub lower: f64,
    pub upper: f64,
}

impl Window {
    #[inline]
    pub fn contains(&self, position: f64) -> bool {
        position > self.lower && position <= self.upper
    }
}

/// One window per selected BPM, in selection order.
pub fn bpm_windows(
    lattice: &Lattice,
    bpms: &[BpmId],
    scope: &SequenceScope,
) -> CorrectionResult<Vec<Window>> {
    let Some(&first) = bpms.first() else {
        return Ok(Vec::new());
    };

    let mut lower = 0.0;
    let mut found = false;
    for id in lattice.bpms_in(scope) {
        if id == first {
            found = true;
            break;
        }
        lower = lattice.bpm_position(id)?;
    }
    if !found {
        return Err(CorrectionError::Configuration(format!(
            "BPM {} is not part of the selected sequence scope",
            lattice.bpm(first)?.name
        )));
    }

    let mut windows = Vec::with_capacity(bpms.len());
    for &bpm in bpms {
        let upper = lattice.bpm_position(bpm)?;
        windows.push(Window { lower, upper });
        lower = upper;
    }
    Ok(windows)
}

/// Candidates restricted to `plane`; an empty list means every corrector
/// of that plane in the accelerator.
pub fn plane_candidates(
    lattice: &Lattice,
    candidates: &[CorrectorId],
    plane: Plane,
) -> CorrectionResult<Vec<CorrectorId>> {
    if candidates.is_empty() {
        return Ok(lattice.correctors_in(&SequenceScope::All, plane));
    }
    let mut out = Vec::with_capacity(candidates.len());
    for &c in candidates {
        let info = lattice.corrector(c)?;
        if info.plane == plane {
            out.push(c);
        } else {
            log::warn!("ignoring {} corrector {} in {plane} list", info.plane, info.name);
        }
    }
    Ok(out)
}

/// Flat, order-preserving list of candidates that fall in any window.
pub fn correctors_in_windows(
    lattice: &Lattice,
    windows: &[Window],
    candidates: &[CorrectorId],
) -> CorrectionResult<Vec<CorrectorId>> {
    let mut selected: Vec<CorrectorId> = Vec::new();
    for window in windows {
        for &c in candidates {
            if window.contains(lattice.corrector_position(c)?) && !selected.contains(&c) {
                selected.push(c);
            }
        }
    }
    Ok(selected)
}

/// First candidate, in candidate order, that lies in `window`.
pub fn first_in_window(
    lattice: &Lattice,
    window: &Window,
    candidates: &[CorrectorId],
) -> CorrectionResult<Option<CorrectorId>> {
    for &c in candidates {
        if window.contains(lattice.corrector_position(c)?) {
            return Ok(Some(c));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lattice() -> Lattice {
        let mut lat = Lattice::new();
        lat.add_sequence("A", 0.0).unwrap();
        lat.add_sequence("B", 10.0).unwrap();
        for (i, s) in [1.0, 2.0, 3.0].iter().enumerate() {
            lat.add_bpm(&format!("A_BPM{i}"), "A", *s).unwrap();
        }
        lat.add_bpm("B_BPM0", "B", 1.0).unwrap(); // 11.0
        lat.add_corrector("A_DCH0", Plane::Horizontal, "A", 0.5)
            .unwrap();
        lat.add_corrector("A_DCH1", Plane::Horizontal, "A", 1.5)
            .unwrap();
        lat.add_corrector("A_DCH2", Plane::Horizontal, "A", 2.0)
            .unwrap();
        lat.add_corrector("A_DCV0", Plane::Vertical, "A", 2.5)
            .unwrap();
        lat.add_corrector("B_DCH0", Plane::Horizontal, "B", 0.5)
            .unwrap(); // 10.5
        lat
    }

    #[test]
    fn test_window_bounds() {
        let w = Window {
            lower: 1.0,
            upper: 2.0,
        };
        assert!(!w.contains(1.0));
        assert!(w.contains(1.5));
        assert!(w.contains(2.0));
        assert!(!w.contains(2.0001));
    }

    #[test]
    fn test_first_window_starts_at_zero() {
        let lat = lattice();
        let w = bpm_windows(&lat, &[BpmId(0), BpmId(1)], &SequenceScope::All).unwrap();
        assert_eq!(w[0], Window { lower: 0.0, upper: 1.0 });
        assert_eq!(w[1], Window { lower: 1.0, upper: 2.0 });
    }

    #[test]
    fn test_first_window_uses_global_predecessor() {
        let lat = lattice();
        let w = bpm_windows(&lat, &[BpmId(3)], &SequenceScope::All).unwrap();
        assert_eq!(w[0], Window { lower: 3.0, upper: 11.0 });
        // Inside its own sequence the BPM is first, so the window opens at 0.
        let w = bpm_windows(&lat, &[BpmId(3)], &SequenceScope::Sequence("B".into())).unwrap();
        assert_eq!(w[0].lower, 0.0);
    }

    #[test]
    fn test_bpm_outside_scope() {
        let lat = lattice();
        assert!(matches!(
            bpm_windows(&lat, &[BpmId(0)], &SequenceScope::Sequence("B".into())),
            Err(CorrectionError::Configuration(_))
        ));
    }

    #[test]
    fn test_windows_invariant() {
        let lat = lattice();
        let bpms = lat.bpms_in(&SequenceScope::All);
        let windows = bpm_windows(&lat, &bpms, &SequenceScope::All).unwrap();
        let cands = plane_candidates(&lat, &[], Plane::Horizontal).unwrap();
        for (i, w) in windows.iter().enumerate().skip(1) {
            let prev = lat.bpm_position(bpms[i - 1]).unwrap();
            let this = lat.bpm_position(bpms[i]).unwrap();
            for c in correctors_in_windows(&lat, &[*w], &cands).unwrap() {
                let s = lat.corrector_position(c).unwrap();
                assert!(s > prev && s <= this, "corrector at {s} outside ({prev}, {this}]");
            }
        }
    }

    #[test]
    fn test_correctors_in_windows_flat_and_unique() {
        let lat = lattice();
        let bpms = lat.bpms_in(&SequenceScope::All);
        let windows = bpm_windows(&lat, &bpms, &SequenceScope::All).unwrap();
        let cands = plane_candidates(&lat, &[], Plane::Horizontal).unwrap();
        let sel = correctors_in_windows(&lat, &windows, &cands).unwrap();
        assert_eq!(
            sel,
            vec![CorrectorId(0), CorrectorId(1), CorrectorId(2), CorrectorId(4)]
        );
    }

    #[test]
    fn test_plane_candidates_filters_wrong_plane() {
        let lat = lattice();
        let c = plane_candidates(&lat, &[CorrectorId(0), CorrectorId(3)], Plane::Vertical).unwrap();
        assert_eq!(c, vec![CorrectorId(3)]);
    }

    #[test]
    fn test_first_in_window_respects_candidate_order() {
        let lat = lattice();
        let w = Window {
            lower: 1.0,
            upper: 2.0,
        };
        // Both 1.5 and 2.0 lie in (1, 2]; the first listed wins.
        let first = first_in_window(&lat, &w, &[CorrectorId(2), CorrectorId(1)]).unwrap();
        assert_eq!(first, Some(CorrectorId(2)));
        let none = first_in_window(&lat, &w, &[CorrectorId(0)]).unwrap();
        assert_eq!(none, None);
    }
}
