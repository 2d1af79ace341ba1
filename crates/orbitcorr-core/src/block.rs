// ─────────────────────────────────────────────────────────────────────
// Orbit Correction Kernel — Correction Block
// ─────────────────────────────────────────────────────────────────────
//! Named grouping of BPMs and correctors with its optional SVD and
//! 1-to-1 engines, and its round trip through `BlockRecord`.

use orbitcorr_devices::Lattice;
use orbitcorr_types::{
    BlockRecord, BpmId, CorrectionError, CorrectionResult, CorrectorId, PairRecord, Plane,
    SequenceScope, SvdRecord,
};

use crate::pairing::{Calibration, PairingEngine};
use crate::svd::ResponseMatrixEngine;

#[derive(Debug, Clone)]
pub struct CorrectionBlock {
    name: String,
    bpms: Vec<BpmId>,
    h_correctors: Vec<CorrectorId>,
    v_correctors: Vec<CorrectorId>,
    svd: Option<ResponseMatrixEngine>,
    pairing: Option<PairingEngine>,
}

impl CorrectionBlock {
    pub fn new(
        name: impl Into<String>,
        bpms: Vec<BpmId>,
        h_correctors: Vec<CorrectorId>,
        v_correctors: Vec<CorrectorId>,
    ) -> Self {
        Self {
            name: name.into(),
            bpms,
            h_correctors,
            v_correctors,
            svd: None,
            pairing: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bpms(&self) -> &[BpmId] {
        &self.bpms
    }

    pub fn correctors(&self, plane: Plane) -> &[CorrectorId] {
        match plane {
            Plane::Horizontal => &self.h_correctors,
            Plane::Vertical => &self.v_correctors,
        }
    }

    pub fn svd(&self) -> Option<&ResponseMatrixEngine> {
        self.svd.as_ref()
    }

    pub fn svd_mut(&mut self) -> Option<&mut ResponseMatrixEngine> {
        self.svd.as_mut()
    }

    pub fn pairing(&self) -> Option<&PairingEngine> {
        self.pairing.as_ref()
    }

    pub fn pairing_mut(&mut self) -> Option<&mut PairingEngine> {
        self.pairing.as_mut()
    }

    /// (Re)select SVD knobs from the block's devices. Any previous matrix
    /// is discarded.
    pub fn define_svd(
        &mut self,
        lattice: &Lattice,
        scope: &SequenceScope,
        cutoff: f64,
    ) -> CorrectionResult<&mut ResponseMatrixEngine> {
        let engine = ResponseMatrixEngine::define_knobs(
            lattice,
            &self.bpms,
            &self.h_correctors,
            &self.v_correctors,
            scope,
            cutoff,
        )?;
        Ok(self.svd.insert(engine))
    }

    /// (Re)pair the block's BPMs. Previous calibrations are discarded.
    pub fn define_pairs(
        &mut self,
        lattice: &Lattice,
        scope: &SequenceScope,
    ) -> CorrectionResult<&mut PairingEngine> {
        let engine = PairingEngine::set_pairs(
            lattice,
            &self.bpms,
            &self.h_correctors,
            &self.v_correctors,
            scope,
        )?;
        Ok(self.pairing.insert(engine))
    }

    /// Every plane that has knobs has a built matrix.
    pub fn ok_svd(&self) -> bool {
        self.svd.as_ref().is_some_and(|e| {
            Plane::BOTH
                .iter()
                .all(|&p| e.correctors(p).is_empty() || e.is_built(p))
        })
    }

    /// At least one pair exists and every pair has a usable calibration.
    pub fn ok_1to1(&self) -> bool {
        let Some(p) = &self.pairing else {
            return false;
        };
        let mut any = false;
        for plane in Plane::BOTH {
            for (bpm, _) in p.pairs(plane) {
                any = true;
                if !p.calibration(bpm, plane).is_some_and(|c| c.is_usable()) {
                    return false;
                }
            }
        }
        any
    }

    pub fn to_record(&self, lattice: &Lattice) -> CorrectionResult<BlockRecord> {
        let bpm_name = |id: BpmId| lattice.bpm(id).map(|b| b.name.clone());
        let corrector_name = |id: CorrectorId| lattice.corrector(id).map(|c| c.name.clone());

        let svd = self.svd.as_ref().map(|e| SvdRecord {
            cutoff: e.cutoff(),
            horizontal: e.matrix_record(Plane::Horizontal),
            vertical: e.matrix_record(Plane::Vertical),
        });

        let mut pairs = Vec::new();
        if let Some(p) = &self.pairing {
            for plane in Plane::BOTH {
                for (bpm, corrector) in p.pairs(plane) {
                    let cal = p.calibration(bpm, plane).unwrap_or_default();
                    pairs.push(PairRecord {
                        plane,
                        bpm: bpm_name(bpm)?,
                        corrector: corrector_name(corrector)?,
                        coefficients: PairRecord::format_coefficients(cal.offset, cal.slope),
                    });
                }
            }
        }

        Ok(BlockRecord {
            name: self.name.clone(),
            bpms: self.bpms.iter().map(|&b| bpm_name(b)).collect::<Result<_, _>>()?,
            h_correctors: self
                .h_correctors
                .iter()
                .map(|&c| corrector_name(c))
                .collect::<Result<_, _>>()?,
            v_correctors: self
                .v_correctors
                .iter()
                .map(|&c| corrector_name(c))
                .collect::<Result<_, _>>()?,
            ok_svd: self.ok_svd(),
            ok_1to1: self.ok_1to1(),
            svd,
            pairs,
        })
    }

    /// Rebuild a block against the live inventory.
    ///
    /// Names that no longer resolve are dropped with a warning. A stored
    /// matrix whose shape no longer fits the resolved selection is
    /// discarded and must be re-measured.
    pub fn from_record(
        lattice: &Lattice,
        record: &BlockRecord,
        scope: &SequenceScope,
    ) -> CorrectionResult<Self> {
        let bpms: Vec<BpmId> = record
            .bpms
            .iter()
            .filter_map(|n| resolve(&record.name, n, lattice.find_bpm(n)))
            .collect();
        let h = resolve_correctors(lattice, &record.name, &record.h_correctors, Plane::Horizontal);
        let v = resolve_correctors(lattice, &record.name, &record.v_correctors, Plane::Vertical);
        let mut block = Self::new(record.name.clone(), bpms, h, v);

        if let Some(stored) = &record.svd {
            block.restore_svd(lattice, scope, stored)?;
        }
        if !record.pairs.is_empty() {
            block.restore_pairs(lattice, &record.pairs)?;
        }

        log::info!(
            "block {} restored: {} BPMs, ok_svd={}, ok_1to1={}",
            block.name,
            block.bpms.len(),
            block.ok_svd(),
            block.ok_1to1()
        );
        Ok(block)
    }

    fn restore_svd(
        &mut self,
        lattice: &Lattice,
        scope: &SequenceScope,
        stored: &SvdRecord,
    ) -> CorrectionResult<()> {
        let name = self.name.clone();
        let engine = match self.define_svd(lattice, scope, stored.cutoff) {
            Ok(engine) => engine,
            Err(CorrectionError::Configuration(msg)) => {
                log::warn!("block {name}: SVD knobs not restored: {msg}");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        for (plane, matrix) in [
            (Plane::Horizontal, &stored.horizontal),
            (Plane::Vertical, &stored.vertical),
        ] {
            let Some(matrix) = matrix else { continue };
            match engine.restore_matrix(plane, matrix) {
                Ok(()) => {}
                Err(CorrectionError::Configuration(msg)) => {
                    log::warn!("block {name}: {msg}");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn restore_pairs(&mut self, lattice: &Lattice, stored: &[PairRecord]) -> CorrectionResult<()> {
        let mut engine = PairingEngine::empty(lattice, &self.bpms);
        for plane in Plane::BOTH {
            let mut pairs = Vec::new();
            let mut calibrations = Vec::new();
            for rec in stored.iter().filter(|r| r.plane == plane) {
                let (Some(bpm), Some(corrector)) =
                    (lattice.find_bpm(&rec.bpm), lattice.find_corrector(&rec.corrector))
                else {
                    log::warn!(
                        "block {}: dropping {plane} pair {} / {}, device no longer exists",
                        self.name,
                        rec.bpm,
                        rec.corrector
                    );
                    continue;
                };
                if !self.bpms.contains(&bpm) {
                    log::warn!(
                        "block {}: dropping {plane} pair for {}, BPM is not in the block",
                        self.name,
                        rec.bpm
                    );
                    continue;
                }
                let (offset, slope) = rec.parse_coefficients()?;
                pairs.push((bpm, corrector));
                calibrations.push((bpm, Calibration { offset, slope }));
            }
            engine.replace_pairs(lattice, plane, &pairs)?;
            for (bpm, cal) in calibrations {
                engine.set_calibration(bpm, plane, cal)?;
            }
        }
        self.pairing = Some(engine);
        Ok(())
    }
}

fn resolve<T>(block: &str, name: &str, found: Option<T>) -> Option<T> {
    if found.is_none() {
        log::warn!("block {block}: dropping {name}, device no longer exists");
    }
    found
}

fn resolve_correctors(
    lattice: &Lattice,
    block: &str,
    names: &[String],
    plane: Plane,
) -> Vec<CorrectorId> {
    names
        .iter()
        .filter_map(|n| resolve(block, n, lattice.find_corrector(n)))
        .filter(|&c| {
            let same_plane = lattice.corrector(c).is_ok_and(|info| info.plane == plane);
            if !same_plane {
                log::warn!("block {block}: dropping corrector #{} from the {plane} list", c.0);
            }
            same_plane
        })
        .collect()
}
