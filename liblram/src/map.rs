//! Seed–chain–extend mapping of one query read against a loaded index.
//!
//! A [`Mapper`] is the thread-local working state: seed and chain
//! arenas, the rescue list for frequent minimizers, the alignment
//! position hash used for duplicate suppression, and a DP engine. The
//! outer loop walks the index's occurrence tiers until a tier produces
//! at least one alignment, then classifies the survivors into
//! primary/supplementary/secondary and estimates mapping quality.
//!
//! Seeds live in a transformed coordinate space `u = 2r - q`,
//! `v = 2q - r` (offset so both fit unsigned 32 bits); chains are greedy
//! windowed walks over the `(rid, u)`-sorted seed array.

mod chain;
mod extend;
mod post;
mod seed;

pub(crate) use chain::Win;

use crate::dp::{Alignment, DpAligner, DpParams};
use crate::index::MinimizerIndex;
use crate::index::robinhood::RhMap;
use crate::pipeline::{OrderedDrain, Pipeline};
use crate::seq::{FastxSource, SeqPacket, SeqRecord, CODE_N};
use crate::sketch::Sketcher;

/// Coordinate offset keeping `u`/`v` positive.
pub(crate) const OFS: u32 = 0x4000_0000;
/// `lid` of a seed no chain has claimed yet.
pub(crate) const UNCHAINED: u32 = u32::MAX;
/// Chain `plen` bit marking a chain fused into another by circular linking.
pub(crate) const MERGED: u32 = 0x8000_0000;
/// Global extension trial budget per query.
pub(crate) const TRIAL_BUDGET: u32 = 50_000;
/// Per-chain seed trial budget.
pub(crate) const SEED_TRIALS: u32 = 8;
/// Mapping quality is computed in 1/16ths internally.
pub const MAPQ_COEF: u32 = 16;

/// One anchor in chain coordinate space.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Seed {
    pub u: u32,
    pub rid: u32,
    pub v: u32,
    /// Leaf that chained this seed, or [`UNCHAINED`].
    pub lid: u32,
}

/// A branch of the chain forest.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Leaf {
    /// Front (farthest-reaching) seed of the branch.
    pub rsid: u32,
    pub rid: u32,
    /// Root seed the branch started from.
    pub lsid: u32,
    /// Chain bin, `u32::MAX` until the branch closes.
    pub cid: u32,
}

/// Chain root: inverted-and-offset reach plus the owning leaf, so that
/// an ascending sort puts the best chain first.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Root {
    pub plen: u32,
    pub lid: u32,
}

/// A deferred posting list, expanded at a later occurrence tier.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Rescue<'i> {
    pub qs: u32,
    pub n: u32,
    pub p: &'i [u64],
}

/// Per-chain result accumulator.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Res {
    pub score: i64,
    pub iid: u32,
}

/// Result bin: the alignments one chain produced, with its query span.
#[derive(Debug, Clone, Default)]
pub(crate) struct Bin {
    pub plen: u32,
    pub lb: u32,
    pub ub: u32,
    /// Quantized mapping quality, filled by post-processing.
    pub mapq: u32,
    pub aln_ids: Vec<u32>,
}

impl Bin {
    fn new() -> Self {
        Self {
            lb: u32::MAX,
            ..Default::default()
        }
    }
}

/// Mapping parameters; defaults follow the noisy-long-read tuning.
#[derive(Debug, Clone)]
pub struct MapParams {
    /// Chainable window edge, in bases.
    pub wlen: i32,
    /// Link-through-gap length, in bases.
    pub glen: i32,
    pub min_score: u32,
    pub min_ratio: f32,
    pub dp: DpParams,
}

impl Default for MapParams {
    fn default() -> Self {
        Self {
            wlen: 7000,
            glen: 7000,
            min_score: 50,
            min_ratio: 0.3,
            dp: DpParams::default(),
        }
    }
}

/// One reported alignment.
#[derive(Debug, Clone)]
pub struct RegAln {
    /// Index of the result bin this alignment came from.
    pub aid: u32,
    /// Mapping quality, 0..=60.
    pub mapq: u32,
    pub aln: Alignment,
}

impl RegAln {
    /// Reference id, recovered from the trace's a-side section id.
    pub fn rid(&self) -> u32 {
        self.aln.segs[0].a_id >> 1
    }

    /// True when the query mapped in reverse orientation (the upward
    /// extension then ran over the forward query section, id 0).
    pub fn is_rev(&self) -> bool {
        self.aln.segs[0].b_id & 1 == 0
    }
}

/// All alignments kept for one query.
#[derive(Debug, Clone, Default)]
pub struct Reg {
    pub n_all: u32,
    /// Alignments belonging to primary + supplementary bins.
    pub n_uniq: u32,
    pub aln: Vec<RegAln>,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Search {
    pub cp: (i32, i32),
    pub tp: (i32, i32),
    pub aid: u32,
    pub bid: u32,
    pub iid: u32,
    pub eid: u32,
    pub sid: usize,
    pub rev: bool,
    pub prem: i64,
    pub pacc: u32,
    pub crem: u32,
    pub srem: u32,
    pub narrow: u32,
    pub min_score: u32,
}

/// Thread-local mapping state over one immutable index.
pub struct Mapper<'i> {
    pub(crate) idx: &'i MinimizerIndex,
    pub(crate) twlen: i32,
    pub(crate) tglen: i32,
    pub(crate) min_ratio: f32,
    pub(crate) min_score: u32,
    pub(crate) mcoef: f64,
    pub(crate) xcoef: f64,
    pub(crate) dp: DpAligner,
    pub(crate) sketcher: Sketcher,

    // per-query sequence context
    pub(crate) qlen: u32,
    pub(crate) rlen: u32,

    // scratch arenas
    pub(crate) words: Vec<u64>,
    pub(crate) resc: Vec<Rescue<'i>>,
    pub(crate) presc: usize,
    pub(crate) seeds: Vec<Seed>,
    pub(crate) n_seed: usize,
    pub(crate) leaves: Vec<Leaf>,
    pub(crate) roots: Vec<Root>,
    pub(crate) nexts: Vec<(u32, u32)>,
    pub(crate) res: Vec<Res>,
    pub(crate) bins: Vec<Bin>,
    pub(crate) alns: Vec<Option<Alignment>>,
    pub(crate) pos: RhMap,
    pub(crate) tail: Vec<u8>,
}

impl<'i> Mapper<'i> {
    pub fn new(idx: &'i MinimizerIndex, params: &MapParams) -> crate::Result<Self> {
        let sketcher = Sketcher::new(idx.w(), idx.k())?;
        if params.wlen <= 0 || params.glen <= 0 {
            return Err(crate::error::LramError::InvalidParam(format!(
                "window and gap lengths must be positive, got wlen={}, glen={}",
                params.wlen, params.glen
            )));
        }
        Ok(Self {
            idx,
            twlen: params.wlen,
            tglen: params.glen,
            min_ratio: params.min_ratio,
            min_score: params.min_score,
            mcoef: params.dp.mcoef(),
            xcoef: params.dp.xcoef(),
            dp: DpAligner::new(params.dp),
            sketcher,
            qlen: 0,
            rlen: 0,
            words: Vec::new(),
            resc: Vec::new(),
            presc: 0,
            seeds: Vec::new(),
            n_seed: 0,
            leaves: Vec::new(),
            roots: Vec::new(),
            nexts: Vec::new(),
            res: Vec::new(),
            bins: Vec::new(),
            alns: Vec::new(),
            pos: RhMap::new(),
            tail: vec![CODE_N; 128],
        })
    }

    fn clear(&mut self) {
        self.words.clear();
        self.resc.clear();
        self.presc = 0;
        self.seeds.clear();
        self.n_seed = 0;
        self.leaves.clear();
        self.roots.clear();
        self.nexts.clear();
        self.res.clear();
        self.bins.clear();
        self.alns.clear();
        self.pos.clear();
    }

    /// Map one encoded query; `None` when the read is unmappable or
    /// nothing met the score threshold.
    pub fn map(&mut self, qseq: &[u8]) -> Option<Reg> {
        if (qseq.len() as u64) < self.idx.k() as u64 {
            return None;
        }
        if (qseq.len() as f64) * self.mcoef < self.min_score as f64 {
            return None;
        }
        self.clear();
        self.qlen = qseq.len() as u32;

        for tier in 0..self.idx.n_occ() {
            if self.seed(tier, qseq) == 0 {
                continue;
            }
            if self.chain() == 0 {
                continue;
            }
            if self.extend(qseq) > 0 {
                break;
            }
        }
        if self.res.is_empty() {
            return None;
        }

        self.res.sort_by_key(|r| std::cmp::Reverse(r.score));
        let n_all = self.prune();
        let n_uniq = self.post_map();
        Some(self.pack_reg(n_all, n_uniq))
    }

    fn pack_reg(&mut self, n_all: usize, n_uniq: usize) -> Reg {
        let mut out = Vec::new();
        let mut uniq = 0u32;
        for (i, r) in self.res[..n_all].iter().enumerate() {
            let bin = &self.bins[r.iid as usize];
            for &aid in &bin.aln_ids {
                let aln = self.alns[aid as usize]
                    .take()
                    .expect("bin alignments are recorded exactly once");
                out.push(RegAln {
                    aid: i as u32,
                    mapq: bin.mapq / MAPQ_COEF,
                    aln,
                });
            }
            if i + 1 == n_uniq {
                uniq = out.len() as u32;
            }
        }
        Reg {
            n_all: out.len() as u32,
            n_uniq: uniq,
            aln: out,
        }
    }
}

// coordinate helpers shared by the chain/extend stages

#[inline]
pub(crate) fn uval(r: i64, q: i64) -> u32 {
    (2 * r - q + OFS as i64) as u32
}

#[inline]
pub(crate) fn vval(r: i64, q: i64) -> u32 {
    (2 * q - r + OFS as i64) as u32
}

#[inline]
pub(crate) fn bare(x: u32) -> i64 {
    x.wrapping_sub(OFS) as i32 as i64
}

/// Reference coordinate of a seed.
#[inline]
pub(crate) fn apos_of(s: &Seed) -> i32 {
    (((bare(s.u) << 1) + bare(s.v)) / 3) as i32
}

/// Query coordinate of a seed (negative on the reverse strand).
#[inline]
pub(crate) fn bpos_of(s: &Seed) -> i32 {
    (((bare(s.v) << 1) + bare(s.u)) / 3) as i32
}

/// Diagonal progress measure; non-decreasing along a chain.
#[inline]
pub(crate) fn ps(s: &Seed) -> u32 {
    s.u.wrapping_add(s.v)
}

/// Position-dedup hash key over `(apos, bpos)` and `(aid, bid)`.
#[inline]
pub(crate) fn pos_key(apos: u32, bpos: u32, aid: u32, bid: u32) -> u64 {
    let x = (bpos as u64) << 32 | apos as u64;
    let y = (bid as u64) << 32 | aid as u64;
    x ^ (x >> 29) ^ y ^ y.swap_bytes()
}

/// Map every record of `src` against `idx`, emitting results in input
/// order. `emit` receives `None` for unmapped queries.
pub fn map_file<F>(
    idx: &MinimizerIndex,
    params: &MapParams,
    src: &mut FastxSource,
    pt: &Pipeline,
    mut emit: F,
) -> crate::Result<()>
where
    F: FnMut(&SeqRecord, Option<&Reg>) -> crate::Result<()>,
{
    // surface parameter errors before threads spin up
    Mapper::new(idx, params)?;

    let mut hq: OrderedDrain<Vec<(SeqRecord, Option<Reg>)>> = OrderedDrain::new();
    pt.stream(
        || src.read_packet(),
        |_tid| {
            let mut mapper = Mapper::new(idx, params).expect("params validated above");
            move |packet: SeqPacket| {
                let id = packet.id;
                let mapped: Vec<(SeqRecord, Option<Reg>)> = packet
                    .records
                    .into_iter()
                    .map(|rec| {
                        let reg = mapper.map(&rec.seq);
                        (rec, reg)
                    })
                    .collect();
                (id, mapped)
            }
        },
        |(id, mapped)| {
            hq.push(id, mapped);
            while let Some(batch) = hq.pop_ready() {
                for (rec, reg) in &batch {
                    emit(rec, reg.as_ref())?;
                }
            }
            Ok(())
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{build_from_records, IndexParams};
    use crate::seq::encode_seq;

    fn record(name: &str, seq: &[u8], circular: bool) -> SeqRecord {
        SeqRecord {
            name: name.to_string(),
            seq: encode_seq(seq),
            qual: None,
            tag: None,
            circular,
        }
    }

    pub(crate) fn test_index(
        refs: Vec<(&str, &[u8], bool)>,
        w: u32,
        k: u32,
    ) -> MinimizerIndex {
        let params = IndexParams {
            b: 10,
            w,
            k,
            frq: vec![0.05, 0.01, 0.001],
        };
        let pt = Pipeline::new(1);
        let records = refs
            .into_iter()
            .map(|(n, s, c)| record(n, s, c))
            .collect();
        build_from_records(&params, records, &pt).unwrap()
    }

    pub(crate) fn test_params() -> MapParams {
        MapParams {
            wlen: 100,
            glen: 100,
            min_score: 5,
            min_ratio: 0.3,
            dp: DpParams::default(),
        }
    }

    #[test]
    fn test_uv_roundtrip() {
        for (r, q) in [(0i64, 0i64), (100, 40), (5000, 4999), (7, 700)] {
            let s = Seed {
                u: uval(r, q),
                v: vval(r, q),
                rid: 0,
                lid: UNCHAINED,
            };
            assert_eq!(apos_of(&s) as i64, r);
            assert_eq!(bpos_of(&s) as i64, q);
        }
    }

    #[test]
    fn test_uv_reverse_strand_twist() {
        // reverse-strand seeds carry a bit-twisted (negative) query pos
        let q = !(37u32) as i32 as i64; // qs ^ -1
        let s = Seed {
            u: uval(1000, q),
            v: vval(1000, q),
            rid: 0,
            lid: UNCHAINED,
        };
        assert!(bpos_of(&s) < 0);
        assert_eq!(apos_of(&s) as i64, 1000);
    }

    #[test]
    fn test_pos_key_differs_by_position_and_id() {
        let a = pos_key(10, 20, 0, 0);
        assert_ne!(a, pos_key(11, 20, 0, 0));
        assert_ne!(a, pos_key(10, 21, 0, 0));
        assert_ne!(a, pos_key(10, 20, 1, 0));
    }

    #[test]
    fn test_short_query_is_unmapped() {
        let idx = test_index(vec![("r0", b"ACGTACGTACGTACGTACGTACGT", false)], 2, 6);
        let mut mapper = Mapper::new(&idx, &test_params()).unwrap();
        assert!(mapper.map(&encode_seq(b"ACG")).is_none());
    }

    #[test]
    fn test_exact_match_maps_full_length() {
        let reference = b"GATTACAGGTTCAACGTTGCATCAGTACGGATCCAGTTGCACTACGTACCGTTAGCAATG";
        let idx = test_index(vec![("r0", reference, false)], 2, 8);
        let mut mapper = Mapper::new(&idx, &test_params()).unwrap();

        let query = &reference[10..50];
        let reg = mapper.map(&encode_seq(query)).expect("mapped");
        assert!(reg.n_all >= 1);
        assert!(reg.n_uniq >= 1);
        let top = &reg.aln[0];
        assert_eq!(top.aln.score, 40);
        assert_eq!(top.rid(), 0);
        assert!(!top.is_rev());
        // spans the whole query
        let blen: u32 = top.aln.segs.iter().map(|s| s.blen).sum();
        assert_eq!(blen, 40);
        assert!(top.mapq <= 60);
    }

    #[test]
    fn test_reverse_complement_maps_with_same_score() {
        let reference = b"GATTACAGGTTCAACGTTGCATCAGTACGGATCCAGTTGCACTACGTACCGTTAGCAATG";
        let idx = test_index(vec![("r0", reference, false)], 2, 8);
        let mut mapper = Mapper::new(&idx, &test_params()).unwrap();

        let query = crate::seq::revcomp(&encode_seq(&reference[10..50]));
        let reg = mapper.map(&query).expect("mapped");
        let top = &reg.aln[0];
        assert_eq!(top.aln.score, 40);
        assert!(top.is_rev());
    }

    #[test]
    fn test_mapq_is_clipped() {
        let reference = b"GATTACAGGTTCAACGTTGCATCAGTACGGATCCAGTTGCACTACGTACCGTTAGCAATG";
        let idx = test_index(vec![("r0", reference, false)], 2, 8);
        let mut mapper = Mapper::new(&idx, &test_params()).unwrap();
        let reg = mapper.map(&encode_seq(&reference[4..56])).expect("mapped");
        for a in &reg.aln {
            assert!(a.mapq <= 60);
        }
    }

    #[test]
    fn test_unrelated_query_is_unmapped() {
        let idx = test_index(
            vec![("r0", b"GATTACAGGTTCAACGTTGCATCAGTACGGATCCAGTTGCAC", false)],
            2,
            8,
        );
        let mut mapper = Mapper::new(&idx, &test_params()).unwrap();
        // no shared 8-mers
        assert!(mapper
            .map(&encode_seq(b"CCCCCCCCCCCCCCCCCCCCCCCCCCCCCC"))
            .is_none());
    }
}
