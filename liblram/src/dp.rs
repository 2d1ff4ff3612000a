//! Banded gap-affine extension DP with X-drop termination.
//!
//! The engine exposes the aligner-service contract the mapper extends
//! through: `fill_root` starts an extension at a seed position,
//! `fill` continues it after the caller swaps in a tail section,
//! `search_max` reports where the best cell landed, and `trace` walks
//! the recorded bands back into an [`Alignment`]. A fill stops at an
//! X-drop ([`STAT_TERM`]), or when it runs off the end of either input
//! section ([`STAT_UPDATE_A`] / [`STAT_UPDATE_B`]) and needs the caller
//! to provide what comes next (the circular wrap, or a sentinel tail of
//! Ns that matches nothing).
//!
//! Scores, bands and traceback directions live inside the engine and are
//! reset by `flush`; the consumed bases are copied in as the band walks
//! over them so sections do not need to outlive the call.

use crate::seq::comp;

/// Extension stopped by the X-drop criterion (or a dead band).
pub const STAT_TERM: u32 = 1;
/// Extension consumed section A to its end.
pub const STAT_UPDATE_A: u32 = 2;
/// Extension needs bases past the end of section B.
pub const STAT_UPDATE_B: u32 = 4;

const NEG: i64 = i64::MIN / 4;
const BW_BASE: u32 = 64;

/// Scoring parameters. Penalties are positive magnitudes.
#[derive(Debug, Clone, Copy)]
pub struct DpParams {
    pub match_score: i32,
    pub mismatch: i32,
    pub gap_open: i32,
    pub gap_extend: i32,
    pub xdrop: i32,
}

impl Default for DpParams {
    fn default() -> Self {
        Self {
            match_score: 1,
            mismatch: 1,
            gap_open: 1,
            gap_extend: 1,
            xdrop: 50,
        }
    }
}

impl DpParams {
    /// Average diagonal score of the substitution matrix.
    pub fn mcoef(&self) -> f64 {
        self.match_score as f64
    }

    /// Average off-diagonal score (negative).
    pub fn xcoef(&self) -> f64 {
        -(self.mismatch as f64)
    }
}

#[derive(Debug, Clone, Copy)]
enum Orient {
    Fwd,
    Rev,
}

/// A section: an oriented window over one sequence, identified by the id
/// the caller packs (`rid << 1 | orientation` for references).
#[derive(Debug, Clone, Copy)]
pub struct SecView<'a> {
    pub id: u32,
    seq: &'a [u8],
    orient: Orient,
}

impl<'a> SecView<'a> {
    pub fn fwd(id: u32, seq: &'a [u8]) -> Self {
        Self {
            id,
            seq,
            orient: Orient::Fwd,
        }
    }

    /// Reads the complement from the far end, so position 0 is the last
    /// forward base.
    pub fn rev(id: u32, seq: &'a [u8]) -> Self {
        Self {
            id,
            seq,
            orient: Orient::Rev,
        }
    }

    pub fn len(&self) -> usize {
        self.seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seq.is_empty()
    }

    #[inline]
    fn at(&self, i: usize) -> u8 {
        match self.orient {
            Orient::Fwd => self.seq[i],
            Orient::Rev => comp(self.seq[self.seq.len() - 1 - i]),
        }
    }
}

/// Result of one fill stage.
#[derive(Debug, Clone, Copy)]
pub struct Fill {
    pub max: i64,
    pub status: u32,
}

/// Where the extension max landed, in root-section coordinates (it may
/// point past the section end after a tail swap; callers clip).
#[derive(Debug, Clone, Copy)]
pub struct MaxPos {
    pub apos: u32,
    pub bpos: u32,
    /// Path length (a-steps + b-steps) at the max.
    pub plen: u32,
}

/// One contiguous run of the alignment within a single (a, b) section pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub a_id: u32,
    pub b_id: u32,
    /// Start within the a section, in that section's orientation.
    pub apos: u32,
    pub bpos: u32,
    pub alen: u32,
    pub blen: u32,
    /// Path offset of the segment start.
    pub ppos: u64,
}

/// Two-symbol path bitstring: `1` advances a, `0` advances b; a diagonal
/// step contributes one of each.
#[derive(Debug, Clone, Default)]
pub struct PathBits {
    pub bits: Vec<u8>,
    pub len: u64,
}

impl PathBits {
    fn push(&mut self, bit: bool) {
        let i = (self.len / 8) as usize;
        if i == self.bits.len() {
            self.bits.push(0);
        }
        self.bits[i] |= (bit as u8) << (self.len % 8);
        self.len += 1;
    }

    pub fn get(&self, i: u64) -> bool {
        self.bits[(i / 8) as usize] >> (i % 8) & 1 != 0
    }
}

/// A traced extension alignment.
#[derive(Debug, Clone, Default)]
pub struct Alignment {
    pub score: i64,
    /// Fraction of diagonal steps that match.
    pub identity: f32,
    /// Total path length (alen + blen over all segments).
    pub plen: u32,
    /// Exactly matching bases.
    pub mlen: u32,
    pub segs: Vec<Segment>,
    pub path: PathBits,
}

impl Alignment {
    pub fn slen(&self) -> u32 {
        self.segs.len() as u32
    }
}

/// A consumed slice of one section.
#[derive(Debug, Clone, Copy)]
struct Span {
    id: u32,
    start: u32,
    taken: u32,
}

/// The extension engine. One per mapping thread; `flush` resets it
/// between alignments.
pub struct DpAligner {
    p: DpParams,
    bw: usize,

    a_spans: Vec<Span>,
    b_spans: Vec<Span>,
    a_bases: Vec<u8>,
    b_bases: Vec<u8>,

    // frontier row (E is row-local and needs no carry)
    hrow: Vec<i64>,
    frow: Vec<i64>,
    off: i64,
    prev_best_col: i64,

    // per-row trace data
    offs: Vec<i64>,
    dirs: Vec<u8>,

    max: i64,
    max_at: (u32, u32),
    status: u32,
}

const DIR_DIAG: u8 = 0;
const DIR_E: u8 = 1;
const DIR_F: u8 = 2;
const DIR_DEAD: u8 = 3;
const EOPEN: u8 = 4;
const FOPEN: u8 = 8;

impl DpAligner {
    pub fn new(p: DpParams) -> Self {
        Self {
            p,
            bw: BW_BASE as usize,
            a_spans: Vec::new(),
            b_spans: Vec::new(),
            a_bases: Vec::new(),
            b_bases: Vec::new(),
            hrow: Vec::new(),
            frow: Vec::new(),
            off: 0,
            prev_best_col: 0,
            offs: Vec::new(),
            dirs: Vec::new(),
            max: 0,
            max_at: (0, 0),
            status: 0,
        }
    }

    pub fn params(&self) -> &DpParams {
        &self.p
    }

    /// Drop all per-alignment state, keeping buffers for reuse.
    pub fn flush(&mut self) {
        self.a_spans.clear();
        self.b_spans.clear();
        self.a_bases.clear();
        self.b_bases.clear();
        self.offs.clear();
        self.dirs.clear();
        self.max = 0;
        self.max_at = (0, 0);
        self.status = 0;
    }

    /// Start an extension of `a[apos..]` against `b[bpos..]`.
    /// `narrow` selects the band width: 64 >> narrow, at least 16.
    pub fn fill_root(
        &mut self,
        a: &SecView,
        apos: u32,
        b: &SecView,
        bpos: u32,
        narrow: u32,
    ) -> Fill {
        self.flush();
        self.bw = (BW_BASE >> narrow).max(16) as usize;
        self.a_spans.push(Span {
            id: a.id,
            start: apos,
            taken: 0,
        });
        self.b_spans.push(Span {
            id: b.id,
            start: bpos,
            taken: 0,
        });

        // row 0: pure b-gap prefix
        let bw = self.bw;
        self.hrow.clear();
        self.frow.clear();
        self.hrow.resize(bw, NEG);
        self.frow.resize(bw, NEG);
        self.off = 0;
        self.prev_best_col = 0;
        self.pull_b(b, bw);
        let avail = self.b_bases.len() as i64;
        let (go, ge, xd) = (
            self.p.gap_open as i64 + self.p.gap_extend as i64,
            self.p.gap_extend as i64,
            self.p.xdrop as i64,
        );
        self.dirs.resize(bw, DIR_DEAD);
        self.offs.push(0);
        self.hrow[0] = 0;
        for j in 1..bw as i64 {
            if j > avail {
                break;
            }
            let s = -(go + (j - 1) * ge);
            if s < -xd {
                break;
            }
            self.hrow[j as usize] = s;
            self.dirs[j as usize] = DIR_E | if j == 1 { EOPEN } else { 0 };
        }

        self.advance(a, b)
    }

    /// Continue after a tail swap; `a`/`b` are the sections to read next
    /// on whichever side(s) the previous fill exhausted.
    pub fn fill(&mut self, a: &SecView, b: &SecView) -> Fill {
        if self.status & STAT_UPDATE_A != 0 {
            self.a_spans.push(Span {
                id: a.id,
                start: 0,
                taken: 0,
            });
        }
        if self.status & STAT_UPDATE_B != 0 {
            self.b_spans.push(Span {
                id: b.id,
                start: 0,
                taken: 0,
            });
        }
        self.advance(a, b)
    }

    fn pull_b(&mut self, b: &SecView, needed: usize) {
        let span = self.b_spans.last_mut().expect("fill_root first");
        while self.b_bases.len() < needed {
            let local = (span.start + span.taken) as usize;
            if local >= b.len() {
                break;
            }
            self.b_bases.push(b.at(local));
            span.taken += 1;
        }
    }

    fn advance(&mut self, a: &SecView, b: &SecView) -> Fill {
        self.status = 0;
        let (m, x, go, ge, xd) = (
            self.p.match_score as i64,
            -(self.p.mismatch as i64),
            self.p.gap_open as i64 + self.p.gap_extend as i64,
            self.p.gap_extend as i64,
            self.p.xdrop as i64,
        );
        let bw = self.bw;

        loop {
            // band offset for the next row, centred on the best column
            let off = self.off.max(self.prev_best_col + 1 - bw as i64 / 2);

            // next reference base
            let alocal = {
                let span = self.a_spans.last().expect("fill_root first");
                (span.start + span.taken) as usize
            };
            if alocal >= a.len() {
                self.status |= STAT_UPDATE_A;
                break;
            }

            // make sure the band's columns have query bases behind them
            self.pull_b(b, (off + bw as i64) as usize);
            let avail = self.b_bases.len() as i64;
            if off > avail {
                // the whole band ran past the end of b
                self.status |= STAT_UPDATE_B;
                break;
            }

            let ac = a.at(alocal);
            self.a_spans.last_mut().unwrap().taken += 1;
            self.a_bases.push(ac);
            let i = self.a_bases.len() as u32;

            let off_p = self.off;
            let hprev = std::mem::take(&mut self.hrow);
            let fprev = std::mem::take(&mut self.frow);
            let fetch = |row: &Vec<i64>, j: i64| -> i64 {
                if j >= off_p && j < off_p + bw as i64 {
                    row[(j - off_p) as usize]
                } else {
                    NEG
                }
            };

            let mut hcur = vec![NEG; bw];
            let mut ecur = vec![NEG; bw];
            let mut fcur = vec![NEG; bw];
            let dbase = self.dirs.len();
            if self.dirs.try_reserve(bw).is_err() {
                crate::error::oom_abort("growing the extension trace");
            }
            self.dirs.resize(dbase + bw, DIR_DEAD);
            let mut best = NEG;
            let mut best_col = off;

            for j in off..off + bw as i64 {
                if j > avail {
                    break;
                }
                let jr = (j - off) as usize;

                let diag = if j >= 1 {
                    let h = fetch(&hprev, j - 1);
                    if h <= NEG / 2 {
                        NEG
                    } else {
                        let bc = self.b_bases[(j - 1) as usize];
                        h + if ac == bc && ac < 4 { m } else { x }
                    }
                } else {
                    NEG
                };

                let (fo, fx) = (fetch(&hprev, j) - go, fetch(&fprev, j) - ge);
                let f = fo.max(fx);
                let (eo, ex) = if jr > 0 {
                    (hcur[jr - 1] - go, ecur[jr - 1] - ge)
                } else {
                    (NEG, NEG)
                };
                let e = eo.max(ex);

                let mut h = diag.max(e).max(f);
                let mut dir = if h == diag {
                    DIR_DIAG
                } else if h == e {
                    DIR_E
                } else {
                    DIR_F
                };
                if h <= NEG / 2 || h < self.max - xd {
                    h = NEG;
                    dir = DIR_DEAD;
                } else {
                    if eo >= ex {
                        dir |= EOPEN;
                    }
                    if fo >= fx {
                        dir |= FOPEN;
                    }
                }
                hcur[jr] = h;
                ecur[jr] = if h <= NEG / 2 { NEG } else { e };
                fcur[jr] = if h <= NEG / 2 { NEG } else { f };
                self.dirs[dbase + jr] = dir;

                if h > best {
                    best = h;
                    best_col = j;
                }
            }

            self.hrow = hcur;
            self.frow = fcur;
            self.off = off;
            self.offs.push(off);

            if best <= NEG / 2 {
                self.status |= STAT_TERM;
                break;
            }
            self.prev_best_col = best_col;
            if best > self.max {
                self.max = best;
                self.max_at = (i, best_col as u32);
            }
            if best < self.max - xd {
                self.status |= STAT_TERM;
                break;
            }
            // the alignment walked off the end of b: ask for its tail
            let b_done = {
                let span = self.b_spans.last().expect("fill_root first");
                (span.start + span.taken) as usize >= b.len()
            };
            if b_done && best_col == avail {
                self.status |= STAT_UPDATE_B;
                break;
            }
        }

        Fill {
            max: self.max,
            status: self.status,
        }
    }

    /// Position of the global max, in root-section coordinates.
    pub fn search_max(&self) -> MaxPos {
        let (row, col) = self.max_at;
        MaxPos {
            apos: self.a_spans[0].start + row,
            bpos: self.b_spans[0].start + col,
            plen: row + col,
        }
    }

    fn dir_at(&self, i: u32, j: u32) -> u8 {
        let off = self.offs[i as usize];
        let jr = j as i64 - off;
        if jr < 0 || jr >= self.bw as i64 {
            return DIR_DEAD;
        }
        self.dirs[i as usize * self.bw + jr as usize]
    }

    /// Trace the recorded bands from the max back to the root and build
    /// the alignment. Returns `None` when the path is degenerate.
    pub fn trace(&self) -> Option<Alignment> {
        let (mut i, mut j) = self.max_at;
        if i == 0 && j == 0 {
            return None;
        }

        // 1 = a-step, 0 = b-step, diagonal pushes one of each
        #[derive(Clone, Copy, PartialEq)]
        enum Step {
            Diag,
            AGap, // consumes b only
            BGap, // consumes a only
        }
        let mut steps = Vec::with_capacity((i + j) as usize);
        let mut matches = 0u64;
        let mut n_diag = 0u64;
        let mut state = 0u8; // 0 = H, 1 = E, 2 = F
        while i > 0 || j > 0 {
            let d = self.dir_at(i, j);
            if d & 3 == DIR_DEAD && state == 0 {
                return None;
            }
            match state {
                0 => match d & 3 {
                    DIR_DIAG => {
                        n_diag += 1;
                        if self.a_bases[(i - 1) as usize] == self.b_bases[(j - 1) as usize]
                            && self.a_bases[(i - 1) as usize] < 4
                        {
                            matches += 1;
                        }
                        steps.push(Step::Diag);
                        i -= 1;
                        j -= 1;
                    }
                    DIR_E => state = 1,
                    DIR_F => state = 2,
                    _ => return None,
                },
                1 => {
                    let open = d & EOPEN != 0;
                    steps.push(Step::AGap);
                    j -= 1;
                    if open {
                        state = 0;
                    }
                }
                _ => {
                    let open = d & FOPEN != 0;
                    steps.push(Step::BGap);
                    i -= 1;
                    if open {
                        state = 0;
                    }
                }
            }
        }
        steps.reverse();

        // split into per-section segments while packing the path
        let mut aln = Alignment {
            score: self.max,
            ..Default::default()
        };
        let a_bounds: Vec<u64> = self
            .a_spans
            .iter()
            .scan(0u64, |acc, s| {
                *acc += s.taken as u64;
                Some(*acc)
            })
            .collect();
        let b_bounds: Vec<u64> = self
            .b_spans
            .iter()
            .scan(0u64, |acc, s| {
                *acc += s.taken as u64;
                Some(*acc)
            })
            .collect();
        let span_of = |bounds: &[u64], g: u64| -> usize {
            bounds.iter().position(|&ub| g < ub).unwrap_or(bounds.len() - 1)
        };
        let local = |spans: &[Span], bounds: &[u64], si: usize, g: u64| -> u32 {
            let base = if si == 0 { 0 } else { bounds[si - 1] };
            spans[si].start + (g - base) as u32
        };

        let (mut ga, mut gb) = (0u64, 0u64);
        let (mut sa, mut sb) = (span_of(&a_bounds, ga), span_of(&b_bounds, gb));
        let mut seg = Segment {
            a_id: self.a_spans[sa].id,
            b_id: self.b_spans[sb].id,
            apos: local(&self.a_spans, &a_bounds, sa, ga),
            bpos: local(&self.b_spans, &b_bounds, sb, gb),
            alen: 0,
            blen: 0,
            ppos: 0,
        };
        for step in steps {
            match step {
                Step::Diag => {
                    aln.path.push(true);
                    aln.path.push(false);
                    ga += 1;
                    gb += 1;
                }
                Step::AGap => {
                    aln.path.push(false);
                    gb += 1;
                }
                Step::BGap => {
                    aln.path.push(true);
                    ga += 1;
                }
            }
            let (na, nb) = (span_of(&a_bounds, ga), span_of(&b_bounds, gb));
            if (na != sa || nb != sb) && (ga < self.max_at.0 as u64 || gb < self.max_at.1 as u64) {
                seg.alen = local(&self.a_spans, &a_bounds, sa, ga) - seg.apos;
                seg.blen = local(&self.b_spans, &b_bounds, sb, gb) - seg.bpos;
                aln.segs.push(seg);
                sa = na;
                sb = nb;
                seg = Segment {
                    a_id: self.a_spans[sa].id,
                    b_id: self.b_spans[sb].id,
                    apos: local(&self.a_spans, &a_bounds, sa, ga),
                    bpos: local(&self.b_spans, &b_bounds, sb, gb),
                    alen: 0,
                    blen: 0,
                    ppos: aln.path.len,
                };
            }
        }
        seg.alen = local(&self.a_spans, &a_bounds, sa, ga) - seg.apos;
        seg.blen = local(&self.b_spans, &b_bounds, sb, gb) - seg.bpos;
        aln.segs.push(seg);

        aln.plen = (ga + gb) as u32;
        aln.mlen = matches as u32;
        aln.identity = if n_diag == 0 {
            0.0
        } else {
            matches as f32 / n_diag as f32
        };
        Some(aln)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seq::encode_seq;

    fn aligner() -> DpAligner {
        DpAligner::new(DpParams::default())
    }

    fn extend_all(dp: &mut DpAligner, a: &SecView, at: &SecView, b: &SecView, bt: &SecView) -> Fill {
        let mut f = dp.fill_root(a, 0, b, 0, 0);
        let mut flag = STAT_TERM;
        while flag & f.status == 0 {
            let an = if f.status & STAT_UPDATE_A != 0 { at } else { a };
            let bn = if f.status & STAT_UPDATE_B != 0 { bt } else { b };
            flag |= f.status & (STAT_UPDATE_A | STAT_UPDATE_B);
            f = dp.fill(an, bn);
        }
        f
    }

    #[test]
    fn test_exact_match_scores_full_length() {
        let r = encode_seq(b"ACGTTGCAACGTTGCAACGT");
        let q = r.clone();
        let tail = vec![4u8; 128];
        let mut dp = aligner();
        let f = extend_all(
            &mut dp,
            &SecView::fwd(0, &r),
            &SecView::fwd(0xfffe, &tail),
            &SecView::fwd(0, &q),
            &SecView::fwd(0xfffe, &tail),
        );
        assert_eq!(f.max, 20);
        let mp = dp.search_max();
        assert_eq!((mp.apos, mp.bpos), (20, 20));
        let aln = dp.trace().unwrap();
        assert_eq!(aln.score, 20);
        assert_eq!(aln.segs.len(), 1);
        assert_eq!(aln.segs[0].alen, 20);
        assert_eq!(aln.segs[0].blen, 20);
        assert!((aln.identity - 1.0).abs() < 1e-6);
        assert_eq!(aln.plen, 40);
    }

    #[test]
    fn test_mismatch_costs_score() {
        let r = encode_seq(b"ACGTTGCAACGTTGCA");
        let mut q = r.clone();
        q[8] = 3 - q[8]; // flip one base
        let tail = vec![4u8; 128];
        let mut dp = aligner();
        let f = extend_all(
            &mut dp,
            &SecView::fwd(0, &r),
            &SecView::fwd(0xfffe, &tail),
            &SecView::fwd(0, &q),
            &SecView::fwd(0xfffe, &tail),
        );
        // 15 matches - 1 mismatch
        assert_eq!(f.max, 14);
        let aln = dp.trace().unwrap();
        assert!(aln.identity < 1.0);
    }

    #[test]
    fn test_deletion_in_query() {
        let r = encode_seq(b"ACGTTGCAAGGCCACGTTGCA");
        let mut q = r.clone();
        q.remove(10); // one-base deletion
        let tail = vec![4u8; 128];
        let mut dp = aligner();
        let f = extend_all(
            &mut dp,
            &SecView::fwd(0, &r),
            &SecView::fwd(0xfffe, &tail),
            &SecView::fwd(0, &q),
            &SecView::fwd(0xfffe, &tail),
        );
        // 20 matches - gap open(2)
        assert_eq!(f.max, 20 - 2);
        let aln = dp.trace().unwrap();
        assert_eq!(aln.segs[0].alen, 21);
        assert_eq!(aln.segs[0].blen, 20);
    }

    #[test]
    fn test_xdrop_terminates_on_garbage() {
        // matching head then unrelated tails: the extension must stop
        // near the head instead of walking the whole sequences
        let mut r = encode_seq(b"ACGTTGCAACGT");
        let mut q = r.clone();
        r.extend(encode_seq(&[b'A'; 200].to_vec()));
        q.extend(encode_seq(&[b'C'; 200].to_vec()));
        let tail = vec![4u8; 128];
        let mut dp = DpAligner::new(DpParams {
            xdrop: 10,
            ..Default::default()
        });
        let f = extend_all(
            &mut dp,
            &SecView::fwd(0, &r),
            &SecView::fwd(0xfffe, &tail),
            &SecView::fwd(0, &q),
            &SecView::fwd(0xfffe, &tail),
        );
        assert!(f.status & STAT_TERM != 0);
        assert_eq!(f.max, 12);
    }

    #[test]
    fn test_reverse_section_reads_revcomp() {
        let r = encode_seq(b"ACGGTC");
        let sec = SecView::rev(1, &r);
        let got: Vec<u8> = (0..6).map(|i| sec.at(i)).collect();
        assert_eq!(got, encode_seq(b"GACCGT"));
    }

    #[test]
    fn test_wrap_into_second_section_splits_segments() {
        // a ends mid-alignment; the same section is swapped in as the
        // tail (circular) and the trace must report two segments
        let r = encode_seq(b"ACGTTGCAAC");
        let q = encode_seq(b"ACGTTGCAACACGTTGCAAC"); // two full copies
        let tail = vec![4u8; 128];
        let mut dp = aligner();
        let a = SecView::fwd(0, &r);
        let b = SecView::fwd(2, &q);
        let bt = SecView::fwd(0xfffe, &tail);
        let f = extend_all(&mut dp, &a, &a, &b, &bt);
        assert_eq!(f.max, 20);
        let aln = dp.trace().unwrap();
        assert_eq!(aln.slen(), 2);
        assert_eq!(aln.segs[0].a_id, 0);
        assert_eq!(aln.segs[1].a_id, 0);
        assert_eq!(aln.segs[0].alen + aln.segs[1].alen, 20);
        assert_eq!(aln.segs[1].apos, 0); // second segment restarts the section
    }

    #[test]
    fn test_root_offset_positions() {
        let r = encode_seq(b"TTTTACGTTGCATTTT");
        let q = encode_seq(b"AAAACGTTGCAAAAA");
        let tail = vec![4u8; 128];
        let mut dp = aligner();
        let mut f = dp.fill_root(&SecView::fwd(0, &r), 4, &SecView::fwd(0, &q), 3, 0);
        let mut flag = STAT_TERM;
        while flag & f.status == 0 {
            let a = SecView::fwd(0xfffe, &tail);
            let b = SecView::fwd(0xfffe, &tail);
            let a_r = SecView::fwd(0, &r);
            let b_q = SecView::fwd(0, &q);
            flag |= f.status & (STAT_UPDATE_A | STAT_UPDATE_B);
            f = dp.fill(
                if f.status & STAT_UPDATE_A != 0 { &a } else { &a_r },
                if f.status & STAT_UPDATE_B != 0 { &b } else { &b_q },
            );
        }
        let mp = dp.search_max();
        // 8 matching bases starting at r[4] / q[3]
        assert!(mp.apos >= 12);
        assert!(mp.bpos >= 11);
    }
}
