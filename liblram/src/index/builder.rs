//! Index construction pipeline.
//!
//! Three phases: an ordered stream that sketches record packets and
//! scatters minimizers into buckets, a parallel per-bucket sort/count
//! pass that feeds the occurrence histogram, and a parallel pass that
//! packs each bucket into its second-stage hash table and posting array.

use log::{debug, info};

use crate::error::LramError;
use crate::index::robinhood::RhMap;
use crate::index::{posting, Bucket, MinimizerIndex, RefSeq, MAX_FRQ_CNT};
use crate::pipeline::{OrderedDrain, Pipeline};
use crate::seq::{FastxSource, SeqPacket, SeqRecord};
use crate::sketch::{Sketcher, WordDecoder};

/// Indexing parameters.
#[derive(Debug, Clone)]
pub struct IndexParams {
    /// First-stage bucket selector width in bits; clipped to `2k`.
    pub b: u32,
    /// Minimizer window size; `0` picks `2k/3`.
    pub w: u32,
    /// k-mer size.
    pub k: u32,
    /// Occurrence-tier fractions, strictly descending, at most 7.
    pub frq: Vec<f32>,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            b: 14,
            w: 0, // derived from k
            k: 15,
            frq: vec![0.05, 0.01, 0.001],
        }
    }
}

impl IndexParams {
    pub fn effective_w(&self) -> u32 {
        if self.w == 0 || self.w > 31 {
            (2.0 / 3.0 * self.k as f64 + 0.499) as u32
        } else {
            self.w
        }
    }

    pub fn effective_b(&self) -> u32 {
        self.b.min(2 * self.k)
    }

    fn validate(&self) -> crate::Result<(u32, u32, u32)> {
        let w = self.effective_w();
        let k = self.k;
        // surfaces InvalidParam for out-of-range w/k
        Sketcher::new(w, k)?;
        if self.frq.is_empty() || self.frq.len() > MAX_FRQ_CNT {
            return Err(LramError::InvalidParam(format!(
                "need 1..={MAX_FRQ_CNT} occurrence fractions, got {}",
                self.frq.len()
            )));
        }
        if self.frq.windows(2).any(|p| p[0] <= p[1]) {
            return Err(LramError::InvalidParam(
                "occurrence fractions must be strictly descending".to_string(),
            ));
        }
        Ok((self.effective_b(), w, k))
    }
}

/// A minimizer scattered into its bucket, pre-sort.
#[derive(Debug, Clone, Copy)]
struct Mini {
    /// Hash bits above the bucket selector.
    hrem: u64,
    pos: u32,
    /// `rid << 1 | strand`.
    rid_s: u32,
}

#[derive(Default)]
struct BktBuild {
    minis: Vec<Mini>,
    n_keys: u32,
    n_single: u32,
    h: RhMap,
    postings: Vec<u64>,
}

/// One sketched record travelling from worker to drain.
struct Sketched {
    rec: SeqRecord,
    words: Vec<u64>,
}

pub(crate) fn build(
    params: &IndexParams,
    src: &mut FastxSource,
    pt: &Pipeline,
) -> crate::Result<MinimizerIndex> {
    build_inner(params, pt, |_| src.read_packet())
}

/// Build from pre-made packets; used by tests and in-memory callers.
pub(crate) fn build_from_packets(
    params: &IndexParams,
    packets: Vec<SeqPacket>,
    pt: &Pipeline,
) -> crate::Result<MinimizerIndex> {
    let mut iter = packets.into_iter();
    build_inner(params, pt, move |_| Ok(iter.next()))
}

fn build_inner(
    params: &IndexParams,
    pt: &Pipeline,
    mut next_packet: impl FnMut(()) -> crate::Result<Option<SeqPacket>>,
) -> crate::Result<MinimizerIndex> {
    let (b, w, k) = params.validate()?;
    let mask = (1u64 << b) - 1;
    // the wrapped prefix only has to cover the first window of k-mers
    let wrap = (w + k) as usize;

    let mut bkts: Vec<BktBuild> = (0..1usize << b).map(|_| BktBuild::default()).collect();
    let mut seqs: Vec<RefSeq> = Vec::new();
    let mut hq: OrderedDrain<Vec<Sketched>> = OrderedDrain::new();

    pt.stream(
        || next_packet(()),
        |_tid| {
            let mut sk = Sketcher::new(w, k).expect("params validated");
            move |packet: SeqPacket| {
                let id = packet.id;
                let sketched: Vec<Sketched> = packet
                    .records
                    .into_iter()
                    .map(|rec| {
                        let mut words = Vec::new();
                        let cap = sk.sketch(&rec.seq, &mut words);
                        if rec.circular {
                            // nori-shiro: run the head past the tail so
                            // wrap-spanning windows get postings too
                            let n = rec.seq.len().min(wrap);
                            sk.resume(&cap, &rec.seq[..n], &mut words);
                        }
                        Sketched { rec, words }
                    })
                    .collect();
                (id, sketched)
            }
        },
        |(id, sketched)| {
            hq.push(id, sketched);
            while let Some(batch) = hq.pop_ready() {
                for s in batch {
                    let rid = seqs.len() as u32;
                    let mut dec = WordDecoder::new(w);
                    for &word in &s.words {
                        let m = dec.step(word);
                        bkts[(m.hash & mask) as usize].minis.push(Mini {
                            hrem: m.hash >> b,
                            pos: m.pos,
                            rid_s: rid << 1 | m.rev as u32,
                        });
                    }
                    seqs.push(RefSeq {
                        name: s.rec.name,
                        seq: s.rec.seq,
                        circular: s.rec.circular,
                    });
                }
            }
            Ok(())
        },
    )?;
    debug!("collected minimizers over {} sequences", seqs.len());

    // sort each bucket and histogram key occurrences
    let chunk_counts = pt.parallel_chunks(&mut bkts, |_tid, chunk| {
        let mut counts: Vec<u32> = Vec::new();
        for bkt in chunk.iter_mut() {
            if bkt.minis.is_empty() {
                continue;
            }
            bkt.minis
                .sort_unstable_by_key(|m| (m.hrem, m.rid_s, m.pos));
            let mut n = 1u32;
            let mut n_keys = 0u32;
            let mut n_single = 0u32;
            for i in 1..bkt.minis.len() {
                if bkt.minis[i].hrem != bkt.minis[i - 1].hrem {
                    n_single += (n == 1) as u32;
                    counts.push(n);
                    n_keys += 1;
                    n = 0;
                }
                n += 1;
            }
            n_single += (n == 1) as u32;
            counts.push(n);
            bkt.n_keys = n_keys + 1;
            bkt.n_single = n_single;
        }
        counts
    });
    let mut counts: Vec<u32> = chunk_counts.into_iter().flatten().collect();
    debug!("distinct keys: {}", counts.len());

    // occurrence thresholds: order statistics over the key histogram
    let mut occ = [u32::MAX; MAX_FRQ_CNT];
    let n_occ = params.frq.len();
    for (i, &f) in params.frq.iter().enumerate() {
        occ[i] = if f <= 0.0 || counts.is_empty() {
            u32::MAX
        } else {
            let nth = (((1.0 - f as f64) * counts.len() as f64) as usize)
                .min(counts.len() - 1);
            let (_, val, _) = counts.select_nth_unstable(nth);
            *val + 1
        };
    }
    info!(
        "occurrence thresholds: {:?}",
        &occ[..n_occ]
    );

    // pack each bucket into its hash table and posting array
    let max_cnt = occ[n_occ - 1];
    pt.parallel_chunks(&mut bkts, |_tid, chunk| {
        for bkt in chunk.iter_mut() {
            if bkt.minis.is_empty() {
                continue;
            }
            bkt.h = RhMap::with_keys(bkt.n_keys as usize);
            let minis = std::mem::take(&mut bkt.minis);
            let mut i = 0;
            while i < minis.len() {
                let mut j = i + 1;
                while j < minis.len() && minis[j].hrem == minis[i].hrem {
                    j += 1;
                }
                let cnt = (j - i) as u64;
                if cnt <= max_cnt as u64 {
                    let key = minis[i].hrem;
                    if cnt == 1 {
                        let m = &minis[i];
                        bkt.h
                            .put(key, posting::pack(m.rid_s >> 1, m.rid_s & 1 != 0, m.pos));
                    } else {
                        let base = bkt.postings.len() as u64;
                        for m in &minis[i..j] {
                            bkt.postings
                                .push(posting::pack(m.rid_s >> 1, m.rid_s & 1 != 0, m.pos));
                        }
                        bkt.h.put(key, base << 32 | 1 << 63 | cnt);
                    }
                }
                i = j;
            }
            bkt.postings.shrink_to_fit();
        }
    });

    let buckets: Vec<Bucket> = bkts
        .into_iter()
        .map(|bkt| Bucket {
            h: bkt.h,
            postings: bkt.postings,
        })
        .collect();

    Ok(MinimizerIndex {
        b,
        w,
        k,
        mask,
        n_occ,
        occ,
        buckets,
        seqs,
    })
}
