//! PAF records built from mapper output, with serialization methods.
//!
//! One [`PafRecord`] per kept alignment; the standard 12 columns plus
//! the `tp` (primary/secondary), `AS` (score) and `id` (identity) tags.

use std::io::Write;

use serde::{Serialize, Serializer};

use crate::index::MinimizerIndex;
use crate::map::{Reg, RegAln};
use crate::seq::SeqRecord;

/// Mapping result row in the Pairwise mApping Format.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PafRecord {
    pub query_name: String,
    pub query_len: u32,
    /// Query start coordinate (0-based, original strand)
    pub query_start: u32,
    /// Query end coordinate (0-based, original strand)
    pub query_end: u32,
    /// ‘+’ if query/target on the same strand; ‘-’ if opposite
    pub strand: char,
    pub target_name: String,
    pub target_len: u32,
    /// Target start on the forward strand; a wrapped alignment on a
    /// circular target runs `target_end` past `target_len`.
    pub target_start: u32,
    pub target_end: u32,
    /// Number of matching bases in the mapping
    pub match_len: u32,
    /// Number of bases, including gaps, in the mapping
    pub block_len: u32,
    /// Mapping quality (0-60)
    pub mapq: u32,
    /// Type of aln: P/primary, S/secondary
    #[serde(serialize_with = "serialize_tp")]
    pub tp: char,
    /// Alignment score
    #[serde(serialize_with = "serialize_score")]
    pub score: i64,
    /// Fraction of matching bases in aligned columns
    #[serde(serialize_with = "serialize_id")]
    pub identity: f32,
}

/// Serialize a tag as `name:type:value`
fn serialize_tag_with_name<S, T>(
    name: &str,
    ty: char,
    value: &T,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: std::fmt::Display,
{
    serializer.serialize_str(&format!("{name}:{ty}:{value}"))
}

fn serialize_tp<S>(value: &char, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serialize_tag_with_name("tp", 'A', value, serializer)
}

fn serialize_score<S>(value: &i64, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serialize_tag_with_name("AS", 'i', value, serializer)
}

fn serialize_id<S>(value: &f32, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serialize_tag_with_name("id", 'f', &format!("{value:.4}"), serializer)
}

impl PafRecord {
    /// Build the record for one alignment of `reg`.
    pub fn from_aln(
        idx: &MinimizerIndex,
        rec: &SeqRecord,
        reg: &Reg,
        nth: usize,
    ) -> PafRecord {
        let a: &RegAln = &reg.aln[nth];
        let aln = &a.aln;
        let rid = a.rid();
        let rlen = idx.seq(rid).len();
        let qlen = rec.seq.len() as u32;

        let first = aln.segs[0];
        let last = *aln.segs.last().expect("alignments have segments");
        let alen: u32 = aln.segs.iter().map(|s| s.alen).sum();
        let blen: u32 = aln.segs.iter().map(|s| s.blen).sum();

        // the a side of a trace is always in the reversed-reference frame
        let target_start = rlen.saturating_sub(last.apos + last.alen);
        let target_end = target_start + alen;

        // the b side is in the reversed-query frame for forward mappings
        // and the forward frame for reverse mappings
        let (query_start, query_end) = if a.is_rev() {
            (first.bpos, last.bpos + last.blen)
        } else {
            (qlen - (last.bpos + last.blen), qlen - first.bpos)
        };

        // aligned columns = path steps minus one per diagonal pair
        let n_diag = if aln.identity > 0.0 {
            (aln.mlen as f64 / aln.identity as f64).round() as u32
        } else {
            0
        };
        let block_len = (alen + blen).saturating_sub(n_diag);

        PafRecord {
            query_name: rec.name.clone(),
            query_len: qlen,
            query_start,
            query_end,
            strand: if a.is_rev() { '-' } else { '+' },
            target_name: idx.seq(rid).name.clone(),
            target_len: rlen,
            target_start,
            target_end,
            match_len: aln.mlen,
            block_len,
            mapq: a.mapq,
            tp: if (nth as u32) < reg.n_uniq { 'P' } else { 'S' },
            score: aln.score,
            identity: aln.identity,
        }
    }
}

/// Tab-separated PAF writer over any `Write`.
pub struct PafWriter<W: Write> {
    inner: csv::Writer<W>,
}

impl<W: Write> PafWriter<W> {
    pub fn new(w: W) -> Self {
        let inner = csv::WriterBuilder::new()
            .has_headers(false)
            .delimiter(b'\t')
            .from_writer(w);
        Self { inner }
    }

    /// Emit every alignment of one query; unmapped queries write nothing.
    pub fn write_reg(
        &mut self,
        idx: &MinimizerIndex,
        rec: &SeqRecord,
        reg: Option<&Reg>,
    ) -> crate::Result<()> {
        let Some(reg) = reg else { return Ok(()) };
        for nth in 0..reg.aln.len() {
            self.inner
                .serialize(PafRecord::from_aln(idx, rec, reg, nth))?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> crate::Result<()> {
        self.inner.flush()?;
        Ok(())
    }
}
