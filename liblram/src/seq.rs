//! Sequence records and the batched record source.
//!
//! FASTA/FASTQ parsing itself is delegated to [`needletail`]; this module
//! turns parsed records into 2-bit encoded [`SeqRecord`]s and groups them
//! into [`SeqPacket`]s of roughly [`DEFAULT_BATCH_BASES`] bases so the
//! pipeline has coarse work units to schedule. Input files may be
//! gzip-compressed (plus zstd, bzip2 and xz behind their features); the
//! format is sniffed from the leading magic bytes.
use std::collections::HashSet;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;

#[cfg(feature = "bzip2")]
use bzip2::read::BzDecoder;
use flate2::read::MultiGzDecoder;
#[cfg(feature = "xz")]
use liblzma::read::XzDecoder;
use needletail::parse_fastx_reader;
use needletail::parser::FastxReader;
#[cfg(feature = "zstd")]
use zstd::stream::read::Decoder as ZstdDecoder;

use crate::error::LramError;

/// Base codes: `A=0, C=1, G=2, T=3`, anything else is [`CODE_N`].
pub const CODE_N: u8 = 4;

/// Target number of bases per packet.
pub const DEFAULT_BATCH_BASES: usize = 512 * 1024;

const ENCODE: [u8; 256] = {
    let mut t = [CODE_N; 256];
    t[b'A' as usize] = 0;
    t[b'a' as usize] = 0;
    t[b'C' as usize] = 1;
    t[b'c' as usize] = 1;
    t[b'G' as usize] = 2;
    t[b'g' as usize] = 2;
    t[b'T' as usize] = 3;
    t[b't' as usize] = 3;
    t[b'U' as usize] = 3;
    t[b'u' as usize] = 3;
    t
};

const DECODE: [u8; 5] = *b"ACGTN";

/// Encode one ASCII base.
#[inline]
pub fn encode_base(c: u8) -> u8 {
    ENCODE[c as usize]
}

/// Complement of a base code; `N` stays `N`.
#[inline]
pub fn comp(c: u8) -> u8 {
    if c < 4 {
        3 - c
    } else {
        CODE_N
    }
}

/// Decode one base code back to ASCII.
#[inline]
pub fn decode_base(c: u8) -> u8 {
    DECODE[(c as usize).min(4)]
}

/// Encode an ASCII sequence into base codes.
pub fn encode_seq(seq: &[u8]) -> Vec<u8> {
    seq.iter().map(|&c| encode_base(c)).collect()
}

/// Reverse complement of an encoded sequence.
pub fn revcomp(seq: &[u8]) -> Vec<u8> {
    seq.iter().rev().map(|&c| comp(c)).collect()
}

/// Which reference sequences are circular.
#[derive(Debug, Clone, Default)]
pub enum CircSpec {
    /// No sequence is circular.
    #[default]
    None,
    /// Every sequence is circular.
    All,
    /// Only the named sequences are circular.
    Names(HashSet<String>),
}

impl CircSpec {
    pub fn is_circular(&self, name: &str) -> bool {
        match self {
            CircSpec::None => false,
            CircSpec::All => true,
            CircSpec::Names(names) => names.contains(name),
        }
    }
}

/// One parsed, encoded sequence record.
#[derive(Debug, Clone)]
pub struct SeqRecord {
    pub name: String,
    /// 2-bit base codes with `N = 4`, one byte per base.
    pub seq: Vec<u8>,
    /// Phred qualities as stored in the file, if any.
    pub qual: Option<Vec<u8>>,
    /// Header comment, kept only when the source is asked to.
    pub tag: Option<Vec<u8>>,
    pub circular: bool,
}

impl SeqRecord {
    pub fn len(&self) -> usize {
        self.seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seq.is_empty()
    }
}

/// A batch of records flowing through the pipeline as one work unit.
#[derive(Debug)]
pub struct SeqPacket {
    /// Ascending packet id, used by the order-preserving drain.
    pub id: u64,
    pub records: Vec<SeqRecord>,
}

/// Options for [`FastxSource`].
#[derive(Debug, Clone)]
pub struct SourceOpts {
    pub batch_bases: usize,
    /// Records shorter than this are dropped.
    pub min_len: usize,
    /// Keep the header comment in [`SeqRecord::tag`].
    pub keep_comment: bool,
    pub circular: CircSpec,
}

impl Default for SourceOpts {
    fn default() -> Self {
        Self {
            batch_bases: DEFAULT_BATCH_BASES,
            min_len: 1,
            keep_comment: false,
            circular: CircSpec::None,
        }
    }
}

/// Input compression, sniffed from a file's first bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compression {
    Plain,
    Gzip,
    #[cfg(feature = "zstd")]
    Zstd,
    #[cfg(feature = "bzip2")]
    Bzip2,
    #[cfg(feature = "xz")]
    Xz,
}

impl Compression {
    fn sniff(head: &[u8]) -> Self {
        match head {
            [0x1f, 0x8b, ..] => Self::Gzip,
            #[cfg(feature = "zstd")]
            [0x28, 0xb5, 0x2f, 0xfd, ..] => Self::Zstd,
            #[cfg(feature = "bzip2")]
            [b'B', b'Z', b'h', ..] => Self::Bzip2,
            #[cfg(feature = "xz")]
            [0xfd, b'7', b'z', b'X', b'Z', ..] => Self::Xz,
            _ => Self::Plain,
        }
    }
}

/// Open a sequence file, decompressing per the sniffed magic. The
/// sniffed bytes are chained back in front of the rest of the file, so
/// this works on any stream without seeking.
fn open_decompressed<P: AsRef<Path>>(path: P) -> std::io::Result<Box<dyn Read + Send>> {
    let mut file = File::open(path)?;
    let mut head = [0u8; 5];
    let mut got = 0;
    while got < head.len() {
        let n = file.read(&mut head[got..])?;
        if n == 0 {
            break;
        }
        got += n;
    }
    let raw = Cursor::new(head[..got].to_vec()).chain(file);

    Ok(match Compression::sniff(&head[..got]) {
        Compression::Gzip => Box::new(MultiGzDecoder::new(raw)),
        #[cfg(feature = "zstd")]
        Compression::Zstd => Box::new(ZstdDecoder::new(raw)?),
        #[cfg(feature = "bzip2")]
        Compression::Bzip2 => Box::new(BzDecoder::new(raw)),
        #[cfg(feature = "xz")]
        Compression::Xz => Box::new(XzDecoder::new(raw)),
        Compression::Plain => Box::new(raw),
    })
}

/// Split a header line into the record id and any trailing comment.
/// needletail hands back everything after the `>`/`@` marker as one line.
pub(crate) fn split_header(line: &[u8]) -> (&[u8], Option<&[u8]>) {
    match line.iter().position(|c| c.is_ascii_whitespace()) {
        Some(cut) => {
            let rest = &line[cut + 1..];
            (&line[..cut], (!rest.is_empty()).then_some(rest))
        }
        None => (line, None),
    }
}

/// A byte-producing record source over one FASTA/FASTQ file, possibly compressed.
pub struct FastxSource {
    reader: Box<dyn FastxReader>,
    opts: SourceOpts,
    next_id: u64,
    /// Set once the underlying parser reported an impossible state.
    broken: bool,
}

impl FastxSource {
    /// Open a FASTA/FASTQ file (gzip/zstd/bzip2/xz transparently decompressed).
    pub fn open<P: AsRef<Path>>(path: P, opts: SourceOpts) -> crate::Result<Self> {
        let reader = open_decompressed(&path)?;
        let reader = parse_fastx_reader(reader).map_err(|e| {
            LramError::FastxParseError(format!(
                "Error opening {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Ok(Self {
            reader,
            opts,
            next_id: 0,
            broken: false,
        })
    }

    /// Wrap an already-open reader; mainly for tests.
    pub fn from_reader<R: std::io::Read + Send + 'static>(
        reader: R,
        opts: SourceOpts,
    ) -> crate::Result<Self> {
        let reader = parse_fastx_reader(reader)
            .map_err(|e| LramError::FastxParseError(format!("Error opening reader: {e}")))?;
        Ok(Self {
            reader,
            opts,
            next_id: 0,
            broken: false,
        })
    }

    /// Read the next packet of up to `batch_bases` bases.
    ///
    /// Returns `Ok(None)` at end of input. A parse failure mid-file
    /// surfaces as [`LramError::ParserBroken`] and poisons the source.
    pub fn read_packet(&mut self) -> crate::Result<Option<SeqPacket>> {
        if self.broken {
            return Ok(None);
        }

        let mut records = Vec::new();
        let mut bases = 0usize;
        while bases < self.opts.batch_bases {
            let Some(parsed) = self.reader.next() else {
                break;
            };
            let rec = match parsed {
                Ok(rec) => rec,
                Err(e) => {
                    self.broken = true;
                    return Err(LramError::ParserBroken(e.to_string()));
                }
            };

            if rec.num_bases() < self.opts.min_len {
                continue;
            }

            let (id, comment) = split_header(rec.id());
            let name = String::from_utf8_lossy(id).into_owned();
            let circular = self.opts.circular.is_circular(&name);
            let tag = if self.opts.keep_comment {
                comment.map(|c| c.to_vec())
            } else {
                None
            };
            let seq = encode_seq(&rec.seq());
            bases += seq.len();
            records.push(SeqRecord {
                name,
                seq,
                qual: rec.qual().map(|q| q.to_vec()),
                tag,
                circular,
            });
        }

        if records.is_empty() {
            return Ok(None);
        }
        let id = self.next_id;
        self.next_id += 1;
        Ok(Some(SeqPacket { id, records }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_encode_decode() {
        let seq = b"ACGTNacgtn";
        let enc = encode_seq(seq);
        assert_eq!(enc, vec![0, 1, 2, 3, 4, 0, 1, 2, 3, 4]);
        let back: Vec<u8> = enc.iter().map(|&c| decode_base(c)).collect();
        assert_eq!(back, b"ACGTNACGTN");
    }

    #[test]
    fn test_revcomp() {
        let enc = encode_seq(b"ACGTN");
        assert_eq!(revcomp(&enc), encode_seq(b"NACGT"));
    }

    #[test]
    fn test_read_packet_batches_by_bases() {
        let mut fa = String::new();
        for i in 0..10 {
            fa.push_str(&format!(">r{i}\nACGTACGTACGT\n"));
        }
        let mut src = FastxSource::from_reader(
            Cursor::new(fa.into_bytes()),
            SourceOpts {
                batch_bases: 30,
                ..Default::default()
            },
        )
        .unwrap();

        let mut ids = Vec::new();
        let mut n_rec = 0;
        while let Some(packet) = src.read_packet().unwrap() {
            ids.push(packet.id);
            n_rec += packet.records.len();
            assert!(!packet.records.is_empty());
        }
        assert_eq!(n_rec, 10);
        assert_eq!(ids, (0..ids.len() as u64).collect::<Vec<_>>());
    }

    #[test]
    fn test_min_len_filter() {
        let fa = ">a\nACGT\n>b\nACGTACGTACGTACGT\n";
        let mut src = FastxSource::from_reader(
            Cursor::new(fa.as_bytes().to_vec()),
            SourceOpts {
                min_len: 10,
                ..Default::default()
            },
        )
        .unwrap();
        let packet = src.read_packet().unwrap().unwrap();
        assert_eq!(packet.records.len(), 1);
        assert_eq!(packet.records[0].name, "b");
    }

    #[test]
    fn test_circular_names() {
        let fa = ">chr\nACGTACGT\n>plasmid\nACGTACGT\n";
        let mut names = HashSet::new();
        names.insert("plasmid".to_string());
        let mut src = FastxSource::from_reader(
            Cursor::new(fa.as_bytes().to_vec()),
            SourceOpts {
                circular: CircSpec::Names(names),
                ..Default::default()
            },
        )
        .unwrap();
        let packet = src.read_packet().unwrap().unwrap();
        assert!(!packet.records[0].circular);
        assert!(packet.records[1].circular);
    }

    #[test]
    fn test_split_header() {
        assert_eq!(split_header(b"read1"), (&b"read1"[..], None));
        assert_eq!(
            split_header(b"read1 length=1200 ch=42"),
            (&b"read1"[..], Some(&b"length=1200 ch=42"[..]))
        );
        assert_eq!(
            split_header(b"read1\tRG:Z:a\tXX:i:2"),
            (&b"read1"[..], Some(&b"RG:Z:a\tXX:i:2"[..]))
        );
        // trailing whitespace with nothing behind it is not a comment
        assert_eq!(split_header(b"read1 "), (&b"read1"[..], None));
        assert_eq!(split_header(b""), (&b""[..], None));
    }

    #[test]
    fn test_sniff_compression() {
        use flate2::write::GzEncoder;
        use std::io::Write;

        let mut enc = GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(b">r\nACGT\n").unwrap();
        let gz = enc.finish().unwrap();
        assert_eq!(Compression::sniff(&gz[..5]), Compression::Gzip);

        assert_eq!(Compression::sniff(b">r\nAC"), Compression::Plain);
        assert_eq!(Compression::sniff(b""), Compression::Plain);
        assert_eq!(Compression::sniff(b"@"), Compression::Plain);
    }

    #[test]
    fn test_open_gzipped_fasta() {
        use flate2::write::GzEncoder;
        use std::io::Write;

        let mut enc = GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(b">chr1 assembled\nACGTACGTACGT\n>chr2\nTTTTGGGG\n")
            .unwrap();
        let gz = enc.finish().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("refs.fa.gz");
        std::fs::write(&path, gz).unwrap();

        let mut src = FastxSource::open(&path, SourceOpts::default()).unwrap();
        let packet = src.read_packet().unwrap().unwrap();
        assert_eq!(packet.records.len(), 2);
        assert_eq!(packet.records[0].name, "chr1");
        assert_eq!(packet.records[1].seq, encode_seq(b"TTTTGGGG"));
        assert!(src.read_packet().unwrap().is_none());
    }

    #[test]
    fn test_open_plain_fasta() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("refs.fa");
        std::fs::write(&path, b">only\nACGT\n").unwrap();

        let mut src = FastxSource::open(&path, SourceOpts::default()).unwrap();
        let packet = src.read_packet().unwrap().unwrap();
        assert_eq!(packet.records.len(), 1);
        assert_eq!(packet.records[0].name, "only");
        assert_eq!(packet.records[0].seq, encode_seq(b"ACGT"));
    }

    #[test]
    fn test_broken_fastq_is_parser_broken() {
        // quality string shorter than the sequence
        let fq = "@r1\nACGTACGT\n+\n!!!\n";
        let mut src =
            FastxSource::from_reader(Cursor::new(fq.as_bytes().to_vec()), SourceOpts::default())
                .unwrap();
        let err = src.read_packet().unwrap_err();
        assert!(matches!(err, LramError::ParserBroken(_)));
        // poisoned afterwards
        assert!(src.read_packet().unwrap().is_none());
    }
}
