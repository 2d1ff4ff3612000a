//! Minimizer-based alignment of noisy long reads.
//!
//! `liblram` builds a two-stage minimizer index over reference sequences
//! and maps reads against it with a seed–chain–extend pipeline: seeds
//! are collected per occurrence tier, chained in a transformed diagonal
//! space, and extended with a banded gap-affine X-drop DP in both
//! directions. Results are classified into primary, supplementary and
//! secondary alignments with approximate mapping qualities.
//!
//! The index can be persisted through a block-compressed container
//! ([`container`]); indexing, mapping and container (de)compression all
//! run over the same bounded worker [`pipeline`].
//!
//! ```no_run
//! use liblram::{IndexParams, MapParams, MinimizerIndex, Pipeline};
//! use liblram::seq::{FastxSource, SourceOpts};
//!
//! # fn main() -> liblram::Result<()> {
//! let pt = Pipeline::new(4);
//! let mut refs = FastxSource::open("ref.fa", SourceOpts::default())?;
//! let idx = MinimizerIndex::build(&IndexParams::default(), &mut refs, &pt)?;
//!
//! let mut reads = FastxSource::open("reads.fq", SourceOpts::default())?;
//! liblram::map_file(&idx, &MapParams::default(), &mut reads, &pt, |rec, reg| {
//!     if let Some(reg) = reg {
//!         println!("{}: {} alignment(s)", rec.name, reg.n_all);
//!     }
//!     Ok(())
//! })?;
//! # Ok(())
//! # }
//! ```

pub mod container;
pub mod dp;
pub mod error;
pub mod index;
pub mod map;
pub mod paf;
pub mod pipeline;
pub mod seq;
pub mod sketch;

pub use self::error::LramError;
pub use self::index::{IndexParams, MinimizerIndex};
pub use self::map::{map_file, MapParams, Mapper, Reg, RegAln};
pub use self::pipeline::Pipeline;

/// Library-wide result type.
pub type Result<T> = std::result::Result<T, LramError>;
