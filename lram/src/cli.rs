use clap::{Args as ClapArgs, Parser, Subcommand};
use std::ffi::OsStr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// `-q` only show errors and warnings. `-qq` only show errors. `-qqq` shows nothing.
    #[arg(short, long, global = true, action = clap::ArgAction::Count, conflicts_with = "verbose")]
    pub quiet: u8,

    /// `-v` show debug output. `-vv` show trace output.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build a minimizer index from reference sequences
    Index(IndexArgs),
    /// Map long reads against a reference or prebuilt index
    Map(MapArgs),
}

#[derive(ClapArgs, Debug)]
pub struct IndexArgs {
    /// Reference FASTA/FASTQ file (may be gzip/zstd/bzip2/xz compressed)
    #[arg(name = "REFERENCE", value_parser = check_path_exists)]
    pub reference: PathBuf,

    /// Output index file
    #[arg(short, long, value_name = "FILE")]
    pub output: PathBuf,

    /// k-mer size
    #[arg(short, long, value_name = "INT", default_value = "15", value_parser = clap::value_parser!(u32).range(1..=31))]
    pub kmer: u32,

    /// Minimizer window size (0 picks 2k/3)
    #[arg(short, long, value_name = "INT", default_value = "0", value_parser = clap::value_parser!(u32).range(0..=31))]
    pub window: u32,

    /// First-stage bucket bits
    #[arg(short, long, value_name = "INT", default_value = "14", value_parser = clap::value_parser!(u32).range(1..=30))]
    pub bucket_bits: u32,

    /// Occurrence-tier fractions, descending
    #[arg(short, long = "frq", value_name = "FLOAT", num_args = 1..=7, value_delimiter = ',', default_values_t = [0.05f32, 0.01, 0.001])]
    pub frq: Vec<f32>,

    /// Treat the named sequences as circular; with no names, all of them
    #[arg(short, long, value_name = "NAME", num_args = 0.., value_delimiter = ',')]
    pub circular: Option<Vec<String>>,

    /// Drop reference records shorter than this
    #[arg(short = 'L', long, value_name = "INT", default_value = "1")]
    pub min_len: usize,

    /// Number of threads to use
    #[arg(short, long, value_name = "INT", default_value = "1")]
    pub threads: usize,
}

#[derive(ClapArgs, Debug)]
pub struct MapArgs {
    /// Reference: FASTA/FASTQ, or a prebuilt `.mai` index
    #[arg(name = "REFERENCE", value_parser = check_path_exists)]
    pub reference: PathBuf,

    /// Read files to map
    #[arg(name = "READS", required = true, value_parser = check_path_exists)]
    pub reads: Vec<PathBuf>,

    /// Output PAF file
    #[arg(short, long, value_name = "FILE", default_value = "-")]
    pub output: String,

    /// k-mer size (when indexing on the fly)
    #[arg(short, long, value_name = "INT", default_value = "15", value_parser = clap::value_parser!(u32).range(1..=31))]
    pub kmer: u32,

    /// Minimizer window size (when indexing on the fly; 0 picks 2k/3)
    #[arg(short, long, value_name = "INT", default_value = "0", value_parser = clap::value_parser!(u32).range(0..=31))]
    pub window: u32,

    /// Treat the named references as circular; with no names, all of them
    #[arg(short, long, value_name = "NAME", num_args = 0.., value_delimiter = ',')]
    pub circular: Option<Vec<String>>,

    /// Chainable window edge length
    #[arg(short = 'W', long, value_name = "INT", default_value = "7000", value_parser = validate_wlen)]
    pub wlen: i32,

    /// Linkable gap length
    #[arg(short = 'G', long, value_name = "INT", default_value = "7000", value_parser = validate_glen)]
    pub glen: i32,

    /// Minimum alignment score
    #[arg(short = 's', long, value_name = "INT", default_value = "50")]
    pub min_score: u32,

    /// Minimum score ratio against the best alignment
    #[arg(short = 'm', long, value_name = "FLOAT", default_value = "0.3", value_parser = validate_ratio)]
    pub min_ratio: f32,

    /// Match award
    #[arg(short = 'a', long, value_name = "INT", default_value = "1", value_parser = clap::value_parser!(i32).range(1..=7))]
    pub match_score: i32,

    /// Mismatch penalty
    #[arg(short = 'x', long, value_name = "INT", default_value = "1", value_parser = clap::value_parser!(i32).range(1..=7))]
    pub mismatch: i32,

    /// Gap open penalty
    #[arg(short = 'p', long, value_name = "INT", default_value = "1", value_parser = clap::value_parser!(i32).range(0..=7))]
    pub gap_open: i32,

    /// Gap extension penalty
    #[arg(short = 'e', long, value_name = "INT", default_value = "1", value_parser = clap::value_parser!(i32).range(1..=7))]
    pub gap_extend: i32,

    /// X-drop cutoff
    #[arg(short = 'Y', long, value_name = "INT", default_value = "50", value_parser = validate_xdrop)]
    pub xdrop: i32,

    /// Drop reads shorter than this
    #[arg(short = 'L', long, value_name = "INT", default_value = "1")]
    pub min_len: usize,

    /// Number of threads to use
    #[arg(short, long, value_name = "INT", default_value = "1")]
    pub threads: usize,
}

/// A utility function that allows the CLI to error if a path doesn't exist
fn check_path_exists<S: AsRef<OsStr> + ?Sized>(s: &S) -> Result<PathBuf, String> {
    let path = PathBuf::from(s);
    if path.exists() {
        Ok(path)
    } else {
        Err(format!("{} does not exist", path.to_string_lossy()))
    }
}

fn validate_ratio(s: &str) -> Result<f32, String> {
    let value: f32 = s
        .parse()
        .map_err(|_| format!("`{}` is not a valid number", s))?;
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("Value `{}` must be between 0.0 and 1.0", s))
    }
}

fn validate_wlen(s: &str) -> Result<i32, String> {
    validate_range(s, 100, 100_000, "window edge length")
}

fn validate_glen(s: &str) -> Result<i32, String> {
    validate_range(s, 100, 10_000, "gap chain length")
}

fn validate_xdrop(s: &str) -> Result<i32, String> {
    validate_range(s, 10, 128, "X-drop cutoff")
}

fn validate_range(s: &str, min: i32, max: i32, what: &str) -> Result<i32, String> {
    let value: i32 = s
        .parse()
        .map_err(|_| format!("`{}` is not a valid number", s))?;
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(format!("{} must be inside [{},{}]", what, min, max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    const BIN: &str = env!("CARGO_BIN_NAME");

    #[test]
    fn check_path_exists_it_doesnt() {
        let result = check_path_exists(OsStr::new("fake.path"));
        assert!(result.is_err())
    }

    #[test]
    fn check_path_it_does() {
        let actual = check_path_exists(OsStr::new("Cargo.toml")).unwrap();
        let expected = PathBuf::from("Cargo.toml");
        assert_eq!(actual, expected)
    }

    #[test]
    fn cli_no_args() {
        let opts = Args::try_parse_from([BIN]);
        assert!(opts.is_err());
    }

    #[test]
    fn cli_index_requires_output() {
        let opts = Args::try_parse_from([BIN, "index", "Cargo.toml"]);
        assert!(opts.is_err());
    }

    #[test]
    fn cli_index_defaults() {
        let opts =
            Args::try_parse_from([BIN, "index", "Cargo.toml", "-o", "out.mai"]).unwrap();
        let Command::Index(index) = opts.command else {
            panic!("expected index subcommand");
        };
        assert_eq!(index.kmer, 15);
        assert_eq!(index.window, 0);
        assert_eq!(index.bucket_bits, 14);
        assert_eq!(index.frq, vec![0.05, 0.01, 0.001]);
        assert!(index.circular.is_none());
    }

    #[test]
    fn cli_index_circular_all() {
        let opts =
            Args::try_parse_from([BIN, "index", "Cargo.toml", "-o", "o.mai", "--circular"])
                .unwrap();
        let Command::Index(index) = opts.command else {
            panic!("expected index subcommand");
        };
        assert_eq!(index.circular, Some(vec![]));
    }

    #[test]
    fn cli_map_requires_reads() {
        let opts = Args::try_parse_from([BIN, "map", "Cargo.toml"]);
        assert!(opts.is_err());
    }

    #[test]
    fn cli_map_defaults() {
        let opts = Args::try_parse_from([BIN, "map", "Cargo.toml", "Cargo.toml"]).unwrap();
        let Command::Map(map) = opts.command else {
            panic!("expected map subcommand");
        };
        assert_eq!(map.wlen, 7000);
        assert_eq!(map.glen, 7000);
        assert_eq!(map.min_score, 50);
        assert_eq!(map.min_ratio, 0.3);
        assert_eq!(map.threads, 1);
        assert_eq!(map.output, "-");
    }

    #[test]
    fn cli_map_rejects_bad_xdrop() {
        let opts =
            Args::try_parse_from([BIN, "map", "Cargo.toml", "Cargo.toml", "-Y", "5"]);
        assert!(opts.is_err());
    }

    #[test]
    fn cli_map_rejects_bad_ratio() {
        let opts =
            Args::try_parse_from([BIN, "map", "Cargo.toml", "Cargo.toml", "-m", "1.5"]);
        assert!(opts.is_err());
    }

    #[test]
    fn cli_with_quiet_verbose_conflict() {
        let opts = Args::try_parse_from([BIN, "map", "Cargo.toml", "Cargo.toml", "-q", "-v"]);
        assert!(opts.is_err());
    }

    #[test]
    fn cli_with_verbose_counts() {
        let opts =
            Args::try_parse_from([BIN, "map", "Cargo.toml", "Cargo.toml", "-vv"]).unwrap();
        assert_eq!(opts.verbose, 2);
    }
}
