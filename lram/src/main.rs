use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn, LevelFilter};

use liblram::container::{ContainerReader, ContainerWriter};
use liblram::paf::PafWriter;
use liblram::seq::{CircSpec, FastxSource, SourceOpts};
use liblram::{map_file, IndexParams, MapParams, MinimizerIndex, Pipeline};

mod cli;

fn setup_logging(quiet: u8, verbose: u8) {
    let sum = verbose as i16 - quiet as i16;
    let lvl = match sum {
        1 => LevelFilter::Debug,
        2.. => LevelFilter::Trace,
        -1 => LevelFilter::Warn,
        -2 => LevelFilter::Error,
        i if i < -2 => LevelFilter::Off,
        _ => LevelFilter::Info,
    };
    let mut log_builder = env_logger::Builder::new();
    log_builder.filter(None, lvl);
    log_builder.init();
}

fn circ_spec(arg: &Option<Vec<String>>) -> CircSpec {
    match arg {
        None => CircSpec::None,
        Some(names) if names.is_empty() => CircSpec::All,
        Some(names) => CircSpec::Names(names.iter().cloned().collect()),
    }
}

fn run_index(args: &cli::IndexArgs) -> Result<()> {
    let start = Instant::now();
    let pt = Pipeline::new(args.threads);
    let params = IndexParams {
        b: args.bucket_bits,
        w: args.window,
        k: args.kmer,
        frq: args.frq.clone(),
    };
    let opts = SourceOpts {
        min_len: args.min_len,
        circular: circ_spec(&args.circular),
        ..Default::default()
    };

    info!(
        "indexing {} with k={}, w={}, b={}",
        args.reference.display(),
        params.k,
        params.effective_w(),
        params.effective_b()
    );
    let mut src = FastxSource::open(&args.reference, opts)
        .with_context(|| format!("opening {}", args.reference.display()))?;
    let idx = MinimizerIndex::build(&params, &mut src, &pt)?;
    info!(
        "indexed {} sequence(s) in {:.2}s",
        idx.n_seq(),
        start.elapsed().as_secs_f64()
    );

    let file = File::create(&args.output)
        .map(BufWriter::new)
        .with_context(|| format!("creating {}", args.output.display()))?;
    let mut container = ContainerWriter::new(file, &pt);
    idx.dump(&mut container)?;
    container.finish()?;
    info!(
        "index written to {} ({:.2}s total)",
        args.output.display(),
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

fn load_or_build_index(args: &cli::MapArgs, pt: &Pipeline) -> Result<MinimizerIndex> {
    let is_index = args
        .reference
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("mai"));
    if is_index {
        if args.circular.is_some() {
            warn!(
                "index will be loaded from `{}'; circular option is ignored",
                args.reference.display()
            );
        }
        debug!("loading index from {}", args.reference.display());
        let file = File::open(&args.reference)
            .map(BufReader::new)
            .with_context(|| format!("opening {}", args.reference.display()))?;
        let mut container = ContainerReader::new(file, pt);
        return Ok(MinimizerIndex::load(&mut container)?);
    }

    debug!("building index from {}", args.reference.display());
    let params = IndexParams {
        k: args.kmer,
        w: args.window,
        ..Default::default()
    };
    let opts = SourceOpts {
        circular: circ_spec(&args.circular),
        ..Default::default()
    };
    let mut src = FastxSource::open(&args.reference, opts)?;
    Ok(MinimizerIndex::build(&params, &mut src, pt)?)
}

fn run_map(args: &cli::MapArgs) -> Result<()> {
    let start = Instant::now();
    let pt = Pipeline::new(args.threads);
    let idx = load_or_build_index(args, &pt)?;
    info!(
        "index ready: {} sequence(s), k={}, w={} ({:.2}s)",
        idx.n_seq(),
        idx.k(),
        idx.w(),
        start.elapsed().as_secs_f64()
    );

    let params = MapParams {
        wlen: args.wlen,
        glen: args.glen,
        min_score: args.min_score,
        min_ratio: args.min_ratio,
        dp: liblram::dp::DpParams {
            match_score: args.match_score,
            mismatch: args.mismatch,
            gap_open: args.gap_open,
            gap_extend: args.gap_extend,
            xdrop: args.xdrop,
        },
    };

    let out: Box<dyn Write> = if args.output == "-" {
        Box::new(BufWriter::new(io::stdout()))
    } else {
        Box::new(BufWriter::new(
            File::create(&args.output).with_context(|| format!("creating {}", args.output))?,
        ))
    };
    let mut paf = PafWriter::new(out);

    let mut n_reads = 0u64;
    let mut n_mapped = 0u64;
    for path in &args.reads {
        info!("mapping {}", path.display());
        let opts = SourceOpts {
            min_len: args.min_len,
            ..Default::default()
        };
        let mut src = match FastxSource::open(path, opts) {
            Ok(src) => src,
            Err(e) => {
                warn!("skipping {}: {}", path.display(), e);
                continue;
            }
        };
        let mapped = map_file(&idx, &params, &mut src, &pt, |rec, reg| {
            n_reads += 1;
            n_mapped += reg.is_some() as u64;
            paf.write_reg(&idx, rec, reg)
        });
        if let Err(e) = mapped {
            // a broken record mid-file abandons that file, not the run
            warn!("aborting {}: {}", path.display(), e);
        }
    }
    paf.flush()?;

    info!(
        "mapped {}/{} read(s) in {:.2}s",
        n_mapped,
        n_reads,
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

fn main() -> Result<()> {
    let args = cli::Args::parse();
    setup_logging(args.quiet, args.verbose);
    debug!("{:?}", args);

    match &args.command {
        cli::Command::Index(index_args) => run_index(index_args),
        cli::Command::Map(map_args) => run_map(map_args),
    }
}
