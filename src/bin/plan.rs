use std::error::Error;

use clap::Parser;
use rayon::prelude::*;

use skyslab::memory::{gib_to_bytes, memory_ceiling, SystemProbe};
use skyslab::{logging, Datastream, DatastreamSpec, DecompError, DecompositionKind, LogLevel};

/// Print how a dataset would be split across ranks and accelerator sub-calls.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Global array shape, slowest axis first, e.g. 1024,1024,1024
    #[arg(short, long, value_delimiter = ',', required = true)]
    shape: Vec<usize>,

    #[arg(short, long, default_value = "1")]
    ranks: usize,

    #[arg(short, long, default_value = "0")]
    axis: usize,

    #[arg(short, long, default_value = "4")]
    bytes_per_cell: u64,

    #[arg(short, long, default_value = "4")]
    peak_bytes_per_cell: u64,

    #[arg(short, long, default_value = "1.0")]
    overhead: f64,

    /// Memory per sub-call in GiB. Probed from this machine when not given.
    #[arg(short, long, default_value = None)]
    memory_gb: Option<f64>,

    #[arg(short, long, default_value = "40.0")]
    gpu_cap_gb: f64,

    #[arg(short, long, default_value = "slab")]
    decomposition: String,

    #[arg(short, long, default_value = "1")]
    log_level: u8,
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = CliArgs::parse();

    logging::init(LogLevel::try_from(args.log_level)?)?;

    let kind: DecompositionKind = args.decomposition.parse()?;
    if args.ranks == 0 {
        return Err(DecompError::InvalidUnitCount(0).into());
    }

    let ceiling = match args.memory_gb {
        Some(gb) => gib_to_bytes(gb)?,
        None => memory_ceiling(&SystemProbe, gib_to_bytes(args.gpu_cap_gb)?, false)?.bytes,
    };

    let spec = DatastreamSpec::new(
        args.shape,
        args.bytes_per_cell,
        args.peak_bytes_per_cell,
        args.overhead,
    )
    .with_kind(kind)
    .with_axis(args.axis);

    let plans = (0..args.ranks)
        .into_par_iter()
        .map(|rank| Datastream::plan_rank(&spec, args.ranks, rank, ceiling))
        .collect::<Result<Vec<_>, _>>()?;

    println!(
        "{} decomposition of {:?} along axis {} over {} ranks, {} bytes per sub-call",
        kind, spec.shape, spec.axis, args.ranks, ceiling
    );
    for (rank, plan) in plans.iter().enumerate() {
        let p = plan.partition();
        println!(
            "rank {}: [{}, {}) at byte {}, {} sub-calls",
            rank,
            p.start,
            p.stop,
            plan.rank_offset(),
            plan.num_chunks()
        );
        for chunk in plan {
            println!(
                "  [{}, {}) bytes {:?} shape {:?}",
                chunk.start,
                chunk.stop,
                chunk.byte_range(spec.bytes_per_cell)?,
                chunk.shape
            );
        }
    }

    Ok(())
}
