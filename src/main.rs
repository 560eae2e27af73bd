// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::time::Instant;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use gridpop::input::write_example_files;
use gridpop::input::write_json;
use gridpop::input::OverlayInput;
use gridpop::input::PopulationInput;
use gridpop::log_recorder::LogRecorder;
use gridpop::regrid_matrix;
use gridpop::ApportionOpts;
use gridpop::RoundingRule;
use log::debug;
use log::info;

/// gridpop: reallocate geography populations onto a regular grid
///
/// gridpop takes integer populations attached to irregular source
/// geographies (census zones and the like) and spreads them over the grid
/// cells each geography overlaps. The split is estimated from sub-unit
/// counts, typically postcodes, produced by an external overlay, and every
/// geography's population is conserved exactly.
///
/// Inputs
/// ======
///
/// Both inputs are JSON, either inline or read from a file with the f: or
/// file: prefix (e.g. --populations f:pops.json).
///
/// Populations map each geography to its total:
///
///   { "E00000001": 6, "E00000002": 2 }
///
/// The overlay gives the number of sub-units in each geography and in each
/// geography/cell intersection:
///
///   {
///     "totals": { "E00000001": 40 },
///     "intersections": [
///       { "geography": "E00000001", "cell": "1km-0412-0388", "count": 16 },
///       ...
///     ]
///   }
///
/// Sub-units attributed to more than one cell are handled by rescaling each
/// geography's proportions to sum to 1.
///
/// Output
/// ======
///
/// A JSON object mapping every cell to its integer population, written to
/// --output or stdout.
///
/// Rounding
/// ========
///
/// Each geography's fractional shares are rounded to nearest (ties to even
/// by default, see --rounding) and the difference from the true total is
/// settled by largest remainder: cells with the largest rounding loss are
/// topped up, or cells with the largest rounding gain are trimmed. Ties go
/// to the lowest cell id.
#[derive(Debug, Parser)]
#[command(verbatim_doc_comment)]
struct Opts {
    /// Population document, inline JSON or f:PATH.
    #[clap(short = 'p', long, required_unless_present = "example")]
    populations: Option<String>,

    /// Overlay count document, inline JSON or f:PATH.
    #[clap(short = 'g', long, required_unless_present = "example")]
    overlay: Option<String>,

    /// Write cell populations to this file instead of stdout.
    #[clap(short = 'o', long)]
    output: Option<String>,

    /// Also dump the normalized weight matrix to this file.
    #[clap(short = 'w', long)]
    weights_out: Option<String>,

    /// Rounding rule applied before the largest-remainder correction.
    #[clap(short = 'r', long, value_enum, default_value_t = RoundingRule::HalfEven)]
    rounding: RoundingRule,

    /// Number of worker threads. 0 lets rayon pick.
    #[clap(short = 'j', long, default_value = "0")]
    jobs: usize,

    /// Write example populations.json and overlay.json into this directory
    /// and exit.
    #[clap(short = 'e', long)]
    example: Option<String>,

    /// Don't collect and report run metrics.
    #[clap(long)]
    no_metrics: bool,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    debug!("opts={:?}", &opts);

    if let Some(dir) = &opts.example {
        write_example_files(dir)?;
        info!("Wrote example inputs to {}", dir);
        return Ok(());
    }

    let recorder = LogRecorder::new();
    if !opts.no_metrics {
        metrics::set_global_recorder(recorder.clone())
            .map_err(|_| anyhow!("failed to install log recorder"))?;
    }

    if opts.jobs > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(opts.jobs)
            .build_global()
            .context("Failed to size worker pool")?;
    }

    let (Some(pops_input), Some(overlay_input)) = (&opts.populations, &opts.overlay) else {
        bail!("--populations and --overlay are required");
    };

    let started = Instant::now();

    let populations = PopulationInput::parse(pops_input)
        .with_context(|| format!("Failed to parse populations ({:?})", pops_input))?
        .to_table()
        .context("Invalid population input")?;
    let overlay = OverlayInput::parse(overlay_input)
        .with_context(|| format!("Failed to parse overlay ({:?})", overlay_input))?
        .to_aggregator()
        .context("Invalid overlay input")?;
    info!(
        "Loaded {} geographies (population {}), overlay {} totals / {} intersections",
        populations.len(),
        populations.total(),
        overlay.nr_geographies(),
        overlay.nr_intersections()
    );

    let matrix = overlay
        .calculate(&populations)
        .context("Failed to build weight matrix")?;
    if let Some(path) = &opts.weights_out {
        write_json(Some(path), &matrix.as_nested())?;
        info!("Wrote weight matrix to {}", path);
    }

    let apportion_opts = ApportionOpts {
        rounding: opts.rounding,
    };
    let (cells, summary) =
        regrid_matrix(&matrix, &populations, &apportion_opts).context("Apportionment failed")?;

    write_json(opts.output.as_deref(), &cells)?;
    if let Some(path) = &opts.output {
        info!("Wrote {} cells to {}", cells.len(), path);
    }

    debug!("summary={}", serde_json::to_string(&summary)?);
    info!("Finished in {:.3}s", started.elapsed().as_secs_f64());

    if !opts.no_metrics {
        recorder.report();
    }
    Ok(())
}
