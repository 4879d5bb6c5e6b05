use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tile_reservoir_cache::{
    PrefetchDecision, Rect, ReservoirConfig, ReservoirStats, SyntheticProducer, TileKey,
    TileLayout, TileReservoir,
};
use tile_reservoir_scheduler::{BackgroundPrefetcher, PrefetcherConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

const BACKGROUND_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(name = "tile-reservoir")]
#[command(about = "Viewport-driven tile cache simulator")]
pub struct Cli {
    /// Log viewport decisions and evictions to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Replay a viewport trace against a synthetic image and print a JSON report.
    Simulate(SimulateArgs),
    /// Print the effective reservoir configuration as JSON.
    Config {
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
    /// Print CLI version.
    Version,
}

#[derive(Debug, Args)]
struct SimulateArgs {
    /// JSON array of `{x, y, width, height}` viewports. Overrides the generated pan.
    #[arg(long, value_name = "FILE")]
    trace: Option<PathBuf>,
    #[arg(long, default_value_t = 10)]
    steps: u32,
    #[arg(long, default_value_t = 256)]
    step_x: i32,
    #[arg(long, default_value_t = 0)]
    step_y: i32,
    #[arg(long, default_value_t = 800, value_parser = clap::value_parser!(i32).range(1..))]
    viewport_width: i32,
    #[arg(long, default_value_t = 600, value_parser = clap::value_parser!(i32).range(1..))]
    viewport_height: i32,
    #[arg(long, default_value_t = 8192, value_parser = clap::value_parser!(i32).range(1..))]
    image_width: i32,
    #[arg(long, default_value_t = 8192, value_parser = clap::value_parser!(i32).range(1..))]
    image_height: i32,
    #[arg(long, default_value_t = 128, value_parser = clap::value_parser!(i32).range(1..))]
    tile_size: i32,
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Make the producer fail for a tile. Repeatable.
    #[arg(long, value_name = "COL,ROW", value_parser = parse_tile_key)]
    fail_tile: Vec<TileKey>,
    /// Fetch corona tiles on a worker pool instead of inline.
    #[arg(long)]
    background: bool,
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u64).range(1..))]
    workers: u64,
}

#[derive(Debug, Serialize)]
struct SimulationOutput {
    mode: &'static str,
    image: Rect,
    tile_size: i32,
    config: ReservoirConfig,
    steps: Vec<StepOutput>,
    stats: ReservoirStats,
}

#[derive(Debug, Serialize)]
struct StepOutput {
    step: usize,
    viewport: Rect,
    corona: Rect,
    decision: PrefetchDecision,
    overlap_ratio: f64,
    evicted: usize,
    fetched: usize,
    failed: Vec<TileKey>,
    tile_count: usize,
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    init_logging(cli.verbose);

    match cli.command {
        Commands::Simulate(args) => run_simulate(&args),
        Commands::Config { config } => run_config(config.as_deref()),
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    // A subscriber may already be installed when `run` is called more than once
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_config(path: Option<&Path>) -> Result<()> {
    let config = load_config(path)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn run_simulate(args: &SimulateArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let viewports = match &args.trace {
        Some(path) => load_trace(path)?,
        None => generated_pan(args),
    };

    let image = Rect::new(0, 0, args.image_width, args.image_height);
    let layout = TileLayout::try_new(args.tile_size, args.tile_size, image)?;
    let producer = args
        .fail_tile
        .iter()
        .fold(SyntheticProducer::new(layout), |producer, &key| {
            producer.with_failing_key(key)
        });
    let reservoir = Arc::new(TileReservoir::new(producer, config));

    info!(
        viewports = viewports.len(),
        background = args.background,
        "starting simulation"
    );

    let steps = if args.background {
        let workers = usize::try_from(args.workers).context("--workers is too large")?;
        simulate_background(&reservoir, &viewports, workers)?
    } else {
        simulate_inline(&reservoir, &viewports)
    };

    let payload = SimulationOutput {
        mode: if args.background { "background" } else { "inline" },
        image,
        tile_size: args.tile_size,
        config,
        steps,
        stats: reservoir.stats(),
    };

    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn simulate_inline(
    reservoir: &TileReservoir<SyntheticProducer>,
    viewports: &[Rect],
) -> Vec<StepOutput> {
    viewports
        .iter()
        .enumerate()
        .map(|(step, &viewport)| {
            let report = reservoir.set_viewport(viewport);
            StepOutput {
                step,
                viewport,
                corona: report.corona,
                decision: report.decision,
                overlap_ratio: report.overlap_ratio,
                evicted: report.evicted,
                fetched: report.fetched,
                failed: report.failed_keys(),
                tile_count: reservoir.tile_count(),
            }
        })
        .collect()
}

fn simulate_background(
    reservoir: &Arc<TileReservoir<SyntheticProducer>>,
    viewports: &[Rect],
    workers: usize,
) -> Result<Vec<StepOutput>> {
    let prefetcher = BackgroundPrefetcher::new(reservoir.clone(), PrefetcherConfig::new(workers))
        .context("failed to start prefetch workers")?;

    let mut steps = Vec::with_capacity(viewports.len());
    for (step, &viewport) in viewports.iter().enumerate() {
        let plan = prefetcher.request_viewport(viewport);
        if !prefetcher.wait_idle(BACKGROUND_TIMEOUT) {
            anyhow::bail!("background prefetch for step {step} did not finish in time");
        }

        // Each batch runs to completion here, so a planned key is missing only if it failed
        let failed: Vec<TileKey> =
            plan.to_fetch.iter().copied().filter(|&key| !reservoir.contains(key)).collect();

        steps.push(StepOutput {
            step,
            viewport,
            corona: plan.corona,
            decision: plan.decision,
            overlap_ratio: plan.overlap_ratio,
            evicted: plan.evicted,
            fetched: plan.to_fetch.len() - failed.len(),
            failed,
            tile_count: reservoir.tile_count(),
        });
    }

    prefetcher.shutdown();
    Ok(steps)
}

fn load_config(path: Option<&Path>) -> Result<ReservoirConfig> {
    let config = match path {
        Some(path) => ReservoirConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => ReservoirConfig::default(),
    };

    config.merge_env().context("invalid configuration in environment")
}

fn load_trace(path: &Path) -> Result<Vec<Rect>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read trace {}", path.display()))?;
    let viewports: Vec<Rect> = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse trace {}", path.display()))?;

    if viewports.is_empty() {
        anyhow::bail!("trace contains no viewports: {}", path.display());
    }

    Ok(viewports)
}

fn generated_pan(args: &SimulateArgs) -> Vec<Rect> {
    (0..args.steps)
        .map(|step| {
            let step = i32::try_from(step).unwrap_or(i32::MAX);
            Rect::new(
                step.saturating_mul(args.step_x),
                step.saturating_mul(args.step_y),
                args.viewport_width,
                args.viewport_height,
            )
        })
        .collect()
}

fn parse_tile_key(value: &str) -> Result<TileKey, String> {
    let (column, row) = value
        .split_once(',')
        .ok_or_else(|| format!("expected COL,ROW, got `{value}`"))?;
    let column = column
        .trim()
        .parse()
        .map_err(|_| format!("invalid tile column `{column}`"))?;
    let row = row
        .trim()
        .parse()
        .map_err(|_| format!("invalid tile row `{row}`"))?;
    Ok(TileKey::new(column, row))
}
