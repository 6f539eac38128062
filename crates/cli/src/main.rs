//! phytostat CLI - zonal statistics of tree crowns over fused rasters

mod features;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use phytostat_core::{GeoTiffRaster, RasterAccess, CRS};
use phytostat_extract::{
    extract, plan_extraction, CancellationToken, ExtractConfig, RegisteredSource, Resampling,
    ResultTable, SourceKind, SourceSet, Statistic, Strategy, TileMode,
};

use crate::features::read_features;

// ─── CLI structure ──────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "phytostat")]
#[command(author, version, about = "Per-crown zonal statistics over fused rasters", long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show information about a raster file
    Info {
        /// Input raster file
        input: PathBuf,
    },
    /// Show how a run would read the rasters, without reading pixels
    Plan {
        #[command(flatten)]
        run: RunArgs,
    },
    /// Extract per-feature statistics
    Extract {
        #[command(flatten)]
        run: RunArgs,
        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Output format
        #[arg(short, long, value_enum, default_value = "csv")]
        format: OutputFormat,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Raster source as PATH[:passive|active[:nearest|bilinear]], repeatable
    #[arg(short, long = "raster", required = true)]
    rasters: Vec<String>,
    /// Band selection for a source as NAME=LIST (1-based, e.g. hsi=1-10,25)
    #[arg(short, long = "bands")]
    bands: Vec<String>,
    /// GeoJSON feature collection
    #[arg(long)]
    features: PathBuf,
    /// Property holding the feature identifier
    #[arg(long, default_value = "crown_id")]
    id_field: String,
    /// CRS of the features, overriding the file (e.g. EPSG:32619)
    #[arg(long)]
    crs: Option<String>,
    /// JSON configuration file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Tile mode: auto, per_feature, tiled
    #[arg(short, long)]
    tile_mode: Option<String>,
    /// Memory budget in MiB
    #[arg(short, long)]
    memory_mb: Option<u64>,
    /// Statistics, comma separated (mean,sd,min,max,count,med,p90)
    #[arg(short, long)]
    stats: Option<String>,
    /// Maximum number of concurrent work units
    #[arg(short = 'j', long)]
    concurrency: Option<usize>,
    /// Upper bound on the tile side in pixels
    #[arg(long)]
    tile_size: Option<usize>,
    /// Keep only pixels where every band is above this value
    #[arg(long)]
    threshold: Option<f64>,
    /// Abort on the first failed feature instead of recording its status
    #[arg(long)]
    fail_fast: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Csv,
    Json,
}

// ─── Helpers ────────────────────────────────────────────────────────────

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")
}

fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

fn done(what: &str, output: Option<&Path>, elapsed: std::time::Duration) {
    match output {
        Some(path) => eprintln!("{} saved to: {}", what, path.display()),
        None => eprintln!("{} written to stdout", what),
    }
    eprintln!("  Processing time: {:.2?}", elapsed);
}

/// Cancel `token` on SIGINT or SIGTERM so that in-flight windows finish and
/// the remaining features are reported as cancelled
fn install_interrupt_handler(token: &CancellationToken) -> Result<()> {
    let mut signals =
        Signals::new([SIGINT, SIGTERM]).context("Failed to register signal handlers")?;
    let token = token.clone();
    std::thread::Builder::new()
        .name("signal-handler".to_string())
        .spawn(move || {
            if let Some(sig) = signals.forever().next() {
                warn!("Received signal {}, cancelling after in-flight windows", sig);
                token.cancel();
            }
        })
        .context("Failed to spawn signal handler thread")?;
    Ok(())
}

/// A `--raster` argument: path plus optional kind and resampling suffixes
#[derive(Debug, PartialEq)]
struct RasterSpec {
    path: PathBuf,
    kind: SourceKind,
    resampling: Option<Resampling>,
}

fn parse_raster_spec(spec: &str) -> Result<RasterSpec> {
    let mut path = spec;
    let mut kind = SourceKind::Passive;
    let mut resampling = None;

    if let Some((head, last)) = path.rsplit_once(':') {
        if let Ok(r) = last.parse::<Resampling>() {
            let Some((head2, k)) = head.rsplit_once(':') else {
                bail!("Resampling given without a source kind in '{spec}'");
            };
            kind = k.parse().with_context(|| format!("In raster '{spec}'"))?;
            resampling = Some(r);
            path = head2;
        } else if let Ok(k) = last.parse::<SourceKind>() {
            kind = k;
            path = head;
        }
    }

    if path.is_empty() {
        bail!("Empty raster path in '{spec}'");
    }
    Ok(RasterSpec {
        path: PathBuf::from(path),
        kind,
        resampling,
    })
}

/// Parse `1-10,25` into 0-based band indices
fn parse_band_list(list: &str) -> Result<Vec<usize>> {
    let mut bands = Vec::new();
    for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (lo, hi) = match part.split_once('-') {
            Some((lo, hi)) => (lo.trim().parse::<usize>()?, hi.trim().parse::<usize>()?),
            None => {
                let b = part.parse::<usize>()?;
                (b, b)
            }
        };
        if lo == 0 || hi < lo {
            bail!("Invalid band range '{part}' (bands are 1-based)");
        }
        bands.extend(lo - 1..hi);
    }
    if bands.is_empty() {
        bail!("Empty band list '{list}'");
    }
    Ok(bands)
}

fn source_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn open_sources(run: &RunArgs) -> Result<SourceSet> {
    let mut selections = Vec::new();
    for arg in &run.bands {
        let (name, list) = arg
            .split_once('=')
            .with_context(|| format!("Expected NAME=LIST, got '{arg}'"))?;
        selections.push((name.to_string(), parse_band_list(list)?));
    }

    let pb = spinner("Opening rasters...");
    let mut sources = Vec::with_capacity(run.rasters.len());
    for arg in &run.rasters {
        let spec = parse_raster_spec(arg)?;
        let raster = GeoTiffRaster::open(&spec.path)
            .with_context(|| format!("Failed to open raster {}", spec.path.display()))?;
        let name = source_name(&spec.path);

        let mut source = RegisteredSource::new(name.clone(), Arc::new(raster), spec.kind);
        if let Some(resampling) = spec.resampling {
            source = source.with_resampling(resampling);
        }
        if let Some((_, bands)) = selections.iter().find(|(n, _)| *n == name) {
            source = source.with_bands(bands.clone());
        }
        if run.rasters.len() > 1 {
            source = source.with_label_prefix(&name);
        }
        info!("Source: {:?}", source);
        sources.push(source);
    }
    pb.finish_and_clear();

    for (name, _) in &selections {
        if !sources.iter().any(|s| s.name() == name) {
            bail!("--bands names unknown source '{name}'");
        }
    }

    SourceSet::new(sources).context("Invalid raster sources")
}

fn load_config(run: &RunArgs) -> Result<ExtractConfig> {
    let mut config = match &run.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str::<ExtractConfig>(&text)
                .with_context(|| format!("Invalid configuration in {}", path.display()))?
        }
        None => ExtractConfig::default(),
    };

    if let Some(mode) = &run.tile_mode {
        config.tile_mode = mode.parse::<TileMode>()?;
    }
    if let Some(mb) = run.memory_mb {
        config.memory_budget_bytes = mb * 1024 * 1024;
    }
    if let Some(stats) = &run.stats {
        config.statistics = stats
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse::<Statistic>)
            .collect::<std::result::Result<_, _>>()?;
    }
    if let Some(n) = run.concurrency {
        config.concurrency_limit = n;
    }
    if run.tile_size.is_some() {
        config.tile_size = run.tile_size;
    }
    if run.threshold.is_some() {
        config.threshold = run.threshold;
    }
    if run.fail_fast {
        config.fail_fast = true;
    }
    Ok(config)
}

fn load_inputs(run: &RunArgs) -> Result<(SourceSet, phytostat_core::FeatureCollection, ExtractConfig)> {
    let sources = open_sources(run)?;
    let crs = run
        .crs
        .as_deref()
        .map(str::parse::<CRS>)
        .transpose()
        .context("Invalid --crs")?;

    let pb = spinner("Reading features...");
    let features = read_features(&run.features, &run.id_field, crs)?;
    pb.finish_and_clear();

    let config = load_config(run)?;
    Ok((sources, features, config))
}

fn write_table(table: &ResultTable, format: OutputFormat, output: Option<&Path>) -> Result<()> {
    let writer: Box<dyn Write> = match output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };
    match format {
        OutputFormat::Csv => table.write_csv(writer).context("Failed to write CSV")?,
        OutputFormat::Json => {
            let mut writer = writer;
            serde_json::to_writer_pretty(&mut writer, table).context("Failed to write JSON")?;
            writeln!(writer)?;
            writer.flush()?;
        }
    }
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    const MIB: f64 = 1024.0 * 1024.0;
    if bytes as f64 >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB)
    } else {
        format!("{} B", bytes)
    }
}

// ─── Main ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    match cli.command {
        // ── Info ─────────────────────────────────────────────────────
        Commands::Info { input } => {
            let raster = GeoTiffRaster::open(&input)
                .with_context(|| format!("Failed to open raster {}", input.display()))?;
            let meta = raster.metadata();
            let extent = meta.extent();

            println!("File: {}", input.display());
            println!(
                "Dimensions: {} x {} ({} cells), {} band(s) of {:?}",
                meta.width,
                meta.height,
                meta.width * meta.height,
                meta.band_count,
                meta.data_type
            );
            println!(
                "Pixel size: {} x {}",
                meta.transform.pixel_width,
                meta.transform.pixel_height.abs()
            );
            println!(
                "Bounds: ({:.6}, {:.6}) - ({:.6}, {:.6})",
                extent.min_x, extent.min_y, extent.max_x, extent.max_y
            );
            match &meta.crs {
                Some(crs) => println!("CRS: {}", crs),
                None => println!("CRS: (none)"),
            }
            for band in 0..meta.band_count {
                let description = meta.band_descriptions[band].as_deref().unwrap_or("-");
                match meta.nodata_for(band) {
                    Some(nd) => println!("  Band {}: {} (nodata {})", band + 1, description, nd),
                    None => println!("  Band {}: {}", band + 1, description),
                }
            }
        }

        // ── Plan ─────────────────────────────────────────────────────
        Commands::Plan { run } => {
            let (sources, features, config) = load_inputs(&run)?;
            let plan = plan_extraction(&sources, &features, &config).context("Planning failed")?;

            let grid = sources.reference_grid();
            println!(
                "Reference grid: {} ({} x {})",
                sources.reference().name(),
                grid.cols,
                grid.rows
            );
            println!("Bands: {}", sources.labels().join(", "));
            match plan.strategy {
                Strategy::WholeRead => println!("Strategy: whole read"),
                Strategy::PerFeature => println!("Strategy: per feature"),
                Strategy::Tiled { tile_size } => println!("Strategy: tiled ({tile_size} px)"),
            }
            println!(
                "Work units: {} ({} concurrent)",
                plan.units.len(),
                plan.concurrency
            );
            println!(
                "Features: {} planned, {} outside the raster",
                plan.planned_features(),
                plan.out_of_bounds.len()
            );
            println!(
                "Estimated peak memory: {} of {}",
                format_bytes(plan.estimated_peak_bytes),
                format_bytes(config.memory_budget_bytes)
            );
            if cli.verbose {
                for unit in &plan.units {
                    println!("  unit {}: {} ({} features)", unit.index, unit.window, unit.features.len());
                }
            }
        }

        // ── Extract ──────────────────────────────────────────────────
        Commands::Extract {
            run,
            output,
            format,
        } => {
            let (sources, features, config) = load_inputs(&run)?;
            let token = CancellationToken::new();
            install_interrupt_handler(&token)?;

            let pb = spinner(&format!("Extracting {} features...", features.len()));
            let start = Instant::now();
            let result = extract(&sources, &features, &config, &token);
            pb.finish_and_clear();
            let table = result
                .context("Extraction failed")?
                .with_id_column(run.id_field.clone());
            let elapsed = start.elapsed();

            for (status, count) in table.status_counts() {
                info!("  {}: {}", status, count);
            }
            if token.is_cancelled() {
                warn!("Run was cancelled; unprocessed features are marked 'cancelled'");
            }

            write_table(&table, format, output.as_deref())?;
            done("Statistics", output.as_deref(), elapsed);
        }
    }

    Ok(())
}
