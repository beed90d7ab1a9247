//! segtile-infer: run tiled segmentation inference over a directory of images.
//!
//! Loads a model bundle, finds every image under the input directory and
//! writes one `<image>_probability_map.png` next to each, at the image's
//! original resolution.
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin segtile-infer -- [OPTIONS] <INPUT_DIRECTORY>
//! ```
//!
//! Exit codes: 0 on success, 1 when run without arguments or when the run
//! fails, 2 when options cannot be parsed.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{ArgAction, CommandFactory, Parser, ValueEnum};
use segtile_io::{
    BundleError, CancelToken, DiscoverError, ModelBundle, ReadOptions, RunConfig, RunError,
    RunReport, find_image_files, run,
};
use segtile_pipeline::{
    AnnoClasses, ClassGains, ConfigError, KernelModel, ModelError, Reduction,
    ResizeFilter, ScoringModel, TilingParameters,
};
use tracing::{error, info};

/// Tiled semantic-segmentation inference.
///
/// Splits every image under INPUT_DIRECTORY into model-sized tiles with
/// overlapping context margins, runs the bundled model on each tile and
/// stitches the results into one probability map per image.
#[derive(Debug, Parser)]
#[command(name = "segtile-infer", version, disable_help_flag = true)]
struct Cli {
    /// Directory searched recursively for .jpeg, .jpg and .png images.
    input_directory: PathBuf,

    /// Class-specific gain in `index:value` form; repeatable. Later values
    /// for the same index win.
    #[arg(short = 'g', long = "gain", value_name = "INDEX:VALUE")]
    gains: Vec<String>,

    /// Maximum tile width [default: 512 with acceleration, 4096 without].
    #[arg(short = 'w', long, value_parser = clap::builder::RangedU64ValueParser::<u32>::new().range(1..))]
    tile_max_width: Option<u32>,

    /// Maximum tile height [default: 512 with acceleration, 4096 without].
    #[arg(short = 'h', long, value_parser = clap::builder::RangedU64ValueParser::<u32>::new().range(1..))]
    tile_max_height: Option<u32>,

    /// Threads decoding input images.
    #[arg(long, default_value_t = default_thread_count(), value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    full_image_reader_thread_count: usize,

    /// Threads resizing and writing result images.
    #[arg(long, default_value_t = default_thread_count(), value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    result_image_writer_thread_count: usize,

    /// Model bundle: class definitions, downscaling factor and weights.
    #[arg(long, default_value = "segtile.bundle")]
    bundle: PathBuf,

    /// How class scores become the 8-bit output.
    #[arg(long, value_enum, default_value_t = ReductionArg::Probability)]
    reduction: ReductionArg,

    /// Class whose probability is written by `--reduction probability`.
    #[arg(long, default_value_t = 1)]
    probability_class: u16,

    /// Filter for downscaling inputs and restoring results.
    #[arg(long, value_enum, default_value_t = Filter::Triangle)]
    resize_filter: Filter,

    /// Only process images that have a label mask.
    #[arg(long)]
    require_labels: bool,

    /// Print the run report as JSON.
    #[arg(long)]
    json: bool,

    /// Print help.
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ReductionArg {
    /// Softmax probability of `--probability-class`, scaled to 0-255.
    Probability,
    /// Index of the highest-scoring class.
    Decision,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Filter {
    Nearest,
    Triangle,
    CatmullRom,
    Lanczos3,
}

impl From<Filter> for ResizeFilter {
    fn from(filter: Filter) -> Self {
        match filter {
            Filter::Nearest => Self::Nearest,
            Filter::Triangle => Self::Triangle,
            Filter::CatmullRom => Self::CatmullRom,
            Filter::Lanczos3 => Self::Lanczos3,
        }
    }
}

fn default_thread_count() -> usize {
    num_cpus::get().max(1)
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("failed to load model bundle {}: {source}", path.display())]
    Bundle {
        path: PathBuf,
        #[source]
        source: BundleError,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Discover(#[from] DiscoverError),

    #[error(transparent)]
    Run(#[from] RunError),
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Build the run settings from the command line and the loaded model.
fn run_config(cli: &Cli, model: &impl ScoringModel, downscaling_factor: f64) -> RunConfig {
    let default_max = if model.is_accelerated() {
        TilingParameters::DEFAULT_ACCELERATED_MAX_TILE
    } else {
        TilingParameters::DEFAULT_CPU_MAX_TILE
    };
    let filter = ResizeFilter::from(cli.resize_filter);
    RunConfig {
        reader_threads: cli.full_image_reader_thread_count,
        writer_threads: cli.result_image_writer_thread_count,
        tiling: TilingParameters::new(
            cli.tile_max_width.unwrap_or(default_max),
            cli.tile_max_height.unwrap_or(default_max),
            model.required_input_dimension(),
        ),
        read: ReadOptions {
            downscaling_factor,
            require_labels: cli.require_labels,
            filter,
        },
        reduction: match cli.reduction {
            ReductionArg::Probability => Reduction::Probability {
                class: cli.probability_class,
            },
            ReductionArg::Decision => Reduction::Decision,
        },
        restore_filter: filter,
    }
}

fn load_bundle(path: &Path) -> Result<ModelBundle, CliError> {
    ModelBundle::load(path).map_err(|source| CliError::Bundle {
        path: path.to_path_buf(),
        source,
    })
}

fn execute(cli: &Cli) -> Result<RunReport, CliError> {
    let bundle = load_bundle(&cli.bundle)?;
    info!(
        bundle = %cli.bundle.display(),
        downscaling_factor = bundle.downscaling_factor,
        weight_bytes = bundle.weights.len(),
        "loaded model bundle"
    );

    let classes = AnnoClasses::parse(&bundle.anno_classes_json)?;
    for class in classes.iter() {
        info!(index = class.index, name = %class.name, color = %class.color, "anno class");
    }
    let model = KernelModel::from_json(&bundle.weights)?;
    // Parsed here rather than by clap so a bad gain exits like any other
    // configuration error.
    let gains = ClassGains::parse(&cli.gains, classes.len())?;
    info!(%gains, "using class gains");

    let config = run_config(cli, &model, bundle.downscaling_factor);
    info!(
        max_tile_width = config.tiling.max_tile_width,
        max_tile_height = config.tiling.max_tile_height,
        margin = config.tiling.margin_x,
        "tiling"
    );

    let files = find_image_files(&cli.input_directory, cli.require_labels)?;
    info!(images = files.len(), directory = %cli.input_directory.display(), "found images");

    Ok(run(
        files,
        &model,
        &classes,
        &gains,
        &config,
        &CancelToken::new(),
    )?)
}

fn main() -> ExitCode {
    if std::env::args_os().len() <= 1 {
        eprintln!("{}", Cli::command().render_usage());
        return ExitCode::FAILURE;
    }

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(2)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    init_tracing();

    match execute(&cli) {
        Ok(report) => {
            if cli.json {
                match serde_json::to_string_pretty(&report) {
                    Ok(json) => println!("{json}"),
                    Err(e) => {
                        eprintln!("Error serializing run report: {e}");
                        return ExitCode::FAILURE;
                    }
                }
            } else {
                println!("{report}");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
