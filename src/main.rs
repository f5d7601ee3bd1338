//! relaxometry CLI: T1/T2 mapping and reference intensity reports

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::LazyLock;

use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use relaxometry_core::acquisition::parse_param_list;
use relaxometry_core::intensity::analyze_intensity;
use relaxometry_core::nifti_io::{list_input_files, read_volume};
use relaxometry_core::pipeline::{run_mapping, validate_job, MappingJob, NiftiStore, OutputPaths};
use relaxometry_core::{AcquisitionParams, FitOptions, Loss, MappingMode};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

static PROGRESS_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("[{elapsed_precise}] Voxels: [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
});

#[derive(Parser)]
#[command(name = "relaxometry")]
#[command(about = "Voxel-wise T1/T2 relaxometry and proton density mapping")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit T1 or T2 and proton density maps.
    Map(MapArgs),
    /// Report intensity statistics of a reference volume.
    Intensity {
        /// Volume to analyse.
        #[arg(long = "refvolume")]
        refvolume: PathBuf,
    },
}

#[derive(Args)]
struct MapArgs {
    /// Relaxation time to map: T1 or T2.
    #[arg(long)]
    mapping: Option<MappingMode>,

    /// Inversion times, comma separated (T1 mapping).
    #[arg(long = "TI", value_name = "LIST")]
    ti: Option<String>,

    /// Echo times, comma separated (T2 mapping).
    #[arg(long = "TE", value_name = "LIST")]
    te: Option<String>,

    /// Flip angles in degrees, comma separated; a single value applies to every volume.
    #[arg(long = "flip-angle", value_name = "LIST")]
    flip_angle: Option<String>,

    /// Input volumes in acquisition order.
    #[arg(
        value_name = "INPUT",
        required_unless_present = "input_dir",
        conflicts_with = "input_dir"
    )]
    inputs: Vec<PathBuf>,

    /// Directory whose .nii/.nii.gz files, sorted by name, are the inputs.
    #[arg(long)]
    input_dir: Option<PathBuf>,

    /// Binary mask; voxels at or below 0.5 are not fitted.
    #[arg(long)]
    mask: Option<PathBuf>,

    /// Directory for the output maps.
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// Prefix for output file names.
    #[arg(long, default_value = "")]
    prefix: String,

    /// Iteration cap per voxel fit.
    #[arg(long, default_value_t = FitOptions::default().max_iterations)]
    max_iterations: usize,

    /// Relative convergence tolerance.
    #[arg(long, default_value_t = FitOptions::default().tolerance)]
    tolerance: f64,

    /// Upper bound on the fitted relaxation time.
    #[arg(long, default_value_t = FitOptions::default().t_max)]
    t_max: f64,

    /// Use a Huber loss with this transition point instead of least squares.
    #[arg(long)]
    huber_delta: Option<f64>,

    /// Worker threads (defaults to all cores).
    #[arg(short = 'j', long)]
    threads: Option<usize>,

    /// Hide the progress bar.
    #[arg(long)]
    no_progress: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    tracing::info!("relaxometry v{}", env!("CARGO_PKG_VERSION"));

    let result = match cli.command {
        Commands::Map(args) => run_map(args),
        Commands::Intensity { refvolume } => run_intensity(&refvolume),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn parse_list(list: &Option<String>) -> CliResult<Option<Vec<f64>>> {
    Ok(list.as_deref().map(parse_param_list).transpose()?)
}

fn run_map(args: MapArgs) -> CliResult<()> {
    let params = AcquisitionParams::from_options(
        args.mapping,
        parse_list(&args.ti)?,
        parse_list(&args.te)?,
        parse_list(&args.flip_angle)?,
    )?;
    let mode = params.mode();

    let inputs = match &args.input_dir {
        Some(dir) => list_input_files(dir)?,
        None => args.inputs,
    };
    for path in &inputs {
        tracing::info!("input: {}", path.display());
    }

    let options = FitOptions {
        max_iterations: args.max_iterations,
        tolerance: args.tolerance,
        t_max: args.t_max,
        loss: match args.huber_delta {
            Some(delta) => Loss::Huber { delta },
            None => Loss::SquaredError,
        },
        num_threads: args.threads,
    };

    let job = MappingJob {
        inputs,
        params,
        mask: args.mask,
        options,
        outputs: OutputPaths::in_dir(&args.output_dir, &args.prefix, mode),
    };

    prepare_output_dir(&job, &args.output_dir)?;

    let bar = if args.no_progress {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(0)
    };
    bar.set_style(PROGRESS_STYLE.clone());
    let progress = BarProgress::new(bar);

    let summary = run_mapping(&NiftiStore, &job, |done, total| progress.update(done, total));
    progress.bar.finish_and_clear();
    let summary = summary?;

    println!(
        "{} map: {} voxels fitted, {} masked out, {} failed \
         (degenerate {}, not converged {}, non-finite {})",
        mode,
        summary.fitted,
        summary.masked_out,
        summary.failed(),
        summary.degenerate,
        summary.non_converged,
        summary.non_finite
    );
    println!("Wrote {}", job.outputs.relaxation.display());
    println!("Wrote {}", job.outputs.pd.display());
    Ok(())
}

/// Validate the job, then make sure `dir` exists
///
/// A configuration error leaves the filesystem untouched.
fn prepare_output_dir(job: &MappingJob, dir: &Path) -> CliResult<()> {
    validate_job(job)?;
    if !dir.exists() {
        std::fs::create_dir_all(dir)
            .map_err(|e| format!("Failed to create output dir {}: {}", dir.display(), e))?;
    }
    Ok(())
}

/// Progress bar fed from worker threads
///
/// Blocks finish in any order, so only advances past the furthest count
/// seen are applied.
struct BarProgress {
    bar: ProgressBar,
    shown: AtomicUsize,
}

impl BarProgress {
    fn new(bar: ProgressBar) -> Self {
        BarProgress {
            bar,
            shown: AtomicUsize::new(0),
        }
    }

    fn update(&self, done: usize, total: usize) {
        self.bar.set_length(total as u64);
        let previous = self.shown.fetch_max(done, Ordering::Relaxed);
        if done > previous {
            self.bar.inc((done - previous) as u64);
        }
    }
}

fn run_intensity(refvolume: &Path) -> CliResult<()> {
    tracing::info!("Reference volume is {}", refvolume.display());
    let volume = read_volume(refvolume)?;
    let report = analyze_intensity(&volume)?;
    println!("{}", report);
    println!("========== ALL DONE ============");
    Ok(())
}
