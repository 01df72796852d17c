use gpupower::analyze;
use gpupower::command;
use gpupower::config::{self, DiagnosticPolicy, PartialSettings, Settings};
use gpupower::error::Error;
use gpupower::gpu::realgpu::RealGpu;
use gpupower::interrupt;
use gpupower::monitor::Monitor;
use gpupower::sampler::SampleMode;
use gpupower::session::DeviceSession;

use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the GPUs the backend can see
    Probe {
        /// Print debug output
        #[arg(long, short, default_value_t = false)]
        verbose: bool,
    },

    /// Sample one GPU's power or energy while a workload runs
    Measure {
        /// Rank of this process, used in the output file name [default: from MPI/Slurm environment, else 0]
        #[arg(long)]
        rank: Option<u32>,

        /// Index of the GPU to sample
        #[arg(long, default_value_t = 0)]
        device: u32,

        /// Read settings from this file, command line options take precedence
        #[arg(long)]
        config: Option<String>,

        /// What to sample, power or energy [default: power]
        #[arg(long)]
        mode: Option<String>,

        /// Time between power samples, e.g. 100ms, 500us, 1s; bare numbers are microseconds; 0 for energy [default: 100ms]
        #[arg(long)]
        interval: Option<String>,

        /// Stop after this long instead of waiting for a command or a signal
        #[arg(long)]
        duration: Option<String>,

        /// Directory for the output file [default: .]
        #[arg(long)]
        output_dir: Option<String>,

        /// Output file name prefix [default: power_usage or gpu_usage by mode]
        #[arg(long)]
        prefix: Option<String>,

        /// Write power samples without timestamps
        #[arg(long, default_value_t = false)]
        no_timestamps: bool,

        /// In energy mode, do not take a second reading when the measurement stops
        #[arg(long, default_value_t = false)]
        no_end_sample: bool,

        /// Handling of device description failures: fatal, warn, or ignore [default: warn]
        #[arg(long)]
        diagnostics: Option<String>,

        /// Print debug output
        #[arg(long, short, default_value_t = false)]
        verbose: bool,

        /// The workload to run while sampling
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Compute the energy consumed from output files
    Analyze {
        /// Treat the files as power or energy data [default: from the file name]
        #[arg(long)]
        mode: Option<String>,

        /// Output files to analyze
        #[arg(required = true)]
        files: Vec<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    let status = match cli.command {
        Commands::Probe { verbose } => {
            init_logger(verbose);
            probe()
        }
        Commands::Measure {
            rank,
            device,
            config: config_file,
            mode,
            interval,
            duration,
            output_dir,
            prefix,
            no_timestamps,
            no_end_sample,
            diagnostics,
            verbose,
            command,
        } => {
            let settings = cli_settings(
                mode,
                interval,
                output_dir,
                prefix,
                no_timestamps,
                no_end_sample,
                diagnostics,
                verbose,
            )
            .and_then(|flags| config::load(config_file.as_deref(), flags));
            let duration = match duration {
                Some(d) => config::parse_interval("--duration", &d).map(Some),
                None => Ok(None),
            };
            match (settings, duration) {
                (Ok(settings), Ok(duration)) => {
                    init_logger(settings.verbose);
                    let rank = rank.unwrap_or_else(rank_from_env);
                    measure(rank, device, &settings, duration, &command)
                }
                (Err(e), _) | (_, Err(e)) => {
                    init_logger(false);
                    log::error!("{e}");
                    1
                }
            }
        }
        Commands::Analyze { mode, files } => {
            init_logger(false);
            match mode.as_deref().map(config::parse_mode).transpose() {
                Ok(mode) => analyze(mode, &files),
                Err(e) => {
                    log::error!("{e}");
                    1
                }
            }
        }
    };
    process::exit(status);
}

// Only flags that were actually given end up set, so that they override the config file and
// nothing else.
#[allow(clippy::too_many_arguments)]
fn cli_settings(
    mode: Option<String>,
    interval: Option<String>,
    output_dir: Option<String>,
    prefix: Option<String>,
    no_timestamps: bool,
    no_end_sample: bool,
    diagnostics: Option<String>,
    verbose: bool,
) -> Result<PartialSettings, String> {
    if let Some(p) = &prefix {
        config::check_prefix(p)?;
    }
    Ok(PartialSettings {
        mode: mode.as_deref().map(config::parse_mode).transpose()?,
        interval: interval
            .as_deref()
            .map(|i| config::parse_interval("--interval", i))
            .transpose()?,
        collect_at_end: no_end_sample.then_some(false),
        directory: output_dir.map(PathBuf::from),
        prefix,
        timestamps: no_timestamps.then_some(false),
        verbose: verbose.then_some(true),
        diagnostics: diagnostics.as_deref().map(config::parse_policy).transpose()?,
    })
}

fn init_logger(verbose: bool) {
    let _ = simple_logger::SimpleLogger::new()
        .with_level(if verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        })
        .env()
        .init();
}

fn fatal(e: Error) -> i32 {
    log::error!("{e}");
    e.exit_code()
}

// MPI launchers and Slurm export the rank; the first one found wins.
fn rank_from_env() -> u32 {
    ["OMPI_COMM_WORLD_RANK", "PMI_RANK", "PMIX_RANK", "SLURM_PROCID"]
        .iter()
        .find_map(|v| std::env::var(v).ok().and_then(|s| s.parse::<u32>().ok()))
        .unwrap_or(0)
}

fn probe() -> i32 {
    let mut session = match DeviceSession::initialize(&RealGpu::new()) {
        Ok(s) => s,
        Err(e) => return fatal(e.into()),
    };
    let devices = match session.enumerate(DiagnosticPolicy::Warn) {
        Ok(d) => d,
        Err(e) => return fatal(e.into()),
    };
    for d in &devices {
        println!(
            "Device {}, name = {}, bus = {}, compute mode = {}, power management = {}",
            d.index,
            d.name,
            d.bus_id,
            d.compute_mode,
            if d.power_management { "on" } else { "off" }
        );
    }
    match session.shutdown() {
        Ok(()) => 0,
        Err(e) => fatal(e.into()),
    }
}

fn measure(
    rank: u32,
    device: u32,
    settings: &Settings,
    duration: Option<Duration>,
    command: &[String],
) -> i32 {
    // Installed first so that a SIGINT or SIGTERM aimed at the job still lets us drain the sampler.
    interrupt::handle_interruptions();

    let monitor = match Monitor::start(&RealGpu::new(), rank, device, settings) {
        Ok(m) => m,
        Err(e) => return fatal(e),
    };
    log::info!("Sampling into {}", monitor.path().display());

    let workload = if !command.is_empty() {
        Some(command::run_workload(command))
    } else {
        let deadline = duration.map(|d| Instant::now() + d);
        while !interrupt::is_interrupted() && deadline.map_or(true, |d| Instant::now() < d) {
            let left = deadline.map_or(Duration::from_millis(100), |d| {
                d.saturating_duration_since(Instant::now())
            });
            thread::sleep(left.min(Duration::from_millis(100)));
        }
        None
    };

    match monitor.stop() {
        Ok(path) => log::info!("Samples written to {}", path.display()),
        Err(e) => return fatal(e),
    }

    match workload {
        None | Some(Ok(0)) => 0,
        Some(Ok(code)) => {
            log::warn!("Workload exited with status {code}");
            code as i32
        }
        Some(Err(e)) => {
            log::error!("Workload failed: {e:?}");
            1
        }
    }
}

fn analyze(mode: Option<SampleMode>, files: &[String]) -> i32 {
    let mut status = 0;
    for f in files {
        let path = PathBuf::from(f);
        match analyze::analyze_file(&path, mode) {
            Ok(joules) => println!("{}", analyze::report(&path, joules)),
            Err(e) => {
                log::error!("{e}");
                status = 1;
            }
        }
    }
    status
}
