//! CLI Entry Point for pulse-train-daq
//!
//! Provides command-line interface for:
//! - Running one acquisition against the configured storage backend
//! - Registering and listing experiment configurations
//! - Comparing a stored run with its ground-truth pattern
//! - Replaying records parked in the local fallback buffer
//!
//! The fieldbus client is not part of this binary: `run` polls a simulated PLC that
//! walks the experiment's bit frame in Gray-code order.
//!
//! # Usage
//!
//! ```bash
//! pulse-train-daq register --experiment press --host 192.168.0.10 --rack 0 --slot 1 --db 12 --inputs 2 --outputs 2
//! pulse-train-daq run --experiment press --duration 10 --role student
//! pulse-train-daq compare --experiment press --experiment-id 1
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use pulse_train_daq::acquisition::{stop_channel, AcquisitionLoop};
use pulse_train_daq::config::Settings;
use pulse_train_daq::ground_truth::{compare, parse_pattern};
use pulse_train_daq::logging;
use pulse_train_daq::pulse_train::format_pattern;
use pulse_train_daq::storage::{
    open_gateway, ExperimentConfig, FallbackBuffer, GroundTruthPattern, StorageGateway,
};
use pulse_train_daq::transport::SimulatedPlc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "pulse-train-daq")]
#[command(about = "PLC pulse-train acquisition with versioned exports", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/pulse_daq.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire one run of an experiment
    Run {
        /// Experiment name
        #[arg(long)]
        experiment: String,

        /// Run length in seconds (overrides acquisition.run_timeout_secs)
        #[arg(long)]
        duration: Option<u64>,

        /// Operator role, used as the export file prefix
        #[arg(long, value_enum)]
        role: Option<Role>,

        /// Dwell of each simulated state in milliseconds
        #[arg(long, default_value = "500")]
        dwell_ms: u64,
    },

    /// List configured experiments
    List,

    /// Create or replace an experiment configuration
    Register {
        #[arg(long)]
        experiment: String,
        #[arg(long)]
        host: String,
        #[arg(long, default_value = "0")]
        rack: u16,
        #[arg(long, default_value = "1")]
        slot: u16,
        #[arg(long)]
        db: u16,
        #[arg(long)]
        inputs: u8,
        #[arg(long)]
        outputs: u8,
        /// Reference pattern, e.g. "[1,3,2,0]"
        #[arg(long)]
        ground_truth: Option<String>,
    },

    /// Compare a stored run with the experiment's ground truth
    Compare {
        /// Experiment the run belongs to
        #[arg(long)]
        experiment: String,
        #[arg(long)]
        experiment_id: i64,
    },

    /// Write buffered records back to storage
    Replay,
}

#[derive(Clone, Copy, ValueEnum)]
enum Role {
    Instructor,
    Student,
}

impl Role {
    fn prefix(self) -> &'static str {
        match self {
            Role::Instructor => "instructor",
            Role::Student => "student",
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let settings = Settings::load(cli.config.as_deref()).context("loading configuration")?;
    settings.validate()?;
    logging::init_from_settings(&settings).map_err(anyhow::Error::msg)?;

    let gateway = open_gateway(&settings.storage).context("opening storage backend")?;

    match cli.command {
        Commands::Run {
            experiment,
            duration,
            role,
            dwell_ms,
        } => run_experiment(settings, gateway, &experiment, duration, role, dwell_ms).await,
        Commands::List => {
            for name in gateway.list_experiments().await? {
                println!("{name}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Register {
            experiment,
            host,
            rack,
            slot,
            db,
            inputs,
            outputs,
            ground_truth,
        } => {
            let config = ExperimentConfig {
                name: experiment,
                host,
                rack,
                slot,
                db_number: db,
                num_inputs: inputs,
                num_outputs: outputs,
            };
            register(gateway.as_ref(), config, ground_truth).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Compare {
            experiment,
            experiment_id,
        } => compare_run(gateway.as_ref(), &experiment, experiment_id).await,
        Commands::Replay => {
            let buffer = FallbackBuffer::new(settings.storage.fallback_path.clone());
            let stats = buffer.replay(gateway.as_ref()).await?;
            println!(
                "Replayed {} buffered record(s), {} remaining, {} unreadable set aside",
                stats.replayed, stats.remaining, stats.rejected
            );
            Ok(if stats.remaining == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            })
        }
    }
}

async fn run_experiment(
    mut settings: Settings,
    gateway: Arc<dyn StorageGateway>,
    experiment: &str,
    duration: Option<u64>,
    role: Option<Role>,
    dwell_ms: u64,
) -> Result<ExitCode> {
    if let Some(secs) = duration {
        settings.acquisition.run_timeout_secs = secs;
    }
    if let Some(role) = role {
        settings.export.file_prefix = Some(role.prefix().to_string());
    }

    // The simulator needs the frame width up front; the loop validates it again.
    let width = match gateway.get_config(experiment).await {
        Ok(config) => config.bit_width().map(|w| w.get()).unwrap_or(8),
        Err(err) => {
            eprintln!("❌ {err}");
            return Ok(ExitCode::from(1));
        }
    };
    let plc = SimulatedPlc::gray_counter(width, Duration::from_millis(dwell_ms));

    let (stop_tx, stop_rx) = stop_channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, stopping run");
            let _ = stop_tx.send(true);
        }
    });

    info!(experiment, run_timeout_secs = settings.acquisition.run_timeout_secs, "Starting run");
    let mut acquisition = AcquisitionLoop::new(plc, gateway, settings);
    match acquisition.run(experiment, stop_rx).await {
        Ok(report) => {
            print!("{report}");
            // Exit codes fit in a byte.
            Ok(ExitCode::from(report.exit_code() as u8))
        }
        Err(err) => {
            eprintln!("❌ Run did not start: {err}");
            Ok(ExitCode::from(1))
        }
    }
}

async fn register(
    gateway: &dyn StorageGateway,
    config: ExperimentConfig,
    ground_truth: Option<String>,
) -> Result<()> {
    let width = config
        .bit_width()
        .with_context(|| format!("experiment '{}'", config.name))?;
    gateway.upsert_config(&config).await?;
    println!(
        "✅ Registered '{}' at {} ({} bits)",
        config.name,
        config.address(),
        width.get()
    );

    if let Some(text) = ground_truth {
        parse_pattern(&text)?;
        gateway
            .upsert_ground_truth(&GroundTruthPattern {
                experiment_name: config.name.clone(),
                ground_truth: text,
            })
            .await?;
        println!("   Ground truth stored");
    }
    Ok(())
}

async fn compare_run(gateway: &dyn StorageGateway, experiment: &str, experiment_id: i64) -> Result<ExitCode> {
    let acquired = match gateway.get_summary(experiment_id).await? {
        Some(summary) => parse_pattern(&summary.pattern)?,
        None => gateway.get_pulse_values(experiment_id).await?,
    };

    let Some(reference) = gateway.get_ground_truth(experiment).await? else {
        println!("Run #{experiment_id}: {}", format_pattern(&acquired));
        println!("No ground truth stored for '{experiment}'");
        return Ok(ExitCode::from(2));
    };
    let expected = parse_pattern(&reference.ground_truth)?;
    let comparison = compare(&acquired, &expected);

    println!("Run #{experiment_id}: {}", format_pattern(&acquired));
    println!("Reference:  {}", format_pattern(&expected));
    println!("Result:     {comparison}");
    Ok(if comparison.matches {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}
