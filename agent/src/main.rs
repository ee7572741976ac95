use clap::{Parser, Subcommand};
use condor_agent::{
    cleaner::SubmitCleaner,
    condor::resolve_submit_dir,
    config::{AgentConfig, DEFAULT_CONFIG_PATH},
    server::{self, AgentState},
    submit::{SubmitRequest, Submitter},
};
use std::{
    fs,
    io::{self, Write},
    net::SocketAddr,
    path::PathBuf,
    process::ExitCode,
    time::SystemTime,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_unwrap::ResultExt;

/// Submission proxy in front of one or more HTCondor schedulers
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Path to the yaml config, missing files fall back to the defaults
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP agent and the submission cleaner
    Serve {
        #[arg(long)]
        listen: Option<SocketAddr>,
        #[arg(long)]
        submit_dir: Option<PathBuf>,
    },
    /// Sweep the submit directory once
    Clean {
        #[arg(long)]
        submit_dir: Option<PathBuf>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Submit a description file and print the cluster id
    Submit {
        file: PathBuf,
        #[arg(long)]
        schedd: Option<String>,
        #[arg(long)]
        submit_dir: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let loaded = AgentConfig::load(&cli.config);

    let level = loaded
        .as_ref()
        .map(|config| config.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());
    // stdout is reserved for command output such as the cluster id
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let mut config = match loaded {
        Ok(config) => config,
        Err(error) => {
            error!(path = ?cli.config, "Failed to load config: {error}");

            return ExitCode::FAILURE;
        }
    };

    if !cli.config.exists() {
        warn!(path = ?cli.config, "Config file not found, continuing with defaults");
    }

    match &cli.command {
        Commands::Serve { listen, submit_dir } => {
            if let Some(listen) = listen {
                config.listen = *listen;
            }
            if submit_dir.is_some() {
                config.submit_dir = submit_dir.clone();
            }
        }
        Commands::Clean { submit_dir, dry_run } => {
            config.cleaner.dry_run |= *dry_run;
            if submit_dir.is_some() {
                config.submit_dir = submit_dir.clone();
            }
        }
        Commands::Submit { submit_dir, .. } => {
            if submit_dir.is_some() {
                config.submit_dir = submit_dir.clone();
            }
        }
    }

    if config.preflight_checks() {
        error!("Config contains errors, refusing to start");

        return ExitCode::FAILURE;
    }

    match cli.command {
        Commands::Serve { .. } => serve(config),
        Commands::Clean { .. } => clean(config),
        Commands::Submit { file, schedd, .. } => submit(config, file, schedd),
    }
}

fn serve(config: AgentConfig) -> ExitCode {
    let cleaner = if config.cleaner.enabled {
        match SubmitCleaner::new(config.clone()).spawn() {
            Ok(handle) => Some(handle),
            Err(error) => {
                error!(error = ?error, "Failed to start the submission cleaner");

                return ExitCode::FAILURE;
            }
        }
    } else {
        info!("Submission cleaner is disabled");
        None
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_log();

    let addr = config.listen;
    let result = runtime.block_on(server::serve(
        addr,
        AgentState::new(Submitter::new(config)),
        shutdown_signal(),
    ));

    if let Some(cleaner) = cleaner {
        cleaner.stop();
        if cleaner.join().is_err() {
            error!("Submission cleaner panicked");
        }
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(addr = %addr, error = ?error, "Agent server failed");

            ExitCode::FAILURE
        }
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received interrupt, shutting down"),
        Err(error) => error!(error = ?error, "Failed to listen for interrupts"),
    }
}

fn clean(config: AgentConfig) -> ExitCode {
    let Some(dir) = resolve_submit_dir(&config) else {
        error!("Could not find a CONDOR_AGENT_SUBMIT_DIR setting for this host -- no cleanup performed");

        return ExitCode::FAILURE;
    };

    let report = SubmitCleaner::new(config).sweep(&dir, SystemTime::now());
    println!(
        "examined: {} | too young: {} | still queued: {} | removed: {} | would remove: {} | errors: {}",
        report.examined,
        report.too_young,
        report.still_queued,
        report.removed,
        report.would_remove,
        report.errors
    );

    if report.errors == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn submit(config: AgentConfig, file: PathBuf, schedd: Option<String>) -> ExitCode {
    let description = match fs::read_to_string(&file) {
        Ok(description) => description,
        Err(error) => {
            error!(path = ?file, "Failed to read submit description: {error}");

            return ExitCode::FAILURE;
        }
    };

    let request = SubmitRequest::new(description).scheduler(schedd);
    match Submitter::new(config).submit(&request) {
        Ok(submission) => {
            // bare cluster id, same as the HTTP response
            let mut stdout = io::stdout();
            if write!(stdout, "{}", submission.cluster_id)
                .and_then(|_| stdout.flush())
                .is_err()
            {
                return ExitCode::FAILURE;
            }

            ExitCode::SUCCESS
        }
        Err(error) => {
            error!("Submission failed: {error}");

            ExitCode::FAILURE
        }
    }
}
