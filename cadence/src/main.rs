//! cadence - drive load-generating activities from the command line
//!
//! ```text
//! cadence run driver=diag op=x cycles=1M threads=auto cyclerate=10K
//! cadence --script warmup.cad --report json
//! ```
//!
//! # Environment Variables
//!
//! - `CADENCE_LOG`: log filter, same syntax as `RUST_LOG` (default: `info`)

use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use cadence::{
    EngineConfig, FailurePolicy, Reporter, Scenario, ScenariosExecutor,
    report::{JsonReporter, StdoutReporter},
    scenario::{CommandScript, ScenariosResults},
};
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ReportFormat {
    Text,
    Json,
}

/// Activity execution and scheduling engine for load generation
#[derive(Parser, Debug)]
#[command(name = "cadence")]
#[command(version, about, long_about = None)]
struct Args {
    /// Log filter (also: CADENCE_LOG)
    #[arg(long, env = "CADENCE_LOG", default_value = "info")]
    log_level: String,

    /// Log activity progress every SECS seconds
    #[arg(long, value_name = "SECS")]
    progress: Option<u64>,

    /// Final report format
    #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
    report: ReportFormat,

    /// Pretty-print JSON reports
    #[arg(long)]
    pretty: bool,

    #[arg(long, default_value = "default")]
    scenario_name: String,

    /// `first` or `aggregate`
    #[arg(long, default_value_t = FailurePolicy::FirstFailure)]
    failure_policy: FailurePolicy,

    /// Seconds activities get to finish on shutdown before being forced
    #[arg(long, value_name = "SECS", default_value_t = 5)]
    shutdown_grace: u64,

    /// Bound every run/await command, in seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Read commands from a file, before any given on the command line
    #[arg(long, value_name = "PATH")]
    script: Option<PathBuf>,

    /// Commands: run, start, stop, forcestop, await, awaitall, waitmillis, set
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    commands: Vec<String>,
}

fn init_tracing(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

fn load_script(args: &Args) -> cadence::Result<CommandScript> {
    let mut script = match &args.script {
        Some(path) => CommandScript::from_text(&std::fs::read_to_string(path)?)?,
        None => CommandScript::parse(std::iter::empty::<&str>())?,
    };
    script.extend(CommandScript::parse(&args.commands)?);
    Ok(match args.timeout {
        Some(secs) => script.with_timeout(Duration::from_secs(secs)),
        None => script,
    })
}

async fn report(format: ReportFormat, pretty: bool, results: &ScenariosResults) -> cadence::Result<()> {
    match format {
        ReportFormat::Text => StdoutReporter.report(results).await,
        ReportFormat::Json => JsonReporter { pretty }.report(results).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let script = match load_script(&args) {
        Ok(script) if script.is_empty() => {
            eprintln!("cadence: nothing to do, give commands or --script");
            return ExitCode::from(2);
        }
        Ok(script) => script,
        Err(e) => {
            eprintln!("cadence: {e}");
            return ExitCode::from(2);
        }
    };

    let config = EngineConfig::builder()
        .failure_policy(args.failure_policy)
        .shutdown_grace(Duration::from_secs(args.shutdown_grace))
        .progress_interval_opt(args.progress.map(Duration::from_secs))
        .build();

    let executor = Arc::new(ScenariosExecutor::new("cadence", config.max_scenarios));
    let scenario = Scenario::builder()
        .name(args.scenario_name.clone())
        .procedure(Arc::new(script))
        .config(config)
        .build();
    if let Err(e) = executor.execute(scenario) {
        eprintln!("cadence: {e}");
        return ExitCode::FAILURE;
    }

    let interrupts = executor.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping scenarios");
            interrupts.interrupt_all().await;
        }
    });

    let results = match executor
        .await_all_results(Duration::MAX, Duration::from_secs(1))
        .await
    {
        Ok(results) => results,
        Err(e) => {
            eprintln!("cadence: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = report(args.report, args.pretty, &results).await {
        eprintln!("cadence: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::from(results.exit_code())
}
