// SPDX-License-Identifier: Apache-2.0

use clap::{Parser, ValueEnum};
use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::select;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::metadata::LevelFilter;
use tracing::{error, info, warn};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use logtail::config::{LogSource, LogtailConfig, TargetConfig};
use logtail::receiver::{LogtailReceiver, SharedSink};
use logtail::sink::{ItemState, LogValue, Sink};

const SHUTDOWN_TIMEOUT_SECS: u64 = 10;

const DEFAULT_DESTINATION: &str = "stdout";
const DEFAULT_GC_INTERVAL_SECS: u64 = 3600;

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Tail the configured targets until interrupted
    Start(RunArgs),

    /// Validate the configuration and exit
    Check(RunArgs),

    /// Return version
    Version,
}

#[derive(Debug, clap::Args)]
struct RunArgs {
    /// Path of the JSON configuration file
    #[arg(long, env = "LOGTAIL_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides the destination of the configuration file
    #[arg(long, env = "LOGTAIL_DESTINATION")]
    destination: Option<String>,

    /// Single file to tail, may be repeated
    #[arg(long, env = "LOGTAIL_LOG", value_delimiter = ',')]
    log: Vec<PathBuf>,

    /// Directory plus file name regex to tail, may be repeated
    #[arg(long, env = "LOGTAIL_LOGRT", value_delimiter = ',')]
    logrt: Vec<String>,

    /// Lines must match this regex
    #[arg(long, env = "LOGTAIL_PATTERN", default_value = "")]
    pattern: String,

    /// Root directory for progress snapshots of command line targets
    #[arg(long, env = "LOGTAIL_PERSISTENT_DIR")]
    persistent_dir: Option<PathBuf>,

    /// Start command line targets at the end of existing data
    #[arg(long, env = "LOGTAIL_SKIP_EXISTING")]
    skip_existing: bool,
}

impl RunArgs {
    fn command_line_targets(&self) -> Vec<TargetConfig> {
        let sources = self
            .log
            .iter()
            .map(|p| {
                (
                    format!("log[{}]", p.display()),
                    LogSource::Log { path: p.clone() },
                )
            })
            .chain(self.logrt.iter().map(|p| {
                (
                    format!("logrt[{p}]"),
                    LogSource::LogRt { path: p.clone() },
                )
            }));

        sources
            .map(|(key, source)| {
                let mut target = TargetConfig::new(key, source);
                target.pattern = self.pattern.clone();
                target.persistent_dir = self.persistent_dir.clone();
                target.skip_existing = self.skip_existing;
                target
            })
            .collect()
    }
}

#[derive(Debug, Parser)]
#[command(name = "logtail")]
#[command(bin_name = "logtail")]
#[command(version, about, long_about = None)]
#[command(subcommand_required = true)]
struct Arguments {
    #[arg(
        value_enum,
        long,
        global = true,
        env = "LOGTAIL_LOG_FORMAT",
        default_value = "text"
    )]
    /// Log format
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

/// Writes every value as one JSON object per line on stdout.
struct StdoutSink {
    out: std::io::Stdout,
}

impl Sink for StdoutSink {
    fn send(&mut self, value: &LogValue<'_>) -> Result<(), BoxError> {
        let state = match value.state {
            ItemState::Normal => "normal",
            ItemState::NotSupported => "not_supported",
        };
        let line = serde_json::json!({
            "destination": value.destination,
            "key": value.key,
            "value": value.value,
            "state": state,
            "lastlogsize": value.lastlogsize,
            "mtime": value.mtime,
            "count": value.flags.count,
        });

        let mut out = self.out.lock();
        serde_json::to_writer(&mut out, &line)?;
        out.write_all(b"\n")?;
        Ok(())
    }
}

fn main() -> ExitCode {
    let opt = Arguments::parse();

    let _logger = match setup_logging(&opt.log_format) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("ERROR: failed to setup logging: {e}");
            return ExitCode::from(1);
        }
    };

    match opt.command {
        Some(Commands::Version) => {
            println!("{}", get_version())
        }
        Some(Commands::Check(args)) => match load_config(&args) {
            Ok(config) => {
                for target in &config.targets {
                    info!(
                        key = %target.key,
                        path = %target.source.path_display(),
                        rotation = ?target.rotation_mode(),
                        mode = ?target.mode,
                        "Target"
                    );
                }
                info!(targets = config.targets.len(), "Configuration is valid");
            }
            Err(e) => {
                error!(error = e, "Invalid configuration.");
                return ExitCode::from(1);
            }
        },
        Some(Commands::Start(args)) => {
            let config = match load_config(&args) {
                Ok(c) => c,
                Err(e) => {
                    error!(error = e, "Invalid configuration.");
                    return ExitCode::from(1);
                }
            };

            if let Err(e) = run(config) {
                error!(error = e, "Failed to run.");
                return ExitCode::from(1);
            }
        }
        None => {
            // it shouldn't be possible to get here since we mark a subcommand as
            // required
            error!("Must specify a command");
            return ExitCode::from(2);
        }
    }

    ExitCode::SUCCESS
}

fn load_config(args: &RunArgs) -> Result<LogtailConfig, BoxError> {
    let mut config = match &args.config {
        Some(path) => {
            let data = std::fs::read_to_string(path)
                .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
            LogtailConfig::from_json(&data)?
        }
        None => LogtailConfig {
            destination: DEFAULT_DESTINATION.to_string(),
            targets: Vec::new(),
            gc_interval: DEFAULT_GC_INTERVAL_SECS,
        },
    };
    config.targets.extend(args.command_line_targets());
    if config.targets.is_empty() {
        return Err("no targets configured, use --config, --log or --logrt".into());
    }

    if let Some(destination) = &args.destination {
        config.destination = destination.clone();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn run(config: LogtailConfig) -> Result<(), BoxError> {
    let mut join_set = JoinSet::new();
    let cancel_token = CancellationToken::new();

    let receiver = LogtailReceiver::new(config)?;
    let sink = SharedSink::new(StdoutSink {
        out: std::io::stdout(),
    });
    receiver.start(sink, &mut join_set, &cancel_token).await?;

    select! {
        res = signal_wait() => {
            res?;
            info!("Shutdown signal received.");
        },
        e = join_set.join_next() => {
            match e {
                Some(Ok(Err(e))) => return Err(e),
                Some(Err(e)) => return Err(e.into()),
                _ => warn!("Unexpected early exit of target task."),
            }
        },
    }
    cancel_token.cancel();

    wait_for_tasks_with_deadline(
        &mut join_set,
        Instant::now() + Duration::from_secs(SHUTDOWN_TIMEOUT_SECS),
    )
    .await
}

async fn wait_for_tasks_with_deadline(
    tasks: &mut JoinSet<Result<(), BoxError>>,
    stop_at: Instant,
) -> Result<(), BoxError> {
    let mut result = Ok(());
    loop {
        match timeout_at(stop_at, tasks.join_next()).await {
            Err(_) => {
                result = Err("timed out waiting for tasks to complete".into());
                break;
            }
            Ok(None) => break,
            Ok(Some(Ok(Ok(())))) => {}
            Ok(Some(Ok(Err(e)))) => result = Err(e),
            Ok(Some(Err(e))) => error!("Failed to join with task: {:?}", e),
        }
    }
    result
}

#[cfg(unix)]
async fn signal_wait() -> Result<(), BoxError> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sig_term = signal(SignalKind::terminate())?;
    let mut sig_int = signal(SignalKind::interrupt())?;

    select! {
        _ = sig_term.recv() => {},
        _ = sig_int.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn signal_wait() -> Result<(), BoxError> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

type LoggerGuard = tracing_appender::non_blocking::WorkerGuard;

// Values go to stdout, logs to stderr
fn setup_logging(log_format: &LogFormatArg) -> Result<LoggerGuard, BoxError> {
    LogTracer::init()?;

    let (non_blocking_writer, guard) = tracing_appender::non_blocking(std::io::stderr());

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    if *log_format == LogFormatArg::Json {
        let app_name = format!("{}-{}", env!("CARGO_PKG_NAME"), get_version());
        let bunyan_formatting_layer = BunyanFormattingLayer::new(app_name, non_blocking_writer);

        let subscriber = Registry::default()
            .with(filter)
            .with(JsonStorageLayer)
            .with(bunyan_formatting_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        // Skip color codes when not in a terminal
        let use_ansi = std::io::stderr().is_terminal();

        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_target(false)
            .with_level(true)
            .with_ansi(use_ansi)
            .compact();

        let subscriber = Registry::default().with(filter).with(layer);
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(guard)
}

fn get_version() -> String {
    // Set during CI
    let version_build = option_env!("BUILD_SHORT_SHA").unwrap_or("dev");

    format!("{}-{}", env!("CARGO_PKG_VERSION"), version_build)
}
