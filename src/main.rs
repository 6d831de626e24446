//! lvscare - keeps an IPVS virtual server pointed at healthy real servers
//!
//! Usage:
//!     lvscare care --vs 10.103.97.2:6443 --rs 192.168.0.2:6443 --rs 192.168.0.3:6443
//!     lvscare care --config lvscare.yaml
//!     lvscare validate --config lvscare.yaml
//!
//! See --help for more options.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use lvscare::care::{CareController, CareSession};
use lvscare::config::{
    load_config, read_config, validate_config, CareConfig, HealthScheme, LogFormat, Scheduler,
    ServerConfig,
};
use lvscare::health::NetworkProbe;
use lvscare::metrics::{MetricsCollector, MetricsServer};
use lvscare::table::{IpvsadmTable, MemoryTable, VirtualServerTable};
use lvscare::util::{init_logging, ShutdownSignal};

/// Keeps an IPVS virtual server's real servers in line with their health.
#[derive(Parser, Debug)]
#[command(name = "lvscare")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the virtual server and keep its real servers healthy
    Care(CareArgs),

    /// Validate a configuration file and exit
    Validate {
        /// Path to the configuration file
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
}

#[derive(Args, Debug)]
struct CareArgs {
    /// Path to a configuration file; flags override its values
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Virtual server address, e.g. 10.103.97.2:6443
    #[arg(long, value_name = "ADDR")]
    vs: Option<SocketAddr>,

    /// Real server address with optional weight, repeatable
    #[arg(long, value_name = "ADDR[@WEIGHT]")]
    rs: Vec<ServerConfig>,

    /// Path requested by HTTP(S) health checks
    #[arg(long, value_name = "PATH")]
    health_path: Option<String>,

    /// Health check scheme: tcp, http or https
    #[arg(long, value_name = "SCHEME", alias = "health-schem")]
    health_scheme: Option<HealthScheme>,

    /// Per-probe timeout, e.g. 3s or 500ms
    #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
    health_timeout: Option<Duration>,

    /// Time between cycles, in seconds or as a duration like 5s
    #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
    interval: Option<Duration>,

    /// Reconcile once and exit
    #[arg(long)]
    run_once: bool,

    /// Delete the virtual server before creating it
    #[arg(long)]
    clean: bool,

    /// IPVS scheduler for a newly created virtual server
    #[arg(long, value_name = "NAME")]
    scheduler: Option<Scheduler>,

    /// Reconcile against an in-memory table instead of the kernel
    #[arg(long)]
    dry_run: bool,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Override log format (json, pretty)
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<LogFormat>,
}

/// Parse plain seconds (`5`) or a humantime duration (`5s`, `500ms`).
fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).map_err(|e| format!("invalid duration '{}': {}", s, e))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Validate { config } => validate(config),
        Command::Care(args) => {
            let dry_run = args.dry_run;
            let config = build_config(args)?;
            run(config, dry_run)
        }
    }
}

fn validate(path: PathBuf) -> Result<()> {
    let config = load_config(&path)
        .with_context(|| format!("failed to load configuration from '{}'", path.display()))?;

    println!("Configuration is valid.");
    println!(
        "  Virtual server: {} ({})",
        config.virtual_server.address, config.virtual_server.scheduler
    );
    println!("  Real servers: {}", config.real_servers.len());
    for rs in &config.real_servers {
        println!("    - {} (weight {})", rs.address, rs.weight);
    }
    println!(
        "  Health check: {} {} (timeout {})",
        config.health_check.scheme,
        config.health_check.path,
        humantime::format_duration(config.health_check.timeout)
    );
    println!("  Interval: {}", humantime::format_duration(config.interval));
    Ok(())
}

/// Merge the optional configuration file with command line overrides.
///
/// The merged result is validated once, after every override is applied.
fn build_config(args: CareArgs) -> Result<CareConfig> {
    let mut config = match (&args.config, args.vs) {
        (Some(path), _) => read_config(path).with_context(|| {
            format!("failed to load configuration from '{}'", path.display())
        })?,
        (None, Some(vs)) => CareConfig::new(vs),
        (None, None) => bail!("either --config or --vs is required"),
    };

    if let Some(vs) = args.vs {
        config.virtual_server.address = vs;
    }
    if let Some(scheduler) = args.scheduler {
        config.virtual_server.scheduler = scheduler;
    }
    if !args.rs.is_empty() {
        config.real_servers = args.rs;
    }
    if let Some(path) = args.health_path {
        config.health_check.path = path;
    }
    if let Some(scheme) = args.health_scheme {
        config.health_check.scheme = scheme;
    }
    if let Some(timeout) = args.health_timeout {
        config.health_check.timeout = timeout;
    }
    if let Some(interval) = args.interval {
        config.interval = interval;
    }
    if let Some(level) = args.log_level {
        config.global.log_level = level;
    }
    if let Some(format) = args.log_format {
        config.global.log_format = format;
    }
    config.run_once |= args.run_once;
    config.clean |= args.clean;

    validate_config(&config)
        .map_err(anyhow::Error::msg)
        .context("invalid care configuration")?;
    Ok(config)
}

/// Run a care session with the given configuration.
fn run(config: CareConfig, dry_run: bool) -> Result<()> {
    init_logging(&config.global.log_level, &config.global.log_format)
        .context("failed to initialize logging")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(run_async(config, dry_run))
}

async fn run_async(config: CareConfig, dry_run: bool) -> Result<()> {
    let shutdown = ShutdownSignal::new();

    let table: Arc<dyn VirtualServerTable> = if dry_run {
        info!("dry run: using in-memory virtual server table");
        Arc::new(MemoryTable::new())
    } else {
        Arc::new(IpvsadmTable::new(&config.ipvs))
    };
    let probe = Arc::new(NetworkProbe::new().context("failed to build health probe client")?);

    let session = CareSession::from(&config);
    let mut controller = CareController::new(session, table, probe);

    let mut metrics_handle = None;
    if config.global.metrics.enabled {
        let collector = MetricsCollector::new();
        let server = MetricsServer::bind(
            config.global.metrics.address,
            config.global.metrics.path.clone(),
            collector.clone(),
        )
        .await
        .with_context(|| {
            format!(
                "failed to bind metrics server on {}",
                config.global.metrics.address
            )
        })?;
        let rx = shutdown.subscribe();
        metrics_handle = Some(tokio::spawn(server.run(rx)));
        controller = controller.with_metrics(collector);
    }

    let signals = shutdown.clone();
    tokio::spawn(async move { signals.trigger_on_signal().await });

    info!(
        virtual_server = %config.virtual_server.address,
        real_servers = config.real_servers.len(),
        scheme = %config.health_check.scheme,
        dry_run,
        "lvscare starting"
    );

    let result = controller.run(shutdown.subscribe()).await;

    // stop the metrics server in run-once mode too
    shutdown.shutdown();
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    match result {
        Ok(summary) => {
            info!(
                cycles = summary.cycles,
                errors = summary.last_report.errors.len(),
                "lvscare stopped"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "care session failed");
            Err(e).context("care session failed")
        }
    }
}
