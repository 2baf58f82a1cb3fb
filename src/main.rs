use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use owo_colors::OwoColorize;
use std::sync::Arc;
use std::time::Duration;

use proxy_gate::balancer::LoadBalancer;
use proxy_gate::config::{config_path, AppConfig};
use proxy_gate::gateway::{Event, Gateway};
use proxy_gate::health::HealthChecker;
use proxy_gate::stats::StatsStore;
use proxy_gate::{metrics, util, Algorithm};

#[derive(Parser)]
#[command(
    name = "proxy_gate",
    version,
    about = "Local TCP proxy gateway with load balancing and upstream health checks"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a default config if missing
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Validate the configuration without side effects
    Check {
        /// Config file to check instead of the default location
        #[arg(long)]
        file: Option<std::path::PathBuf>,
    },
    /// Run the gateway over the configured static targets
    Run,
    /// List the available load balancing algorithms
    Algorithms,
    /// Generate shell completions
    Completions { shell: Shell },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Init { force } => init_config(force),
        Commands::Check { file } => check_config(file).await,
        Commands::Run => run_gateway().await,
        Commands::Algorithms => {
            for algorithm in Algorithm::ALL {
                println!("{algorithm}");
            }
            Ok(())
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "proxy_gate", &mut std::io::stdout());
            Ok(())
        }
    }
}

fn init_config(force: bool) -> Result<()> {
    let path = config_path()?;
    if path.exists() && !force {
        println!(
            "{} config already exists at {} (use --force to overwrite)",
            "skipped:".yellow(),
            path.display()
        );
        return Ok(());
    }
    AppConfig::default().save(&path)?;
    println!("{} wrote default config to {}", "ok:".green(), path.display());
    Ok(())
}

async fn check_config(file: Option<std::path::PathBuf>) -> Result<()> {
    let path = match file {
        Some(path) => path,
        None => config_path()?,
    };
    let config = AppConfig::load_from(&path)?;

    println!("config: {}", path.display());
    println!("  mode:       {}", config.settings.mode);
    println!("  algorithm:  {}", config.settings.algorithm);
    println!(
        "  listen:     {}:{}",
        config.settings.host, config.settings.port
    );
    println!(
        "  heartbeat:  {:?} ms",
        config.settings.heartbeat.delays()
    );
    println!("  targets:    {}", config.targets.len());
    println!("  clients:    {}", config.clients.len());

    for target in &config.targets {
        let responding = util::port_responding("127.0.0.1", target.id).await;
        let status = if responding {
            "responding".green().to_string()
        } else {
            "not responding".red().to_string()
        };
        println!("  target {} ({}): {}", target.id, target.conf_id, status);
    }
    println!("{}", "ok: configuration is valid".green());
    Ok(())
}

async fn run_gateway() -> Result<()> {
    let config = AppConfig::load()?;
    if config.targets.is_empty() {
        anyhow::bail!(
            "No targets configured. Add [[targets]] entries or embed the cluster manager."
        );
    }
    if let Err(e) = metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics registration failed");
    }

    let probe = &config.settings.probe;
    let checker = HealthChecker::new(
        probe.host.clone(),
        probe.port,
        Duration::from_millis(probe.connect_timeout_ms),
        Duration::from_millis(probe.probe_timeout_ms),
    );
    let balancer = Arc::new(LoadBalancer::new(
        config.settings.algorithm,
        config.targets.clone(),
    ));
    let gateway = Arc::new(Gateway::new(
        config.settings.host.clone(),
        balancer,
        checker,
        config.settings.heartbeat.delays(),
    ));

    let stats = StatsStore::load().context("Failed to load stats store")?;
    stats.clone().start_flush_loop(Duration::from_secs(5));

    // Consume gateway events for logging and probe history.
    let mut events = gateway.subscribe();
    let event_stats = stats.clone();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                Event::HealthCheckFailed(targets) => {
                    for target in targets {
                        event_stats
                            .record_probe(
                                &target.conf_id,
                                false,
                                Some("confirmed by two probe rounds".to_string()),
                            )
                            .await;
                    }
                }
                Event::LoadBalancerError { message } => {
                    tracing::warn!(%message, "Load balancer returned no target");
                }
                Event::LocalSocketError { port, message }
                | Event::RemoteSocketError { port, message }
                | Event::TransferError { port, message } => {
                    tracing::debug!(port, %message, "Socket error");
                }
            }
        }
    });

    let addr = gateway.listen(config.settings.port).await?;
    println!(
        "{} gateway listening on {} ({} targets, {} algorithm)",
        "ok:".green(),
        addr,
        config.targets.len(),
        config.settings.algorithm
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for ctrl-c")?;
    tracing::info!("Shutting down");
    gateway.stop().await;
    stats.flush().await?;
    println!(
        "relayed {} across this run",
        util::format_bytes(gateway.bytes_transfer())
    );
    Ok(())
}
