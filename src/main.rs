use anyhow::Result;
use clap::{Parser, Subcommand};

use jobcache::config::{AppConfig, CONFIG_ENV};
use jobcache::manager::ExecutionDataManager;

#[derive(Parser)]
#[command(
    name = "jobcache",
    about = "Execution-history cache for job orchestration dashboards",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (otherwise JOBCACHE_CONFIG, then ./jobcache.toml)
    #[arg(long, global = true, env = CONFIG_ENV)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + background worker)
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: String,
    },

    /// Fetch one job's executions through the cache
    Fetch {
        /// Job identifier
        #[arg(long)]
        job: String,

        /// Trailing window in days (defaults to the configured window)
        #[arg(long)]
        days: Option<u32>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Inspect the own cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// List cached jobs
    List {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = tracing::subscriber::with_default(jobcache::logging::bootstrap(), || {
        match &cli.config {
            Some(path) => AppConfig::load(path),
            None => Ok(AppConfig::load_or_default()),
        }
    })?;
    jobcache::logging::init(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            tracing::info!(%bind, "starting jobcache daemon");
            jobcache::serve(&config, &bind).await?;
        }
        Commands::Fetch { job, days, json } => {
            let manager = ExecutionDataManager::from_config(&config);
            let days = days.unwrap_or_else(|| manager.default_days());
            let result = manager.get_job_executions(&job, days).await;
            manager.shutdown().await;
            let executions = result?;

            if json {
                println!("{}", serde_json::to_string_pretty(&executions)?);
            } else {
                let metrics = jobcache::fetcher::metrics::compute_metrics(&executions);
                println!("\n{} -- last {} days", job, days);
                println!(
                    "{} runs, {} succeeded, {} failed ({:.1}% success), avg {:.0} ms",
                    metrics.total,
                    metrics.successful,
                    metrics.failed,
                    metrics.success_rate,
                    metrics.avg_duration_ms
                );
                println!("{:<12} | {:<25} | {:<10} | Duration", "ID", "Started", "Status");
                println!("{:-<12}-|-{:-<25}-|-{:-<10}-|-{:-<10}", "", "", "", "");
                for e in &executions {
                    let duration = e
                        .duration_ms
                        .map(|d| format!("{} ms", d))
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<12} | {:<25} | {:<10} | {}",
                        e.id,
                        e.started_at.to_rfc3339(),
                        e.status.to_string(),
                        duration
                    );
                }
            }
        }
        Commands::Cache { action } => match action {
            CacheAction::List { json } => {
                let manager = ExecutionDataManager::from_config(&config);
                let entries = manager.cached_jobs().await;
                manager.shutdown().await;
                let entries = entries?;

                if json {
                    println!("{}", serde_json::to_string_pretty(&entries)?);
                } else if entries.is_empty() {
                    println!("No cached jobs.");
                } else {
                    println!("{:<24} | {:<6} | {:<25} | {:<5} | Fetched", "Job", "Runs", "Covered", "Peer");
                    println!("{:-<24}-|-{:-<6}-|-{:-<25}-|-{:-<5}-|-{:-<25}", "", "", "", "", "");
                    for entry in entries {
                        println!(
                            "{:<24} | {:<6} | {:<25} | {:<5} | {}",
                            entry.job_id,
                            entry.executions.len(),
                            entry.covered.to_string(),
                            entry.has_peer_data,
                            entry.last_fetched.to_rfc3339()
                        );
                    }
                }
            }
        },
    }

    Ok(())
}
