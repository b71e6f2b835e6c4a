use anyhow::Result;
use clap::{Parser, Subcommand};
use lake_sync::{DomainRegistry, IngestConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "lake-cli")]
#[command(about = "Incremental staging-to-bronze ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Merge pending staging files into history.
    Ingest {
        /// Only ingest this domain.
        #[arg(long)]
        domain: Option<String>,
    },
    /// List registered domains.
    Domains,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Ingest { domain: None }) {
        Commands::Ingest { domain } => {
            let summary = lake_sync::run_ingest_once_from_env(domain).await?;
            for domain in &summary.domains {
                let (added, rows) = domain
                    .merge
                    .as_ref()
                    .map_or((0, None), |m| (m.added, Some(m.result_rows)));
                println!(
                    "{}: files={} consumed={} rejected={} added={} history_rows={}",
                    domain.domain_id,
                    domain.staged_files,
                    domain.consumed.len(),
                    domain.rejected.len(),
                    added,
                    rows.map_or_else(|| "unchanged".to_string(), |r| r.to_string()),
                );
            }
            println!(
                "ingest complete: run_id={} report={}",
                summary.run_id,
                summary.report_path.as_deref().unwrap_or("-")
            );
        }
        Commands::Domains => {
            let config = IngestConfig::from_env()?;
            let registry = DomainRegistry::load(&config.domains_file).await?;
            for domain in &registry.domains {
                println!(
                    "{}\t{}\t{}\t{} -> {}",
                    domain.domain_id,
                    if domain.enabled { "enabled" } else { "disabled" },
                    domain.dedup.name(),
                    domain.staging_prefix,
                    domain.bronze_path
                );
            }
        }
    }

    Ok(())
}
