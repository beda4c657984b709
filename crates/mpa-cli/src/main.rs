use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mpa_core::{CanonicalResult, Flow};
use mpa_storage::{open_store, PgRecordStore, StoreConfig};
use mpa_sync::{JobState, PersistenceReconciler};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mpa")]
#[command(about = "Market plan analyzer command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start a remote analysis for a domain and poll it to completion.
    Analyze {
        domain: String,
        #[arg(long, default_value = "plan")]
        flow: Flow,
        /// Print the full snapshot as JSON instead of a summary.
        #[arg(long)]
        json: bool,
    },
    /// Print the latest stored result for a domain.
    Show {
        domain: String,
        #[arg(long, default_value = "plan")]
        flow: Flow,
    },
    Serve,
    Migrate,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mpa=info,warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn print_result(result: &CanonicalResult) {
    let summary = &result.summary;
    println!("{} ({})", summary.name, result.flow);
    println!("  industry: {}", summary.industry);
    println!("  target:   {}", summary.target);
    println!("  about:    {}", summary.description);
    for (i, item) in result.items.iter().enumerate() {
        println!("  {}. {}", i + 1, item.name);
        println!("     target: {} | objective: {} | kpi: {}", item.target, item.objective, item.kpi);
        if !item.scenarios.is_empty() {
            println!("     scenarios: {}", item.scenarios.len());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze { domain, flow, json } => {
            info!(%domain, %flow, "starting analysis");
            let run = mpa_sync::run_analysis_once_from_env(&domain, flow).await?;
            let snapshot = &run.snapshot;
            info!(%domain, status = snapshot.status.label(), attempts = snapshot.attempt, "analysis finished");
            if json {
                println!("{}", serde_json::to_string_pretty(snapshot)?);
            } else if let Some(result) = &snapshot.data {
                print_result(result);
                for issue in &snapshot.validation_errors {
                    println!("  note: {} ({})", issue.message, issue.field);
                }
            }
            if snapshot.status != JobState::Success {
                match &snapshot.error {
                    Some(err) => bail!("{}: {err}", err.user_message()),
                    None => bail!("analysis of {domain} ended in state {}", snapshot.status.label()),
                }
            }
        }
        Commands::Show { domain, flow } => {
            let store = open_store(&StoreConfig::from_env()).await?;
            let outcome = PersistenceReconciler::new(store).load(&domain, flow).await;
            if let Some(err) = outcome.error {
                bail!(err);
            }
            match outcome.record {
                Some(record) => {
                    println!(
                        "{} v{} saved {}",
                        record.normalized_key, record.version_no, record.created_at
                    );
                    let result = record.result().context("decoding stored result")?;
                    print_result(&result);
                }
                None => println!("no {flow} record for {domain}"),
            }
        }
        Commands::Serve => mpa_web::serve_from_env().await?,
        Commands::Migrate => {
            let url = StoreConfig::from_env()
                .database_url
                .context("DATABASE_URL must be set to migrate")?;
            let store = PgRecordStore::connect(&url)
                .await
                .context("connecting to record database")?;
            info!("creating analysis_records");
            store.migrate().await.context("creating analysis_records")?;
            println!("migrations applied");
        }
    }

    Ok(())
}
