use anyhow::{Context, Result};
use bi_assistant::catalog::CatalogStore;
use bi_assistant::guardrail::{Allowlist, CandidateQuery, Guardrail, ValidationVerdict};
use bi_assistant::observability::init_tracing;
use bi_assistant::warehouse::WarehouseRouter;
use bi_assistant::{AppConfig, Orchestrator, WarehouseTarget};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "bi-assistant")]
#[command(about = "Answer business questions with guarded, read-only SQL")]
struct Args {
    /// Log level (overrides LOG_LEVEL; RUST_LOG wins over both)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer a question against a warehouse
    Ask {
        question: String,

        /// embedded, bigquery or snowflake (default: WAREHOUSE)
        #[arg(short, long)]
        warehouse: Option<String>,

        /// Also write the rows to a .csv, .parquet or .json file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run the guardrail on a SQL statement
    Validate {
        sql: String,

        /// Relations to allow instead of the whole catalog
        #[arg(long = "allow")]
        allow: Vec<String>,
    },
    /// Show the catalog entries retrieved for a question
    Search {
        question: String,

        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },
    /// Reload the catalog and rebuild the vector cache
    RebuildIndex,
    /// List configured warehouses
    Warehouses {
        /// Try to connect to each one
        #[arg(long)]
        check: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = AppConfig::from_env().context("Failed to load configuration")?;
    init_tracing(args.log_level.as_deref().unwrap_or(&config.log_level));

    match args.command {
        Command::Ask {
            question,
            warehouse,
            output,
        } => ask(&config, &question, warehouse.as_deref(), output).await,
        Command::Validate { sql, allow } => validate(&config, &sql, allow).await,
        Command::Search { question, top_k } => search(&config, &question, top_k).await,
        Command::RebuildIndex => {
            let catalog = load_catalog(&config).await?;
            let snapshot = catalog.snapshot()?;
            println!(
                "Indexed {} entries from {} (hash {}, {})",
                snapshot.index.len(),
                snapshot.source,
                snapshot.catalog_hash(),
                if snapshot.is_degraded() { "lexical" } else { "vector" }
            );
            Ok(())
        }
        Command::Warehouses { check } => warehouses(&config, check).await,
    }
}

async fn load_catalog(config: &AppConfig) -> Result<Arc<CatalogStore>> {
    let catalog = Arc::new(CatalogStore::from_config(config).await?);
    catalog.rebuild().await?;
    Ok(catalog)
}

async fn ask(config: &AppConfig, question: &str, warehouse: Option<&str>, output: Option<PathBuf>) -> Result<()> {
    let target = match warehouse {
        Some(name) => name.parse::<WarehouseTarget>()?,
        None => config.warehouse,
    };
    config.validate_target(target)?;

    let orchestrator = Orchestrator::bootstrap(config).await?;
    let answer = orchestrator.answer(question, target).await?;

    println!("SQL: {}", answer.sql);
    if answer.degraded {
        println!("(schema retrieval ran in degraded lexical mode)");
    }
    println!("{}", answer.result.to_dataframe()?);
    println!(
        "{} rows{} in {} ms after {} attempt(s)",
        answer.result.row_count,
        if answer.result.truncated { " (truncated)" } else { "" },
        answer.result.elapsed.as_millis(),
        answer.attempts
    );

    if let Some(path) = output {
        answer.result.write_to_path(&path)?;
        info!("Wrote results to {}", path.display());
    }
    orchestrator.router().disconnect_all().await;
    Ok(())
}

async fn validate(config: &AppConfig, sql: &str, allow: Vec<String>) -> Result<()> {
    let allowlist = if allow.is_empty() {
        let catalog = load_catalog(config).await?;
        Allowlist::from_entries(catalog.snapshot()?.index.entries())
    } else {
        Allowlist::new(allow)
    };
    let allowlist = allowlist.with_reference_patterns(&config.limits.allowed_schemas);

    let guardrail = Guardrail::from_limits(&config.limits);
    match guardrail.validate(&CandidateQuery::new(sql), &allowlist) {
        ValidationVerdict::Allowed {
            normalized_sql,
            enforced_row_limit,
        } => {
            println!("ALLOWED (limit {})", enforced_row_limit);
            println!("{}", normalized_sql);
            Ok(())
        }
        ValidationVerdict::Rejected { reason, detail } => {
            println!("REJECTED {}: {}", reason, detail);
            std::process::exit(2);
        }
    }
}

async fn search(config: &AppConfig, question: &str, top_k: Option<usize>) -> Result<()> {
    let catalog = load_catalog(config).await?;
    let snapshot = catalog.snapshot()?;
    let result = snapshot
        .index
        .query(question, top_k.unwrap_or(config.retrieval_top_k))
        .await?;

    if result.degraded {
        println!("(lexical fallback)");
    }
    for scored in &result.entries {
        println!(
            "{:.3}  {:<7} {}  {}",
            scored.score, scored.entry.kind, scored.entry.qualified_name, scored.entry.description
        );
    }
    Ok(())
}

async fn warehouses(config: &AppConfig, check: bool) -> Result<()> {
    let router = WarehouseRouter::from_config(config)?;
    for target in WarehouseTarget::ALL {
        let marker = if target == config.warehouse { "*" } else { " " };
        match router.runner(target) {
            Ok(runner) if check => match runner.connect().await {
                Ok(()) => println!("{} {:<10} connected", marker, target),
                Err(e) => println!("{} {:<10} {}", marker, target, e),
            },
            Ok(_) => println!("{} {:<10} configured", marker, target),
            Err(_) => match config.validate_target(target) {
                Err(e) => println!("{} {:<10} {}", marker, target, e),
                Ok(()) => println!("{} {:<10} unavailable", marker, target),
            },
        }
    }
    router.disconnect_all().await;
    Ok(())
}
