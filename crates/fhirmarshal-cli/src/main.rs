mod cli;
mod commands;
mod config;
mod observability;
mod output;

use anyhow::{Result, anyhow};
use clap::Parser;
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cli::{Cli, Commands};
use output::print_error;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    observability::init_tracing();

    if let Err(e) = run().await {
        print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut cfg = config::loader::load_config(cli.config.as_deref()).map_err(|e| anyhow!(e))?;
    cli.resolve_config(&mut cfg).map_err(|e| anyhow!("invalid configuration: {e}"))?;
    observability::apply_logging_level(&cfg.logging.level);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight work");
            on_signal.cancel();
        }
    });

    match &cli.command {
        Commands::Load(args) => {
            let summary = commands::load::load(&cfg, &args.inputs, cancel).await?;
            check_load(&summary)?;
        }
        Commands::BulkExport(args) => {
            let outcome = commands::bulk::bulk_export(
                &cfg,
                &args.url,
                args.token.as_deref(),
                cancel.clone(),
            )
            .await?;
            if args.load {
                info!(output = %outcome.output.display(), "Loading export output");
                let summary =
                    commands::load::load(&cfg, std::slice::from_ref(&outcome.output), cancel)
                        .await?;
                check_load(&summary)?;
            }
        }
        Commands::Config => {
            let shown = toml::to_string_pretty(&cfg.redacted())?;
            println!("{}", "# effective configuration".dimmed());
            print!("{shown}");
        }
    }

    Ok(())
}

fn check_load(summary: &fhirmarshal_db_postgres::LoadSummary) -> Result<()> {
    if summary.cancelled {
        anyhow::bail!("Load cancelled; {} rows were not flushed", summary.unflushed);
    }
    if summary.failed_batches > 0 || summary.failed_containers > 0 {
        anyhow::bail!(
            "{} batches and {} inputs failed",
            summary.failed_batches,
            summary.failed_containers
        );
    }
    Ok(())
}
