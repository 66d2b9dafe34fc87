use anyhow::Context;
use matchsync::adapters::postgres;
use matchsync::cli::{self, Cli, Commands};
use matchsync::coordination::{install_signal_handlers, GracefulShutdown};
use matchsync::domain::NewMatch;
use matchsync::services::REFRESH_JOB;
use matchsync::App;
use std::sync::Arc;
use tracing::info;

use crate::main_runtime::{init_logging, init_logging_simple, load_config};

pub(crate) async fn run(cli: &Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;

    match &cli.command {
        Commands::Run => {
            init_logging(&config.logging);
            let drain_timeout = config.jobs.shutdown_drain_timeout();
            let app = App::connect(config).await?;
            let shutdown = Arc::new(GracefulShutdown::new(drain_timeout));
            install_signal_handlers(shutdown.clone());
            info!("matchsync running, press Ctrl+C to stop");
            app.run(shutdown).await?;
        }
        Commands::Migrate => {
            init_logging_simple();
            let pool = postgres::connect(&config.database)
                .await
                .context("failed to connect to database")?;
            postgres::migrate(&pool).await?;
            println!("\x1b[32m✓ migrations applied\x1b[0m");
        }
        Commands::Correct { match_id, set } => {
            init_logging_simple();
            let app = App::connect(config).await?;
            let outcome = app.gate.correct(*match_id, set.clone()).await?;
            cli::print_apply_outcome(*match_id, &outcome);
        }
        Commands::Refresh => {
            init_logging(&config.logging);
            let app = App::connect(config).await?;
            let outcome = app.scheduler.run_refresh().await?;
            cli::print_job_outcome(REFRESH_JOB, &outcome);
        }
        Commands::Show { match_id } => {
            init_logging_simple();
            let app = App::connect(config).await?;
            match app.gate.store().get(*match_id).await? {
                Some(record) => cli::print_record(&record),
                None => println!("\x1b[33mmatch {} not found\x1b[0m", match_id),
            }
        }
        Commands::Import { match_id, kickoff } => {
            init_logging_simple();
            let app = App::connect(config).await?;
            let created = app
                .gate
                .import(NewMatch {
                    match_id: *match_id,
                    kickoff_at: *kickoff,
                })
                .await?;
            if created {
                println!("\x1b[32m✓ match {} imported\x1b[0m", match_id);
            } else {
                println!("match {} already exists", match_id);
            }
        }
    }

    Ok(())
}
