//! # Ingestion worker (`ingestd`)
//!
//! Binary entry point for the ingestion core. Two commands:
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ingestd init` | Create the Postgres schema (idempotent) |
//! | `ingestd run` | Start the stream consumer and metrics endpoint |
//!
//! All configuration comes from the environment (a `.env` file is
//! honored). `ingestd run` blocks until SIGINT/SIGTERM, then drains
//! in-flight events for the configured grace period before exiting.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rag_ingest::{config::Config, consumer, context::AppContext, metrics, migrate};

/// Ingestion worker for the conversation RAG platform.
#[derive(Parser)]
#[command(
    name = "ingestd",
    about = "Message-driven ingestion worker: Redis Streams -> MinIO -> Postgres + Qdrant",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the ingestion_jobs, conversations, and conversation_turns
    /// tables with their indexes. Safe to run on every deploy.
    Init,

    /// Run the ingestion consumer.
    ///
    /// Joins the consumer group, processes events until a shutdown
    /// signal arrives, and serves Prometheus metrics on METRICS_PORT.
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,rag_ingest=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Commands::Init => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(1)
                .connect(&config.database_url)
                .await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Run => {
            metrics::init_metrics(config.metrics_port)?;
            info!(port = config.metrics_port, "metrics endpoint up");

            let grace = config.processing.shutdown_grace;
            let ctx = Arc::new(AppContext::init(config).await?);

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let mut consumer_handle = tokio::spawn(consumer::run(Arc::clone(&ctx), shutdown_rx));

            tokio::select! {
                _ = shutdown_signal() => {
                    info!(grace_secs = grace.as_secs(), "shutdown signal received, draining");
                    let _ = shutdown_tx.send(true);
                    // The consumer enforces the grace period itself.
                    match consumer_handle.await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!("consumer exited with error: {e:#}"),
                        Err(join_err) => error!("consumer task panicked: {join_err}"),
                    }
                }
                result = &mut consumer_handle => {
                    // The consumer only returns on its own on a fatal error.
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!("consumer terminated: {e:#}"),
                        Err(join_err) => error!("consumer task panicked: {join_err}"),
                    }
                }
            }

            ctx.teardown().await;
            info!("worker stopped");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
