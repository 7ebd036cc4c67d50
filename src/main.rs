//! partscout - distributed marketplace parts-listing acquisition.
//!
//! Given a set of part numbers, drives headless browsers to search a
//! classifieds marketplace, filters the results through a multi-stage
//! validation pipeline and fetches full detail pages for survivors. All
//! coordination runs through PostgreSQL; workers are stateless between
//! tasks.

mod browser;
mod cli;
mod config;
mod llm;
mod models;
mod orchestrator;
mod repository;
mod schema;
mod validation;
mod workers;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before anything else)
    let _ = dotenvy::dotenv();

    let default_filter = if cli::is_verbose() {
        "partscout=debug"
    } else {
        "partscout=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    cli::run().await
}
