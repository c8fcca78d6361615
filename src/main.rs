use build_time::build_time_local;
use color_eyre::Result;
use tracing_subscriber::EnvFilter;

use crate::controller::Controller;

pub mod cleanup;
pub mod config;
pub mod controller;
pub mod errors;
pub mod ext;
pub mod guid;
pub mod introspector;
pub mod job_builder;
pub mod quantity_parser;
pub mod types;
pub mod volume_publisher;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!(version = config::VERSION, built = build_time_local!(), "pg-reflinker starting");

    Controller::create().await?.run().await.map_err(|e| color_eyre::eyre::eyre!(e))
}
