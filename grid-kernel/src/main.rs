/**
 * GRID - Point d'entrée du binaire `grid`
 *
 * RÔLE : .env, logging, parsing des arguments, puis délégation à cli::run
 * (vms, containers, api, version).
 *
 * LOGS : sur stderr, filtrés par RUST_LOG (défaut grid_kernel=info), pour
 * laisser stdout aux tableaux.
 */

use anyhow::Result;
use clap::Parser;
use grid_kernel::cli::{self, Cli};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Ok si .env n'existe pas
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("grid_kernel=info")))
        .with_writer(std::io::stderr)
        .init();

    cli::run(Cli::parse()).await
}
