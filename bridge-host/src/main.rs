//! Bridge Host Binary Entry Point

use bridge_host::{init_logging, run_host, Args};
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.logging_config())?;

    tokio::select! {
        result = run_host(args) => {
            if let Err(e) = result {
                tracing::error!("Bridge host failed: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received, stopping bridge host...");
        }
    }

    Ok(())
}
