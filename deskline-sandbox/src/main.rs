//! `Deskline` sandbox backend.
//!
//! An axum server holding conversations in memory, for local development
//! of the console.
//!
//! # Usage
//!
//! ```bash
//! # Run on the default address 127.0.0.1:9300
//! cargo run --bin deskline-sandbox
//!
//! # Custom address, empty projects
//! cargo run --bin deskline-sandbox -- --bind 0.0.0.0:8080 --no-seed
//! ```

use std::sync::Arc;

use clap::Parser;
use deskline_sandbox::config::{SandboxCliArgs, SandboxConfig};
use deskline_sandbox::server::{self, SandboxState};

#[tokio::main]
async fn main() {
    let cli = SandboxCliArgs::parse();

    let config = match SandboxConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, seed = config.seed, "starting deskline sandbox");

    let state = Arc::new(SandboxState::new(config.seed));
    if let Some(url) = &config.public_url {
        state.set_public_url(url);
    }

    match server::start_server(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "sandbox listening (ws: /ws?project=<name>, api: /api)");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "sandbox server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start sandbox server");
            std::process::exit(1);
        }
    }
}
