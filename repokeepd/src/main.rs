mod api;
mod cli;
mod commands;
mod config;
mod idle;
mod rotation;
mod service;
mod store;
mod store_manager;
mod task;

use std::process::ExitCode;
use std::time::Duration;
use clap::Parser;
use crate::cli::{Args, Cmd};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("repokeepd=info,repokeep_client=info,shared=info"))
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let result = match args.cmd {
        Cmd::Service { action } => commands::service(action).await,
        Cmd::Records { timeout, action } => commands::records(action, Duration::from_secs(timeout)).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(1)
        }
    }
}
