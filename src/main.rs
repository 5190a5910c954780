#![allow(dead_code)]
#![recursion_limit = "256"]

mod cli;
mod config;
mod application;
mod domain;
mod data;
mod ml;
mod infra;
mod tracking;
mod serve;

use anyhow::Result;
use clap::Parser;
use cli::Cli;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("image_classifier=info,tower_http=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    cli.run()
}
