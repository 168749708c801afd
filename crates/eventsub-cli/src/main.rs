//! `eventsub` entry point
//!
//! Listens to one event-subscription session and prints notifications as
//! JSON lines until interrupted.

#![warn(clippy::all)]

mod cli;

use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();

    if let Err(e) = cli.execute().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
