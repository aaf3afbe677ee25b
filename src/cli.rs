//! CLI argument parsing for the dispatch-worker binary.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "dispatch-worker", about = "Multi-order batching and driver assignment worker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the worker server (default if no subcommand given)
    Serve,
    /// Run database migrations and exit
    Migrate,
    /// Run one grouping sweep over the ready pool and print the report as JSON
    Sweep,
    /// Run one workload rebalancing pass and print the report as JSON
    Rebalance {
        /// Only print the audit, move nothing
        #[arg(long)]
        dry_run: bool,
    },
}
