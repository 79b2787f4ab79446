use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "cronwheel", about = "Cron-driven deferred task scheduler on a hashed timing wheel")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a cron expression and print its parsed field sets
    Check {
        /// Quartz-style expression, e.g. "0 15 10 ? * MON-FRI"
        expression: String,
    },

    /// Print the upcoming fire times of a cron expression
    Next {
        expression: String,

        /// How many fire times to print
        #[arg(long, short, default_value_t = 5)]
        count: usize,

        /// Evaluate in this IANA zone instead of UTC
        #[arg(long)]
        timezone: Option<String>,

        /// Compute from this RFC 3339 instant instead of now
        #[arg(long)]
        from: Option<String>,
    },

    /// Run the jobs in a TOML job file until interrupted
    Run {
        /// Path to the job file
        #[arg(long, short, default_value = "jobs.toml")]
        config: PathBuf,

        /// Stop after this long (e.g. "30s") instead of waiting for ctrl-c
        #[arg(long = "for")]
        duration: Option<String>,
    },
}
