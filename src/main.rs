mod cli;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use clap::Parser;
use tracing::info;

use cronwheel::config::{load_config, validate_config};
use cronwheel::{CronExpression, Scheduler};

use crate::cli::{Cli, Commands};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check { expression } => {
            init_tracing("warn");
            let cron = CronExpression::parse(&expression).context("invalid cron expression")?;
            print!("{}", cron.summary());
        }
        Commands::Next {
            expression,
            count,
            timezone,
            from,
        } => {
            init_tracing("warn");
            let mut cron = CronExpression::parse(&expression).context("invalid cron expression")?;
            if let Some(ref tz) = timezone {
                let tz: Tz = tz
                    .parse()
                    .map_err(|_| anyhow::anyhow!("unknown timezone '{tz}'"))?;
                cron = cron.in_time_zone(tz);
            }
            let start = match from {
                Some(ref s) => DateTime::parse_from_rfc3339(s)
                    .with_context(|| format!("invalid --from instant '{s}'"))?
                    .with_timezone(&Utc),
                None => Utc::now(),
            };

            let fires: Vec<_> = cron.upcoming(start).take(count).collect();
            if fires.is_empty() {
                println!("no upcoming fire times");
            }
            for fire in fires {
                println!("{}", fire.with_timezone(&cron.time_zone()).to_rfc3339());
            }
        }
        Commands::Run { config, duration } => {
            let config_path = config;
            let config = load_config(&config_path)
                .with_context(|| format!("loading job file {}", config_path.display()))?;
            init_tracing(&config.log_level);
            validate_config(&config).context("job file validation failed")?;
            info!(config_path = %config_path.display(), jobs = config.job.len(), "job file loaded");

            let limit = duration
                .map(|s| humantime::parse_duration(&s).with_context(|| format!("invalid --for duration '{s}'")))
                .transpose()?;

            let scheduler = Scheduler::new(config.tick_duration()?, config.wheel_size);
            for job in &config.job {
                let mut cron = CronExpression::parse(&job.cron)?;
                if let Some(tz) = &job.timezone {
                    // Validated above; unknown zones never get this far.
                    cron = cron.in_time_zone(tz.parse().map_err(|_| anyhow::anyhow!("unknown timezone '{tz}'"))?);
                }
                let id = job.id.clone();
                scheduler
                    .add_expression(job.id.clone(), cron, move || {
                        info!(job = %id, "fired");
                    })
                    .with_context(|| format!("scheduling job '{}'", job.id))?;
            }

            wait_for_shutdown(limit).await;
            info!("shutdown signal received");

            let unfired = scheduler.shutdown();
            if !unfired.is_empty() {
                info!(jobs = ?unfired, "jobs still pending at shutdown");
            }
        }
    }

    Ok(())
}

fn init_tracing(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn wait_for_shutdown(limit: Option<std::time::Duration>) {
    let ctrl_c = tokio::signal::ctrl_c();
    let deadline = async {
        match limit {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
            _ = deadline => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = ctrl_c => {},
            _ = deadline => {},
        }
    }
}
