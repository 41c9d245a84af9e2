mod cli;
mod config;
mod destination;
mod error;
mod progress;

use crate::{
    cli::Args,
    config::AppConfig,
    destination::{confirm_overwrite, contains_files, prepare_output_dir, resolve_output_dir},
    error::{AppError, Result},
    progress::ProgressReporter,
};
use clap::Parser;
#[cfg(feature = "colored-output")]
use colored::*;
use spool_engine::{DownloadJob, EventEmitter, title_from_url};
use std::process;
use tracing::{Level, debug, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run(args).await {
        debug!(error = ?e, "Application error");
        eprintln!("{}", failure_line(&e));
        process::exit(1);
    }
}

/// The one line printed for a failed run.
fn failure_line(e: &AppError) -> String {
    #[cfg(feature = "colored-output")]
    let label = "Error:".red().bold().to_string();
    #[cfg(not(feature = "colored-output"))]
    let label = "Error:";
    format!("{label} {e}")
}

async fn run(args: Args) -> Result<()> {
    init_logging(args.verbose, args.quiet)?;

    let config = AppConfig::load(args.config.as_deref())?;
    debug!(?config, "Configuration loaded");

    let title = title_from_url(&args.url);
    let cwd = std::env::current_dir()?;
    let directory = resolve_output_dir(args.output_dir.as_deref(), &title, &cwd);
    prepare_output_dir(&directory)?;
    if contains_files(&directory)? && !args.yes && !confirm_overwrite(&directory)? {
        println!("Terminated.");
        return Ok(());
    }

    if !args.quiet {
        println!(
            "Downloading \"{}\" to \"{}\"...",
            args.url,
            directory.display()
        );
    }

    let (events, receiver) = EventEmitter::channel();
    let job = DownloadJob::new(config.job_config(&args, directory, title))?.with_events(events);

    let token = job.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling download");
            token.cancel();
        }
    });

    // Logs and the bar would fight over the terminal, so the bar yields to -v.
    let progress = ProgressReporter::spawn(receiver, args.quiet || args.verbose);
    let result = job.run(&args.url).await;
    drop(job);
    progress.finish().await;
    let report = result?;

    for warning in &report.warnings {
        eprintln!("Warning: {warning}");
    }
    if !args.quiet {
        match report.artifacts.as_slice() {
            [single] => println!("All done! Saved to \"{}\"", single.display()),
            many => println!(
                "All done! {} files, {} segments",
                many.len(),
                report.segments
            ),
        }
    }
    Ok(())
}

fn init_logging(verbose: bool, quiet: bool) -> Result<()> {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::WARN.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_level(verbose))
        .try_init()
        .map_err(|e| AppError::Config(format!("failed to initialise logging: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use spool_engine::DownloadError;

    #[test]
    fn failure_line_names_the_stage_once() {
        let line = failure_line(&AppError::from(DownloadError::Cancelled));
        assert!(line.ends_with("job failed: download cancelled"));
        assert_eq!(line.matches("failed").count(), 1);
    }
}
