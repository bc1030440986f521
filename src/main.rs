mod app;
mod config;
mod dataset;
mod error;
mod features;
mod join;
mod mapping;
mod output;
mod pipeline;
mod storage;
mod utils;
mod workspace;

use anyhow::{Context, Result};
use clap::Parser;

use app::{Cli, resolve_job, summarize};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let job = resolve_job(&cli)?;
    tracing::info!(
        "Job: points {:?}, regions {:?} -> {:?} '{}' (on conflict: {:?})",
        job.points,
        job.regions,
        job.output.store,
        job.output.relation,
        job.output.on_conflict
    );

    let start = std::time::Instant::now();
    let output = pipeline::run_job(&job).context("Pipeline: run failed")?;

    tracing::info!(
        "Done! {} in {:.2}s",
        summarize(&output),
        start.elapsed().as_secs_f64()
    );
    println!("{}", summarize(&output));

    Ok(())
}
