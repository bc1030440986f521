use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use crate::config::{ConflictPolicy, JobConfig};
use crate::output::OutputRelation;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Job configuration file (YAML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Point dataset (.geojson file or <store>/<relation>)
    #[arg(short, long)]
    pub points: Option<PathBuf>,

    /// Region dataset (.geojson file or <store>/<relation>)
    #[arg(short, long)]
    pub regions: Option<PathBuf>,

    /// Output store directory (created if missing)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Output relation name
    #[arg(long)]
    pub relation: Option<String>,

    /// What to do when the output relation already exists
    #[arg(long, value_enum)]
    pub on_conflict: Option<ConflictPolicy>,

    /// Public name for the per-region count field
    #[arg(long)]
    pub count_name: Option<String>,

    /// Parent directory for the scratch workspace (default: system temp dir)
    #[arg(long, env = "TRACTCOUNT_WORKSPACE_DIR")]
    pub workspace_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

/// Builds the job from the config file, if any, with flags taking precedence.
pub fn resolve_job(cli: &Cli) -> Result<JobConfig> {
    let mut job = match &cli.config {
        Some(path) => JobConfig::load(path)
            .with_context(|| format!("Config: Failed to load job file {:?}", path))?,
        None => JobConfig::new(
            required(&cli.points, "--points")?,
            required(&cli.regions, "--regions")?,
            required(&cli.output, "--output")?,
        ),
    };

    if let Some(points) = &cli.points {
        job.points = points.clone();
    }
    if let Some(regions) = &cli.regions {
        job.regions = regions.clone();
    }
    if let Some(store) = &cli.output {
        job.output.store = store.clone();
    }
    if let Some(relation) = &cli.relation {
        job.output.relation = relation.clone();
    }
    if let Some(policy) = cli.on_conflict {
        job.output.on_conflict = policy;
    }
    if let Some(name) = &cli.count_name {
        job.set_public_count_name(name.clone());
    }
    if let Some(dir) = &cli.workspace_dir {
        job.workspace_dir = Some(dir.clone());
    }

    Ok(job)
}

fn required(value: &Option<PathBuf>, flag: &str) -> Result<PathBuf> {
    value
        .clone()
        .with_context(|| format!("CLI: {flag} is required without --config"))
}

pub fn summarize(output: &OutputRelation) -> String {
    let action = match (output.store_created, output.replaced) {
        (true, _) => "created store, wrote",
        (false, true) => "replaced",
        (false, false) => "wrote",
    };
    format!(
        "{} '{}' in {:?}: {} features, fields [{}]",
        action,
        output.name,
        output.store,
        output.feature_count,
        output
            .schema
            .fields()
            .iter()
            .map(|field| format!("{}: {}", field.name, field.field_type))
            .collect::<Vec<_>>()
            .join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("tractcount").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn flags_alone_build_a_job() {
        let cli = parse(&[
            "--points",
            "p.geojson",
            "--regions",
            "r.geojson",
            "--output",
            "out.store",
            "--on-conflict",
            "overwrite",
            "--count-name",
            "n",
        ]);

        let job = resolve_job(&cli).unwrap();

        assert_eq!(job.points, PathBuf::from("p.geojson"));
        assert_eq!(job.output.store, PathBuf::from("out.store"));
        assert_eq!(job.output.on_conflict, ConflictPolicy::Overwrite);
        assert_eq!(job.rename_map()["Join_Count"], "n");
    }

    #[test]
    fn missing_inputs_without_config_are_rejected() {
        let cli = parse(&["--points", "p.geojson"]);
        let err = resolve_job(&cli).unwrap_err();
        assert!(err.to_string().contains("--regions"));
    }

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("job.yaml");
        std::fs::write(
            &path,
            "points: p\nregions: r\noutput:\n  store: s\n  relation: from_file\n",
        )
        .unwrap();
        let config = path.to_string_lossy().into_owned();

        let cli = parse(&["--config", &config, "--relation", "from_flag"]);
        let job = resolve_job(&cli).unwrap();

        assert_eq!(job.output.relation, "from_flag");
        assert_eq!(job.points, PathBuf::from("p"));
    }
}
