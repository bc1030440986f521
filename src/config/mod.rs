use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::join::DEFAULT_COUNT_FIELD;

pub const DEFAULT_PUBLIC_COUNT_FIELD: &str = "tract_addr_count";
pub const DEFAULT_RELATION: &str = "tract_addr_count";

/// What to do when the output relation already exists.
#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    #[default]
    Fail,
    Overwrite,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct OutputConfig {
    pub store: PathBuf,
    #[serde(default = "default_relation")]
    pub relation: String,
    #[serde(default)]
    pub on_conflict: ConflictPolicy,
}

fn default_relation() -> String {
    DEFAULT_RELATION.to_string()
}

fn default_count_field() -> String {
    DEFAULT_COUNT_FIELD.to_string()
}

/// Field renames are a list rather than a map so field names keep their case
/// through the config loader.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Rename {
    pub from: String,
    pub to: String,
}

/// One aggregation job, as read from a YAML file or assembled from flags.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct JobConfig {
    pub points: PathBuf,
    pub regions: PathBuf,
    pub output: OutputConfig,
    #[serde(default)]
    pub workspace_dir: Option<PathBuf>,
    #[serde(default = "default_count_field")]
    pub count_field: String,
    /// When absent, the count field is renamed to `tract_addr_count`.
    #[serde(default)]
    pub renames: Option<Vec<Rename>>,
}

impl JobConfig {
    pub fn new(points: PathBuf, regions: PathBuf, store: PathBuf) -> Self {
        Self {
            points,
            regions,
            output: OutputConfig {
                store,
                relation: default_relation(),
                on_conflict: ConflictPolicy::default(),
            },
            workspace_dir: None,
            count_field: default_count_field(),
            renames: None,
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Renames keyed by source field. A later entry for the same field wins.
    pub fn rename_map(&self) -> BTreeMap<String, String> {
        match &self.renames {
            Some(renames) => renames
                .iter()
                .map(|rename| (rename.from.clone(), rename.to.clone()))
                .collect(),
            None => BTreeMap::from([(
                self.count_field.clone(),
                DEFAULT_PUBLIC_COUNT_FIELD.to_string(),
            )]),
        }
    }

    /// Points the generated count field at a new public name, replacing any
    /// existing rename of it.
    pub fn set_public_count_name(&mut self, name: impl Into<String>) {
        let count_field = self.count_field.clone();
        let renames = self.renames.get_or_insert_with(Vec::new);
        renames.retain(|rename| rename.from != count_field);
        renames.push(Rename {
            from: count_field,
            to: name.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn loads_minimal_yaml_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("job.yaml");
        fs::write(
            &path,
            r#"
points: data/address.store/address_points
regions: data/tracts.geojson
output:
  store: out/final.store
"#,
        )
        .unwrap();

        let job = JobConfig::load(&path).unwrap();

        assert_eq!(job.points, PathBuf::from("data/address.store/address_points"));
        assert_eq!(job.output.relation, DEFAULT_RELATION);
        assert_eq!(job.output.on_conflict, ConflictPolicy::Fail);
        assert_eq!(job.count_field, "Join_Count");
        assert_eq!(job.rename_map()["Join_Count"], "tract_addr_count");
        assert!(job.workspace_dir.is_none());
    }

    #[test]
    fn loads_full_yaml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("job.yaml");
        fs::write(
            &path,
            r#"
points: p.geojson
regions: r.geojson
workspace_dir: /var/tmp
output:
  store: final.store
  relation: counts
  on_conflict: overwrite
count_field: Join_Count
renames:
  - from: Join_Count
    to: n_points
"#,
        )
        .unwrap();

        let job = JobConfig::load(&path).unwrap();

        assert_eq!(job.output.relation, "counts");
        assert_eq!(job.output.on_conflict, ConflictPolicy::Overwrite);
        assert_eq!(job.workspace_dir, Some(PathBuf::from("/var/tmp")));
        assert_eq!(job.rename_map().len(), 1);
        assert_eq!(job.rename_map()["Join_Count"], "n_points");
    }

    #[test]
    fn rejects_unknown_conflict_policy() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("job.yaml");
        fs::write(
            &path,
            "points: p\nregions: r\noutput:\n  store: s\n  on_conflict: merge\n",
        )
        .unwrap();

        assert!(JobConfig::load(&path).is_err());
    }

    #[test]
    fn default_rename_follows_count_field() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("job.yaml");
        fs::write(
            &path,
            "points: p\nregions: r\noutput:\n  store: s\ncount_field: hits\n",
        )
        .unwrap();

        let job = JobConfig::load(&path).unwrap();

        assert!(job.renames.is_none());
        assert_eq!(
            job.rename_map(),
            BTreeMap::from([("hits".to_string(), "tract_addr_count".to_string())])
        );
    }

    #[test]
    fn public_count_name_replaces_rename() {
        let mut job = JobConfig::new("p".into(), "r".into(), "s".into());
        job.set_public_count_name("addr_total");
        assert_eq!(job.rename_map()["Join_Count"], "addr_total");
        assert_eq!(job.rename_map().len(), 1);
    }
}
