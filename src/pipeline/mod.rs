//! One aggregation run, start to finish.
//!
//! Provisioning, the join, field mapping and materialization all happen inside
//! `workspace::scoped`, so the scratch workspace is gone by the time `run_job`
//! returns, whatever the outcome.

use crate::config::JobConfig;
use crate::dataset::{PointDataset, RegionDataset};
use crate::error::PipelineError;
use crate::join::SpatialAggregator;
use crate::mapping::build_mapping;
use crate::output::{OutputMaterializer, OutputRelation};
use crate::workspace::{self, WorkspaceProvisioner};

/// Name of the join output inside the scratch store.
pub const STAGED_RELATION: &str = "joined";

pub fn provisioner_for(job: &JobConfig) -> WorkspaceProvisioner {
    match &job.workspace_dir {
        Some(dir) => WorkspaceProvisioner::in_dir(dir),
        None => WorkspaceProvisioner::new(),
    }
}

pub fn run_job(job: &JobConfig) -> Result<OutputRelation, PipelineError> {
    let provisioner = provisioner_for(job);
    let aggregator = SpatialAggregator::new(job.count_field.clone());
    let materializer = OutputMaterializer::new(job.output.on_conflict);
    let renames = job.rename_map();

    workspace::scoped(&provisioner, |workspace| {
        tracing::info!("Pipeline: workspace {:?}", workspace.path());

        let regions = RegionDataset::open(&job.regions)?;
        let points = PointDataset::open(&job.points)?;
        tracing::info!(
            "Pipeline: {} regions from {:?}, {} points from {:?}",
            regions.len(),
            regions.path(),
            points.len(),
            points.path()
        );

        let joined = aggregator.aggregate(&regions, &points, workspace, STAGED_RELATION)?;
        tracing::debug!(
            "Pipeline: staged {} records as '{}' (count field '{}')",
            joined.len(),
            joined.relation(),
            joined.count_field()
        );

        let mapping = build_mapping(joined.schema(), &renames)?;
        let output = materializer.materialize(
            &joined,
            &mapping,
            &job.output.store,
            &job.output.relation,
        )?;
        Ok(output)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConflictPolicy, Rename};
    use crate::error::{JoinError, SchemaError};
    use crate::storage::FeatureStore;
    use serde_json::{Value, json};
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn square(x0: f64, name: &str) -> Value {
        json!({
            "type": "Feature",
            "properties": {"name": name},
            "geometry": {
                "type": "Polygon",
                "coordinates": [[[x0, 0.0], [x0 + 5.0, 0.0], [x0 + 5.0, 5.0], [x0, 5.0], [x0, 0.0]]]
            }
        })
    }

    fn point(x: f64, y: f64) -> Value {
        json!({
            "type": "Feature",
            "properties": {},
            "geometry": {"type": "Point", "coordinates": [x, y]}
        })
    }

    fn write_collection(path: &Path, features: Vec<Value>) {
        let doc = json!({"type": "FeatureCollection", "features": features});
        fs::write(path, serde_json::to_vec(&doc).unwrap()).unwrap();
    }

    struct Fixture {
        root: TempDir,
        scratch: PathBuf,
        job: JobConfig,
    }

    /// Three regions with 4, 4 and 2 points inside them.
    fn fixture() -> Fixture {
        let root = TempDir::new().unwrap();
        let regions = root.path().join("tracts.geojson");
        let points = root.path().join("addresses.geojson");
        let scratch = root.path().join("scratch");
        fs::create_dir(&scratch).unwrap();

        write_collection(
            &regions,
            vec![square(0.0, "north"), square(10.0, "central"), square(20.0, "south")],
        );
        let mut coords = vec![(1.0, 1.0), (2.0, 2.0), (3.0, 3.0), (4.0, 1.0)];
        coords.extend([(11.0, 1.0), (12.0, 2.0), (13.0, 3.0), (14.0, 4.0)]);
        coords.extend([(21.0, 1.0), (22.0, 2.0)]);
        write_collection(&points, coords.into_iter().map(|(x, y)| point(x, y)).collect());

        let mut job = JobConfig::new(points, regions, root.path().join("final.store"));
        job.workspace_dir = Some(scratch.clone());
        Fixture { root, scratch, job }
    }

    fn scratch_is_empty(fixture: &Fixture) -> bool {
        fs::read_dir(&fixture.scratch).unwrap().next().is_none()
    }

    fn counts_by_name(store: &Path, relation: &str) -> Vec<(String, u64)> {
        let set = FeatureStore::open(store).unwrap().read_relation(relation).unwrap();
        set.features
            .iter()
            .map(|feature| {
                (
                    feature.attributes["name"].as_str().unwrap().to_string(),
                    feature.attributes["tract_addr_count"].as_u64().unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn counts_points_per_region_and_cleans_up() {
        let fixture = fixture();

        let output = run_job(&fixture.job).unwrap();

        assert_eq!(output.feature_count, 3);
        assert_eq!(
            counts_by_name(&output.store, &output.name),
            vec![
                ("north".to_string(), 4),
                ("central".to_string(), 4),
                ("south".to_string(), 2),
            ]
        );
        let names: Vec<&str> = output.schema.names().collect();
        assert_eq!(names, vec!["name", "tract_addr_count"]);
        assert!(scratch_is_empty(&fixture));
    }

    #[test]
    fn regions_without_points_are_kept_with_zero() {
        let fixture = fixture();
        write_collection(&fixture.job.points, vec![point(100.0, 100.0)]);

        let output = run_job(&fixture.job).unwrap();

        let counts: Vec<u64> = counts_by_name(&output.store, &output.name)
            .into_iter()
            .map(|(_, count)| count)
            .collect();
        assert_eq!(counts, vec![0, 0, 0]);
    }

    #[test]
    fn corrupt_region_geometry_surfaces_join_error() {
        let fixture = fixture();
        let bad = json!({
            "type": "Feature",
            "properties": {"name": "broken"},
            "geometry": {"type": "Polygon", "coordinates": [[[0.0, 0.0], [1.0, 1.0], [0.0, 0.0]]]}
        });
        write_collection(&fixture.job.regions, vec![square(0.0, "ok"), bad]);

        let err = run_job(&fixture.job).unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Join(JoinError::InvalidGeometry { index: 1, .. })
        ));
        assert!(scratch_is_empty(&fixture));
        assert!(!fixture.job.output.store.exists());
    }

    #[test]
    fn unreadable_points_surface_join_error() {
        let mut fixture = fixture();
        fixture.job.points = fixture.root.path().join("missing.geojson");

        let err = run_job(&fixture.job).unwrap_err();

        assert!(matches!(err, PipelineError::Join(JoinError::Unreadable { .. })));
        assert!(scratch_is_empty(&fixture));
    }

    #[test]
    fn rename_of_unknown_field_is_schema_error() {
        let mut fixture = fixture();
        fixture.job.renames = Some(vec![Rename {
            from: "Join_Count_1".to_string(),
            to: "tract_addr_count".to_string(),
        }]);

        let err = run_job(&fixture.job).unwrap_err();

        assert!(matches!(err, PipelineError::Schema(SchemaError::MissingField { .. })));
        assert!(scratch_is_empty(&fixture));
        assert!(!fixture.job.output.store.exists());
    }

    #[test]
    fn custom_count_field_gets_the_public_name() {
        let mut fixture = fixture();
        fixture.job.count_field = "hits".to_string();

        let output = run_job(&fixture.job).unwrap();

        let names: Vec<&str> = output.schema.names().collect();
        assert_eq!(names, vec!["name", "tract_addr_count"]);
        assert_eq!(counts_by_name(&output.store, &output.name)[2], ("south".to_string(), 2));
    }

    #[test]
    fn second_run_follows_conflict_policy() {
        let mut fixture = fixture();
        run_job(&fixture.job).unwrap();

        for _ in 0..2 {
            let err = run_job(&fixture.job).unwrap_err();
            assert!(matches!(err, PipelineError::OutputConflict(_)));
        }

        fixture.job.output.on_conflict = ConflictPolicy::Overwrite;
        let output = run_job(&fixture.job).unwrap();
        assert!(output.replaced);
        assert!(!output.store_created);
        assert!(scratch_is_empty(&fixture));
    }

    #[test]
    fn runs_from_a_store_relation_input() {
        let fixture = fixture();
        let first = run_job(&fixture.job).unwrap();

        // The first run's output becomes the region input of the second.
        let mut job = fixture.job.clone();
        job.regions = first.store.join(&first.name);
        job.output.relation = "recount".to_string();
        job.count_field = "hits".to_string();
        job.renames = Some(Vec::new());

        let output = run_job(&job).unwrap();

        let set = FeatureStore::open(&output.store)
            .unwrap()
            .read_relation("recount")
            .unwrap();
        let hits: Vec<u64> = set
            .features
            .iter()
            .map(|feature| feature.attributes["hits"].as_u64().unwrap())
            .collect();
        assert_eq!(hits, vec![4, 4, 2]);
        assert!(set.schema.contains("tract_addr_count"));
    }
}
