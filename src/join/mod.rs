//! Point-in-region counting.

use geo::{BoundingRect, Intersects};
use geo_types::{Geometry, Point, Rect};
use serde_json::Value;

use crate::dataset::{PointDataset, Region, RegionDataset};
use crate::error::JoinError;
use crate::features::{Feature, FeatureSet, Field, FieldType, Schema};
use crate::storage::StoreError;
use crate::workspace::TemporaryWorkspace;

pub const DEFAULT_COUNT_FIELD: &str = "Join_Count";

/// A join output staged inside a workspace.
///
/// Borrows the workspace, so it cannot outlive the scratch store it lives in.
pub struct JoinResult<'w> {
    workspace: &'w TemporaryWorkspace,
    relation: String,
    schema: Schema,
    count_field: String,
    record_count: usize,
}

impl JoinResult<'_> {
    pub fn relation(&self) -> &str {
        &self.relation
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn count_field(&self) -> &str {
        &self.count_field
    }

    pub fn len(&self) -> usize {
        self.record_count
    }

    /// Reads the staged records back from the workspace.
    pub fn load(&self) -> Result<FeatureSet, StoreError> {
        self.workspace.store().read_relation(&self.relation)
    }
}

#[derive(Clone, Debug)]
pub struct SpatialAggregator {
    count_field: String,
}

impl Default for SpatialAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_COUNT_FIELD)
    }
}

impl SpatialAggregator {
    pub fn new(count_field: impl Into<String>) -> Self {
        Self {
            count_field: count_field.into(),
        }
    }

    /// Number of points attributed to each region, in region order.
    ///
    /// A point counts for the first region whose geometry intersects it,
    /// boundary included, so a point on a shared edge is counted once.
    pub fn count(&self, regions: &RegionDataset, points: &PointDataset) -> Vec<u64> {
        let envelopes: Vec<Option<Rect<f64>>> = regions
            .regions()
            .iter()
            .map(|region| region.geometry.bounding_rect())
            .collect();

        let mut counts = vec![0u64; regions.len()];
        let mut outside = 0u64;
        for point in points.points() {
            let hit = regions
                .regions()
                .iter()
                .zip(&envelopes)
                .position(|(region, envelope)| {
                    envelope.is_some_and(|rect| covers(&rect, point))
                        && region.geometry.intersects(point)
                });
            match hit {
                Some(index) => counts[index] += 1,
                None => outside += 1,
            }
        }

        tracing::debug!("Join: {} points fall outside every region", outside);
        counts
    }

    /// Counts points per region and stages the result as `output_name`.
    ///
    /// Every region yields one record, carrying its attributes plus the count
    /// field; regions without points get a count of zero.
    pub fn aggregate<'w>(
        &self,
        regions: &RegionDataset,
        points: &PointDataset,
        workspace: &'w mut TemporaryWorkspace,
        output_name: &str,
    ) -> Result<JoinResult<'w>, JoinError> {
        if regions.schema().contains(&self.count_field) {
            return Err(JoinError::CountFieldCollision {
                field: self.count_field.clone(),
            });
        }

        let counts = self.count(regions, points);

        let mut schema = regions.schema().clone();
        schema.push(Field::new(self.count_field.clone(), FieldType::Integer));

        let features = regions
            .regions()
            .iter()
            .zip(&counts)
            .map(|(region, count)| {
                let mut attributes = region.attributes.clone();
                attributes.insert(self.count_field.clone(), Value::from(*count));
                Feature {
                    geometry: region_geometry(region),
                    attributes,
                }
            })
            .collect();
        let set = FeatureSet { schema, features };

        workspace
            .store_mut()
            .write_relation(output_name, &set, false)
            .map_err(|source| JoinError::Stage {
                relation: output_name.to_string(),
                source,
            })?;

        tracing::info!(
            "Join: counted {} points into {} regions ({} total)",
            points.len(),
            regions.len(),
            counts.iter().sum::<u64>()
        );

        let workspace: &'w TemporaryWorkspace = workspace;
        Ok(JoinResult {
            workspace,
            relation: output_name.to_string(),
            schema: set.schema,
            count_field: self.count_field.clone(),
            record_count: set.features.len(),
        })
    }
}

fn covers(rect: &Rect<f64>, point: &Point<f64>) -> bool {
    let (min, max) = (rect.min(), rect.max());
    (min.x..=max.x).contains(&point.x()) && (min.y..=max.y).contains(&point.y())
}

/// Single-part regions are written back as plain polygons.
fn region_geometry(region: &Region) -> Geometry<f64> {
    match region.geometry.0.as_slice() {
        [polygon] => Geometry::Polygon(polygon.clone()),
        _ => Geometry::MultiPolygon(region.geometry.clone()),
    }
}
