//! Read-only input datasets.
//!
//! A dataset path is either a GeoJSON FeatureCollection file or
//! `<store>/<relation>`, naming a relation inside a feature store.

use geo::{Area, CoordsIter};
use geo_types::{Coord, Geometry, LineString, MultiPolygon, Point};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::error::JoinError;
use crate::features::{Feature, Schema};
use crate::storage::{FeatureStore, geojson};

const POINTS: &str = "point";
const REGIONS: &str = "region";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DatasetSource {
    File(PathBuf),
    Relation { store: PathBuf, name: String },
}

impl DatasetSource {
    pub fn resolve(path: &Path) -> Self {
        if !path.is_file()
            && let (Some(store), Some(name)) = (path.parent(), path.file_name())
            && FeatureStore::is_store(store)
        {
            return DatasetSource::Relation {
                store: store.to_path_buf(),
                name: name.to_string_lossy().into_owned(),
            };
        }
        DatasetSource::File(path.to_path_buf())
    }
}

pub struct PointDataset {
    path: PathBuf,
    points: Vec<Point<f64>>,
}

impl PointDataset {
    pub fn open(path: &Path) -> Result<Self, JoinError> {
        let (features, _) = read_source(path, POINTS)?;
        let points = features
            .into_iter()
            .enumerate()
            .map(|(index, feature)| {
                let point = match feature.geometry {
                    Geometry::Point(point) => point,
                    Geometry::MultiPoint(multi) if multi.0.len() == 1 => multi.0[0],
                    other => return Err(unexpected(path, POINTS, index, "Point", &other)),
                };
                if !(point.x().is_finite() && point.y().is_finite()) {
                    return Err(invalid(path, POINTS, index, "non-finite coordinate"));
                }
                Ok(point)
            })
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!("Dataset: {} points from {:?}", points.len(), path);
        Ok(Self {
            path: path.to_path_buf(),
            points,
        })
    }

    #[cfg(test)]
    pub fn from_points(points: Vec<Point<f64>>) -> Self {
        Self {
            path: PathBuf::from("<memory>"),
            points,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn points(&self) -> &[Point<f64>] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }
}

#[derive(Clone, Debug)]
pub struct Region {
    pub geometry: MultiPolygon<f64>,
    pub attributes: Map<String, Value>,
}

pub struct RegionDataset {
    path: PathBuf,
    schema: Schema,
    regions: Vec<Region>,
}

impl RegionDataset {
    pub fn open(path: &Path) -> Result<Self, JoinError> {
        let (features, schema) = read_source(path, REGIONS)?;
        let schema = schema.unwrap_or_else(|| Schema::infer(&features));

        let regions = features
            .into_iter()
            .enumerate()
            .map(|(index, feature)| {
                let geometry = match feature.geometry {
                    Geometry::Polygon(polygon) => MultiPolygon(vec![polygon]),
                    Geometry::MultiPolygon(multi) => multi,
                    other => return Err(unexpected(path, REGIONS, index, "Polygon", &other)),
                };
                if let Some(reason) = polygon_defect(&geometry) {
                    return Err(invalid(path, REGIONS, index, reason));
                }
                Ok(Region {
                    geometry,
                    attributes: feature.attributes,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(
            "Dataset: {} regions ({} attributes) from {:?}",
            regions.len(),
            schema.len(),
            path
        );
        Ok(Self {
            path: path.to_path_buf(),
            schema,
            regions,
        })
    }

    #[cfg(test)]
    pub fn from_regions(regions: Vec<Region>) -> Self {
        let features: Vec<Feature> = regions
            .iter()
            .map(|region| Feature {
                geometry: Geometry::MultiPolygon(region.geometry.clone()),
                attributes: region.attributes.clone(),
            })
            .collect();
        Self {
            path: PathBuf::from("<memory>"),
            schema: Schema::infer(&features),
            regions,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }
}

/// Loads features from either source kind. Relations carry their stored
/// schema; plain files do not.
fn read_source(path: &Path, role: &'static str) -> Result<(Vec<Feature>, Option<Schema>), JoinError> {
    let unreadable = |source| JoinError::Unreadable {
        role,
        path: path.to_path_buf(),
        source,
    };

    match DatasetSource::resolve(path) {
        DatasetSource::Relation { store, name } => {
            let set = FeatureStore::open(&store)
                .and_then(|store| store.read_relation(&name))
                .map_err(unreadable)?;
            Ok((set.features, Some(set.schema)))
        }
        DatasetSource::File(file) => {
            let raw = geojson::read_collection(&file).map_err(unreadable)?;
            let features = raw
                .into_iter()
                .enumerate()
                .map(|(index, feature)| {
                    let geometry = feature.geometry.ok_or_else(|| JoinError::MissingGeometry {
                        role,
                        path: path.to_path_buf(),
                        index,
                    })?;
                    let geometry = geojson::convert_geometry(geometry)
                        .map_err(|reason| invalid(path, role, index, &reason))?;
                    Ok(Feature {
                        geometry,
                        attributes: feature.properties.unwrap_or_default(),
                    })
                })
                .collect::<Result<Vec<_>, JoinError>>()?;
            Ok((features, None))
        }
    }
}

/// Every part is checked on its own, so one broken part of a multipolygon is
/// not hidden by the area of the others.
fn polygon_defect(geometry: &MultiPolygon<f64>) -> Option<&'static str> {
    if geometry.0.is_empty() {
        return Some("empty multipolygon");
    }
    if !geometry
        .coords_iter()
        .all(|coord| coord.x.is_finite() && coord.y.is_finite())
    {
        return Some("non-finite coordinate");
    }
    for polygon in &geometry.0 {
        if distinct_vertices(polygon.exterior()) < 3 {
            return Some("polygon has fewer than three distinct vertices");
        }
        if polygon
            .interiors()
            .iter()
            .any(|ring| distinct_vertices(ring) < 3)
        {
            return Some("polygon hole has fewer than three distinct vertices");
        }
        if polygon.unsigned_area() == 0.0 {
            return Some("polygon has zero area");
        }
    }
    None
}

fn distinct_vertices(ring: &LineString<f64>) -> usize {
    let mut seen: Vec<Coord<f64>> = Vec::with_capacity(ring.0.len());
    for coord in &ring.0 {
        if !seen.contains(coord) {
            seen.push(*coord);
        }
    }
    seen.len()
}

fn geometry_kind(geometry: &Geometry<f64>) -> &'static str {
    match geometry {
        Geometry::Point(_) => "Point",
        Geometry::Line(_) => "Line",
        Geometry::LineString(_) => "LineString",
        Geometry::Polygon(_) => "Polygon",
        Geometry::MultiPoint(_) => "MultiPoint",
        Geometry::MultiLineString(_) => "MultiLineString",
        Geometry::MultiPolygon(_) => "MultiPolygon",
        Geometry::GeometryCollection(_) => "GeometryCollection",
        Geometry::Rect(_) => "Rect",
        Geometry::Triangle(_) => "Triangle",
    }
}

fn unexpected(
    path: &Path,
    role: &'static str,
    index: usize,
    expected: &'static str,
    found: &Geometry<f64>,
) -> JoinError {
    JoinError::UnexpectedGeometry {
        role,
        path: path.to_path_buf(),
        index,
        expected,
        found: geometry_kind(found),
    }
}

fn invalid(path: &Path, role: &'static str, index: usize, reason: &str) -> JoinError {
    JoinError::InvalidGeometry {
        role,
        path: path.to_path_buf(),
        index,
        reason: reason.to_string(),
    }
}
