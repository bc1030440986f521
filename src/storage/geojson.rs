use geo_types::Geometry;
use geojson::GeoJson;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use super::StoreError;
use crate::features::Feature;

const HEADER: &str = "{\n  \"type\": \"FeatureCollection\",\n  \"features\": [\n";
const FOOTER: &str = "\n  ]\n}\n";

/// Streams features into a GeoJSON FeatureCollection.
///
/// Output goes to a temporary file next to the target and is renamed into
/// place by `finish`, so readers never observe a half-written relation.
pub struct RelationWriter {
    target: PathBuf,
    writer: BufWriter<NamedTempFile>,
    first_feature: bool,
}

impl RelationWriter {
    pub fn new(target: &Path) -> Result<Self, StoreError> {
        let dir = target.parent().unwrap_or(Path::new("."));
        let file = NamedTempFile::new_in(dir).map_err(StoreError::io(dir))?;
        let mut writer = BufWriter::new(file);
        writer
            .write_all(HEADER.as_bytes())
            .map_err(StoreError::io(target))?;

        Ok(Self {
            target: target.to_path_buf(),
            writer,
            first_feature: true,
        })
    }

    pub fn add_feature(&mut self, feature: &Feature) -> Result<(), StoreError> {
        if !self.first_feature {
            writeln!(self.writer, ",").map_err(StoreError::io(&self.target))?;
        }
        self.first_feature = false;

        let geojson = GeoJson::Feature(geojson::Feature {
            bbox: None,
            geometry: Some(geojson::Geometry::from(&feature.geometry)),
            id: None,
            properties: Some(feature.attributes.clone()),
            foreign_members: None,
        });
        serde_json::to_writer(&mut self.writer, &geojson).map_err(|err| StoreError::GeoJson {
            path: self.target.clone(),
            message: err.to_string(),
        })
    }

    pub fn finish(mut self) -> Result<(), StoreError> {
        self.writer
            .write_all(FOOTER.as_bytes())
            .and_then(|()| self.writer.flush())
            .map_err(StoreError::io(&self.target))?;

        let file = self
            .writer
            .into_inner()
            .map_err(|err| StoreError::io(&self.target)(err.into_error()))?;
        file.persist(&self.target)
            .map_err(|err| StoreError::io(&self.target)(err.error))?;
        Ok(())
    }
}

/// Writes a whole relation file atomically.
pub fn write_features(target: &Path, features: &[Feature]) -> Result<(), StoreError> {
    let mut writer = RelationWriter::new(target)?;
    for feature in features {
        writer.add_feature(feature)?;
    }
    writer.finish()
}

/// Reads the raw features of a GeoJSON FeatureCollection file.
pub fn read_collection(path: &Path) -> Result<Vec<geojson::Feature>, StoreError> {
    let raw = fs::read_to_string(path).map_err(StoreError::io(path))?;
    let parsed = raw.parse::<GeoJson>().map_err(|err| StoreError::GeoJson {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;

    match parsed {
        GeoJson::FeatureCollection(collection) => Ok(collection.features),
        GeoJson::Feature(_) => Err(StoreError::GeoJson {
            path: path.to_path_buf(),
            message: "expected a FeatureCollection, found a single Feature".to_string(),
        }),
        GeoJson::Geometry(_) => Err(StoreError::GeoJson {
            path: path.to_path_buf(),
            message: "expected a FeatureCollection, found a bare Geometry".to_string(),
        }),
    }
}

pub fn convert_geometry(geometry: geojson::Geometry) -> Result<Geometry<f64>, String> {
    Geometry::<f64>::try_from(geometry).map_err(|err| err.to_string())
}

/// Reads a relation file written by `RelationWriter`.
pub fn read_features(path: &Path) -> Result<Vec<Feature>, StoreError> {
    read_collection(path)?
        .into_iter()
        .enumerate()
        .map(|(index, raw)| {
            let geometry = raw.geometry.ok_or_else(|| StoreError::GeoJson {
                path: path.to_path_buf(),
                message: format!("feature {index} has no geometry"),
            })?;
            let geometry = convert_geometry(geometry).map_err(|message| StoreError::GeoJson {
                path: path.to_path_buf(),
                message: format!("feature {index}: {message}"),
            })?;
            Ok(Feature {
                geometry,
                attributes: raw.properties.unwrap_or_default(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo_types::{LineString, Point, Polygon};
    use serde_json::{Map, Value};
    use tempfile::TempDir;

    fn point_feature(name: &str, lon: f64, lat: f64) -> Feature {
        let mut attributes = Map::new();
        attributes.insert("name".to_string(), Value::String(name.to_string()));
        Feature {
            geometry: Geometry::Point(Point::new(lon, lat)),
            attributes,
        }
    }

    #[test]
    fn writes_valid_feature_collection() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("points.geojson");

        write_features(
            &path,
            &[point_feature("First", 0.0, 0.0), point_feature("Second", 1.0, 1.0)],
        )
        .unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let parsed: Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed["type"], "FeatureCollection");
        assert_eq!(parsed["features"].as_array().unwrap().len(), 2);
        assert_eq!(parsed["features"][1]["properties"]["name"], "Second");
    }

    #[test]
    fn writes_empty_feature_collection() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.geojson");

        write_features(&path, &[]).unwrap();

        assert!(read_features(&path).unwrap().is_empty());
    }

    #[test]
    fn reads_back_polygon_and_attributes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("regions.geojson");
        let polygon = Polygon::new(
            LineString::from(vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0), (0.0, 0.0)]),
            vec![],
        );
        let mut attributes = Map::new();
        attributes.insert("count".to_string(), Value::from(3));
        let feature = Feature {
            geometry: Geometry::Polygon(polygon),
            attributes,
        };

        write_features(&path, std::slice::from_ref(&feature)).unwrap();
        let features = read_features(&path).unwrap();

        assert_eq!(features, vec![feature]);
    }

    #[test]
    fn abandoned_writer_leaves_no_target() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.geojson");

        let mut writer = RelationWriter::new(&path).unwrap();
        writer.add_feature(&point_feature("a", 0.0, 0.0)).unwrap();
        drop(writer);

        assert!(!path.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn rejects_single_feature_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("single.geojson");
        fs::write(
            &path,
            r#"{"type":"Feature","geometry":{"type":"Point","coordinates":[0,0]},"properties":{}}"#,
        )
        .unwrap();

        let err = read_collection(&path).unwrap_err();
        assert!(err.to_string().contains("FeatureCollection"));
    }

    #[test]
    fn missing_geometry_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nogeom.geojson");
        fs::write(
            &path,
            r#"{"type":"FeatureCollection","features":[{"type":"Feature","geometry":null,"properties":{}}]}"#,
        )
        .unwrap();

        let err = read_features(&path).unwrap_err();
        assert!(matches!(err, StoreError::GeoJson { .. }));
    }
}
