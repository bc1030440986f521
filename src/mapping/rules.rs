//! Mapping construction and application.

use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

use crate::error::SchemaError;
use crate::features::{Feature, FeatureSet, Field, Schema};

/// One output field and the source field it is read from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldMap {
    pub source: String,
    pub target: Field,
}

/// Ordered output schema of a copy, one entry per output field.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldMapping {
    maps: Vec<FieldMap>,
}

impl FieldMapping {
    pub fn target_schema(&self) -> Schema {
        Schema::new(self.maps.iter().map(|map| map.target.clone()).collect())
    }

    /// Projects a feature through the mapping. Missing source attributes
    /// become null.
    pub fn apply(&self, feature: &Feature) -> Feature {
        let attributes: Map<String, Value> = self
            .maps
            .iter()
            .map(|map| {
                let value = feature
                    .attributes
                    .get(&map.source)
                    .cloned()
                    .unwrap_or(Value::Null);
                (map.target.name.clone(), value)
            })
            .collect();

        Feature {
            geometry: feature.geometry.clone(),
            attributes,
        }
    }

    pub fn apply_set(&self, set: &FeatureSet) -> FeatureSet {
        FeatureSet {
            schema: self.target_schema(),
            features: set.features.iter().map(|feature| self.apply(feature)).collect(),
        }
    }
}

/// Builds a mapping that renames `renames` keys to their values and passes
/// every other field of `schema` through in order.
pub fn build_mapping(
    schema: &Schema,
    renames: &BTreeMap<String, String>,
) -> Result<FieldMapping, SchemaError> {
    if let Some(missing) = renames.keys().find(|name| !schema.contains(name)) {
        return Err(SchemaError::MissingField {
            field: missing.clone(),
            available: schema.names().collect::<Vec<_>>().join(", "),
        });
    }

    // target name -> source name
    let mut targets: HashMap<&str, &str> = HashMap::with_capacity(schema.len());
    let mut maps = Vec::with_capacity(schema.len());
    for field in schema.fields() {
        let renamed = renames.get(&field.name);
        let target = renamed.unwrap_or(&field.name);

        if let Some(existing) = targets.insert(target, &field.name) {
            let source_field = if renamed.is_some() { field.name.as_str() } else { existing };
            return Err(SchemaError::DuplicateField {
                source_field: source_field.to_string(),
                field: target.clone(),
            });
        }

        maps.push(FieldMap {
            source: field.name.clone(),
            target: Field::new(target.clone(), field.field_type),
        });
    }

    Ok(FieldMapping { maps })
}
