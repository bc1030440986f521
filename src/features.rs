use geo_types::Geometry;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Integer,
    Float,
    String,
    Boolean,
    Json,
}

impl FieldType {
    /// Type of a single attribute value; `None` for null.
    pub fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(FieldType::Boolean),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(FieldType::Integer),
            Value::Number(_) => Some(FieldType::Float),
            Value::String(_) => Some(FieldType::String),
            Value::Array(_) | Value::Object(_) => Some(FieldType::Json),
        }
    }

    fn widen(self, other: FieldType) -> FieldType {
        match (self, other) {
            (a, b) if a == b => a,
            (FieldType::Integer, FieldType::Float) | (FieldType::Float, FieldType::Integer) => {
                FieldType::Float
            }
            _ => FieldType::Json,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::String => "string",
            FieldType::Boolean => "boolean",
            FieldType::Json => "json",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// Ordered attribute schema of a feature collection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    /// Infers a schema from feature attributes.
    ///
    /// Fields come out in sorted name order. Integer and float values widen to
    /// float; any other mix, or a field that is only ever null, becomes json.
    pub fn infer(features: &[Feature]) -> Self {
        let mut seen: BTreeMap<&str, Option<FieldType>> = BTreeMap::new();
        for feature in features {
            for (name, value) in &feature.attributes {
                let slot = seen.entry(name.as_str()).or_insert(None);
                *slot = match (*slot, FieldType::of(value)) {
                    (Some(current), Some(next)) => Some(current.widen(next)),
                    (current, next) => current.or(next),
                };
            }
        }

        let fields = seen
            .into_iter()
            .map(|(name, field_type)| Field::new(name, field_type.unwrap_or(FieldType::Json)))
            .collect();
        Self { fields }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn push(&mut self, field: Field) {
        self.fields.push(field);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|field| field.name.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Feature {
    pub geometry: Geometry<f64>,
    pub attributes: Map<String, Value>,
}

/// A named relation's contents: schema plus records.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FeatureSet {
    pub schema: Schema,
    pub features: Vec<Feature>,
}

impl FeatureSet {
    pub fn len(&self) -> usize {
        self.features.len()
    }
}
