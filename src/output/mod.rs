//! Copying a staged join result into the persistent output store.

use std::path::{Path, PathBuf};

use crate::config::ConflictPolicy;
use crate::error::{OutputConflictError, OutputError, PipelineError};
use crate::features::Schema;
use crate::join::JoinResult;
use crate::mapping::FieldMapping;
use crate::storage::{FeatureStore, StoreError};
use crate::utils::validate_relation_name;

/// The durable artifact of a successful run.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputRelation {
    pub store: PathBuf,
    pub name: String,
    pub schema: Schema,
    pub feature_count: u64,
    pub store_created: bool,
    pub replaced: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct OutputMaterializer {
    policy: ConflictPolicy,
}

impl OutputMaterializer {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self { policy }
    }

    /// Creates `store` if needed, then copies `result` into it as `relation`
    /// with `mapping` applied.
    pub fn materialize(
        &self,
        result: &JoinResult<'_>,
        mapping: &FieldMapping,
        store: &Path,
        relation: &str,
    ) -> Result<OutputRelation, PipelineError> {
        let failed = |source| OutputError {
            store: store.to_path_buf(),
            relation: relation.to_string(),
            source,
        };
        let conflict = || OutputConflictError {
            store: store.to_path_buf(),
            relation: relation.to_string(),
        };
        let replace = self.policy == ConflictPolicy::Overwrite;

        validate_relation_name(relation).map_err(failed)?;

        let (mut output, store_created) = FeatureStore::create_if_absent(store).map_err(failed)?;
        if store_created {
            tracing::info!("Output: created store {:?}", store);
        } else {
            tracing::debug!("Output: using store {:?} created {}", store, output.created());
        }

        let existing = output.relation(relation).map(|entry| entry.feature_count);
        let replaced = existing.is_some();
        if let Some(previous) = existing {
            match self.policy {
                ConflictPolicy::Fail => return Err(conflict().into()),
                ConflictPolicy::Overwrite => {
                    tracing::warn!(
                        "Output: replacing existing relation '{}' ({} features) in {:?}",
                        relation,
                        previous,
                        store
                    );
                }
            }
        }

        let staged = result.load().map_err(failed)?;
        let mapped = mapping.apply_set(&staged);
        // Checked again under the store lock in case another writer got there
        // first.
        let entry = match output.write_relation(relation, &mapped, replace) {
            Ok(entry) => entry,
            Err(StoreError::RelationExists { .. }) => return Err(conflict().into()),
            Err(err) => return Err(failed(err).into()),
        };

        tracing::info!(
            "Output: wrote {} features to '{}' in {:?}",
            entry.feature_count,
            relation,
            store
        );
        Ok(OutputRelation {
            store: store.to_path_buf(),
            name: relation.to_string(),
            schema: entry.schema,
            feature_count: entry.feature_count,
            store_created,
            replaced,
        })
    }
}
