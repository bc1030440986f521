//! Directory-backed feature stores.
//!
//! A store is a directory holding `manifest.json` plus one GeoJSON
//! FeatureCollection file per relation. The manifest records each relation's
//! schema, so a relation read back keeps its field order and types even when
//! every value of a field is null.

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::features::{FeatureSet, Schema};
use crate::utils::validate_relation_name;

pub mod geojson;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const LOCK_FILE: &str = ".lock";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path:?} is not a feature store")]
    NotAStore { path: PathBuf },

    #[error("{path:?} already exists")]
    AlreadyExists { path: PathBuf },

    #[error("invalid manifest in {path:?}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported store format version {found} in {path:?}")]
    UnsupportedVersion { path: PathBuf, found: u32 },

    #[error("relation '{name}' not found in {path:?}")]
    MissingRelation { path: PathBuf, name: String },

    #[error("invalid relation name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("store {path:?} is locked by another writer")]
    Locked { path: PathBuf },

    #[error("relation '{name}' already exists in {path:?}")]
    RelationExists { path: PathBuf, name: String },

    #[error("invalid GeoJSON in {path:?}: {message}")]
    GeoJson { path: PathBuf, message: String },

    #[error("store {path:?} has been destroyed")]
    Destroyed { path: PathBuf },
}

impl StoreError {
    pub fn io(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + use<> {
        let path = path.to_path_buf();
        move |source| StoreError::Io { path, source }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct RelationEntry {
    pub file: String,
    pub schema: Schema,
    pub feature_count: u64,
    pub written: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct Manifest {
    format_version: u32,
    created: String,
    #[serde(default)]
    relations: BTreeMap<String, RelationEntry>,
}

impl Manifest {
    fn new() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            created: timestamp(),
            relations: BTreeMap::new(),
        }
    }
}

fn timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Relation files alternate between two names so a rewrite never touches the
/// file the manifest currently points at.
fn relation_file(name: &str, current: Option<&str>) -> String {
    let primary = format!("{name}.geojson");
    if current == Some(primary.as_str()) {
        format!("{name}.next.geojson")
    } else {
        primary
    }
}

/// Removes a file, treating "already gone" as success.
fn remove_file_if_present(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(StoreError::io(path)(err)),
        _ => Ok(()),
    }
}

/// Exclusive OS file lock on `.lock`, held while a manifest update runs.
///
/// The kernel drops the lock when the handle closes or the process dies, so a
/// lock file left behind by a crashed writer does not block anyone.
struct StoreLock {
    _file: File,
}

impl StoreLock {
    fn acquire(root: &Path) -> Result<Self, StoreError> {
        let path = root.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(StoreError::io(&path))?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { _file: file }),
            Err(err) if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Err(StoreError::Locked {
                    path: root.to_path_buf(),
                })
            }
            Err(err) => Err(StoreError::io(&path)(err)),
        }
    }
}

pub struct FeatureStore {
    root: PathBuf,
    manifest: Manifest,
    destroyed: bool,
}

impl FeatureStore {
    pub fn is_store(path: &Path) -> bool {
        path.join(MANIFEST_FILE).is_file()
    }

    /// Creates a new, empty store. Fails if anything already exists at `path`.
    pub fn create(path: &Path) -> Result<Self, StoreError> {
        fs::create_dir(path).map_err(|err| {
            if err.kind() == ErrorKind::AlreadyExists {
                StoreError::AlreadyExists {
                    path: path.to_path_buf(),
                }
            } else {
                StoreError::io(path)(err)
            }
        })?;

        let store = Self {
            root: path.to_path_buf(),
            manifest: Manifest::new(),
            destroyed: false,
        };
        Self::write_manifest_to(&store.root, &store.manifest)?;
        Ok(store)
    }

    /// Opens the store at `path`, creating it first if nothing is there.
    ///
    /// Returns the store and whether this call created it. The new store is
    /// assembled in a sibling staging directory and renamed into place, so a
    /// concurrent creator either wins the rename or finds a complete store.
    /// An existing empty directory is adopted; any other non-store path is
    /// rejected.
    pub fn create_if_absent(path: &Path) -> Result<(Self, bool), StoreError> {
        if Self::is_store(path) {
            return Ok((Self::open(path)?, false));
        }

        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(StoreError::io(parent))?;

        let staging = tempfile::Builder::new()
            .prefix(".store-")
            .tempdir_in(parent)
            .map_err(StoreError::io(parent))?;
        Self::write_manifest_to(staging.path(), &Manifest::new())?;

        match fs::rename(staging.path(), path) {
            Ok(()) => {
                tracing::debug!("Store: created {:?}", path);
                Ok((Self::open(path)?, true))
            }
            Err(_) if Self::is_store(path) => {
                tracing::debug!("Store: {:?} appeared concurrently, opening it", path);
                Ok((Self::open(path)?, false))
            }
            Err(_) if path.exists() => Err(StoreError::NotAStore {
                path: path.to_path_buf(),
            }),
            Err(err) => Err(StoreError::io(path)(err)),
        }
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let manifest = Self::read_manifest(path)?;
        Ok(Self {
            root: path.to_path_buf(),
            manifest,
            destroyed: false,
        })
    }

    pub fn created(&self) -> &str {
        &self.manifest.created
    }

    pub fn relation(&self, name: &str) -> Option<&RelationEntry> {
        self.manifest.relations.get(name)
    }

    #[cfg(test)]
    pub fn relation_names(&self) -> impl Iterator<Item = &str> {
        self.manifest.relations.keys().map(String::as_str)
    }

    /// Writes `set` as relation `name`.
    ///
    /// An existing relation is replaced only when `replace` is set; the check
    /// runs under the store lock. The new contents go to a file the manifest
    /// does not reference yet, and the manifest switch is the commit point, so
    /// a failed write leaves the previous relation intact.
    pub fn write_relation(
        &mut self,
        name: &str,
        set: &FeatureSet,
        replace: bool,
    ) -> Result<RelationEntry, StoreError> {
        self.ensure_live()?;
        validate_relation_name(name)?;

        let _lock = StoreLock::acquire(&self.root)?;
        self.manifest = Self::read_manifest(&self.root)?;

        let previous = self.manifest.relations.get(name).map(|entry| entry.file.clone());
        if previous.is_some() && !replace {
            return Err(StoreError::RelationExists {
                path: self.root.clone(),
                name: name.to_string(),
            });
        }

        let file = relation_file(name, previous.as_deref());
        let target = self.root.join(&file);
        geojson::write_features(&target, &set.features)?;

        let entry = RelationEntry {
            file,
            schema: set.schema.clone(),
            feature_count: set.len() as u64,
            written: timestamp(),
        };
        let mut manifest = self.manifest.clone();
        manifest.relations.insert(name.to_string(), entry.clone());
        if let Err(err) = Self::write_manifest_to(&self.root, &manifest) {
            if let Err(cleanup) = remove_file_if_present(&target) {
                tracing::warn!("Store: {}", cleanup);
            }
            return Err(err);
        }
        self.manifest = manifest;

        if let Some(previous) = previous
            && let Err(err) = remove_file_if_present(&self.root.join(previous))
        {
            tracing::warn!("Store: stale relation file left behind: {}", err);
        }

        tracing::debug!(
            "Store: wrote relation '{}' ({} features) to {:?}",
            name,
            entry.feature_count,
            self.root
        );
        Ok(entry)
    }

    pub fn read_relation(&self, name: &str) -> Result<FeatureSet, StoreError> {
        self.ensure_live()?;
        let entry = self
            .manifest
            .relations
            .get(name)
            .ok_or_else(|| StoreError::MissingRelation {
                path: self.root.clone(),
                name: name.to_string(),
            })?;

        let features = geojson::read_features(&self.root.join(&entry.file))?;
        Ok(FeatureSet {
            schema: entry.schema.clone(),
            features,
        })
    }

    /// Deletes every file the store owns, then its directory.
    ///
    /// Entries that are already gone are skipped. Every removal is attempted
    /// even after a failure; the first failure is returned. Idempotent.
    pub fn destroy(&mut self) -> Result<(), StoreError> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;

        let mut targets: Vec<PathBuf> = self
            .manifest
            .relations
            .values()
            .map(|entry| self.root.join(&entry.file))
            .collect();
        targets.push(self.root.join(LOCK_FILE));
        targets.push(self.root.join(MANIFEST_FILE));
        self.manifest.relations.clear();

        let mut first_failure = None;
        for target in targets {
            if let Err(err) = remove_file_if_present(&target) {
                tracing::warn!("Store: {}", err);
                first_failure.get_or_insert(err);
            }
        }

        match fs::remove_dir(&self.root) {
            Err(err) if err.kind() != ErrorKind::NotFound => {
                let err = StoreError::io(&self.root)(err);
                tracing::warn!("Store: {}", err);
                first_failure.get_or_insert(err);
            }
            _ => {}
        }

        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn ensure_live(&self) -> Result<(), StoreError> {
        if self.destroyed {
            return Err(StoreError::Destroyed {
                path: self.root.clone(),
            });
        }
        Ok(())
    }

    fn read_manifest(root: &Path) -> Result<Manifest, StoreError> {
        let path = root.join(MANIFEST_FILE);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotAStore {
                    path: root.to_path_buf(),
                });
            }
            Err(err) => return Err(StoreError::io(&path)(err)),
        };

        let manifest: Manifest =
            serde_json::from_slice(&raw).map_err(|source| StoreError::Manifest {
                path: path.clone(),
                source,
            })?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(StoreError::UnsupportedVersion {
                path,
                found: manifest.format_version,
            });
        }
        Ok(manifest)
    }

    fn write_manifest_to(root: &Path, manifest: &Manifest) -> Result<(), StoreError> {
        let path = root.join(MANIFEST_FILE);
        let content = serde_json::to_vec_pretty(manifest).map_err(|source| StoreError::Manifest {
            path: path.clone(),
            source,
        })?;

        let mut file = NamedTempFile::new_in(root).map_err(StoreError::io(root))?;
        file.write_all(&content).map_err(StoreError::io(&path))?;
        file.persist(&path)
            .map_err(|err| StoreError::io(&path)(err.error))?;
        Ok(())
    }
}
