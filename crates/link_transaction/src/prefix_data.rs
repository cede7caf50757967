//! Reading the installed-package metadata of a prefix.
//!
//! Every installed package leaves a `conda-meta/<dist>.json` document in its
//! prefix. During a transaction this store is read many times (planning,
//! verification) and treated as read-mostly; all writes happen through the
//! record actions in the record phase.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;

use crate::record::PrefixRecord;

/// The file whose presence marks a directory as a managed environment, and
/// whose writability stands in for the writability of the whole prefix.
pub const PREFIX_MAGIC_FILE: &str = "conda-meta/history";

/// An error raised while reading a prefix's installed-package metadata.
#[derive(Debug, thiserror::Error)]
pub enum PrefixDataError {
    /// The `conda-meta` directory could not be enumerated.
    #[error("failed to read 'conda-meta' in '{0}'")]
    FailedToReadCondaMeta(PathBuf, #[source] std::io::Error),

    /// A record document could not be read.
    #[error("failed to read prefix record '{0}'")]
    FailedToReadRecord(PathBuf, #[source] std::io::Error),

    /// A record document did not parse.
    #[error("malformed prefix record '{0}'")]
    MalformedRecord(PathBuf, #[source] serde_json::Error),
}

/// The installed packages of one prefix, keyed by normalized package name.
#[derive(Debug, Clone)]
pub struct PrefixData {
    prefix_path: PathBuf,
    records: IndexMap<String, PrefixRecord>,
}

impl PrefixData {
    /// Loads all records from `<prefix>/conda-meta/*.json`. A missing
    /// `conda-meta` directory yields an empty store.
    pub fn from_prefix(prefix_path: impl Into<PathBuf>) -> Result<Self, PrefixDataError> {
        let prefix_path = prefix_path.into();
        let conda_meta = prefix_path.join("conda-meta");

        let mut records = IndexMap::new();
        let entries = match std::fs::read_dir(&conda_meta) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(Self {
                    prefix_path,
                    records,
                })
            }
            Err(e) => return Err(PrefixDataError::FailedToReadCondaMeta(conda_meta, e)),
        };

        for entry in entries {
            let entry =
                entry.map_err(|e| PrefixDataError::FailedToReadCondaMeta(conda_meta.clone(), e))?;
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let contents = fs_err::read_to_string(&path)
                .map_err(|e| PrefixDataError::FailedToReadRecord(path.clone(), e))?;
            let record: PrefixRecord = serde_json::from_str(&contents)
                .map_err(|e| PrefixDataError::MalformedRecord(path.clone(), e))?;
            records.insert(record.record.name.as_normalized().to_string(), record);
        }
        records.sort_keys();

        Ok(Self {
            prefix_path,
            records,
        })
    }

    /// The prefix this store was loaded from.
    pub fn prefix_path(&self) -> &Path {
        &self.prefix_path
    }

    /// Looks up the installed record of a package by name.
    pub fn get(&self, name: &str) -> Option<&PrefixRecord> {
        self.records.get(&name.to_ascii_lowercase())
    }

    /// Iterates over all installed records in name order.
    pub fn iter_records(&self) -> impl Iterator<Item = &PrefixRecord> {
        self.records.values()
    }

    /// The `major.minor` of the python installed in this prefix, if any.
    pub fn python_short_version(&self) -> Option<(u64, u64)> {
        self.get("python")
            .and_then(|record| record.record.version.version().as_major_minor())
    }
}

/// Whether a directory is (or was) a managed environment.
pub fn is_conda_environment(prefix_path: &Path) -> bool {
    prefix_path.join(PREFIX_MAGIC_FILE).is_file()
}
