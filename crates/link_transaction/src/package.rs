//! Reading metadata out of an extracted package cache entry.
//!
//! An extracted package carries its metadata in `info/`: `index.json` with
//! identity, `paths.json` with the file manifest, and an optional `link.json`
//! with python entry points. `paths.json` may be absent for old archives, in
//! which case the plain `info/files` listing is used.

use std::{io::ErrorKind, path::{Path, PathBuf}};

use serde::{Deserialize, Serialize};

use crate::record::PackageRecord;

/// An error that occurred while reading package metadata from the cache.
#[derive(Debug, thiserror::Error)]
pub enum PackageReadError {
    /// The `info/index.json` file could not be read.
    #[error("failed to read 'info/index.json' from '{0}'")]
    FailedToReadIndexJson(PathBuf, #[source] std::io::Error),

    /// The `info/paths.json` file (or its `info/files` fallback) could not be
    /// read.
    #[error("failed to read the file manifest from '{0}'")]
    FailedToReadPathsJson(PathBuf, #[source] std::io::Error),

    /// The `info/link.json` file could not be read.
    #[error("failed to read 'info/link.json' from '{0}'")]
    FailedToReadLinkJson(PathBuf, #[source] std::io::Error),

    /// A metadata file did not parse.
    #[error("malformed package metadata in '{0}'")]
    MalformedMetadata(PathBuf, #[source] serde_json::Error),

    /// An entry point declaration did not parse.
    #[error("malformed entry point '{0}'")]
    MalformedEntryPoint(String),
}

/// How a file should be placed into the prefix, as recorded by the package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathType {
    /// A regular file, hard-linked when possible.
    HardLink,
    /// A file that must be placed as a symbolic link.
    SoftLink,
    /// An (empty) directory shipped by the package.
    Directory,
}

/// One entry in the package's file manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsEntry {
    /// Path of the file relative to the archive root.
    #[serde(rename = "_path")]
    pub relative_path: PathBuf,

    /// How the file should be materialized in the prefix.
    #[serde(default = "PathsEntry::default_path_type")]
    pub path_type: PathType,

    /// When set the file must never be linked, only copied.
    #[serde(default)]
    pub no_link: bool,
}

impl PathsEntry {
    fn default_path_type() -> PathType {
        PathType::HardLink
    }
}

/// The `info/paths.json` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsJson {
    /// All files in the package.
    pub paths: Vec<PathsEntry>,
}

/// The `info/index.json` document. Only the fields the engine consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct IndexJson {
    /// The package name.
    pub name: String,

    /// The noarch kind, `"python"` for noarch python packages.
    #[serde(default)]
    pub noarch: Option<String>,
}

/// Declares where generated python entry points should point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    /// The executable name to generate.
    pub command: String,

    /// The python module containing the function.
    pub module: String,

    /// The function invoked by the entry point.
    pub function: String,
}

impl EntryPoint {
    /// Parses the `command = module:function` form used in `link.json`.
    pub fn parse(declaration: &str) -> Result<Self, PackageReadError> {
        let malformed = || PackageReadError::MalformedEntryPoint(declaration.to_string());
        let (command, target) = declaration.split_once('=').ok_or_else(malformed)?;
        let (module, function) = target.split_once(':').ok_or_else(malformed)?;
        let entry_point = Self {
            command: command.trim().to_string(),
            module: module.trim().to_string(),
            function: function.trim().to_string(),
        };
        if entry_point.command.is_empty()
            || entry_point.module.is_empty()
            || entry_point.function.is_empty()
        {
            return Err(malformed());
        }
        Ok(entry_point)
    }
}

#[derive(Debug, Deserialize)]
struct LinkJson {
    #[serde(default)]
    noarch: Option<NoArchLinks>,
}

#[derive(Debug, Deserialize)]
struct NoArchLinks {
    #[serde(default)]
    entry_points: Vec<String>,
}

/// Everything the planner needs to know about a package that is about to be
/// linked.
#[derive(Debug, Clone)]
pub struct PackageInfo {
    /// The record this information belongs to.
    pub record: PackageRecord,

    /// Location of the extracted package in the cache.
    pub extracted_package_dir: PathBuf,

    /// The file manifest of the package.
    pub paths: Vec<PathsEntry>,

    /// Entry points declared by the package, if it is noarch python.
    pub entry_points: Vec<EntryPoint>,

    /// Whether the package is a noarch python package.
    pub noarch_python: bool,
}

impl PackageInfo {
    /// Manifest paths that are `Menu/*.json` shortcut declarations.
    pub fn menu_files(&self) -> impl Iterator<Item = &PathsEntry> {
        self.paths.iter().filter(|entry| {
            let path = &entry.relative_path;
            path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
                && path
                    .parent()
                    .and_then(Path::to_str)
                    .is_some_and(|parent| parent.eq_ignore_ascii_case("menu"))
        })
    }
}

/// Reads the metadata of an extracted cache entry for the given record.
pub fn read_package_info(
    record: &PackageRecord,
    extracted_package_dir: &Path,
) -> Result<PackageInfo, PackageReadError> {
    let index_json = read_index_json(extracted_package_dir)?;
    let paths = read_paths_with_fallback(extracted_package_dir)?;

    let noarch_python = index_json.noarch.as_deref() == Some("python") || record.noarch_python;
    let entry_points = if noarch_python {
        read_entry_points(extracted_package_dir)?
    } else {
        Vec::new()
    };

    Ok(PackageInfo {
        record: record.clone(),
        extracted_package_dir: extracted_package_dir.to_path_buf(),
        paths,
        entry_points,
        noarch_python,
    })
}

fn read_index_json(package_dir: &Path) -> Result<IndexJson, PackageReadError> {
    let path = package_dir.join("info/index.json");
    let contents = fs_err::read_to_string(&path)
        .map_err(|e| PackageReadError::FailedToReadIndexJson(package_dir.to_path_buf(), e))?;
    serde_json::from_str(&contents).map_err(|e| PackageReadError::MalformedMetadata(path, e))
}

/// Reads `info/paths.json`, falling back to the older `info/files` listing.
fn read_paths_with_fallback(package_dir: &Path) -> Result<Vec<PathsEntry>, PackageReadError> {
    let paths_json_path = package_dir.join("info/paths.json");
    match fs_err::read_to_string(&paths_json_path) {
        Ok(contents) => {
            let paths_json: PathsJson = serde_json::from_str(&contents)
                .map_err(|e| PackageReadError::MalformedMetadata(paths_json_path, e))?;
            Ok(paths_json.paths)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            let files_path = package_dir.join("info/files");
            let contents = fs_err::read_to_string(&files_path).map_err(|e| {
                PackageReadError::FailedToReadPathsJson(package_dir.to_path_buf(), e)
            })?;
            Ok(contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(|line| PathsEntry {
                    relative_path: PathBuf::from(line),
                    path_type: PathType::HardLink,
                    no_link: false,
                })
                .collect())
        }
        Err(e) => Err(PackageReadError::FailedToReadPathsJson(
            package_dir.to_path_buf(),
            e,
        )),
    }
}

fn read_entry_points(package_dir: &Path) -> Result<Vec<EntryPoint>, PackageReadError> {
    let path = package_dir.join("info/link.json");
    let contents = match fs_err::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(PackageReadError::FailedToReadLinkJson(
                package_dir.to_path_buf(),
                e,
            ))
        }
    };
    let link_json: LinkJson =
        serde_json::from_str(&contents).map_err(|e| PackageReadError::MalformedMetadata(path, e))?;
    link_json
        .noarch
        .map(|noarch| noarch.entry_points.iter().map(|s| EntryPoint::parse(s)).collect())
        .unwrap_or_else(|| Ok(Vec::new()))
}
