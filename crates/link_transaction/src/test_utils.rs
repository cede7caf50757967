//! Shared helpers for the tests in this crate: building records, laying out
//! extracted cache entries and pre-populating prefixes.

use std::path::{Path, PathBuf};

use rattler_conda_types::PackageName;

use crate::{
    config::TransactionConfig,
    package::{PathType, PathsEntry, PathsJson},
    record::{Channel, PackageRecord, PrefixRecord},
};

pub(crate) fn record(name: &str, version: &str, build: &str) -> PackageRecord {
    PackageRecord {
        name: PackageName::new_unchecked(name),
        version: version.parse().unwrap(),
        build: build.to_string(),
        build_number: build
            .rsplit('_')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0),
        channel: Channel::named("test-channel"),
        subdir: "linux-64".to_string(),
        url: Some(
            format!("https://example.com/test-channel/linux-64/{name}-{version}-{build}.conda")
                .parse()
                .unwrap(),
        ),
        depends: Vec::new(),
        size: Some(1024),
        noarch_python: false,
    }
}

pub(crate) fn noarch_record(name: &str, version: &str, build: &str) -> PackageRecord {
    PackageRecord {
        noarch_python: true,
        subdir: "noarch".to_string(),
        ..record(name, version, build)
    }
}

/// A configuration rooted in a temporary directory with link scripts off,
/// which is what most tests want.
pub(crate) fn test_config(root_prefix: &Path) -> TransactionConfig {
    TransactionConfig {
        execute_link_scripts: false,
        ..TransactionConfig::new(root_prefix)
    }
}

/// Writes an extracted cache entry for `prec` containing `files` and returns
/// the entry directory.
pub(crate) fn write_package(cache_root: &Path, prec: &PackageRecord, files: &[&str]) -> PathBuf {
    write_package_with(cache_root, prec, files, &[], None)
}

/// Writes an extracted cache entry with full control over entry points and
/// the noarch marker.
pub(crate) fn write_package_with(
    cache_root: &Path,
    prec: &PackageRecord,
    files: &[&str],
    entry_points: &[&str],
    noarch: Option<&str>,
) -> PathBuf {
    let package_dir = cache_root.join(prec.cache_entry_name());
    fs_err::create_dir_all(package_dir.join("info")).unwrap();

    let noarch_field = noarch
        .map(|kind| format!(r#", "noarch": "{kind}""#))
        .unwrap_or_default();
    fs_err::write(
        package_dir.join("info/index.json"),
        format!(
            r#"{{"name": "{}", "version": "{}", "build": "{}"{}}}"#,
            prec.name.as_normalized(),
            prec.version,
            prec.build,
            noarch_field
        ),
    )
    .unwrap();

    let paths_json = PathsJson {
        paths: files
            .iter()
            .map(|file| PathsEntry {
                relative_path: PathBuf::from(file),
                path_type: PathType::HardLink,
                no_link: false,
            })
            .collect(),
    };
    fs_err::write(
        package_dir.join("info/paths.json"),
        serde_json::to_string_pretty(&paths_json).unwrap(),
    )
    .unwrap();

    if !entry_points.is_empty() {
        let declarations: Vec<String> = entry_points.iter().map(|ep| format!("\"{ep}\"")).collect();
        fs_err::write(
            package_dir.join("info/link.json"),
            format!(
                r#"{{"noarch": {{"type": "python", "entry_points": [{}]}}}}"#,
                declarations.join(", ")
            ),
        )
        .unwrap();
    }

    for file in files {
        let full_path = package_dir.join(file);
        fs_err::create_dir_all(full_path.parent().unwrap()).unwrap();
        fs_err::write(&full_path, format!("content of {file}\n")).unwrap();
    }

    package_dir
}

/// Materializes an installed package in a prefix: its files plus the
/// `conda-meta/<dist>.json` record. Returns the written record.
pub(crate) fn install_into_prefix(
    prefix: &Path,
    prec: &PackageRecord,
    files: &[&str],
) -> PrefixRecord {
    for file in files {
        let full_path = prefix.join(file);
        fs_err::create_dir_all(full_path.parent().unwrap()).unwrap();
        fs_err::write(&full_path, format!("content of {file}\n")).unwrap();
    }

    let prefix_record = PrefixRecord {
        record: prec.clone(),
        files: files.iter().map(PathBuf::from).collect(),
        requested_spec: None,
    };
    let conda_meta = prefix.join("conda-meta");
    fs_err::create_dir_all(&conda_meta).unwrap();
    fs_err::write(
        conda_meta.join(prefix_record.file_name()),
        serde_json::to_string_pretty(&prefix_record).unwrap(),
    )
    .unwrap();
    prefix_record
}

/// Lists every file (not directory) under `root`, relative to it, sorted.
pub(crate) fn snapshot_files(root: &Path) -> Vec<PathBuf> {
    fn walk(dir: &Path, root: &Path, out: &mut Vec<PathBuf>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(&path, root, out);
            } else {
                out.push(path.strip_prefix(root).unwrap().to_path_buf());
            }
        }
    }
    let mut out = Vec::new();
    walk(root, root, &mut out);
    out.sort();
    out
}
