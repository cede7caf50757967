//! Selecting and performing the physical link operation for package files.

use std::{io::ErrorKind, path::Path};

use crate::config::TransactionConfig;

/// How a path is materialized in the target prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// Hard link from the package cache.
    Hardlink,
    /// Symbolic link to the package cache.
    Softlink,
    /// Plain copy.
    Copy,
    /// A directory, created rather than linked.
    Directory,
}

impl std::fmt::Display for LinkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkType::Hardlink => write!(f, "hardlink"),
            LinkType::Softlink => write!(f, "softlink"),
            LinkType::Copy => write!(f, "copy"),
            LinkType::Directory => write!(f, "directory"),
        }
    }
}

/// Chooses how files of a package are brought into the target prefix: hard
/// links when the cache and the prefix share a filesystem, soft links when
/// allowed and supported, a copy otherwise. Configuration can force either
/// copying or soft-linking.
pub fn determine_link_type(
    extracted_package_dir: &Path,
    target_prefix: &Path,
    config: &TransactionConfig,
) -> LinkType {
    if config.always_copy {
        return LinkType::Copy;
    }
    if config.always_softlink {
        return LinkType::Softlink;
    }
    let source_test_file = extracted_package_dir.join("info/index.json");
    if hardlink_supported(&source_test_file, target_prefix) {
        return LinkType::Hardlink;
    }
    if config.allow_softlinks && softlink_supported(target_prefix) {
        return LinkType::Softlink;
    }
    LinkType::Copy
}

/// Probes whether a file can be hard-linked into the target directory by
/// actually creating (and removing) one.
pub(crate) fn hardlink_supported(source_file: &Path, target_dir: &Path) -> bool {
    let probe = target_dir.join(format!(".hardlink_test_{}", uuid::Uuid::new_v4().simple()));
    match fs_err::hard_link(source_file, &probe) {
        Ok(()) => {
            if let Err(e) = fs_err::remove_file(&probe) {
                tracing::warn!("failed to remove probe file '{}': {e}", probe.display());
            }
            true
        }
        Err(e) => {
            tracing::debug!(
                "hard links from '{}' to '{}' are not supported: {e}",
                source_file.display(),
                target_dir.display()
            );
            false
        }
    }
}

/// Probes whether symbolic links can be created in the target directory.
pub(crate) fn softlink_supported(target_dir: &Path) -> bool {
    let probe = target_dir.join(format!(".softlink_test_{}", uuid::Uuid::new_v4().simple()));
    let result = symlink(Path::new("./"), &probe);
    match result {
        Ok(()) => {
            if let Err(e) = fs_err::remove_file(&probe) {
                tracing::warn!("failed to remove probe link '{}': {e}", probe.display());
            }
            true
        }
        Err(e) => {
            tracing::debug!(
                "symbolic links in '{}' are not supported: {e}",
                target_dir.display()
            );
            false
        }
    }
}

#[cfg(unix)]
fn symlink(original: &Path, link: &Path) -> std::io::Result<()> {
    fs_err::os::unix::fs::symlink(original, link)
}

#[cfg(windows)]
fn symlink(original: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(original, link)
}

/// Places `source` at `target` using the requested link type. A failing hard
/// link degrades to a copy, which keeps installations working across
/// filesystem boundaries the probe did not see.
pub(crate) fn link_file(
    source: &Path,
    target: &Path,
    link_type: LinkType,
) -> std::io::Result<()> {
    match link_type {
        LinkType::Hardlink => match fs_err::hard_link(source, target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(e),
            Err(e) => {
                tracing::warn!(
                    "failed to hardlink '{}' to '{}' ({e}), copying instead",
                    source.display(),
                    target.display()
                );
                fs_err::copy(source, target).map(|_| ())
            }
        },
        LinkType::Softlink => symlink(source, target),
        LinkType::Copy => fs_err::copy(source, target).map(|_| ()),
        LinkType::Directory => match fs_err::create_dir(target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_config;

    #[test]
    fn test_always_copy_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.always_copy = true;
        assert_eq!(
            determine_link_type(dir.path(), dir.path(), &config),
            LinkType::Copy
        );
    }

    #[test]
    fn test_hardlink_within_same_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let package_dir = dir.path().join("pkg");
        fs_err::create_dir_all(package_dir.join("info")).unwrap();
        fs_err::write(package_dir.join("info/index.json"), "{}").unwrap();
        let target = dir.path().join("env");
        fs_err::create_dir_all(&target).unwrap();

        let config = test_config(dir.path());
        assert_eq!(
            determine_link_type(&package_dir, &target, &config),
            LinkType::Hardlink
        );
    }

    #[test]
    fn test_link_file_copy() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.txt");
        fs_err::write(&source, "payload").unwrap();
        let target = dir.path().join("target.txt");
        link_file(&source, &target, LinkType::Copy).unwrap();
        assert_eq!(fs_err::read_to_string(&target).unwrap(), "payload");
    }
}
