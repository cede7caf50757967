//! Seams to the download/extract machinery.
//!
//! Fetching archives and materializing them into the content-addressed
//! package cache is not this crate's job. The engine only needs two
//! capabilities: drive a [`Fetcher`] to completion before anything is linked,
//! and resolve a record to its extracted cache entry through a
//! [`PackageCache`]. A directory-backed implementation is provided for hosts
//! that manage the cache themselves (and for tests).

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use url::Url;

use crate::record::PackageRecord;

/// An error raised while materializing packages into the cache.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// A package that must be linked has no extracted cache entry and the
    /// fetcher has no way to produce one.
    #[error("no extracted package cache entry for '{0}'")]
    MissingCacheEntry(String),

    /// The underlying transport failed.
    #[error("failed to fetch '{0}'")]
    FetchFailed(String, #[source] std::io::Error),
}

/// Drives download and extraction of the packages a transaction will link.
///
/// `execute` must be idempotent; the engine calls it lazily from several
/// phases and relies on completed work not being redone.
pub trait Fetcher {
    /// Computes which packages actually need to be downloaded. Idempotent;
    /// used for reporting before anything is executed.
    fn prepare(&mut self) -> Result<(), FetchError>;

    /// Downloads and extracts everything that is missing from the cache.
    fn execute(&mut self) -> Result<(), FetchError>;

    /// Whether `execute` already ran to completion.
    fn executed(&self) -> bool;

    /// The urls of the packages `execute` will (or did) download, i.e. those
    /// that were not already cached.
    fn download_urls(&self) -> HashSet<Url>;
}

/// Resolves records to their extracted entries in the package cache.
pub trait PackageCache {
    /// Returns the extracted directory for the record, if present.
    fn entry_to_link(&self, record: &PackageRecord) -> Option<PathBuf>;
}

/// A package cache rooted in a directory, with one extracted entry per
/// `name-version-build` subdirectory.
#[derive(Debug, Clone)]
pub struct DirectoryCache {
    root: PathBuf,
}

impl DirectoryCache {
    /// A cache rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory of the cache.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl PackageCache for DirectoryCache {
    fn entry_to_link(&self, record: &PackageRecord) -> Option<PathBuf> {
        let entry = self.root.join(record.cache_entry_name());
        entry.is_dir().then_some(entry)
    }
}

/// A fetcher over an already-populated [`DirectoryCache`]. It cannot
/// download; every link prec must be extracted up front, and `prepare`
/// reports the ones that are not.
pub struct CachedFetcher {
    cache: DirectoryCache,
    link_precs: Vec<PackageRecord>,
    missing: Vec<PackageRecord>,
    prepared: bool,
    executed: bool,
}

impl CachedFetcher {
    /// A fetcher serving `link_precs` out of `cache`.
    pub fn new(cache: DirectoryCache, link_precs: Vec<PackageRecord>) -> Self {
        Self {
            cache,
            link_precs,
            missing: Vec::new(),
            prepared: false,
            executed: false,
        }
    }
}

impl Fetcher for CachedFetcher {
    fn prepare(&mut self) -> Result<(), FetchError> {
        if self.prepared {
            return Ok(());
        }
        self.missing = self
            .link_precs
            .iter()
            .filter(|prec| self.cache.entry_to_link(prec).is_none())
            .cloned()
            .collect();
        self.prepared = true;
        Ok(())
    }

    fn execute(&mut self) -> Result<(), FetchError> {
        if self.executed {
            return Ok(());
        }
        self.prepare()?;
        if let Some(missing) = self.missing.first() {
            return Err(FetchError::MissingCacheEntry(missing.dist_str()));
        }
        self.executed = true;
        Ok(())
    }

    fn executed(&self) -> bool {
        self.executed
    }

    fn download_urls(&self) -> HashSet<Url> {
        self.missing
            .iter()
            .filter_map(|prec| prec.url.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::test_utils::{record, write_package};

    #[test]
    fn test_directory_cache_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let prec = record("foo", "1.0", "0");
        let entry = write_package(dir.path(), &prec, &["bin/foo"]);

        let cache = DirectoryCache::new(dir.path());
        assert_eq!(cache.entry_to_link(&prec), Some(entry));
        assert_eq!(cache.entry_to_link(&record("bar", "1.0", "0")), None);
    }

    #[test]
    fn test_cached_fetcher_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let prec = record("foo", "1.0", "0");
        write_package(dir.path(), &prec, &["bin/foo"]);

        let mut fetcher = CachedFetcher::new(DirectoryCache::new(dir.path()), vec![prec]);
        assert!(!fetcher.executed());
        fetcher.execute().unwrap();
        assert!(fetcher.executed());
        fetcher.execute().unwrap();
        assert!(fetcher.download_urls().is_empty());
    }

    #[test]
    fn test_cached_fetcher_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let mut fetcher = CachedFetcher::new(
            DirectoryCache::new(dir.path()),
            vec![record("absent", "1.0", "0")],
        );
        assert_matches!(fetcher.execute(), Err(FetchError::MissingCacheEntry(_)));
        assert_eq!(fetcher.download_urls().len(), 1);
    }
}
