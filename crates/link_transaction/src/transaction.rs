//! The transaction façade tying planning, verification and execution
//! together.
//!
//! A transaction is constructed from one setup per prefix and then driven
//! through `download_and_extract → prepare → verify → execute`. Each phase is
//! idempotent: re-entering a completed phase is a no-op, and later phases
//! pull in earlier ones on demand. The per-prefix scratch directories are
//! removed on every exit path out of `execute`, and after a failed `verify`.

use std::{
    fmt::{Display, Formatter},
    path::PathBuf,
};

use indexmap::IndexMap;

use crate::{
    change_report::ChangeReport,
    config::{SafetyChecks, TransactionConfig},
    driver::{SignalGuard, TransactionDriver},
    execute::{ExecuteError, Executor},
    fetch::{FetchError, Fetcher, PackageCache},
    planner::{PlanError, Planner, PrefixActionGroup},
    prefix_data::is_conda_environment,
    record::{PrefixSetup, TransactionContext},
    verify::{apply_safety_policy, VerificationError, Verifier},
};

/// The collected verification failures of a transaction.
#[derive(Debug)]
pub struct VerificationReport {
    /// Every error that survived the safety policy.
    pub errors: Vec<VerificationError>,
}

impl Display for VerificationReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "transaction verification failed with {} error(s):",
            self.errors.len()
        )?;
        for error in &self.errors {
            writeln!(f, "  - {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for VerificationReport {}

/// Any error a transaction can surface.
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    /// Planning failed.
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// Fetching or extracting packages failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Verification failed.
    #[error(transparent)]
    Verification(#[from] VerificationReport),

    /// Execution failed; the prefixes were rolled back on a best-effort
    /// basis when rollback is enabled.
    #[error(transparent)]
    Execute(#[from] ExecuteError),
}

/// Atomically removes a set of packages from and installs another set into
/// one or more prefixes.
pub struct UnlinkLinkTransaction {
    config: TransactionConfig,
    setups: IndexMap<PathBuf, PrefixSetup>,
    fetcher: Box<dyn Fetcher>,
    cache: Box<dyn PackageCache>,
    driver: TransactionDriver,
    contexts: IndexMap<PathBuf, TransactionContext>,
    action_groups: IndexMap<PathBuf, PrefixActionGroup>,
    prepared: bool,
    verified: bool,
    executed: bool,
}

impl UnlinkLinkTransaction {
    /// A transaction over the given setups, one per prefix.
    pub fn new(
        config: TransactionConfig,
        setups: impl IntoIterator<Item = PrefixSetup>,
        fetcher: Box<dyn Fetcher>,
        cache: Box<dyn PackageCache>,
    ) -> Self {
        let setups: IndexMap<PathBuf, PrefixSetup> = setups
            .into_iter()
            .map(|setup| (setup.target_prefix.clone(), setup))
            .collect();

        for setup in setups.values() {
            tracing::info!(
                "initializing transaction\n  target_prefix: {}\n  unlink_precs:\n    {}\n  link_precs:\n    {}",
                setup.target_prefix.display(),
                setup
                    .unlink_precs
                    .iter()
                    .map(|prec| prec.dist_str())
                    .collect::<Vec<_>>()
                    .join("\n    "),
                setup
                    .link_precs
                    .iter()
                    .map(|prec| prec.dist_str())
                    .collect::<Vec<_>>()
                    .join("\n    "),
            );
        }

        let driver = TransactionDriver::new(&config);
        Self {
            config,
            setups,
            fetcher,
            cache,
            driver,
            contexts: IndexMap::new(),
            action_groups: IndexMap::new(),
            prepared: false,
            verified: false,
            executed: false,
        }
    }

    /// True when no prefix has anything to unlink or link and every target
    /// already is a managed environment.
    pub fn nothing_to_do(&self) -> bool {
        self.setups
            .values()
            .all(|setup| setup.unlink_precs.is_empty() && setup.link_precs.is_empty())
            && self
                .setups
                .keys()
                .all(|prefix| is_conda_environment(prefix))
    }

    /// Materializes every link package into the cache. Idempotent.
    pub fn download_and_extract(&mut self) -> Result<(), TransactionError> {
        if !self.fetcher.executed() {
            self.fetcher.execute()?;
        }
        Ok(())
    }

    /// Plans action groups for every prefix. Idempotent.
    pub fn prepare(&mut self) -> Result<(), TransactionError> {
        self.download_and_extract()?;
        if self.prepared {
            return Ok(());
        }
        tracing::info!("preparing transaction");

        let planner = Planner::new(&self.config, self.cache.as_ref());
        for setup in self.setups.values() {
            let mut context = TransactionContext::new(&setup.target_prefix);
            let groups = planner.plan(&mut context, setup)?;
            self.contexts.insert(setup.target_prefix.clone(), context);
            self.action_groups
                .insert(setup.target_prefix.clone(), groups);
        }

        self.prepared = true;
        Ok(())
    }

    /// Runs the pre-flight checks. Idempotent; must not be reached for a
    /// dry-run transaction.
    pub fn verify(&mut self) -> Result<(), TransactionError> {
        if !self.prepared {
            self.prepare()?;
        }
        assert!(
            !self.config.dry_run,
            "a dry-run transaction must never be verified or executed"
        );
        if self.verified {
            return Ok(());
        }

        if self.config.safety_checks == SafetyChecks::Disabled {
            self.verified = true;
            return Ok(());
        }

        tracing::info!("verifying transaction");
        let errors = Verifier::new(&self.config).verify(&self.setups, &mut self.action_groups);
        let errors = apply_safety_policy(errors, &self.config);
        if !errors.is_empty() {
            self.remove_temp_dirs();
            return Err(VerificationReport { errors }.into());
        }

        self.verified = true;
        Ok(())
    }

    /// Executes the transaction. Idempotent; pulls in the earlier phases on
    /// demand. The scratch directories are removed on every exit path.
    pub fn execute(&mut self) -> Result<(), TransactionError> {
        if !self.verified {
            self.verify()?;
        }
        assert!(
            !self.config.dry_run,
            "a dry-run transaction must never be executed"
        );
        if self.executed {
            return Ok(());
        }

        tracing::info!("executing transaction");
        let result = {
            let _temp_dirs = TempDirGuard {
                contexts: &self.contexts,
            };
            let _interrupts = SignalGuard::install(self.driver.cancel_flag());
            let executor = Executor::new(&self.config, &self.driver);
            executor.execute(&mut self.action_groups)
        };

        result?;
        self.executed = true;
        Ok(())
    }

    /// Prints the human-readable package plan for every prefix, whether or
    /// not the transaction will be executed.
    pub fn print_transaction_summary(&mut self) -> Result<(), TransactionError> {
        self.fetcher.prepare()?;
        let download_urls = self.fetcher.download_urls();

        for setup in self.setups.values() {
            let report = ChangeReport::compute(
                &setup.target_prefix,
                &setup.unlink_precs,
                &setup.link_precs,
                &download_urls,
                &setup
                    .remove_specs
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>(),
                &setup
                    .update_specs
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>(),
            );
            let rendered = report.render(&self.config);
            if self.config.json {
                eprintln!("{rendered}");
            } else {
                println!("{rendered}");
            }
        }
        Ok(())
    }

    fn remove_temp_dirs(&self) {
        remove_temp_dirs(&self.contexts);
    }
}

fn remove_temp_dirs(contexts: &IndexMap<PathBuf, TransactionContext>) {
    for context in contexts.values() {
        match fs_err::remove_dir_all(&context.temp_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                "failed to remove scratch directory '{}': {e}",
                context.temp_dir.display()
            ),
        }
    }
}

/// Removes every prefix's scratch directory when dropped, which covers all
/// exit paths out of `execute`, rollback and panics included.
struct TempDirGuard<'a> {
    contexts: &'a IndexMap<PathBuf, TransactionContext>,
}

impl Drop for TempDirGuard<'_> {
    fn drop(&mut self) {
        remove_temp_dirs(self.contexts);
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        fetch::{CachedFetcher, DirectoryCache},
        record::PackageRecord,
        test_utils::{install_into_prefix, record, snapshot_files, test_config, write_package},
    };

    fn transaction_for(
        config: &TransactionConfig,
        cache_dir: &Path,
        prefix: &Path,
        unlink: Vec<PackageRecord>,
        link: Vec<PackageRecord>,
    ) -> UnlinkLinkTransaction {
        let setup = PrefixSetup {
            target_prefix: prefix.to_path_buf(),
            unlink_precs: unlink,
            link_precs: link.clone(),
            remove_specs: Vec::new(),
            update_specs: Vec::new(),
        };
        UnlinkLinkTransaction::new(
            config.clone(),
            [setup],
            Box::new(CachedFetcher::new(DirectoryCache::new(cache_dir), link)),
            Box::new(DirectoryCache::new(cache_dir)),
        )
    }

    #[test]
    fn test_full_pipeline() {
        let root = tempfile::tempdir().unwrap();
        let cache_dir = root.path().join("cache");
        let prefix = root.path().join("envs/test");

        let prec = record("tool", "1.0", "0");
        write_package(&cache_dir, &prec, &["bin/tool"]);

        let config = test_config(root.path());
        let mut transaction =
            transaction_for(&config, &cache_dir, &prefix, Vec::new(), vec![prec]);
        assert!(!transaction.nothing_to_do());

        transaction.print_transaction_summary().unwrap();
        transaction.execute().unwrap();

        assert!(prefix.join("bin/tool").is_file());
        assert!(prefix.join("conda-meta/tool-1.0-0.json").is_file());
        assert!(prefix.join("conda-meta/history").is_file());
        assert!(!prefix.join(".condatmp").exists());

        // Re-entering any phase after completion is a no-op.
        transaction.prepare().unwrap();
        transaction.verify().unwrap();
        transaction.execute().unwrap();
        assert!(prefix.join("bin/tool").is_file());
    }

    #[test]
    fn test_nothing_to_do() {
        let root = tempfile::tempdir().unwrap();
        let cache_dir = root.path().join("cache");
        let prefix = root.path().join("envs/empty");
        fs_err::create_dir_all(prefix.join("conda-meta")).unwrap();
        fs_err::write(prefix.join("conda-meta/history"), "").unwrap();

        let config = test_config(root.path());
        let transaction =
            transaction_for(&config, &cache_dir, &prefix, Vec::new(), Vec::new());
        assert!(transaction.nothing_to_do());

        // A prefix that is not an environment yet means there is work to do.
        let other = root.path().join("envs/new");
        let transaction =
            transaction_for(&config, &cache_dir, &other, Vec::new(), Vec::new());
        assert!(!transaction.nothing_to_do());
    }

    #[test]
    #[should_panic(expected = "dry-run")]
    fn test_dry_run_execute_is_forbidden() {
        let root = tempfile::tempdir().unwrap();
        let cache_dir = root.path().join("cache");
        let prefix = root.path().join("envs/test");
        let prec = record("tool", "1.0", "0");
        write_package(&cache_dir, &prec, &["bin/tool"]);

        let mut config = test_config(root.path());
        config.dry_run = true;
        let mut transaction =
            transaction_for(&config, &cache_dir, &prefix, Vec::new(), vec![prec]);
        let _ = transaction.execute();
    }

    #[test]
    fn test_verification_failure_removes_scratch() {
        let root = tempfile::tempdir().unwrap();
        let cache_dir = root.path().join("cache");
        let prefix = root.path().join("envs/test");

        // An untracked file already owns the path the package wants.
        fs_err::create_dir_all(prefix.join("bin")).unwrap();
        fs_err::write(prefix.join("bin/tool"), "stray").unwrap();
        let prec = record("tool", "1.0", "0");
        write_package(&cache_dir, &prec, &["bin/tool"]);

        let config = test_config(root.path());
        let mut transaction =
            transaction_for(&config, &cache_dir, &prefix, Vec::new(), vec![prec]);
        let error = transaction.execute().unwrap_err();
        assert_matches!(error, TransactionError::Verification(_));
        assert!(!prefix.join(".condatmp").exists());
        // Nothing was linked.
        assert_eq!(fs_err::read_to_string(prefix.join("bin/tool")).unwrap(), "stray");
    }

    #[test]
    fn test_transaction_roundtrip_restores_prefix() {
        let root = tempfile::tempdir().unwrap();
        let cache_dir = root.path().join("cache");
        let prefix = root.path().join("envs/test");

        let base = record("base", "1.0", "0");
        install_into_prefix(&prefix, &base, &["share/base.txt"]);
        let a = record("pkg-a", "1.0", "0");
        write_package(&cache_dir, &a, &["bin/a", "lib/a/a.so"]);
        let b = record("pkg-b", "2.0", "0");
        write_package(&cache_dir, &b, &["bin/b"]);

        let config = test_config(root.path());
        let before: Vec<_> = snapshot_files(&prefix)
            .into_iter()
            .filter(|path| path != Path::new("conda-meta/history"))
            .collect();

        // T: link a and b.
        let mut transaction = transaction_for(
            &config,
            &cache_dir,
            &prefix,
            Vec::new(),
            vec![a.clone(), b.clone()],
        );
        transaction.execute().unwrap();
        assert!(prefix.join("bin/a").is_file());
        assert!(prefix.join("bin/b").is_file());

        // T⁻¹: swap link and unlink.
        let mut inverse =
            transaction_for(&config, &cache_dir, &prefix, vec![a, b], Vec::new());
        inverse.execute().unwrap();

        let after: Vec<_> = snapshot_files(&prefix)
            .into_iter()
            .filter(|path| path != Path::new("conda-meta/history"))
            .collect();
        assert_eq!(before, after);
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_execute_rolls_back_and_removes_scratch() {
        let root = tempfile::tempdir().unwrap();
        let cache_dir = root.path().join("cache");
        let prefix = root.path().join("envs/test");

        let old = record("old", "1.0", "0");
        install_into_prefix(&prefix, &old, &["share/old.txt"]);

        let bad = record("pkg-b", "1.0", "0");
        let bad_dir = write_package(&cache_dir, &bad, &["share/b.txt", "bin/.pkg-b-post-link.sh"]);
        fs_err::write(bad_dir.join("bin/.pkg-b-post-link.sh"), "#!/bin/sh\nexit 1\n").unwrap();

        let mut config = test_config(root.path());
        config.execute_link_scripts = true;
        let before: Vec<_> = snapshot_files(&prefix)
            .into_iter()
            .filter(|path| path != Path::new("conda-meta/history"))
            .collect();

        let mut transaction =
            transaction_for(&config, &cache_dir, &prefix, vec![old], vec![bad]);
        let error = transaction.execute().unwrap_err();
        assert_matches!(error, TransactionError::Execute(_));

        // The unlinked package is back, the failed one is gone, scratch is
        // removed.
        let after: Vec<_> = snapshot_files(&prefix)
            .into_iter()
            .filter(|path| path != Path::new("conda-meta/history"))
            .collect();
        assert_eq!(before, after);
        assert!(!prefix.join(".condatmp").exists());
    }
}
