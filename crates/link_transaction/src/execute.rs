//! Executing a planned and verified transaction.
//!
//! The executor walks the interleaved action groups of all prefixes in two
//! phases: unlink (pre-unlink scripts, unlink groups in parallel, post-unlink
//! scripts, unregister) then link (pre-link scripts, link groups in parallel,
//! post-link scripts, entry points/byte-compilation/records in parallel,
//! register). Scripts always run serially in group-emission order.
//!
//! Any failure stops at the phase boundary, and, when rollback is enabled,
//! every group that was touched is reversed in the opposite order. Errors
//! raised while rolling back are collected but never stop the rollback.

use std::fmt::{Display, Formatter};

use indexmap::IndexMap;
use std::path::PathBuf;

use crate::{
    action::{Action, ActionError, CompileMultiPycAction},
    config::TransactionConfig,
    driver::TransactionDriver,
    link_script::{LinkScriptError, ScriptPhase, ScriptRunner},
    planner::{ActionGroup, GroupKind, GroupState, PrefixActionGroup},
};

/// What brought a group down.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteFailureKind {
    /// An action raised during `execute`.
    #[error(transparent)]
    Action(#[from] ActionError),

    /// A link-side script failed.
    #[error(transparent)]
    Script(#[from] LinkScriptError),

    /// The transaction was interrupted.
    #[error("the transaction was cancelled")]
    Cancelled,
}

/// One failed group, with the errors of its own (local) reversal.
#[derive(Debug)]
pub struct GroupFailure {
    /// Which group failed, e.g. `link test-channel::foo-1.0-0`.
    pub group_label: String,
    /// The primary error.
    pub error: ExecuteFailureKind,
    /// Errors raised while reversing the failed group itself.
    pub reverse_errors: Vec<ActionError>,
}

/// The aggregate error of a failed execution: the first failure, any further
/// failures from the same phase, and everything that went wrong while rolling
/// back.
#[derive(Debug)]
pub struct ExecuteError {
    /// The first failure observed.
    pub failure: GroupFailure,
    /// Failures of other groups in the same phase.
    pub additional_failures: Vec<GroupFailure>,
    /// Errors raised during transaction-wide rollback.
    pub rollback_errors: Vec<ActionError>,
}

impl Display for ExecuteError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "transaction failed in group '{}': {}",
            self.failure.group_label, self.failure.error
        )?;
        if !self.additional_failures.is_empty() {
            write!(f, " (+{} more failures)", self.additional_failures.len())?;
        }
        if !self.rollback_errors.is_empty() {
            write!(f, "; {} rollback error(s)", self.rollback_errors.len())?;
        }
        Ok(())
    }
}

impl std::error::Error for ExecuteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.failure.error)
    }
}

/// Runs the action groups of a transaction with bounded parallelism.
pub struct Executor<'a> {
    config: &'a TransactionConfig,
    driver: &'a TransactionDriver,
}

impl<'a> Executor<'a> {
    /// An executor using the given configuration and driver.
    pub fn new(config: &'a TransactionConfig, driver: &'a TransactionDriver) -> Self {
        Self { config, driver }
    }

    /// Executes every prefix's groups. On failure the already-touched groups
    /// are rolled back (when enabled) and the aggregate error is returned.
    pub fn execute(
        &self,
        prefix_groups: &mut IndexMap<PathBuf, PrefixActionGroup>,
    ) -> Result<(), ExecuteError> {
        // The canonical interleaved sequence over all prefixes. Rollback
        // traverses it in reverse.
        let mut all: Vec<&mut ActionGroup> = Vec::new();
        for prefix_group in prefix_groups.values_mut() {
            let PrefixActionGroup {
                unlink_action_groups,
                unregister_action_groups,
                link_action_groups,
                register_action_groups,
                compile_action_groups,
                entry_point_action_groups,
                prefix_record_groups,
            } = prefix_group;
            all.extend(unlink_action_groups.iter_mut());
            all.extend(unregister_action_groups.iter_mut());
            all.extend(link_action_groups.iter_mut());
            all.extend(register_action_groups.iter_mut());
            all.extend(compile_action_groups.iter_mut());
            all.extend(entry_point_action_groups.iter_mut());
            all.extend(prefix_record_groups.iter_mut());
        }

        let mut failures = Vec::new();
        self.run_phases(&mut all, &mut failures);

        if failures.is_empty() {
            for group in &mut all {
                for action in &mut group.actions {
                    if let Err(e) = action.cleanup() {
                        tracing::warn!("cleanup failed: {e}");
                    }
                }
            }
            return Ok(());
        }

        let mut rollback_errors = Vec::new();
        if self.config.rollback_enabled {
            tracing::info!("rolling back transaction");
            for group in all.iter_mut().rev() {
                rollback_errors.extend(reverse_group(group, None));
            }
        }

        let mut failures = failures.into_iter();
        let failure = failures.next().expect("checked non-empty above");
        Err(ExecuteError {
            failure,
            additional_failures: failures.collect(),
            rollback_errors,
        })
    }

    fn run_phases(&self, all: &mut Vec<&mut ActionGroup>, failures: &mut Vec<GroupFailure>) {
        let scripts = ScriptRunner::new(self.config);

        // Phase U: pre-unlink scripts, serially. Their failures only log.
        if self.config.execute_link_scripts {
            for group in all.iter().filter(|group| group.kind == GroupKind::Unlink) {
                let Some(prec) = &group.pkg else { continue };
                if let Err(e) = scripts.run(
                    &group.target_prefix,
                    prec,
                    ScriptPhase::PreUnlink,
                    &group.target_prefix,
                    false,
                ) {
                    tracing::warn!("pre-unlink script did not run: {e}");
                }
            }
        }
        if self.push_if_cancelled(failures) {
            return;
        }

        // Unlink groups across all prefixes, in parallel.
        failures.extend(self.driver.run_each(all, |group| {
            (group.kind == GroupKind::Unlink)
                .then(|| self.execute_group(group).err())
                .flatten()
        }));

        // Post-unlink scripts, serially, in group order. Failures only log.
        if self.config.execute_link_scripts {
            for group in all.iter().filter(|group| group.kind == GroupKind::Unlink) {
                let Some(prec) = &group.pkg else { continue };
                if let Err(e) = scripts.run(
                    &group.target_prefix,
                    prec,
                    ScriptPhase::PostUnlink,
                    &group.target_prefix,
                    true,
                ) {
                    tracing::warn!("post-unlink script did not run: {e}");
                }
            }
        }

        // Unregister groups, serially.
        for group in all.iter_mut() {
            if group.kind == GroupKind::Unregister {
                if let Err(failure) = self.execute_group(group) {
                    failures.push(failure);
                }
            }
        }

        if !failures.is_empty() || self.push_if_cancelled(failures) {
            return;
        }

        // Phase L: pre-link scripts, serially, out of the extracted package.
        // A failing pre-link aborts before anything of the package lands.
        if self.config.execute_link_scripts {
            for group in all.iter_mut().filter(|group| group.kind == GroupKind::Link) {
                let (Some(prec), Some(package_dir)) = (&group.pkg, &group.extracted_package_dir)
                else {
                    continue;
                };
                match scripts.run(
                    package_dir,
                    prec,
                    ScriptPhase::PreLink,
                    &group.target_prefix,
                    false,
                ) {
                    Ok(_) => {}
                    Err(e) => {
                        group.state = GroupState::Failed;
                        failures.push(GroupFailure {
                            group_label: group.label(),
                            error: e.into(),
                            reverse_errors: Vec::new(),
                        });
                        return;
                    }
                }
            }
        }
        if self.push_if_cancelled(failures) {
            return;
        }

        // Link groups across all prefixes, in parallel.
        failures.extend(self.driver.run_each(all, |group| {
            (group.kind == GroupKind::Link)
                .then(|| self.execute_group(group).err())
                .flatten()
        }));

        // Post-link scripts, serially, in group order. A failure reverses the
        // package's own group; the transaction-wide rollback follows.
        if self.config.execute_link_scripts {
            for group in all.iter_mut().filter(|group| group.kind == GroupKind::Link) {
                if group.state != GroupState::Executed {
                    continue;
                }
                let Some(prec) = group.pkg.clone() else { continue };
                match scripts.run(
                    &group.target_prefix,
                    &prec,
                    ScriptPhase::PostLink,
                    &group.target_prefix,
                    true,
                ) {
                    Ok(_) => {}
                    Err(e) => {
                        let reverse_errors = if self.config.rollback_enabled {
                            reverse_group(group, None)
                        } else {
                            Vec::new()
                        };
                        group.state = GroupState::Failed;
                        failures.push(GroupFailure {
                            group_label: group.label(),
                            error: e.into(),
                            reverse_errors,
                        });
                    }
                }
            }
        }

        if !failures.is_empty() || self.push_if_cancelled(failures) {
            return;
        }

        // Entry points and records across all prefixes, in parallel.
        failures.extend(self.driver.run_each(all, |group| {
            matches!(group.kind, GroupKind::EntryPoint | GroupKind::Record)
                .then(|| self.execute_group(group).err())
                .flatten()
        }));

        // One aggregated byte-compilation for the whole transaction,
        // amortizing interpreter startup over every package.
        let aggregate = CompileMultiPycAction::aggregate(
            all.iter()
                .filter(|group| group.kind == GroupKind::Compile)
                .flat_map(|group| group.actions.iter())
                .filter_map(|action| match action {
                    Action::CompileMultiPyc(action) => Some(action),
                    _ => None,
                }),
        );
        let aggregate_result = aggregate.map(|aggregate| {
            tracing::info!(
                "byte-compiling {} files in one pass",
                aggregate.source_short_paths.len()
            );
            Action::CompileMultiPyc(aggregate).execute()
        });
        match aggregate_result {
            None | Some(Ok(())) => {
                for group in all.iter_mut().filter(|group| group.kind == GroupKind::Compile) {
                    for action in &mut group.actions {
                        if let Action::CompileMultiPyc(action) = action {
                            action.mark_executed();
                        }
                    }
                    group.state = GroupState::Executed;
                }
            }
            Some(Err(e)) => {
                failures.push(GroupFailure {
                    group_label: "compile".to_string(),
                    error: e.into(),
                    reverse_errors: Vec::new(),
                });
            }
        }

        if !failures.is_empty() || self.push_if_cancelled(failures) {
            return;
        }

        // Register groups last, serially.
        for group in all.iter_mut() {
            if group.kind == GroupKind::Register {
                if let Err(failure) = self.execute_group(group) {
                    failures.push(failure);
                }
            }
        }
    }

    /// Runs one group's actions in order. On a raising action the group
    /// reverses itself from the index reached, and the failure is returned.
    fn execute_group(&self, group: &mut ActionGroup) -> Result<(), GroupFailure> {
        group.state = GroupState::Executing;

        match (group.kind, &group.pkg) {
            (GroupKind::Unlink, Some(prec)) => tracing::info!(
                "===> UNLINKING PACKAGE: {} <===\n  prefix={}",
                prec.dist_str(),
                group.target_prefix.display()
            ),
            (GroupKind::Link, Some(prec)) => tracing::info!(
                "===> LINKING PACKAGE: {} <===\n  prefix={}\n  source={}",
                prec.dist_str(),
                group.target_prefix.display(),
                group
                    .extracted_package_dir
                    .as_deref()
                    .unwrap_or_else(|| std::path::Path::new("?"))
                    .display()
            ),
            _ => {}
        }

        for index in 0..group.actions.len() {
            if let Err(e) = group.actions[index].execute() {
                let reverse_errors = if self.config.rollback_enabled {
                    reverse_group(group, Some(index))
                } else {
                    Vec::new()
                };
                group.state = GroupState::Failed;
                return Err(GroupFailure {
                    group_label: group.label(),
                    error: e.into(),
                    reverse_errors,
                });
            }
        }

        group.state = GroupState::Executed;
        Ok(())
    }

    fn push_if_cancelled(&self, failures: &mut Vec<GroupFailure>) -> bool {
        if self.driver.is_cancelled() {
            failures.push(GroupFailure {
                group_label: "transaction".to_string(),
                error: ExecuteFailureKind::Cancelled,
                reverse_errors: Vec::new(),
            });
            true
        } else {
            false
        }
    }
}

/// Reverses a group's actions in descending index order, starting from
/// `reached` when the group failed midway. Errors are collected, never
/// short-circuiting.
fn reverse_group(group: &mut ActionGroup, reached: Option<usize>) -> Vec<ActionError> {
    if matches!(group.kind, GroupKind::Unlink | GroupKind::Link)
        && matches!(
            group.state,
            GroupState::Executed | GroupState::Executing | GroupState::Failed
        )
    {
        tracing::info!("===> REVERSING {} <===", group.label());
    }

    let upper = reached.map_or(group.actions.len(), |index| index + 1);
    let mut errors = Vec::new();
    for action in group.actions[..upper].iter_mut().rev() {
        if let Err(e) = action.reverse() {
            tracing::debug!("error reversing action: {e}");
            errors.push(e);
        }
    }

    if !matches!(group.state, GroupState::Pending) {
        group.state = if errors.is_empty() {
            GroupState::Reverted
        } else {
            GroupState::RevertFailed
        };
    }
    errors
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::*;
    use crate::{
        fetch::DirectoryCache,
        planner::Planner,
        record::{PrefixSetup, TransactionContext},
        test_utils::{install_into_prefix, record, snapshot_files, test_config, write_package},
    };

    fn plan_one(
        config: &TransactionConfig,
        cache: &DirectoryCache,
        setup: &PrefixSetup,
    ) -> IndexMap<PathBuf, PrefixActionGroup> {
        let planner = Planner::new(config, cache);
        let mut context = TransactionContext::new(&setup.target_prefix);
        let groups = planner.plan(&mut context, setup).unwrap();
        let mut map = IndexMap::new();
        map.insert(setup.target_prefix.clone(), groups);
        map
    }

    #[test]
    fn test_link_then_unlink_roundtrip() {
        let root = tempfile::tempdir().unwrap();
        let cache_dir = root.path().join("cache");
        let prefix = root.path().join("envs/test");
        fs_err::create_dir_all(&prefix).unwrap();

        let prec = record("tool", "1.0", "0");
        write_package(&cache_dir, &prec, &["bin/tool", "lib/tool/data.txt"]);

        let config = test_config(root.path());
        let cache = DirectoryCache::new(&cache_dir);
        let driver = TransactionDriver::new(&config);
        let executor = Executor::new(&config, &driver);

        // Link.
        let setup = PrefixSetup {
            target_prefix: prefix.clone(),
            unlink_precs: Vec::new(),
            link_precs: vec![prec.clone()],
            remove_specs: Vec::new(),
            update_specs: Vec::new(),
        };
        let mut groups = plan_one(&config, &cache, &setup);
        executor.execute(&mut groups).unwrap();

        assert!(prefix.join("bin/tool").is_file());
        assert!(prefix.join("lib/tool/data.txt").is_file());
        assert!(prefix.join("conda-meta/tool-1.0-0.json").is_file());
        assert!(prefix.join("conda-meta/history").is_file());
        let registry = fs_err::read_to_string(root.path().join("environments.txt")).unwrap();
        assert!(registry.contains::<&str>(prefix.to_string_lossy().as_ref()));

        // Unlink again: the prefix keeps only transaction bookkeeping.
        let setup = PrefixSetup {
            target_prefix: prefix.clone(),
            unlink_precs: vec![prec],
            link_precs: Vec::new(),
            remove_specs: Vec::new(),
            update_specs: Vec::new(),
        };
        let mut groups = plan_one(&config, &cache, &setup);
        executor.execute(&mut groups).unwrap();

        assert!(!prefix.join("bin/tool").exists());
        assert!(!prefix.join("lib").exists());
        assert!(!prefix.join("conda-meta/tool-1.0-0.json").exists());
    }

    #[test]
    fn test_update_replaces_files() {
        let root = tempfile::tempdir().unwrap();
        let cache_dir = root.path().join("cache");
        let prefix = root.path().join("envs/test");

        let old = record("tool", "1.0", "0");
        install_into_prefix(&prefix, &old, &["bin/tool", "share/old.txt"]);
        let new = record("tool", "2.0", "0");
        write_package(&cache_dir, &new, &["bin/tool", "share/new.txt"]);

        let config = test_config(root.path());
        let cache = DirectoryCache::new(&cache_dir);
        let driver = TransactionDriver::new(&config);
        let executor = Executor::new(&config, &driver);

        let setup = PrefixSetup {
            target_prefix: prefix.clone(),
            unlink_precs: vec![old],
            link_precs: vec![new],
            remove_specs: Vec::new(),
            update_specs: Vec::new(),
        };
        let mut groups = plan_one(&config, &cache, &setup);
        executor.execute(&mut groups).unwrap();

        assert!(prefix.join("bin/tool").is_file());
        assert!(!prefix.join("share/old.txt").exists());
        assert!(prefix.join("share/new.txt").is_file());
        assert!(!prefix.join("conda-meta/tool-1.0-0.json").exists());
        assert!(prefix.join("conda-meta/tool-2.0-0.json").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn test_rollback_on_post_link_failure() {
        let root = tempfile::tempdir().unwrap();
        let cache_dir = root.path().join("cache");
        let prefix = root.path().join("envs/test");

        let existing = record("keeper", "1.0", "0");
        install_into_prefix(&prefix, &existing, &["share/keeper.txt"]);

        let good = record("pkg-a", "1.0", "0");
        write_package(&cache_dir, &good, &["share/a.txt"]);
        let bad = record("pkg-b", "1.0", "0");
        let bad_dir = write_package(&cache_dir, &bad, &["share/b.txt", "bin/.pkg-b-post-link.sh"]);
        fs_err::write(
            bad_dir.join("bin/.pkg-b-post-link.sh"),
            "#!/bin/sh\nexit 1\n",
        )
        .unwrap();

        let mut config = test_config(root.path());
        config.execute_link_scripts = true;
        let cache = DirectoryCache::new(&cache_dir);
        let driver = TransactionDriver::new(&config);
        let executor = Executor::new(&config, &driver);

        let before = snapshot_files(&prefix);

        let setup = PrefixSetup {
            target_prefix: prefix.clone(),
            unlink_precs: Vec::new(),
            link_precs: vec![good, bad],
            remove_specs: Vec::new(),
            update_specs: Vec::new(),
        };
        let mut groups = plan_one(&config, &cache, &setup);
        let error = executor.execute(&mut groups).unwrap_err();

        assert!(matches!(error.failure.error, ExecuteFailureKind::Script(_)));
        assert!(error.failure.group_label.contains("pkg-b"));

        // Both packages are gone again; the prefix equals its pre-transaction
        // snapshot.
        let after = snapshot_files(&prefix);
        assert_eq!(before, after);
    }

    #[test]
    fn test_rollback_on_conflicting_link() {
        let root = tempfile::tempdir().unwrap();
        let cache_dir = root.path().join("cache");
        let prefix = root.path().join("envs/test");
        fs_err::create_dir_all(&prefix).unwrap();

        // The second file of the package collides with an unwritable target,
        // forcing a mid-group failure.
        let prec = record("half", "1.0", "0");
        write_package(&cache_dir, &prec, &["share/ok.txt", "share/clash"]);
        fs_err::create_dir_all(prefix.join("share/clash")).unwrap();
        fs_err::write(prefix.join("share/clash/blocker"), "").unwrap();

        let config = test_config(root.path());
        let cache = DirectoryCache::new(&cache_dir);
        let driver = TransactionDriver::new(&config);
        let executor = Executor::new(&config, &driver);

        let before = snapshot_files(&prefix);
        let setup = PrefixSetup {
            target_prefix: prefix.clone(),
            unlink_precs: Vec::new(),
            link_precs: vec![prec],
            remove_specs: Vec::new(),
            update_specs: Vec::new(),
        };
        let mut groups = plan_one(&config, &cache, &setup);
        let error = executor.execute(&mut groups).unwrap_err();
        assert!(matches!(error.failure.error, ExecuteFailureKind::Action(_)));

        assert_eq!(before, snapshot_files(&prefix));
    }

    #[test]
    fn test_noarch_python_install() {
        use crate::test_utils::{noarch_record, write_package_with};

        let root = tempfile::tempdir().unwrap();
        let cache_dir = root.path().join("cache");
        let prefix = root.path().join("envs/test");

        let python = record("python", "3.9.1", "0");
        write_package(&cache_dir, &python, &["bin/python3.9"]);
        let pkg = noarch_record("mypkg", "1.0", "0");
        write_package_with(
            &cache_dir,
            &pkg,
            &["site-packages/mypkg/__init__.py"],
            &["mypkg = mypkg.cli:main"],
            Some("python"),
        );

        let config = test_config(root.path());
        let cache = DirectoryCache::new(&cache_dir);
        let driver = TransactionDriver::new(&config);
        let executor = Executor::new(&config, &driver);

        let setup = PrefixSetup {
            target_prefix: prefix.clone(),
            unlink_precs: Vec::new(),
            link_precs: vec![python, pkg],
            remove_specs: Vec::new(),
            update_specs: Vec::new(),
        };
        let mut groups = plan_one(&config, &cache, &setup);
        executor.execute(&mut groups).unwrap();

        // The module landed under the versioned site-packages directory and
        // the entry point was generated after it.
        assert!(prefix
            .join("lib/python3.9/site-packages/mypkg/__init__.py")
            .is_file());
        let entry_point = prefix.join("bin/mypkg");
        let script = fs_err::read_to_string(&entry_point).unwrap();
        assert!(script.contains("from mypkg.cli import main"));

        // The record references the entry point and the scheduled byte-code
        // outputs alongside the package files.
        let record_json =
            fs_err::read_to_string(prefix.join("conda-meta/mypkg-1.0-0.json")).unwrap();
        assert!(record_json.contains("lib/python3.9/site-packages/mypkg/__init__.py"));
        assert!(record_json.contains("bin/mypkg"));
        assert!(record_json.contains("__pycache__/__init__.cpython-39.pyc"));
    }

    #[test]
    fn test_compile_aggregation() {
        let prefix = Path::new("/prefix");
        let python =
            crate::python::PythonInfo::from_short_version((3, 9), rattler_conda_types::Platform::Linux64);
        let parts: Vec<CompileMultiPycAction> = (0..3)
            .map(|i| {
                CompileMultiPycAction::new(
                    prefix.to_path_buf(),
                    python.clone(),
                    vec![PathBuf::from(format!(
                        "lib/python3.9/site-packages/pkg{i}/mod.py"
                    ))],
                    prefix.join(".condatmp"),
                )
            })
            .collect();

        let aggregate = CompileMultiPycAction::aggregate(parts.iter()).unwrap();
        assert_eq!(aggregate.source_short_paths.len(), 3);
        assert_eq!(aggregate.target_short_paths.len(), 3);

        // Nothing to compile aggregates to nothing.
        assert!(CompileMultiPycAction::aggregate(std::iter::empty()).is_none());
    }
}
