//! Pre-flight verification of a planned transaction.
//!
//! Verification never mutates a prefix (beyond probing that `conda-meta/` is
//! writable, restoring whatever the probe created). Errors are collected, not
//! raised; the caller decides what survives the configured safety policy.
//!
//! Three levels run in order: transaction-wide checks short-circuit the rest,
//! then per-prefix path-collision checks and per-action checks run for every
//! prefix (in parallel across prefixes).

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use rayon::prelude::*;

use crate::{
    action::Action,
    config::{SafetyChecks, TransactionConfig},
    planner::PrefixActionGroup,
    prefix_data::{PrefixData, PREFIX_MAGIC_FILE},
    record::{leading_name_token, PrefixSetup},
};

/// A verification failure. Collected and reported in aggregate.
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    /// A path being linked already exists in the prefix and belongs to an
    /// installed package that is not being unlinked.
    #[error(
        "path '{path}' conflicts: package '{link_dist}' wants to link it but it is owned by \
         installed package '{clobber_dist}'"
    )]
    KnownPackageClobber {
        /// The conflicting path, relative to the prefix.
        path: PathBuf,
        /// The package being linked.
        link_dist: String,
        /// The installed owner of the path.
        clobber_dist: String,
    },

    /// A path being linked already exists in the prefix but no installed
    /// package claims it.
    #[error(
        "path '{path}' conflicts: package '{link_dist}' wants to link it but it already exists \
         in the prefix"
    )]
    UnknownPackageClobber {
        /// The conflicting path, relative to the prefix.
        path: PathBuf,
        /// The package being linked.
        link_dist: String,
    },

    /// More than one package in this transaction creates the same path.
    #[error("path '{path}' would be created by multiple packages: {dists:?}")]
    SharedLinkPathClobber {
        /// The contested path, relative to the prefix.
        path: PathBuf,
        /// Every package contributing the path.
        dists: Vec<String>,
    },

    /// A package on the configured disallow list is being linked.
    #[error("package '{dist}' is disallowed by configuration")]
    DisallowedPackage {
        /// The offending package.
        dist: String,
    },

    /// The transaction would remove the package manager from its own
    /// environment without replacing it.
    #[error(
        "this operation will remove conda without replacing it with another version of conda"
    )]
    RemoveProtectedPackage,

    /// A dependency of the surviving package manager would be missing after
    /// the transaction.
    #[error(
        "'{dependency}' is a dependency of conda and cannot be removed from conda's operating \
         environment"
    )]
    RemoveRequiredDependency {
        /// The dependency that would go missing.
        dependency: String,
    },

    /// The prefix cannot be written to.
    #[error("environment is not writable: '{prefix}'")]
    EnvironmentNotWritable {
        /// The unwritable prefix.
        prefix: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A file in the package manifest is missing from the extracted cache
    /// entry.
    #[error("package '{dist}' appears corrupted: manifest path '{path}' does not exist")]
    PackagedFileMissing {
        /// The package with the broken manifest.
        dist: String,
        /// The missing path inside the cache entry.
        path: PathBuf,
    },
}

impl VerificationError {
    /// Whether the `warn` safety policy may demote this error to a warning.
    /// Self-protection and writability failures never are.
    pub fn demotable(&self) -> bool {
        matches!(
            self,
            VerificationError::KnownPackageClobber { .. }
                | VerificationError::UnknownPackageClobber { .. }
                | VerificationError::SharedLinkPathClobber { .. }
                | VerificationError::PackagedFileMissing { .. }
        )
    }
}

/// Splits collected errors per the configured safety policy: demotable
/// classes become warnings under [`SafetyChecks::Warn`], everything else is
/// returned to be raised.
pub(crate) fn apply_safety_policy(
    errors: Vec<VerificationError>,
    config: &TransactionConfig,
) -> Vec<VerificationError> {
    match config.safety_checks {
        SafetyChecks::Enabled => errors,
        SafetyChecks::Disabled => Vec::new(),
        SafetyChecks::Warn => errors
            .into_iter()
            .filter(|error| {
                if error.demotable() {
                    tracing::warn!("{error}");
                    false
                } else {
                    true
                }
            })
            .collect(),
    }
}

/// Runs the pre-flight checks for a planned transaction.
pub struct Verifier<'a> {
    config: &'a TransactionConfig,
}

impl<'a> Verifier<'a> {
    /// A verifier for the given configuration.
    pub fn new(config: &'a TransactionConfig) -> Self {
        Self { config }
    }

    /// Verifies the whole transaction. Transaction-level errors short-circuit
    /// the per-prefix and per-action levels.
    pub fn verify(
        &self,
        setups: &IndexMap<PathBuf, PrefixSetup>,
        action_groups: &mut IndexMap<PathBuf, PrefixActionGroup>,
    ) -> Vec<VerificationError> {
        let transaction_errors = self.verify_transaction_level(setups);
        if !transaction_errors.is_empty() {
            return transaction_errors;
        }

        let mut per_prefix: Vec<(PathBuf, &mut PrefixActionGroup)> = action_groups
            .iter_mut()
            .map(|(prefix, group)| (prefix.clone(), group))
            .collect();

        let verify_one = |(prefix, group): &mut (PathBuf, &mut PrefixActionGroup)| {
            let mut errors = self.verify_prefix_level(prefix, group);
            errors.extend(Self::verify_action_level(group));
            errors
        };

        if self.config.debug {
            per_prefix.iter_mut().flat_map(verify_one).collect()
        } else {
            per_prefix
                .par_iter_mut()
                .flat_map_iter(verify_one)
                .collect()
        }
    }

    /// Transaction-wide checks: self-protection of the package manager, its
    /// dependencies, the disallow list, and prefix writability.
    fn verify_transaction_level(
        &self,
        setups: &IndexMap<PathBuf, PrefixSetup>,
    ) -> Vec<VerificationError> {
        let mut errors = Vec::new();
        let config = self.config;

        // The environments that may host the package manager itself.
        let conda_prefixes = [
            config.root_prefix.join("envs").join("_conda_"),
            config.root_prefix.clone(),
        ];
        let conda_setups: Vec<&PrefixSetup> = setups
            .values()
            .filter(|setup| conda_prefixes.contains(&setup.target_prefix))
            .collect();

        let conda_unlinked = conda_setups.iter().any(|setup| {
            setup
                .unlink_precs
                .iter()
                .any(|prec| prec.name.as_normalized() == "conda")
        });
        let conda_link = conda_setups.iter().find_map(|setup| {
            setup
                .link_precs
                .iter()
                .find(|prec| prec.name.as_normalized() == "conda")
                .map(|prec| (prec, *setup))
        });

        if conda_unlinked && conda_link.is_none() {
            // Never skippable, not even with safety checks demoted.
            errors.push(VerificationError::RemoveProtectedPackage);
        }

        // Dependencies of the conda that survives the transaction.
        let (conda_final_prefix, conda_depends) = match &conda_link {
            Some((prec, setup)) => (setup.target_prefix.clone(), prec.depends.clone()),
            None => {
                let depends = read_prefix_data(&config.conda_prefix)
                    .as_ref()
                    .and_then(|data| data.get("conda"))
                    .map(|record| record.record.depends.clone())
                    .unwrap_or_default();
                (config.conda_prefix.clone(), depends)
            }
        };
        if !conda_depends.is_empty() {
            let already_linked: HashSet<String> = read_prefix_data(&conda_final_prefix)
                .map(|data| {
                    data.iter_records()
                        .map(|record| record.record.name.as_normalized().to_string())
                        .collect()
                })
                .unwrap_or_default();
            let (being_linked, being_unlinked) = setups
                .get(&conda_final_prefix)
                .map(|setup| {
                    (
                        setup
                            .link_precs
                            .iter()
                            .map(|prec| prec.name.as_normalized().to_string())
                            .collect::<HashSet<_>>(),
                        setup
                            .unlink_precs
                            .iter()
                            .map(|prec| prec.name.as_normalized().to_string())
                            .collect::<HashSet<_>>(),
                    )
                })
                .unwrap_or_default();

            for dependency in &conda_depends {
                let Some(dep_name) = leading_name_token(dependency) else {
                    continue;
                };
                if dep_name == "conda" {
                    continue;
                }
                let present_after = being_linked.contains(&dep_name)
                    || (already_linked.contains(&dep_name) && !being_unlinked.contains(&dep_name));
                if !present_after {
                    errors.push(VerificationError::RemoveRequiredDependency {
                        dependency: dep_name,
                    });
                }
            }
        }

        // The disallow list.
        let disallowed: Vec<String> = config
            .disallowed_packages
            .iter()
            .filter_map(|spec| leading_name_token(spec))
            .collect();
        if !disallowed.is_empty() {
            for setup in setups.values() {
                for prec in &setup.link_precs {
                    if disallowed
                        .iter()
                        .any(|name| name == prec.name.as_normalized())
                    {
                        errors.push(VerificationError::DisallowedPackage {
                            dist: prec.dist_str(),
                        });
                    }
                }
            }
        }

        // Writability of each prefix, probed through the magic file.
        for setup in setups.values() {
            if let Some(error) = probe_prefix_writable(&setup.target_prefix) {
                errors.push(error);
            }
        }

        errors
    }

    /// Per-prefix checks: every created path must be new or scheduled for
    /// unlink, and no two packages may create the same path.
    fn verify_prefix_level(
        &self,
        target_prefix: &Path,
        prefix_action_group: &PrefixActionGroup,
    ) -> Vec<VerificationError> {
        let case_insensitive = self.config.case_insensitive_paths();
        let fold = |path: &Path| fold_path(path, case_insensitive);

        let unlink_paths: HashSet<String> = prefix_action_group
            .unlink_action_groups
            .iter()
            .flat_map(|group| group.actions.iter())
            .filter_map(|action| match action {
                Action::UnlinkPath(action) => Some(fold(&action.target_short_path)),
                _ => None,
            })
            .collect();

        let prefix_data = read_prefix_data(target_prefix);

        let mut errors = Vec::new();
        // Every path the transaction creates, discovered through the record
        // actions which reference all preceding link/entry-point/compile
        // outputs.
        let mut link_paths: IndexMap<String, (PathBuf, Vec<String>)> = IndexMap::new();
        for group in &prefix_action_group.prefix_record_groups {
            for action in &group.actions {
                let Action::CreatePrefixRecord(record_action) = action else {
                    continue;
                };
                let link_dist = record_action.record.dist_str();
                for path in &record_action.files {
                    let folded = fold(path);
                    link_paths
                        .entry(folded.clone())
                        .or_insert_with(|| (path.clone(), Vec::new()))
                        .1
                        .push(link_dist.clone());

                    if unlink_paths.contains(&folded) {
                        continue;
                    }
                    if target_prefix.join(path).symlink_metadata().is_ok() {
                        let owner = prefix_data.as_ref().and_then(|data| {
                            data.iter_records().find(|record| {
                                record.files.iter().any(|file| fold(file) == folded)
                            })
                        });
                        errors.push(match owner {
                            Some(owner) => VerificationError::KnownPackageClobber {
                                path: path.clone(),
                                link_dist: link_dist.clone(),
                                clobber_dist: owner.record.dist_str(),
                            },
                            None => VerificationError::UnknownPackageClobber {
                                path: path.clone(),
                                link_dist: link_dist.clone(),
                            },
                        });
                    }
                }
            }
        }

        for (path, dists) in link_paths.into_values() {
            if dists.len() > 1 {
                errors.push(VerificationError::SharedLinkPathClobber { path, dists });
            }
        }

        errors
    }

    /// Per-action checks: ask every not-yet-verified action to verify
    /// itself.
    fn verify_action_level(prefix_action_group: &mut PrefixActionGroup) -> Vec<VerificationError> {
        let PrefixActionGroup {
            unlink_action_groups,
            unregister_action_groups,
            link_action_groups,
            register_action_groups,
            compile_action_groups,
            entry_point_action_groups,
            prefix_record_groups,
        } = prefix_action_group;

        let mut errors = Vec::new();
        for group in unlink_action_groups
            .iter_mut()
            .chain(unregister_action_groups.iter_mut())
            .chain(link_action_groups.iter_mut())
            .chain(register_action_groups.iter_mut())
            .chain(compile_action_groups.iter_mut())
            .chain(entry_point_action_groups.iter_mut())
            .chain(prefix_record_groups.iter_mut())
        {
            for action in &mut group.actions {
                if action.verified() {
                    continue;
                }
                if let Some(error) = action.verify() {
                    tracing::debug!("verification error: {error}");
                    errors.push(error);
                }
            }
        }
        errors
    }
}

fn read_prefix_data(prefix: &Path) -> Option<PrefixData> {
    match PrefixData::from_prefix(prefix) {
        Ok(data) => Some(data),
        Err(e) => {
            tracing::warn!("unable to read installed packages of '{}': {e}", prefix.display());
            None
        }
    }
}

/// Folds a relative path for collision comparison.
pub(crate) fn fold_path(path: &Path, case_insensitive: bool) -> String {
    let rendered = path.to_string_lossy().replace('\\', "/");
    if case_insensitive {
        rendered.to_lowercase()
    } else {
        rendered
    }
}

/// Probes that the prefix can be written to by opening its magic file for
/// append. Anything the probe creates is removed again.
fn probe_prefix_writable(target_prefix: &Path) -> Option<VerificationError> {
    let magic_file = target_prefix.join(PREFIX_MAGIC_FILE);
    let magic_existed = magic_file.symlink_metadata().is_ok();
    let meta_dir = magic_file
        .parent()
        .expect("the magic file always has a parent");
    let dir_existed = meta_dir.is_dir();

    let restore = |created_file: bool| {
        if !dir_existed {
            let _ = fs_err::remove_dir_all(meta_dir);
        } else if created_file && !magic_existed {
            let _ = fs_err::remove_file(&magic_file);
        }
    };

    if !dir_existed {
        if let Err(e) = fs_err::create_dir_all(meta_dir) {
            return Some(VerificationError::EnvironmentNotWritable {
                prefix: target_prefix.to_path_buf(),
                source: e,
            });
        }
    }

    match fs_err::OpenOptions::new()
        .append(true)
        .create(true)
        .open(&magic_file)
    {
        Ok(file) => {
            drop(file);
            restore(true);
            None
        }
        Err(e) => {
            restore(false);
            Some(VerificationError::EnvironmentNotWritable {
                prefix: target_prefix.to_path_buf(),
                source: e,
            })
        }
    }
}
