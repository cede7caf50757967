//! Turning a [`PrefixSetup`] into ordered action groups.
//!
//! The planner is pure with respect to the filesystem except for ensuring the
//! target prefix directory exists. Everything else it does is read and
//! compute; all mutation is deferred to the actions it emits.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use crate::{
    action::{
        Action, CompileMultiPycAction, CreateDirectoryAction, CreateNonadminMarkerAction,
        CreatePrefixRecordAction, CreatePythonEntryPointAction, LinkFileAction, MakeMenuAction,
        RegisterEnvironmentLocationAction, RemoveMenuAction, RemovePrefixRecordAction,
        UnlinkPathAction, UnregisterEnvironmentLocationAction, UpdateHistoryAction,
    },
    config::TransactionConfig,
    fetch::PackageCache,
    link::{determine_link_type, LinkType},
    package::{read_package_info, PackageInfo, PackageReadError, PathType},
    prefix_data::{PrefixData, PrefixDataError},
    python::PythonInfo,
    record::{spec_name, PrefixRecord, PrefixSetup, TransactionContext},
};

/// An error raised while planning a transaction.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    /// The target prefix directory could not be created.
    #[error(
        "unable to create prefix directory '{0}'. Check that you have sufficient permissions."
    )]
    EnvironmentNotWritable(PathBuf, #[source] std::io::Error),

    /// A package scheduled to link has no extracted cache entry.
    #[error("no extracted package cache entry for '{0}'")]
    MissingCacheEntry(String),

    /// A noarch python package is being linked but no python will be present
    /// in the prefix.
    #[error("cannot link noarch python package '{0}' without python in the environment")]
    MissingPythonInfo(String),

    /// The version of the python package being linked has no usable
    /// major/minor component.
    #[error("invalid python version '{0}'")]
    InvalidPythonVersion(String),

    /// Package metadata in the cache could not be read.
    #[error(transparent)]
    PackageRead(#[from] PackageReadError),

    /// The installed-package metadata of the prefix could not be read.
    #[error(transparent)]
    PrefixData(#[from] PrefixDataError),
}

/// The kind of an [`ActionGroup`]. Execution phases select groups by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    /// Remove one package's paths.
    Unlink,
    /// Remove the prefix from the environments registry.
    Unregister,
    /// Place one package's paths.
    Link,
    /// Register the prefix and append history.
    Register,
    /// Byte-compile one package's python sources.
    Compile,
    /// Generate one package's python entry points.
    EntryPoint,
    /// Write the installed-package records of the prefix.
    Record,
}

impl std::fmt::Display for GroupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupKind::Unlink => write!(f, "unlink"),
            GroupKind::Unregister => write!(f, "unregister"),
            GroupKind::Link => write!(f, "link"),
            GroupKind::Register => write!(f, "register"),
            GroupKind::Compile => write!(f, "compile"),
            GroupKind::EntryPoint => write!(f, "entry_point"),
            GroupKind::Record => write!(f, "record"),
        }
    }
}

/// Lifecycle of an [`ActionGroup`]. Transitions are driven solely by the
/// executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupState {
    /// Not touched yet.
    #[default]
    Pending,
    /// Actions are currently running.
    Executing,
    /// All actions ran successfully.
    Executed,
    /// An action raised.
    Failed,
    /// The group's actions were rolled back.
    Reverted,
    /// Rolling back raised as well.
    RevertFailed,
}

/// One package's actions of one kind, bound to a target prefix.
#[derive(Debug)]
pub struct ActionGroup {
    /// What phase these actions belong to.
    pub kind: GroupKind,
    /// The package the actions belong to; absent for prefix-wide kinds.
    pub pkg: Option<crate::record::PackageRecord>,
    /// The actions, in execution order.
    pub actions: Vec<Action>,
    /// The prefix the actions mutate.
    pub target_prefix: PathBuf,
    /// Where in its lifecycle this group is.
    pub state: GroupState,
    /// For link groups, the extracted cache entry the package comes from.
    /// Pre-link scripts ship inside it.
    pub extracted_package_dir: Option<PathBuf>,
}

impl ActionGroup {
    fn new(kind: GroupKind, target_prefix: PathBuf, actions: Vec<Action>) -> Self {
        Self {
            kind,
            pkg: None,
            actions,
            target_prefix,
            state: GroupState::default(),
            extracted_package_dir: None,
        }
    }

    /// A human-readable label for diagnostics.
    pub fn label(&self) -> String {
        match &self.pkg {
            Some(pkg) => format!("{} {}", self.kind, pkg.dist_str()),
            None => self.kind.to_string(),
        }
    }
}

/// The seven per-prefix lists of action groups, in canonical order.
#[derive(Debug, Default)]
pub struct PrefixActionGroup {
    /// Per-package unlink groups.
    pub unlink_action_groups: Vec<ActionGroup>,
    /// The unregister group, present iff the prefix has unlinks.
    pub unregister_action_groups: Vec<ActionGroup>,
    /// Per-package link groups.
    pub link_action_groups: Vec<ActionGroup>,
    /// The register/history group.
    pub register_action_groups: Vec<ActionGroup>,
    /// Per-package byte-compilation groups.
    pub compile_action_groups: Vec<ActionGroup>,
    /// Per-package entry-point groups.
    pub entry_point_action_groups: Vec<ActionGroup>,
    /// The record group writing `conda-meta/*.json`.
    pub prefix_record_groups: Vec<ActionGroup>,
}

/// Builds ordered action groups for one prefix from its setup.
pub struct Planner<'a> {
    config: &'a TransactionConfig,
    cache: &'a dyn PackageCache,
}

impl<'a> Planner<'a> {
    /// A planner using the given configuration and package cache.
    pub fn new(config: &'a TransactionConfig, cache: &'a dyn PackageCache) -> Self {
        Self { config, cache }
    }

    /// Plans all groups for `setup`, populating the transaction context with
    /// the target python version along the way.
    pub fn plan(
        &self,
        context: &mut TransactionContext,
        setup: &PrefixSetup,
    ) -> Result<PrefixActionGroup, PlanError> {
        let target_prefix = &setup.target_prefix;
        if !target_prefix.is_dir() {
            fs_err::create_dir_all(target_prefix)
                .map_err(|e| PlanError::EnvironmentNotWritable(target_prefix.clone(), e))?;
        }

        let prefix_data = PrefixData::from_prefix(target_prefix)?;
        let prefix_recs_to_unlink: Vec<PrefixRecord> = setup
            .unlink_precs
            .iter()
            .filter_map(|prec| prefix_data.get(prec.name.as_normalized()).cloned())
            .collect();

        let mut packages_info = Vec::with_capacity(setup.link_precs.len());
        for prec in &setup.link_precs {
            let extracted_dir = self
                .cache
                .entry_to_link(prec)
                .ok_or_else(|| PlanError::MissingCacheEntry(prec.dist_str()))?;
            packages_info.push(read_package_info(prec, &extracted_dir)?);
        }

        let python_version =
            self.target_python_version(&prefix_data, &prefix_recs_to_unlink, &packages_info)?;
        context.target_python_version = python_version;
        let python_info =
            python_version.map(|v| PythonInfo::from_short_version(v, self.config.platform));
        context.target_site_packages_short_path = python_info
            .as_ref()
            .map(|python| python.site_packages_path.clone());

        // Unlink side.
        let unlink_action_groups: Vec<ActionGroup> = prefix_recs_to_unlink
            .iter()
            .map(|record| ActionGroup {
                pkg: Some(record.record.clone()),
                ..ActionGroup::new(
                    GroupKind::Unlink,
                    target_prefix.clone(),
                    self.make_unlink_actions(context, target_prefix, record),
                )
            })
            .collect();

        let unregister_action_groups = if unlink_action_groups.is_empty() {
            Vec::new()
        } else {
            vec![ActionGroup::new(
                GroupKind::Unregister,
                target_prefix.clone(),
                vec![Action::UnregisterEnvironmentLocation(
                    UnregisterEnvironmentLocationAction::new(
                        self.config.environments_file.clone(),
                        target_prefix.clone(),
                    ),
                )],
            )]
        };

        // Link side. Attach the update spec matching each package by name.
        let matched_specs: Vec<Option<String>> = packages_info
            .iter()
            .map(|info| {
                setup
                    .update_specs
                    .iter()
                    .find(|spec| {
                        spec_name(spec).as_deref() == Some(info.record.name.as_normalized())
                    })
                    .map(ToString::to_string)
            })
            .collect();

        let link_types: Vec<LinkType> = packages_info
            .iter()
            .map(|info| {
                determine_link_type(&info.extracted_package_dir, target_prefix, self.config)
            })
            .collect();

        let mut link_action_groups = Vec::new();
        let mut entry_point_action_groups = Vec::new();
        let mut compile_action_groups = Vec::new();
        let mut record_actions = Vec::new();

        for ((info, link_type), requested_spec) in packages_info
            .iter()
            .zip(link_types.iter().copied())
            .zip(matched_specs.iter())
        {
            if info.noarch_python && python_info.is_none() {
                return Err(PlanError::MissingPythonInfo(info.record.dist_str()));
            }

            let file_targets = self.link_targets(info, python_info.as_ref());
            let link_actions =
                self.make_link_actions(target_prefix, info, link_type, &file_targets);
            let entry_point_actions =
                self.make_entry_point_actions(target_prefix, info, python_info.as_ref());
            let compile_actions = self.make_compile_actions(
                context,
                target_prefix,
                info,
                python_info.as_ref(),
                &file_targets,
            );

            // The record references every path the preceding groups produce.
            let mut files: Vec<PathBuf> = file_targets
                .iter()
                .filter(|(entry, _)| entry.path_type != PathType::Directory)
                .map(|(_, target)| target.clone())
                .collect();
            for action in &entry_point_actions {
                if let Action::CreatePythonEntryPoint(action) = action {
                    files.extend(action.all_target_short_paths());
                }
            }
            for action in &compile_actions {
                if let Action::CompileMultiPyc(action) = action {
                    files.extend(action.target_short_paths.iter().cloned());
                }
            }
            record_actions.push(Action::CreatePrefixRecord(CreatePrefixRecordAction::new(
                target_prefix.clone(),
                info.record.clone(),
                requested_spec.clone(),
                files,
            )));

            link_action_groups.push(ActionGroup {
                pkg: Some(info.record.clone()),
                extracted_package_dir: Some(info.extracted_package_dir.clone()),
                ..ActionGroup::new(GroupKind::Link, target_prefix.clone(), link_actions)
            });
            entry_point_action_groups.push(ActionGroup {
                pkg: Some(info.record.clone()),
                ..ActionGroup::new(
                    GroupKind::EntryPoint,
                    target_prefix.clone(),
                    entry_point_actions,
                )
            });
            compile_action_groups.push(ActionGroup {
                pkg: Some(info.record.clone()),
                ..ActionGroup::new(GroupKind::Compile, target_prefix.clone(), compile_actions)
            });
        }

        let prefix_record_groups = vec![ActionGroup::new(
            GroupKind::Record,
            target_prefix.clone(),
            record_actions,
        )];

        let register_action_groups = vec![ActionGroup::new(
            GroupKind::Register,
            target_prefix.clone(),
            vec![
                Action::RegisterEnvironmentLocation(RegisterEnvironmentLocationAction::new(
                    self.config.environments_file.clone(),
                    target_prefix.clone(),
                )),
                Action::UpdateHistory(UpdateHistoryAction::new(
                    target_prefix.clone(),
                    setup.remove_specs.iter().map(ToString::to_string).collect(),
                    setup.update_specs.iter().map(ToString::to_string).collect(),
                    setup
                        .unlink_precs
                        .iter()
                        .map(|prec| prec.dist_str())
                        .collect(),
                    setup.link_precs.iter().map(|prec| prec.dist_str()).collect(),
                )),
            ],
        )];

        Ok(PrefixActionGroup {
            unlink_action_groups,
            unregister_action_groups,
            link_action_groups,
            register_action_groups,
            compile_action_groups,
            entry_point_action_groups,
            prefix_record_groups,
        })
    }

    /// The python that will be present once the transaction finished: a
    /// python being linked wins, otherwise a python that is installed and not
    /// being unlinked, otherwise none.
    fn target_python_version(
        &self,
        prefix_data: &PrefixData,
        prefix_recs_to_unlink: &[PrefixRecord],
        packages_info: &[PackageInfo],
    ) -> Result<Option<(u64, u64)>, PlanError> {
        if let Some(info) = packages_info.iter().find(|info| info.record.is_python()) {
            let version = info.record.version.version();
            return version
                .as_major_minor()
                .map(Some)
                .ok_or_else(|| PlanError::InvalidPythonVersion(version.to_string()));
        }

        if let Some(linked_version) = prefix_data.python_short_version() {
            let unlinking_python = prefix_recs_to_unlink
                .iter()
                .any(|record| record.record.is_python());
            if !unlinking_python {
                return Ok(Some(linked_version));
            }
        }

        Ok(None)
    }

    fn make_unlink_actions(
        &self,
        context: &TransactionContext,
        target_prefix: &Path,
        record: &PrefixRecord,
    ) -> Vec<Action> {
        let mut actions = Vec::new();

        // Menu shortcuts go first, while their declarations still exist.
        if self.config.platform.is_windows() {
            for file in &record.files {
                if is_menu_declaration(file) {
                    actions.push(Action::RemoveMenu(RemoveMenuAction::new(
                        target_prefix.to_path_buf(),
                        file.clone(),
                    )));
                }
            }
        }

        for file in &record.files {
            actions.push(Action::UnlinkPath(UnlinkPathAction::new(
                target_prefix.to_path_buf(),
                file.clone(),
                LinkType::Hardlink,
                context.temp_dir.clone(),
            )));
        }

        // Directories deepest-first, so emptied trees collapse bottom-up.
        for directory in all_ancestors(record.files.iter()).iter().rev() {
            actions.push(Action::UnlinkPath(UnlinkPathAction::new(
                target_prefix.to_path_buf(),
                directory.clone(),
                LinkType::Directory,
                context.temp_dir.clone(),
            )));
        }

        actions.push(Action::RemovePrefixRecord(RemovePrefixRecordAction::new(
            target_prefix.to_path_buf(),
            record.clone(),
            context.temp_dir.clone(),
        )));

        actions
    }

    /// Computes where every manifest entry of a package lands in the prefix.
    fn link_targets<'i>(
        &self,
        info: &'i PackageInfo,
        python_info: Option<&PythonInfo>,
    ) -> Vec<(&'i crate::package::PathsEntry, PathBuf)> {
        info.paths
            .iter()
            .map(|entry| {
                let target = match (info.noarch_python, python_info) {
                    (true, Some(python)) => {
                        python.noarch_target_path(&entry.relative_path).into_owned()
                    }
                    _ => entry.relative_path.clone(),
                };
                (entry, target)
            })
            .collect()
    }

    fn make_link_actions(
        &self,
        target_prefix: &Path,
        info: &PackageInfo,
        link_type: LinkType,
        file_targets: &[(&crate::package::PathsEntry, PathBuf)],
    ) -> Vec<Action> {
        let mut actions = Vec::new();

        // Directory creation strictly precedes the file links it encloses.
        let mut directories = all_ancestors(
            file_targets
                .iter()
                .filter(|(entry, _)| entry.path_type != PathType::Directory)
                .map(|(_, target)| target),
        );
        for (entry, target) in file_targets {
            if entry.path_type == PathType::Directory {
                directories.insert(target.clone());
            }
        }
        for directory in &directories {
            actions.push(Action::CreateDirectory(CreateDirectoryAction::new(
                target_prefix.to_path_buf(),
                directory.clone(),
            )));
        }

        for (entry, target) in file_targets {
            if entry.path_type == PathType::Directory {
                continue;
            }
            let per_file_link_type = match entry.path_type {
                PathType::SoftLink => LinkType::Softlink,
                _ if entry.no_link => LinkType::Copy,
                _ => link_type,
            };
            actions.push(Action::LinkFile(LinkFileAction::new(
                info.extracted_package_dir.join(&entry.relative_path),
                target_prefix.to_path_buf(),
                target.clone(),
                per_file_link_type,
                info.record.dist_str(),
            )));
        }

        if self.config.platform.is_windows()
            && self.config.root_prefix.join(".nonadmin").is_file()
        {
            actions.push(Action::CreateNonadminMarker(
                CreateNonadminMarkerAction::new(target_prefix.to_path_buf()),
            ));
        }

        if self.config.platform.is_windows() {
            for entry in info.menu_files() {
                actions.push(Action::MakeMenu(MakeMenuAction::new(
                    target_prefix.to_path_buf(),
                    entry.relative_path.clone(),
                )));
            }
        }

        actions
    }

    fn make_entry_point_actions(
        &self,
        target_prefix: &Path,
        info: &PackageInfo,
        python_info: Option<&PythonInfo>,
    ) -> Vec<Action> {
        let Some(python) = python_info else {
            return Vec::new();
        };
        info.entry_points
            .iter()
            .map(|entry_point| {
                Action::CreatePythonEntryPoint(CreatePythonEntryPointAction::new(
                    target_prefix.to_path_buf(),
                    entry_point.clone(),
                    python.clone(),
                ))
            })
            .collect()
    }

    fn make_compile_actions(
        &self,
        context: &TransactionContext,
        target_prefix: &Path,
        info: &PackageInfo,
        python_info: Option<&PythonInfo>,
        file_targets: &[(&crate::package::PathsEntry, PathBuf)],
    ) -> Vec<Action> {
        let Some(python) = python_info else {
            return Vec::new();
        };
        if !info.noarch_python {
            return Vec::new();
        }
        let sources: Vec<PathBuf> = file_targets
            .iter()
            .filter(|(entry, target)| {
                entry.path_type != PathType::Directory
                    && target.extension().is_some_and(|ext| ext == "py")
                    && target.starts_with(&python.site_packages_path)
            })
            .map(|(_, target)| target.clone())
            .collect();
        if sources.is_empty() {
            return Vec::new();
        }
        vec![Action::CompileMultiPyc(CompileMultiPycAction::new(
            target_prefix.to_path_buf(),
            python.clone(),
            sources,
            context.temp_dir.clone(),
        ))]
    }
}

/// All ancestor directories of the given relative paths, parents first.
fn all_ancestors<'p>(paths: impl Iterator<Item = &'p PathBuf>) -> BTreeSet<PathBuf> {
    let mut directories = BTreeSet::new();
    for path in paths {
        let mut current = path.parent();
        while let Some(parent) = current {
            if parent.as_os_str().is_empty() || !directories.insert(parent.to_path_buf()) {
                break;
            }
            current = parent.parent();
        }
    }
    directories
}

fn is_menu_declaration(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
        && path
            .parent()
            .and_then(Path::to_str)
            .is_some_and(|parent| parent.eq_ignore_ascii_case("menu"))
}

#[cfg(test)]
mod tests {
    use rattler_conda_types::{MatchSpec, ParseStrictness};

    use super::*;
    use crate::{
        fetch::DirectoryCache,
        test_utils::{install_into_prefix, noarch_record, record, test_config, write_package,
            write_package_with},
    };

    fn setup_for(prefix: &Path, unlink: Vec<crate::record::PackageRecord>, link: Vec<crate::record::PackageRecord>) -> PrefixSetup {
        PrefixSetup {
            target_prefix: prefix.to_path_buf(),
            unlink_precs: unlink,
            link_precs: link,
            remove_specs: Vec::new(),
            update_specs: Vec::new(),
        }
    }

    #[test]
    fn test_link_plan_ordering() {
        let cache_dir = tempfile::tempdir().unwrap();
        let prefix = tempfile::tempdir().unwrap();
        let prec = record("tool", "1.0", "0");
        write_package(cache_dir.path(), &prec, &["bin/tool", "lib/tool/data.txt"]);

        let config = test_config(prefix.path());
        let cache = DirectoryCache::new(cache_dir.path());
        let planner = Planner::new(&config, &cache);
        let mut context = TransactionContext::new(prefix.path());
        let setup = setup_for(prefix.path(), Vec::new(), vec![prec]);
        let plan = planner.plan(&mut context, &setup).unwrap();

        assert!(plan.unlink_action_groups.is_empty());
        assert!(plan.unregister_action_groups.is_empty());
        assert_eq!(plan.link_action_groups.len(), 1);
        assert_eq!(plan.register_action_groups.len(), 1);
        assert_eq!(plan.prefix_record_groups.len(), 1);

        // Directories come before the files they enclose.
        let actions = &plan.link_action_groups[0].actions;
        let first_file = actions
            .iter()
            .position(|a| matches!(a, Action::LinkFile(_)))
            .unwrap();
        let last_dir = actions
            .iter()
            .rposition(|a| matches!(a, Action::CreateDirectory(_)))
            .unwrap();
        assert!(last_dir < first_file);

        // The record lists exactly the package files.
        let Action::CreatePrefixRecord(record_action) = &plan.prefix_record_groups[0].actions[0]
        else {
            panic!("expected a record action");
        };
        assert_eq!(
            record_action.files,
            vec![PathBuf::from("bin/tool"), PathBuf::from("lib/tool/data.txt")]
        );
    }

    #[test]
    fn test_unlink_plan_removes_directories_deepest_first() {
        let cache_dir = tempfile::tempdir().unwrap();
        let prefix = tempfile::tempdir().unwrap();
        let prec = record("tool", "1.0", "0");
        install_into_prefix(prefix.path(), &prec, &["lib/tool/sub/data.txt", "bin/tool"]);

        let config = test_config(prefix.path());
        let cache = DirectoryCache::new(cache_dir.path());
        let planner = Planner::new(&config, &cache);
        let mut context = TransactionContext::new(prefix.path());
        let setup = setup_for(prefix.path(), vec![prec], Vec::new());
        let plan = planner.plan(&mut context, &setup).unwrap();

        assert_eq!(plan.unlink_action_groups.len(), 1);
        assert_eq!(plan.unregister_action_groups.len(), 1);

        let actions = &plan.unlink_action_groups[0].actions;
        let directories: Vec<&Path> = actions
            .iter()
            .filter_map(|action| match action {
                Action::UnlinkPath(a) if a.link_type == LinkType::Directory => {
                    Some(a.target_short_path.as_path())
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            directories,
            vec![
                Path::new("lib/tool/sub"),
                Path::new("lib/tool"),
                Path::new("lib"),
                Path::new("bin")
            ]
        );

        // The record removal comes last.
        assert!(matches!(
            actions.last().unwrap(),
            Action::RemovePrefixRecord(_)
        ));
    }

    #[test]
    fn test_python_version_from_link_precs() {
        let cache_dir = tempfile::tempdir().unwrap();
        let prefix = tempfile::tempdir().unwrap();
        let python = record("python", "3.9.1", "0");
        let pkg = noarch_record("mypkg", "1.0", "0");
        write_package(cache_dir.path(), &python, &["bin/python3.9"]);
        write_package_with(
            cache_dir.path(),
            &pkg,
            &["site-packages/mypkg/__init__.py"],
            &["mypkg = mypkg.cli:main"],
            Some("python"),
        );

        let config = test_config(prefix.path());
        let cache = DirectoryCache::new(cache_dir.path());
        let planner = Planner::new(&config, &cache);
        let mut context = TransactionContext::new(prefix.path());
        let setup = setup_for(prefix.path(), Vec::new(), vec![python, pkg]);
        let plan = planner.plan(&mut context, &setup).unwrap();

        assert_eq!(context.target_python_version, Some((3, 9)));
        assert_eq!(
            context.target_site_packages_short_path,
            Some(PathBuf::from("lib/python3.9/site-packages"))
        );

        // The noarch package's files land under site-packages, it gets an
        // entry point group and a compile group.
        let link_group = &plan.link_action_groups[1];
        assert!(link_group.actions.iter().any(|action| matches!(
            action,
            Action::LinkFile(a)
                if a.target_short_path
                    == Path::new("lib/python3.9/site-packages/mypkg/__init__.py")
        )));
        assert_eq!(plan.entry_point_action_groups[1].actions.len(), 1);
        assert_eq!(plan.compile_action_groups[1].actions.len(), 1);
        let Action::CompileMultiPyc(compile) = &plan.compile_action_groups[1].actions[0] else {
            panic!("expected a compile action");
        };
        assert_eq!(
            compile.target_short_paths,
            vec![PathBuf::from(
                "lib/python3.9/site-packages/mypkg/__pycache__/__init__.cpython-39.pyc"
            )]
        );
    }

    #[test]
    fn test_python_version_from_installed_prefix() {
        let cache_dir = tempfile::tempdir().unwrap();
        let prefix = tempfile::tempdir().unwrap();
        install_into_prefix(prefix.path(), &record("python", "3.10.2", "0"), &["bin/python3.10"]);

        let config = test_config(prefix.path());
        let cache = DirectoryCache::new(cache_dir.path());
        let planner = Planner::new(&config, &cache);

        // Python stays: its version carries over.
        let mut context = TransactionContext::new(prefix.path());
        let setup = setup_for(prefix.path(), Vec::new(), Vec::new());
        planner.plan(&mut context, &setup).unwrap();
        assert_eq!(context.target_python_version, Some((3, 10)));

        // Python is being unlinked without replacement: no python remains.
        let mut context = TransactionContext::new(prefix.path());
        let setup = setup_for(prefix.path(), vec![record("python", "3.10.2", "0")], Vec::new());
        planner.plan(&mut context, &setup).unwrap();
        assert_eq!(context.target_python_version, None);
    }

    #[test]
    fn test_update_spec_assignment() {
        let cache_dir = tempfile::tempdir().unwrap();
        let prefix = tempfile::tempdir().unwrap();
        let prec = record("tool", "2.0", "0");
        write_package(cache_dir.path(), &prec, &["bin/tool"]);

        let config = test_config(prefix.path());
        let cache = DirectoryCache::new(cache_dir.path());
        let planner = Planner::new(&config, &cache);
        let mut context = TransactionContext::new(prefix.path());
        let mut setup = setup_for(prefix.path(), Vec::new(), vec![prec]);
        setup.update_specs = vec![
            MatchSpec::from_str("other >1", ParseStrictness::Lenient).unwrap(),
            MatchSpec::from_str("tool >=2", ParseStrictness::Lenient).unwrap(),
        ];
        let plan = planner.plan(&mut context, &setup).unwrap();

        let Action::CreatePrefixRecord(record_action) = &plan.prefix_record_groups[0].actions[0]
        else {
            panic!("expected a record action");
        };
        assert_eq!(record_action.requested_spec.as_deref(), Some("tool >=2"));
    }

    #[test]
    fn test_missing_cache_entry() {
        let cache_dir = tempfile::tempdir().unwrap();
        let prefix = tempfile::tempdir().unwrap();
        let config = test_config(prefix.path());
        let cache = DirectoryCache::new(cache_dir.path());
        let planner = Planner::new(&config, &cache);
        let mut context = TransactionContext::new(prefix.path());
        let setup = setup_for(prefix.path(), Vec::new(), vec![record("ghost", "1.0", "0")]);
        assert!(matches!(
            planner.plan(&mut context, &setup),
            Err(PlanError::MissingCacheEntry(_))
        ));
    }
}
