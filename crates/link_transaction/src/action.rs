//! The reversible units of change a transaction is made of.
//!
//! An [`Action`] is a tagged variant over every concrete filesystem or
//! metadata operation the engine performs. All variants share one operation
//! set: `verify` (pre-flight, side-effect free), `execute`, `reverse` (undo a
//! performed `execute`) and `cleanup` (release scratch state after a
//! successful transaction). Construction never touches the filesystem; every
//! side effect lives in `execute`.
//!
//! Unlinked files are not deleted during `execute` but renamed into the
//! transaction's scratch directory, which is what makes `reverse` a rename
//! back and `cleanup` the actual deletion.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Command,
};

use crate::{
    link::{link_file, LinkType},
    package::EntryPoint,
    python::PythonInfo,
    record::{PackageRecord, PrefixRecord},
    verify::VerificationError,
};

/// An error raised by an action's `execute`, `reverse` or `cleanup`.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    /// A directory could not be created.
    #[error("failed to create directory '{path}'")]
    CreateDirectory {
        /// The directory being created.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A file could not be linked into the prefix.
    #[error("failed to link '{path}'")]
    LinkFile {
        /// The target path of the link.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A file could not be moved out of the prefix.
    #[error("failed to unlink '{path}'")]
    UnlinkPath {
        /// The path being removed.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A previously removed or created path could not be restored.
    #[error("failed to restore '{path}'")]
    Restore {
        /// The path being restored.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A generated entry point could not be written.
    #[error("failed to create entry point '{path}'")]
    EntryPoint {
        /// The entry point script path.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The installed-package record could not be written or removed.
    #[error("failed to write prefix record '{path}'")]
    Record {
        /// The record document path.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The installed-package record could not be serialized.
    #[error("failed to serialize prefix record for '{dist}'")]
    SerializeRecord {
        /// The package whose record failed to serialize.
        dist: String,
        #[source]
        source: serde_json::Error,
    },

    /// The environments registry file could not be updated.
    #[error("failed to update environment registry '{path}'")]
    EnvironmentsFile {
        /// The registry file.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The history ledger could not be updated.
    #[error("failed to update history in '{path}'")]
    History {
        /// The history file.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The byte-compilation work list could not be written.
    #[error("failed to write compilation list '{path}'")]
    CompileListing {
        /// The list file in the scratch directory.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Scratch state could not be released.
    #[error("failed to clean up '{path}'")]
    Cleanup {
        /// The scratch path.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A reversible unit of filesystem or metadata change.
#[derive(Debug)]
pub enum Action {
    /// Create a directory needed by file links, first-writer-wins.
    CreateDirectory(CreateDirectoryAction),
    /// Place one package file into the prefix.
    LinkFile(LinkFileAction),
    /// Move one path out of the prefix (into scratch), or drop an emptied
    /// directory.
    UnlinkPath(UnlinkPathAction),
    /// Mark the prefix as user-writable on Windows.
    CreateNonadminMarker(CreateNonadminMarkerAction),
    /// Register the menu shortcuts a package declares.
    MakeMenu(MakeMenuAction),
    /// Drop the menu shortcuts a package declared.
    RemoveMenu(RemoveMenuAction),
    /// Generate an executable for a declared python entry point.
    CreatePythonEntryPoint(CreatePythonEntryPointAction),
    /// Byte-compile the python sources of one or more packages.
    CompileMultiPyc(CompileMultiPycAction),
    /// Write the installed-package record of a linked package.
    CreatePrefixRecord(CreatePrefixRecordAction),
    /// Drop the installed-package record of an unlinked package.
    RemovePrefixRecord(RemovePrefixRecordAction),
    /// Add the prefix to the environments registry.
    RegisterEnvironmentLocation(RegisterEnvironmentLocationAction),
    /// Remove the prefix from the environments registry.
    UnregisterEnvironmentLocation(UnregisterEnvironmentLocationAction),
    /// Append this transaction to the prefix history ledger.
    UpdateHistory(UpdateHistoryAction),
}

impl Action {
    /// Pre-flight check. Returns an error instead of raising so callers can
    /// aggregate. Marks the action verified, making re-verification a no-op.
    pub fn verify(&mut self) -> Option<VerificationError> {
        match self {
            Action::LinkFile(action) => action.verify(),
            _ => None,
        }
    }

    /// Whether `verify` already ran for this action.
    pub fn verified(&self) -> bool {
        match self {
            Action::LinkFile(action) => action.verified,
            _ => true,
        }
    }

    /// Performs the change.
    pub fn execute(&mut self) -> Result<(), ActionError> {
        match self {
            Action::CreateDirectory(action) => action.execute(),
            Action::LinkFile(action) => action.execute(),
            Action::UnlinkPath(action) => action.execute(),
            Action::CreateNonadminMarker(action) => action.execute(),
            Action::MakeMenu(action) => action.execute(),
            Action::RemoveMenu(action) => action.execute(),
            Action::CreatePythonEntryPoint(action) => action.execute(),
            Action::CompileMultiPyc(action) => action.execute(),
            Action::CreatePrefixRecord(action) => action.execute(),
            Action::RemovePrefixRecord(action) => action.execute(),
            Action::RegisterEnvironmentLocation(action) => action.execute(),
            Action::UnregisterEnvironmentLocation(action) => action.execute(),
            Action::UpdateHistory(action) => action.execute(),
        }
    }

    /// Undoes a performed `execute`. Safe to call on actions that never
    /// executed; they undo nothing.
    pub fn reverse(&mut self) -> Result<(), ActionError> {
        match self {
            Action::CreateDirectory(action) => action.reverse(),
            Action::LinkFile(action) => action.reverse(),
            Action::UnlinkPath(action) => action.reverse(),
            Action::CreateNonadminMarker(action) => action.reverse(),
            Action::MakeMenu(action) => action.reverse(),
            Action::RemoveMenu(action) => action.reverse(),
            Action::CreatePythonEntryPoint(action) => action.reverse(),
            Action::CompileMultiPyc(action) => action.reverse(),
            Action::CreatePrefixRecord(action) => action.reverse(),
            Action::RemovePrefixRecord(action) => action.reverse(),
            Action::RegisterEnvironmentLocation(action) => action.reverse(),
            Action::UnregisterEnvironmentLocation(action) => action.reverse(),
            Action::UpdateHistory(action) => action.reverse(),
        }
    }

    /// Releases scratch state once the transaction committed.
    pub fn cleanup(&mut self) -> Result<(), ActionError> {
        match self {
            Action::UnlinkPath(action) => action.cleanup(),
            Action::RemovePrefixRecord(action) => action.cleanup(),
            Action::CompileMultiPyc(action) => action.cleanup(),
            _ => Ok(()),
        }
    }

    /// The single path this action creates in the prefix, when there is one.
    pub fn target_short_path(&self) -> Option<&Path> {
        match self {
            Action::CreateDirectory(action) => Some(&action.target_short_path),
            Action::LinkFile(action) => Some(&action.target_short_path),
            Action::UnlinkPath(action) => Some(&action.target_short_path),
            Action::CreateNonadminMarker(_) => Some(Path::new(".nonadmin")),
            Action::CreatePythonEntryPoint(action) => Some(&action.script_short_path),
            Action::CreatePrefixRecord(action) => Some(&action.meta_short_path),
            Action::RemovePrefixRecord(action) => Some(&action.meta_short_path),
            _ => None,
        }
    }
}

/// Creates a directory inside the prefix. Creation is idempotent so several
/// packages may share parent directories; only the action that actually
/// created the directory will remove it on reverse.
#[derive(Debug)]
pub struct CreateDirectoryAction {
    /// The prefix being mutated.
    pub target_prefix: PathBuf,
    /// The directory, relative to the prefix.
    pub target_short_path: PathBuf,
    created: bool,
}

impl CreateDirectoryAction {
    pub(crate) fn new(target_prefix: PathBuf, target_short_path: PathBuf) -> Self {
        Self {
            target_prefix,
            target_short_path,
            created: false,
        }
    }

    fn execute(&mut self) -> Result<(), ActionError> {
        let full_path = self.target_prefix.join(&self.target_short_path);
        match fs_err::create_dir(&full_path) {
            Ok(()) => {
                self.created = true;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // A parent was scheduled in another group; create the chain.
                fs_err::create_dir_all(&full_path).map_err(|e| ActionError::CreateDirectory {
                    path: full_path.clone(),
                    source: e,
                })?;
                self.created = true;
                Ok(())
            }
            Err(e) => Err(ActionError::CreateDirectory {
                path: full_path,
                source: e,
            }),
        }
    }

    fn reverse(&mut self) -> Result<(), ActionError> {
        if !self.created {
            return Ok(());
        }
        let full_path = self.target_prefix.join(&self.target_short_path);
        match fs_err::remove_dir(&full_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => {
                // Another package may have placed files here in the meantime.
                tracing::debug!("not removing '{}': {e}", full_path.display());
                Ok(())
            }
        }
    }
}

/// Links one file of a package from its extracted cache entry into the
/// prefix.
#[derive(Debug)]
pub struct LinkFileAction {
    /// Absolute path of the file inside the extracted cache entry.
    pub source_path: PathBuf,
    /// The prefix being mutated.
    pub target_prefix: PathBuf,
    /// Where the file lands, relative to the prefix.
    pub target_short_path: PathBuf,
    /// How the file is materialized.
    pub link_type: LinkType,
    /// The package this file belongs to, for diagnostics.
    pub dist: String,
    verified: bool,
    created: bool,
}

impl LinkFileAction {
    pub(crate) fn new(
        source_path: PathBuf,
        target_prefix: PathBuf,
        target_short_path: PathBuf,
        link_type: LinkType,
        dist: String,
    ) -> Self {
        Self {
            source_path,
            target_prefix,
            target_short_path,
            link_type,
            dist,
            verified: false,
            created: false,
        }
    }

    fn verify(&mut self) -> Option<VerificationError> {
        if self.verified {
            return None;
        }
        self.verified = true;
        if self.source_path.symlink_metadata().is_err() {
            return Some(VerificationError::PackagedFileMissing {
                dist: self.dist.clone(),
                path: self.source_path.clone(),
            });
        }
        None
    }

    fn execute(&mut self) -> Result<(), ActionError> {
        let full_path = self.target_prefix.join(&self.target_short_path);
        link_file(&self.source_path, &full_path, self.link_type).map_err(|e| {
            ActionError::LinkFile {
                path: full_path,
                source: e,
            }
        })?;
        self.created = true;
        Ok(())
    }

    fn reverse(&mut self) -> Result<(), ActionError> {
        if !self.created {
            return Ok(());
        }
        let full_path = self.target_prefix.join(&self.target_short_path);
        match fs_err::remove_file(&full_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ActionError::Restore {
                path: full_path,
                source: e,
            }),
        }
    }
}

/// Removes one path of an unlinked package. Files are renamed into the
/// transaction's scratch directory so the removal can be reversed; the
/// directory variant drops directories that became empty.
#[derive(Debug)]
pub struct UnlinkPathAction {
    /// The prefix being mutated.
    pub target_prefix: PathBuf,
    /// The path being removed, relative to the prefix.
    pub target_short_path: PathBuf,
    /// `LinkType::Directory` marks the directory variant.
    pub link_type: LinkType,
    temp_dir: PathBuf,
    saved_path: Option<PathBuf>,
    removed_directory: bool,
}

impl UnlinkPathAction {
    pub(crate) fn new(
        target_prefix: PathBuf,
        target_short_path: PathBuf,
        link_type: LinkType,
        temp_dir: PathBuf,
    ) -> Self {
        Self {
            target_prefix,
            target_short_path,
            link_type,
            temp_dir,
            saved_path: None,
            removed_directory: false,
        }
    }

    fn execute(&mut self) -> Result<(), ActionError> {
        let full_path = self.target_prefix.join(&self.target_short_path);
        if self.link_type == LinkType::Directory {
            return match fs_err::remove_dir(&full_path) {
                Ok(()) => {
                    self.removed_directory = true;
                    Ok(())
                }
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => {
                    // Still holds files of other packages; leave it alone.
                    tracing::debug!("not removing '{}': {e}", full_path.display());
                    Ok(())
                }
            };
        }

        fs_err::create_dir_all(&self.temp_dir).map_err(|e| ActionError::CreateDirectory {
            path: self.temp_dir.clone(),
            source: e,
        })?;
        let saved = self
            .temp_dir
            .join(uuid::Uuid::new_v4().simple().to_string());
        match fs_err::rename(&full_path, &saved) {
            Ok(()) => {
                self.saved_path = Some(saved);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ActionError::UnlinkPath {
                path: full_path,
                source: e,
            }),
        }
    }

    fn reverse(&mut self) -> Result<(), ActionError> {
        let full_path = self.target_prefix.join(&self.target_short_path);
        if self.removed_directory {
            self.removed_directory = false;
            return fs_err::create_dir_all(&full_path).map_err(|e| ActionError::Restore {
                path: full_path,
                source: e,
            });
        }
        if let Some(saved) = self.saved_path.take() {
            if let Some(parent) = full_path.parent() {
                fs_err::create_dir_all(parent).map_err(|e| ActionError::Restore {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
            fs_err::rename(&saved, &full_path).map_err(|e| ActionError::Restore {
                path: full_path,
                source: e,
            })?;
        }
        Ok(())
    }

    fn cleanup(&mut self) -> Result<(), ActionError> {
        if let Some(saved) = self.saved_path.take() {
            match fs_err::remove_file(&saved) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(ActionError::Cleanup {
                        path: saved,
                        source: e,
                    })
                }
            }
        }
        Ok(())
    }
}

/// Marks the prefix as installed without administrator rights (Windows).
#[derive(Debug)]
pub struct CreateNonadminMarkerAction {
    /// The prefix being mutated.
    pub target_prefix: PathBuf,
    created: bool,
}

impl CreateNonadminMarkerAction {
    pub(crate) fn new(target_prefix: PathBuf) -> Self {
        Self {
            target_prefix,
            created: false,
        }
    }

    fn execute(&mut self) -> Result<(), ActionError> {
        let marker = self.target_prefix.join(".nonadmin");
        if marker.exists() {
            return Ok(());
        }
        fs_err::write(&marker, "").map_err(|e| ActionError::LinkFile {
            path: marker.clone(),
            source: e,
        })?;
        self.created = true;
        Ok(())
    }

    fn reverse(&mut self) -> Result<(), ActionError> {
        if !self.created {
            return Ok(());
        }
        let marker = self.target_prefix.join(".nonadmin");
        match fs_err::remove_file(&marker) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ActionError::Restore {
                path: marker,
                source: e,
            }),
        }
    }
}

/// Registers the menu shortcuts declared by a `Menu/*.json` file. Shortcut
/// rendering is owned by the hosting application; the engine validates the
/// declaration and schedules it at the right point of the transaction.
#[derive(Debug)]
pub struct MakeMenuAction {
    /// The prefix being mutated.
    pub target_prefix: PathBuf,
    /// The menu declaration, relative to the prefix.
    pub menu_short_path: PathBuf,
}

impl MakeMenuAction {
    pub(crate) fn new(target_prefix: PathBuf, menu_short_path: PathBuf) -> Self {
        Self {
            target_prefix,
            menu_short_path,
        }
    }

    fn execute(&mut self) -> Result<(), ActionError> {
        let full_path = self.target_prefix.join(&self.menu_short_path);
        match fs_err::read_to_string(&full_path) {
            Ok(contents) => match serde_json::from_str::<serde_json::Value>(&contents) {
                Ok(_) => {
                    tracing::info!("registering menu shortcuts from '{}'", full_path.display());
                }
                Err(e) => {
                    tracing::warn!(
                        "ignoring malformed menu declaration '{}': {e}",
                        full_path.display()
                    );
                }
            },
            Err(e) => {
                tracing::warn!("menu declaration '{}' unreadable: {e}", full_path.display());
            }
        }
        Ok(())
    }

    fn reverse(&mut self) -> Result<(), ActionError> {
        Ok(())
    }
}

/// Drops the menu shortcuts of a package that is being unlinked.
#[derive(Debug)]
pub struct RemoveMenuAction {
    /// The prefix being mutated.
    pub target_prefix: PathBuf,
    /// The menu declaration, relative to the prefix.
    pub menu_short_path: PathBuf,
}

impl RemoveMenuAction {
    pub(crate) fn new(target_prefix: PathBuf, menu_short_path: PathBuf) -> Self {
        Self {
            target_prefix,
            menu_short_path,
        }
    }

    fn execute(&mut self) -> Result<(), ActionError> {
        tracing::info!(
            "removing menu shortcuts declared by '{}'",
            self.target_prefix.join(&self.menu_short_path).display()
        );
        Ok(())
    }

    fn reverse(&mut self) -> Result<(), ActionError> {
        Ok(())
    }
}

/// Generates the executable for one declared python entry point.
#[derive(Debug)]
pub struct CreatePythonEntryPointAction {
    /// The prefix being mutated.
    pub target_prefix: PathBuf,
    /// The declaration from the package's `link.json`.
    pub entry_point: EntryPoint,
    /// The python distribution the entry point targets.
    pub python: PythonInfo,
    /// The generated script, relative to the prefix.
    pub script_short_path: PathBuf,
    created_paths: Vec<PathBuf>,
}

impl CreatePythonEntryPointAction {
    pub(crate) fn new(target_prefix: PathBuf, entry_point: EntryPoint, python: PythonInfo) -> Self {
        let script_short_path = if python.platform.is_windows() {
            python
                .bin_dir
                .join(format!("{}-script.py", entry_point.command))
        } else {
            python.bin_dir.join(&entry_point.command)
        };
        Self {
            target_prefix,
            entry_point,
            python,
            script_short_path,
            created_paths: Vec::new(),
        }
    }

    /// Every path this action will create, relative to the prefix.
    pub(crate) fn all_target_short_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.script_short_path.clone()];
        if self.python.platform.is_windows() {
            paths.push(
                self.python
                    .bin_dir
                    .join(format!("{}.bat", self.entry_point.command)),
            );
        }
        paths
    }

    fn execute(&mut self) -> Result<(), ActionError> {
        let script = self.python.entry_point_template(
            &self.target_prefix,
            &self.entry_point.module,
            &self.entry_point.function,
        );
        let script_path = self.target_prefix.join(&self.script_short_path);
        if let Some(parent) = script_path.parent() {
            fs_err::create_dir_all(parent).map_err(|e| ActionError::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        fs_err::write(&script_path, script).map_err(|e| ActionError::EntryPoint {
            path: script_path.clone(),
            source: e,
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs_err::set_permissions(&script_path, std::fs::Permissions::from_mode(0o775)).map_err(
                |e| ActionError::EntryPoint {
                    path: script_path.clone(),
                    source: e,
                },
            )?;
        }
        self.created_paths.push(self.script_short_path.clone());

        if self.python.platform.is_windows() {
            let shim_short_path = self
                .python
                .bin_dir
                .join(format!("{}.bat", self.entry_point.command));
            let shim_path = self.target_prefix.join(&shim_short_path);
            let interpreter = self.target_prefix.join(&self.python.path);
            let shim = format!(
                "@echo off\r\n\"{}\" \"%~dp0{}-script.py\" %*\r\n",
                interpreter.display(),
                self.entry_point.command
            );
            fs_err::write(&shim_path, shim).map_err(|e| ActionError::EntryPoint {
                path: shim_path,
                source: e,
            })?;
            self.created_paths.push(shim_short_path);
        }
        Ok(())
    }

    fn reverse(&mut self) -> Result<(), ActionError> {
        for short_path in self.created_paths.drain(..) {
            let full_path = self.target_prefix.join(short_path);
            match fs_err::remove_file(&full_path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(ActionError::Restore {
                        path: full_path,
                        source: e,
                    })
                }
            }
        }
        Ok(())
    }
}

/// Byte-compiles python sources. One action per package at planning time; the
/// executor folds all of them into a single aggregated action (one
/// interpreter launch) via [`CompileMultiPycAction::aggregate`].
#[derive(Debug)]
pub struct CompileMultiPycAction {
    /// The prefix being mutated.
    pub target_prefix: PathBuf,
    /// The python distribution performing the compilation.
    pub python: PythonInfo,
    /// The `.py` sources, relative to the prefix.
    pub source_short_paths: Vec<PathBuf>,
    /// The `.pyc` outputs, relative to the prefix.
    pub target_short_paths: Vec<PathBuf>,
    temp_dir: PathBuf,
    list_file: Option<PathBuf>,
    executed: bool,
}

impl CompileMultiPycAction {
    pub(crate) fn new(
        target_prefix: PathBuf,
        python: PythonInfo,
        source_short_paths: Vec<PathBuf>,
        temp_dir: PathBuf,
    ) -> Self {
        let target_short_paths = source_short_paths
            .iter()
            .map(|source| python.pyc_path(source))
            .collect();
        Self {
            target_prefix,
            python,
            source_short_paths,
            target_short_paths,
            temp_dir,
            list_file: None,
            executed: false,
        }
    }

    /// The aggregating constructor: one action compiling the ordered
    /// concatenation of every part's sources with a single interpreter
    /// launch. Returns `None` when there is nothing to compile.
    pub(crate) fn aggregate<'a>(
        parts: impl IntoIterator<Item = &'a CompileMultiPycAction>,
    ) -> Option<CompileMultiPycAction> {
        let mut parts = parts.into_iter().peekable();
        let first = parts.peek()?;
        let mut aggregate = CompileMultiPycAction {
            target_prefix: first.target_prefix.clone(),
            python: first.python.clone(),
            source_short_paths: Vec::new(),
            target_short_paths: Vec::new(),
            temp_dir: first.temp_dir.clone(),
            list_file: None,
            executed: false,
        };
        for part in parts {
            aggregate
                .source_short_paths
                .extend(part.source_short_paths.iter().cloned());
            aggregate
                .target_short_paths
                .extend(part.target_short_paths.iter().cloned());
        }
        (!aggregate.source_short_paths.is_empty()).then_some(aggregate)
    }

    /// Marks this action executed after an aggregate containing its items ran
    /// on its behalf, so `reverse` knows there may be outputs to remove.
    pub(crate) fn mark_executed(&mut self) {
        self.executed = true;
    }

    fn execute(&mut self) -> Result<(), ActionError> {
        self.executed = true;
        if self.source_short_paths.is_empty() {
            return Ok(());
        }

        let interpreter = self.target_prefix.join(&self.python.path);
        if !interpreter.exists() {
            tracing::warn!(
                "python interpreter '{}' not present, skipping byte-compilation",
                interpreter.display()
            );
            return Ok(());
        }

        fs_err::create_dir_all(&self.temp_dir).map_err(|e| ActionError::CreateDirectory {
            path: self.temp_dir.clone(),
            source: e,
        })?;
        let list_file = self
            .temp_dir
            .join(format!("pyc_{}.txt", uuid::Uuid::new_v4().simple()));
        let listing = self
            .source_short_paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("\n");
        fs_err::write(&list_file, listing).map_err(|e| ActionError::CompileListing {
            path: list_file.clone(),
            source: e,
        })?;
        self.list_file = Some(list_file.clone());

        let output = Command::new(&interpreter)
            .args(["-Wi", "-m", "compileall", "-q", "-l", "-i"])
            .arg(&list_file)
            .current_dir(&self.target_prefix)
            .output();
        match output {
            Ok(output) if output.status.success() => {}
            Ok(output) => {
                tracing::warn!(
                    "byte-compilation reported failures (exit {:?}): {}",
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Err(e) => {
                tracing::warn!(
                    "failed to launch '{}' for byte-compilation: {e}",
                    interpreter.display()
                );
            }
        }
        Ok(())
    }

    fn reverse(&mut self) -> Result<(), ActionError> {
        if !self.executed {
            return Ok(());
        }
        for target in &self.target_short_paths {
            let full_path = self.target_prefix.join(target);
            match fs_err::remove_file(&full_path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(ActionError::Restore {
                        path: full_path,
                        source: e,
                    })
                }
            }
        }
        Ok(())
    }

    fn cleanup(&mut self) -> Result<(), ActionError> {
        if let Some(list_file) = self.list_file.take() {
            match fs_err::remove_file(&list_file) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(ActionError::Cleanup {
                        path: list_file,
                        source: e,
                    })
                }
            }
        }
        Ok(())
    }
}

/// Writes the `conda-meta/<dist>.json` record of a freshly linked package,
/// referencing every path the preceding link, entry-point and compile
/// actions produce.
#[derive(Debug)]
pub struct CreatePrefixRecordAction {
    /// The prefix being mutated.
    pub target_prefix: PathBuf,
    /// The package being recorded.
    pub record: PackageRecord,
    /// The spec that requested this package, if any.
    pub requested_spec: Option<String>,
    /// Every file belonging to the package, relative to the prefix.
    pub files: Vec<PathBuf>,
    /// The record document, relative to the prefix.
    pub meta_short_path: PathBuf,
    created: bool,
}

impl CreatePrefixRecordAction {
    pub(crate) fn new(
        target_prefix: PathBuf,
        record: PackageRecord,
        requested_spec: Option<String>,
        files: Vec<PathBuf>,
    ) -> Self {
        let meta_short_path = Path::new("conda-meta").join(record.record_file_name());
        Self {
            target_prefix,
            record,
            requested_spec,
            files,
            meta_short_path,
            created: false,
        }
    }

    fn execute(&mut self) -> Result<(), ActionError> {
        let full_path = self.target_prefix.join(&self.meta_short_path);
        if let Some(parent) = full_path.parent() {
            fs_err::create_dir_all(parent).map_err(|e| ActionError::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let prefix_record = PrefixRecord {
            record: self.record.clone(),
            files: self.files.clone(),
            requested_spec: self.requested_spec.clone(),
        };
        let contents = serde_json::to_string_pretty(&prefix_record).map_err(|e| {
            ActionError::SerializeRecord {
                dist: self.record.dist_str(),
                source: e,
            }
        })?;
        fs_err::write(&full_path, contents).map_err(|e| ActionError::Record {
            path: full_path.clone(),
            source: e,
        })?;
        self.created = true;
        Ok(())
    }

    fn reverse(&mut self) -> Result<(), ActionError> {
        if !self.created {
            return Ok(());
        }
        let full_path = self.target_prefix.join(&self.meta_short_path);
        match fs_err::remove_file(&full_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ActionError::Restore {
                path: full_path,
                source: e,
            }),
        }
    }
}

/// Removes the `conda-meta/<dist>.json` record of an unlinked package. The
/// document is parked in the scratch directory until cleanup so the removal
/// can be reversed.
#[derive(Debug)]
pub struct RemovePrefixRecordAction {
    /// The prefix being mutated.
    pub target_prefix: PathBuf,
    /// The installed record being dropped.
    pub record: PrefixRecord,
    /// The record document, relative to the prefix.
    pub meta_short_path: PathBuf,
    temp_dir: PathBuf,
    saved_path: Option<PathBuf>,
}

impl RemovePrefixRecordAction {
    pub(crate) fn new(target_prefix: PathBuf, record: PrefixRecord, temp_dir: PathBuf) -> Self {
        let meta_short_path = Path::new("conda-meta").join(record.file_name());
        Self {
            target_prefix,
            record,
            meta_short_path,
            temp_dir,
            saved_path: None,
        }
    }

    fn execute(&mut self) -> Result<(), ActionError> {
        let full_path = self.target_prefix.join(&self.meta_short_path);
        fs_err::create_dir_all(&self.temp_dir).map_err(|e| ActionError::CreateDirectory {
            path: self.temp_dir.clone(),
            source: e,
        })?;
        let saved = self
            .temp_dir
            .join(uuid::Uuid::new_v4().simple().to_string());
        match fs_err::rename(&full_path, &saved) {
            Ok(()) => {
                self.saved_path = Some(saved);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ActionError::Record {
                path: full_path,
                source: e,
            }),
        }
    }

    fn reverse(&mut self) -> Result<(), ActionError> {
        if let Some(saved) = self.saved_path.take() {
            let full_path = self.target_prefix.join(&self.meta_short_path);
            fs_err::rename(&saved, &full_path).map_err(|e| ActionError::Restore {
                path: full_path,
                source: e,
            })?;
        }
        Ok(())
    }

    fn cleanup(&mut self) -> Result<(), ActionError> {
        if let Some(saved) = self.saved_path.take() {
            match fs_err::remove_file(&saved) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(ActionError::Cleanup {
                        path: saved,
                        source: e,
                    })
                }
            }
        }
        Ok(())
    }
}

/// Adds the prefix to the environments registry file.
#[derive(Debug)]
pub struct RegisterEnvironmentLocationAction {
    /// The registry file.
    pub environments_file: PathBuf,
    /// The prefix being registered.
    pub target_prefix: PathBuf,
    added: bool,
}

impl RegisterEnvironmentLocationAction {
    pub(crate) fn new(environments_file: PathBuf, target_prefix: PathBuf) -> Self {
        Self {
            environments_file,
            target_prefix,
            added: false,
        }
    }

    fn execute(&mut self) -> Result<(), ActionError> {
        let io_err = |e| ActionError::EnvironmentsFile {
            path: self.environments_file.clone(),
            source: e,
        };
        let line = self.target_prefix.to_string_lossy().into_owned();
        let contents = match fs_err::read_to_string(&self.environments_file) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => return Err(io_err(e)),
        };
        if contents.lines().any(|existing| existing == line) {
            return Ok(());
        }
        if let Some(parent) = self.environments_file.parent() {
            fs_err::create_dir_all(parent).map_err(io_err)?;
        }
        let mut updated = contents;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(&line);
        updated.push('\n');
        fs_err::write(&self.environments_file, updated).map_err(io_err)?;
        self.added = true;
        Ok(())
    }

    fn reverse(&mut self) -> Result<(), ActionError> {
        if !self.added {
            return Ok(());
        }
        self.added = false;
        remove_environment_line(&self.environments_file, &self.target_prefix)
    }
}

/// Removes the prefix from the environments registry file.
#[derive(Debug)]
pub struct UnregisterEnvironmentLocationAction {
    /// The registry file.
    pub environments_file: PathBuf,
    /// The prefix being unregistered.
    pub target_prefix: PathBuf,
    removed: bool,
}

impl UnregisterEnvironmentLocationAction {
    pub(crate) fn new(environments_file: PathBuf, target_prefix: PathBuf) -> Self {
        Self {
            environments_file,
            target_prefix,
            removed: false,
        }
    }

    fn execute(&mut self) -> Result<(), ActionError> {
        let line = self.target_prefix.to_string_lossy();
        let contents = match fs_err::read_to_string(&self.environments_file) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(ActionError::EnvironmentsFile {
                    path: self.environments_file.clone(),
                    source: e,
                })
            }
        };
        if !contents.lines().any(|existing| existing == line) {
            return Ok(());
        }
        remove_environment_line(&self.environments_file, &self.target_prefix)?;
        self.removed = true;
        Ok(())
    }

    fn reverse(&mut self) -> Result<(), ActionError> {
        if !self.removed {
            return Ok(());
        }
        self.removed = false;
        let io_err = |e| ActionError::EnvironmentsFile {
            path: self.environments_file.clone(),
            source: e,
        };
        let mut contents = match fs_err::read_to_string(&self.environments_file) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => return Err(io_err(e)),
        };
        if !contents.is_empty() && !contents.ends_with('\n') {
            contents.push('\n');
        }
        contents.push_str(&self.target_prefix.to_string_lossy());
        contents.push('\n');
        fs_err::write(&self.environments_file, contents).map_err(io_err)
    }
}

fn remove_environment_line(
    environments_file: &Path,
    target_prefix: &Path,
) -> Result<(), ActionError> {
    let io_err = |e| ActionError::EnvironmentsFile {
        path: environments_file.to_path_buf(),
        source: e,
    };
    let line = target_prefix.to_string_lossy();
    let contents = match fs_err::read_to_string(environments_file) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(io_err(e)),
    };
    let mut remaining: String = contents
        .lines()
        .filter(|existing| *existing != line)
        .collect::<Vec<_>>()
        .join("\n");
    if !remaining.is_empty() {
        remaining.push('\n');
    }
    fs_err::write(environments_file, remaining).map_err(io_err)
}

/// Appends this transaction to the append-only `conda-meta/history` ledger.
#[derive(Debug)]
pub struct UpdateHistoryAction {
    /// The prefix being mutated.
    pub target_prefix: PathBuf,
    /// The specs the user asked to remove.
    pub remove_specs: Vec<String>,
    /// The specs the user asked to add or update.
    pub update_specs: Vec<String>,
    /// Dist strings of the packages being unlinked.
    pub unlink_dists: Vec<String>,
    /// Dist strings of the packages being linked.
    pub link_dists: Vec<String>,
    prior_len: Option<Option<u64>>,
}

impl UpdateHistoryAction {
    pub(crate) fn new(
        target_prefix: PathBuf,
        remove_specs: Vec<String>,
        update_specs: Vec<String>,
        unlink_dists: Vec<String>,
        link_dists: Vec<String>,
    ) -> Self {
        Self {
            target_prefix,
            remove_specs,
            update_specs,
            unlink_dists,
            link_dists,
            prior_len: None,
        }
    }

    fn history_path(&self) -> PathBuf {
        self.target_prefix.join("conda-meta").join("history")
    }

    fn execute(&mut self) -> Result<(), ActionError> {
        let path = self.history_path();
        let io_err = |e| ActionError::History {
            path: path.clone(),
            source: e,
        };
        if let Some(parent) = path.parent() {
            fs_err::create_dir_all(parent).map_err(io_err)?;
        }
        let prior_len = match fs_err::metadata(&path) {
            Ok(metadata) => Some(metadata.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(io_err(e)),
        };
        self.prior_len = Some(prior_len);

        let mut entry = format!(
            "==> {} <==\n# cmd: {}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            std::env::args().collect::<Vec<_>>().join(" ")
        );
        for dist in &self.unlink_dists {
            entry.push_str(&format!("-{dist}\n"));
        }
        for dist in &self.link_dists {
            entry.push_str(&format!("+{dist}\n"));
        }
        if !self.remove_specs.is_empty() {
            entry.push_str(&format!("# remove specs: {:?}\n", self.remove_specs));
        }
        if !self.update_specs.is_empty() {
            entry.push_str(&format!("# update specs: {:?}\n", self.update_specs));
        }

        use std::io::Write;
        let mut file = fs_err::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        file.write_all(entry.as_bytes()).map_err(io_err)?;
        Ok(())
    }

    fn reverse(&mut self) -> Result<(), ActionError> {
        let path = self.history_path();
        let io_err = |e| ActionError::History {
            path: path.clone(),
            source: e,
        };
        match self.prior_len.take() {
            None => Ok(()),
            Some(None) => match fs_err::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(io_err(e)),
            },
            Some(Some(len)) => {
                let file = fs_err::OpenOptions::new()
                    .write(true)
                    .open(&path)
                    .map_err(io_err)?;
                file.set_len(len).map_err(io_err)?;
                Ok(())
            }
        }
    }
}
