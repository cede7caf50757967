//! Running per-package `pre-link`/`post-link`/`pre-unlink`/`post-unlink`
//! scripts.
//!
//! Scripts are optional files named `.<pkg>-<phase>.sh` in `bin/` (POSIX) or
//! `.<pkg>-<phase>.bat` in `Scripts/` (Windows). Link-side failures abort the
//! transaction; unlink-side failures are logged and reported as `false` so
//! removal proceeds.

use std::{
    collections::HashMap,
    fmt::{Display, Formatter},
    path::{Path, PathBuf},
    process::Command,
};

use crate::{config::TransactionConfig, record::PackageRecord};

/// The four script phases of a package's lifecycle in a prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptPhase {
    /// Before the package's files are linked. Runs out of the extracted
    /// package, deprecated but still honored.
    PreLink,
    /// After the package's files were linked.
    PostLink,
    /// Before the package's files are unlinked.
    PreUnlink,
    /// After the package's files were unlinked.
    PostUnlink,
}

impl ScriptPhase {
    fn as_str(&self) -> &'static str {
        match self {
            ScriptPhase::PreLink => "pre-link",
            ScriptPhase::PostLink => "post-link",
            ScriptPhase::PreUnlink => "pre-unlink",
            ScriptPhase::PostUnlink => "post-unlink",
        }
    }

    /// Link-side failures raise; unlink-side failures only log.
    pub fn is_link_side(&self) -> bool {
        matches!(self, ScriptPhase::PreLink | ScriptPhase::PostLink)
    }
}

impl Display for ScriptPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error raised when a link-side script fails.
#[derive(Debug, thiserror::Error)]
pub enum LinkScriptError {
    /// The script ran and exited non-zero.
    #[error(
        "{phase} script failed for package {dist}\n\
         location of failed script: {script_path}\n\
         ==> script messages <==\n{messages}\n\
         ==> script output <==\n\
         stdout: {stdout}\n\
         stderr: {stderr}\n\
         return code: {code:?}"
    )]
    ScriptFailed {
        /// The phase that failed.
        phase: ScriptPhase,
        /// The package whose script failed.
        dist: String,
        /// Where the failing script lives.
        script_path: PathBuf,
        /// Contents of the `.messages.txt` side channel, if any.
        messages: String,
        /// Captured standard output.
        stdout: String,
        /// Captured standard error.
        stderr: String,
        /// The exit code, when the script was not killed by a signal.
        code: Option<i32>,
    },

    /// The script could not be started.
    #[error("failed to run {phase} script for package {dist}")]
    Io {
        /// The phase that failed.
        phase: ScriptPhase,
        /// The package whose script failed to start.
        dist: String,
        #[source]
        source: std::io::Error,
    },
}

/// Executes package scripts with the documented environment.
pub struct ScriptRunner<'a> {
    config: &'a TransactionConfig,
}

impl<'a> ScriptRunner<'a> {
    /// A runner for the given configuration.
    pub fn new(config: &'a TransactionConfig) -> Self {
        Self { config }
    }

    /// Runs the script of `phase` for `prec`, looked up under `script_root`
    /// (the target prefix, or the extracted package for `pre-link`) with
    /// `$PREFIX` pointing at `env_prefix`.
    ///
    /// Returns `Ok(true)` when the script is absent or succeeded, `Ok(false)`
    /// when an unlink-side script failed (or had to be skipped), and an error
    /// for a failing link-side script.
    pub fn run(
        &self,
        script_root: &Path,
        prec: &PackageRecord,
        phase: ScriptPhase,
        env_prefix: &Path,
        activate: bool,
    ) -> Result<bool, LinkScriptError> {
        let windows = self.config.platform.is_windows();
        let script_dir = script_root.join(if windows { "Scripts" } else { "bin" });
        let script_path = script_dir.join(format!(
            ".{}-{}.{}",
            prec.name.as_normalized(),
            phase,
            if windows { "bat" } else { "sh" }
        ));
        if !script_path.is_file() {
            return Ok(true);
        }

        if phase == ScriptPhase::PreLink {
            tracing::warn!(
                "package {} uses a pre-link script; pre-link scripts are potentially dangerous \
                 because they can modify the package cache",
                prec.dist_str()
            );
        }

        let mut env: HashMap<String, String> = HashMap::new();
        env.insert(
            "ROOT_PREFIX".to_string(),
            self.config.root_prefix.to_string_lossy().into_owned(),
        );
        env.insert(
            "PREFIX".to_string(),
            env_prefix.to_string_lossy().into_owned(),
        );
        env.insert(
            "PKG_NAME".to_string(),
            prec.name.as_normalized().to_string(),
        );
        env.insert("PKG_VERSION".to_string(), prec.version.to_string());
        env.insert("PKG_BUILDNUM".to_string(), prec.build_number.to_string());
        if phase == ScriptPhase::PreLink {
            env.insert(
                "SOURCE_DIR".to_string(),
                script_root.to_string_lossy().into_owned(),
            );
        }
        let path_var = std::env::join_paths(
            std::iter::once(script_dir.clone())
                .chain(std::env::var_os("PATH").map(|p| std::env::split_paths(&p).collect::<Vec<_>>()).unwrap_or_default()),
        )
        .map(|joined| joined.to_string_lossy().into_owned())
        .unwrap_or_default();
        env.insert("PATH".to_string(), path_var);

        let mut script_caller: Option<PathBuf> = None;
        let mut command = if windows {
            let Some(comspec) = std::env::var_os("COMSPEC") else {
                tracing::info!(
                    "skipping {phase} for {} because COMSPEC is not set",
                    prec.dist_str()
                );
                return Ok(false);
            };
            let mut command = Command::new(comspec);
            command.arg("/d").arg("/c").arg(&script_path);
            command
        } else if activate {
            // A throwaway wrapper that brings the prefix onto PATH before
            // sourcing the actual script.
            let wrapper = std::env::temp_dir().join(format!(
                ".link_script_caller_{}.sh",
                uuid::Uuid::new_v4().simple()
            ));
            let contents = format!(
                "#!/bin/sh\nexport PATH=\"{}:$PATH\"\n. \"{}\"\n",
                env_prefix.join("bin").display(),
                script_path.display()
            );
            if let Err(e) = fs_err::write(&wrapper, contents) {
                return Err(LinkScriptError::Io {
                    phase,
                    dist: prec.dist_str(),
                    source: e,
                });
            }
            script_caller = Some(wrapper.clone());
            let mut command = Command::new("bash");
            command.arg(wrapper);
            command
        } else {
            let mut command = Command::new("bash");
            command.arg("-x").arg(&script_path);
            command
        };
        command.envs(&env).current_dir(script_root);

        tracing::debug!(
            "for {} at '{}', executing {phase} script '{}'",
            prec.dist_str(),
            env_prefix.display(),
            script_path.display()
        );

        let output = command.output();
        if let Some(wrapper) = script_caller {
            if std::env::var_os("CONDA_TEST_SAVE_TEMPS").is_none() {
                let _ = fs_err::remove_file(&wrapper);
            } else {
                tracing::warn!("CONDA_TEST_SAVE_TEMPS :: retaining script wrapper '{}'", wrapper.display());
            }
        }
        let output = match output {
            Ok(output) => output,
            Err(e) => {
                return Err(LinkScriptError::Io {
                    phase,
                    dist: prec.dist_str(),
                    source: e,
                })
            }
        };

        let messages = self.consume_messages(env_prefix);
        if output.status.success() {
            return Ok(true);
        }

        if phase.is_link_side() {
            Err(LinkScriptError::ScriptFailed {
                phase,
                dist: prec.dist_str(),
                script_path,
                messages: messages.unwrap_or_else(|| "<None>".to_string()),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                code: output.status.code(),
            })
        } else {
            tracing::warn!(
                "{phase} script failed for package {}, consider notifying the package maintainer",
                prec.dist_str()
            );
            Ok(false)
        }
    }

    /// Reads, prints and removes the `.messages.txt` side channel a script
    /// may have left in the prefix.
    fn consume_messages(&self, env_prefix: &Path) -> Option<String> {
        let path = env_prefix.join(".messages.txt");
        let contents = fs_err::read_to_string(&path).ok()?;
        if self.config.json {
            eprint!("{contents}");
        } else {
            print!("{contents}");
        }
        if let Err(e) = fs_err::remove_file(&path) {
            tracing::warn!("failed to remove '{}': {e}", path.display());
        }
        Some(contents)
    }
}
