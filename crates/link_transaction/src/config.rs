//! Configuration for a transaction.
//!
//! The engine deliberately does not consult any process-global state. All
//! knobs that influence planning, verification and execution are collected in
//! a [`TransactionConfig`] that is constructed once and threaded through the
//! planner, verifier and executor.

use std::path::PathBuf;

use rattler_conda_types::Platform;

/// How strictly pre-flight verification failures are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SafetyChecks {
    /// All verification errors abort the transaction.
    #[default]
    Enabled,
    /// Clobber and packaged-file errors are demoted to warnings. Errors that
    /// would remove the package manager from its own environment are still
    /// fatal.
    Warn,
    /// Verification is skipped entirely.
    Disabled,
}

/// Immutable configuration for a single transaction.
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    /// Always copy files into the prefix instead of linking them.
    pub always_copy: bool,

    /// Always use soft links, even when hard links would be possible.
    pub always_softlink: bool,

    /// Allow falling back to soft links when hard links are not supported.
    pub allow_softlinks: bool,

    /// Pre-flight verification policy.
    pub safety_checks: SafetyChecks,

    /// Whether a failed execution rolls back every group that was already
    /// touched.
    pub rollback_enabled: bool,

    /// Match specs of packages that may never be linked.
    pub disallowed_packages: Vec<String>,

    /// The root prefix of the installation hosting the package manager.
    pub root_prefix: PathBuf,

    /// The prefix the package manager itself lives in. Usually equal to
    /// `root_prefix`.
    pub conda_prefix: PathBuf,

    /// File that records the locations of all known environments.
    pub environments_file: PathBuf,

    /// Emit human output on stderr instead of stdout and route script
    /// messages accordingly.
    pub json: bool,

    /// Suppress non-essential output.
    pub quiet: bool,

    /// Verbosity level, `0` is the default.
    pub verbosity: u8,

    /// When set, `verify` and `execute` must never be reached.
    pub dry_run: bool,

    /// Controls whether channel names show up in the transaction summary.
    /// `None` elides only the default channel.
    pub show_channel_urls: Option<bool>,

    /// Run every phase synchronously on the calling thread. Useful to get
    /// reproducible behavior when debugging.
    pub debug: bool,

    /// Whether per-package pre/post link and unlink scripts are executed.
    pub execute_link_scripts: bool,

    /// The platform the target prefixes are used on.
    pub platform: Platform,
}

impl TransactionConfig {
    /// Creates a configuration with defaults matching interactive use: hard
    /// links preferred, safety checks and rollback enabled, link scripts on.
    pub fn new(root_prefix: impl Into<PathBuf>) -> Self {
        let root_prefix = root_prefix.into();
        Self {
            always_copy: false,
            always_softlink: false,
            allow_softlinks: false,
            safety_checks: SafetyChecks::Enabled,
            rollback_enabled: true,
            disallowed_packages: Vec::new(),
            conda_prefix: root_prefix.clone(),
            environments_file: root_prefix.join("environments.txt"),
            root_prefix,
            json: false,
            quiet: false,
            verbosity: 0,
            dry_run: false,
            show_channel_urls: None,
            debug: false,
            execute_link_scripts: true,
            platform: Platform::current(),
        }
    }

    /// Returns true when path comparisons must be case-insensitive.
    pub fn case_insensitive_paths(&self) -> bool {
        self.platform.is_windows()
    }
}
