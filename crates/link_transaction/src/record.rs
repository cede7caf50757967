//! The data model of a transaction: package records, installed records and
//! the per-prefix intent that is handed to the planner.

use std::path::PathBuf;

use rattler_conda_types::{MatchSpec, PackageName, VersionWithSource};
use serde::{Deserialize, Serialize};
use url::Url;

/// Namekeys of ordinary packages carry this sentinel. It exists so that
/// ordinary packages sort apart from (historical) private-environment entries
/// and is re-ordered to sort first when rendering.
pub const GLOBAL_NAMEKEY_PREFIX: &str = "global:";

/// The channel a package was served from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Short display name, e.g. `conda-forge`.
    pub name: String,

    /// Fully qualified name used in dist strings.
    pub canonical_name: String,
}

impl Channel {
    /// A channel with equal short and canonical names.
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            canonical_name: name.clone(),
            name,
        }
    }
}

/// Identity and provenance of a single package instance. Immutable once
/// constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageRecord {
    /// The name of the package.
    pub name: PackageName,

    /// The version of the package.
    pub version: VersionWithSource,

    /// The build string, e.g. `py39h06a4308_0`.
    pub build: String,

    /// The build number of the package.
    #[serde(default)]
    pub build_number: u64,

    /// The channel the package came from.
    pub channel: Channel,

    /// The platform subdirectory within the channel.
    pub subdir: String,

    /// Download location of the package archive, if known.
    #[serde(default)]
    pub url: Option<Url>,

    /// Match spec strings of the packages this package depends on.
    #[serde(default)]
    pub depends: Vec<String>,

    /// The archive size in bytes, if known.
    #[serde(default)]
    pub size: Option<u64>,

    /// Whether this is a noarch python package, i.e. python source that is
    /// relocated into `site-packages` and byte-compiled on the target.
    #[serde(default)]
    pub noarch_python: bool,
}

impl PackageRecord {
    /// Canonical grouping key for this record.
    pub fn namekey(&self) -> String {
        format!("{GLOBAL_NAMEKEY_PREFIX}{}", self.name.as_normalized())
    }

    /// Renders `channel::name-version-build`, the canonical human-readable
    /// identity of this record.
    pub fn dist_str(&self) -> String {
        if self.channel.canonical_name.is_empty() {
            format!("{}-{}-{}", self.name.as_normalized(), self.version, self.build)
        } else {
            format!(
                "{}::{}-{}-{}",
                self.channel.canonical_name,
                self.name.as_normalized(),
                self.version,
                self.build
            )
        }
    }

    /// The file name of the installed-record document in `conda-meta/`.
    pub fn record_file_name(&self) -> String {
        format!(
            "{}-{}-{}.json",
            self.name.as_normalized(),
            self.version,
            self.build
        )
    }

    /// The directory name of this package's entry in the package cache.
    pub fn cache_entry_name(&self) -> String {
        format!(
            "{}-{}-{}",
            self.name.as_normalized(),
            self.version,
            self.build
        )
    }

    /// True when this record is the python interpreter itself.
    pub fn is_python(&self) -> bool {
        self.name.as_normalized() == "python"
    }
}

/// An installed package: its record plus everything only known once the
/// package is on disk. Serialized as `conda-meta/<dist>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefixRecord {
    /// The identity of the installed package.
    #[serde(flatten)]
    pub record: PackageRecord,

    /// All files belonging to this package, relative to the prefix root.
    #[serde(default)]
    pub files: Vec<PathBuf>,

    /// The user-requested spec that brought this package in, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_spec: Option<String>,
}

impl PrefixRecord {
    /// The file name of this record in `conda-meta/`.
    pub fn file_name(&self) -> String {
        self.record.record_file_name()
    }
}

/// One unit of intent for one prefix. Immutable input to the planner.
#[derive(Debug, Clone)]
pub struct PrefixSetup {
    /// The environment to mutate.
    pub target_prefix: PathBuf,

    /// Packages to remove from the prefix.
    pub unlink_precs: Vec<PackageRecord>,

    /// Packages to install into the prefix.
    pub link_precs: Vec<PackageRecord>,

    /// The specs the user asked to remove.
    pub remove_specs: Vec<MatchSpec>,

    /// The specs the user asked to add or update.
    pub update_specs: Vec<MatchSpec>,
}

/// Per-transaction scratch state. Created at `prepare`, populated by the
/// planner, torn down when `execute` finishes.
#[derive(Debug, Clone)]
pub struct TransactionContext {
    /// `major.minor` of the python that will be present once the transaction
    /// finished, if any.
    pub target_python_version: Option<(u64, u64)>,

    /// The site-packages directory relative to the prefix, when python is
    /// present.
    pub target_site_packages_short_path: Option<PathBuf>,

    /// Scratch directory inside the target prefix. Owned exclusively by the
    /// transaction and removed when it ends.
    pub temp_dir: PathBuf,
}

impl TransactionContext {
    /// Context for a transaction on `target_prefix` with no python knowledge
    /// yet.
    pub fn new(target_prefix: &std::path::Path) -> Self {
        Self {
            target_python_version: None,
            target_site_packages_short_path: None,
            temp_dir: target_prefix.join(".condatmp"),
        }
    }
}

/// Maps a namekey to a string that sorts the `global:` sentinel first.
pub(crate) fn sortable_namekey(namekey: &str) -> String {
    match namekey.strip_prefix(GLOBAL_NAMEKEY_PREFIX) {
        Some(rest) => format!("0:{rest}"),
        None => namekey.to_string(),
    }
}

/// Strips the `global:` sentinel for display.
pub(crate) fn strip_global(namekey: &str) -> &str {
    namekey.strip_prefix(GLOBAL_NAMEKEY_PREFIX).unwrap_or(namekey)
}

/// Extracts the package name a match spec constrains. Specs are treated as
/// opaque beyond their leading name token, which is also how `depends`
/// entries (`"python >=3.9"`) reduce to a name.
pub(crate) fn spec_name(spec: &MatchSpec) -> Option<String> {
    leading_name_token(&spec.to_string())
}

/// The leading package-name token of a spec string, lower-cased.
pub(crate) fn leading_name_token(spec_str: &str) -> Option<String> {
    let spec_str = spec_str.trim();
    // Drop a `channel::` qualifier if present.
    let spec_str = spec_str
        .rsplit_once("::")
        .map_or(spec_str, |(_, rest)| rest);
    let token: String = spec_str
        .chars()
        .take_while(|c| !c.is_whitespace() && !"=<>!~,;[(".contains(*c))
        .collect();
    if token.is_empty() {
        None
    } else {
        Some(token.to_ascii_lowercase())
    }
}
