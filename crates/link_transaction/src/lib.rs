//! Transactional mutation of conda-style environment prefixes.
//!
//! This crate implements the unlink/link transaction engine of a package
//! manager: given, per prefix, a set of installed packages to remove and a
//! set of extracted packages to install, it plans the required filesystem
//! operations, verifies the plan is safe before anything is touched, executes
//! it with bounded parallelism, and rolls the prefixes back when execution
//! fails midway.
//!
//! The main entry point is [`UnlinkLinkTransaction`], driven through
//! `download_and_extract → prepare → verify → execute`:
//!
//! - the [`planner`] turns each [`PrefixSetup`] into ordered groups of
//!   reversible [`action::Action`]s,
//! - the [`verify`] module checks the whole transaction (self-protection of
//!   the package manager, path clobbers, writability) before any destructive
//!   step,
//! - the [`execute`] module walks the groups phase by phase, runs package
//!   scripts at the documented points, and reverses everything already done
//!   when an action fails.
//!
//! Downloading and extracting archives is not part of this crate; it is
//! consumed through the [`fetch::Fetcher`] and [`fetch::PackageCache`]
//! seams.

pub mod action;
pub mod change_report;
pub mod config;
pub mod driver;
pub mod execute;
pub mod fetch;
pub mod link;
pub mod link_script;
pub mod package;
pub mod planner;
pub mod prefix_data;
pub mod python;
pub mod record;
pub mod transaction;
pub mod verify;

#[cfg(test)]
mod test_utils;

pub use config::{SafetyChecks, TransactionConfig};
pub use fetch::{CachedFetcher, DirectoryCache, Fetcher, PackageCache};
pub use link::LinkType;
pub use planner::{ActionGroup, GroupKind, GroupState, Planner, PrefixActionGroup};
pub use python::PythonInfo;
pub use record::{Channel, PackageRecord, PrefixRecord, PrefixSetup, TransactionContext};
pub use transaction::{TransactionError, UnlinkLinkTransaction, VerificationReport};
pub use verify::{VerificationError, Verifier};
