//! Classifying and rendering what a transaction will change.
//!
//! The report diffs the unlink and link sets of one prefix into
//! removed/new/updated/downgraded/superseded buckets and marks which link
//! packages actually have to be downloaded. Rendering is stable: sections are
//! sorted by namekey with the `global:` sentinel ordered first.

use std::{collections::HashSet, path::PathBuf};

use indexmap::IndexMap;
use itertools::Itertools;
use url::Url;

use crate::{
    config::TransactionConfig,
    record::{sortable_namekey, strip_global, PackageRecord},
};

/// The channel name that is elided from display unless channels are
/// explicitly requested.
const DEFAULTS_CHANNEL_NAME: &str = "defaults";

/// The derived diff of one prefix's transaction.
#[derive(Debug)]
pub struct ChangeReport {
    /// The prefix the changes apply to.
    pub prefix: PathBuf,
    /// The specs the user asked to remove.
    pub specs_to_remove: Vec<String>,
    /// The specs the user asked to add or update.
    pub specs_to_add: Vec<String>,
    /// Packages only in the unlink set, keyed by namekey.
    pub removed: IndexMap<String, PackageRecord>,
    /// Packages only in the link set, keyed by namekey.
    pub new: IndexMap<String, PackageRecord>,
    /// Version or build-number increases, keyed by namekey.
    pub updated: IndexMap<String, (PackageRecord, PackageRecord)>,
    /// Version decreases within the same channel and subdir.
    pub downgraded: IndexMap<String, (PackageRecord, PackageRecord)>,
    /// Replacements coming from a different channel or subdir.
    pub superseded: IndexMap<String, (PackageRecord, PackageRecord)>,
    /// Link packages whose archive still has to be downloaded.
    pub fetched: Vec<PackageRecord>,
}

impl ChangeReport {
    /// Diffs the unlink and link sets of a prefix.
    pub fn compute(
        prefix: &std::path::Path,
        unlink_precs: &[PackageRecord],
        link_precs: &[PackageRecord],
        download_urls: &HashSet<Url>,
        specs_to_remove: &[String],
        specs_to_add: &[String],
    ) -> Self {
        let unlink_map: IndexMap<String, &PackageRecord> = unlink_precs
            .iter()
            .map(|prec| (prec.namekey(), prec))
            .collect();
        let link_map: IndexMap<String, &PackageRecord> = link_precs
            .iter()
            .map(|prec| (prec.namekey(), prec))
            .collect();

        let mut removed = IndexMap::new();
        let mut new = IndexMap::new();
        let mut updated = IndexMap::new();
        let mut downgraded = IndexMap::new();
        let mut superseded = IndexMap::new();

        for (namekey, unlink_prec) in &unlink_map {
            if !link_map.contains_key(namekey) {
                removed.insert(namekey.clone(), (*unlink_prec).clone());
            }
        }
        for (namekey, link_prec) in &link_map {
            let Some(unlink_prec) = unlink_map.get(namekey) else {
                new.insert(namekey.clone(), (*link_prec).clone());
                continue;
            };

            let unlink_version = unlink_prec.version.version();
            let link_version = link_prec.version.version();
            let build_number_increases = link_prec.build_number > unlink_prec.build_number;
            if (link_version == unlink_version && build_number_increases)
                || link_version > unlink_version
            {
                updated.insert(
                    namekey.clone(),
                    ((*unlink_prec).clone(), (*link_prec).clone()),
                );
            } else if link_prec.channel.name == unlink_prec.channel.name
                && link_prec.subdir == unlink_prec.subdir
            {
                if link_prec == unlink_prec {
                    // A rebuild of the same package, e.g. noarch python
                    // packages relinked for a python change. Not reported.
                    continue;
                }
                downgraded.insert(
                    namekey.clone(),
                    ((*unlink_prec).clone(), (*link_prec).clone()),
                );
            } else {
                superseded.insert(
                    namekey.clone(),
                    ((*unlink_prec).clone(), (*link_prec).clone()),
                );
            }
        }

        let fetched = link_precs
            .iter()
            .filter(|prec| {
                prec.url
                    .as_ref()
                    .is_some_and(|url| download_urls.contains(url))
            })
            .cloned()
            .collect();

        Self {
            prefix: prefix.to_path_buf(),
            specs_to_remove: specs_to_remove.to_vec(),
            specs_to_add: specs_to_add.to_vec(),
            removed,
            new,
            updated,
            downgraded,
            superseded,
            fetched,
        }
    }

    /// Renders the human-readable package plan.
    pub fn render(&self, config: &TransactionConfig) -> String {
        let mut builder = vec![String::new(), "## Package Plan ##\n".to_string()];
        builder.push(format!("  environment location: {}", self.prefix.display()));
        builder.push(String::new());
        if !self.specs_to_remove.is_empty() {
            builder.push(format!(
                "  removed specs:{}",
                dashlist(self.specs_to_remove.iter().sorted())
            ));
            builder.push(String::new());
        }
        if !self.specs_to_add.is_empty() {
            builder.push(format!(
                "  added / updated specs:{}",
                dashlist(self.specs_to_add.iter().sorted())
            ));
            builder.push(String::new());
        }

        let channel_filter = |name: &str| -> String {
            match config.show_channel_urls {
                Some(false) => String::new(),
                None if name == DEFAULTS_CHANNEL_NAME => String::new(),
                _ => name.to_string(),
            }
        };

        if !self.fetched.is_empty() {
            builder.push("\nThe following packages will be downloaded:\n".to_string());
            let format_row = |left: &str, right: &str| format!("    {left:<27}|{right:>17}");
            builder.push(format_row("package", "build"));
            builder.push(format_row(&"-".repeat(27), &"-".repeat(17)));

            let mut total_bytes = 0;
            for prec in self
                .fetched
                .iter()
                .sorted_by_key(|prec| sortable_namekey(&prec.namekey()))
            {
                let size = prec.size.unwrap_or(0);
                total_bytes += size;
                let mut extra = format!("{:>15}", human_bytes(size));
                let channel = channel_filter(&prec.channel.canonical_name);
                if !channel.is_empty() {
                    extra.push_str("  ");
                    extra.push_str(&channel);
                }
                let name_version = format!(
                    "{}-{}",
                    strip_global(&prec.namekey()),
                    prec.version
                );
                builder.push(format!("{}{extra}", format_row(&name_version, &prec.build)));
            }
            builder.push(format!("    {}", "-".repeat(60)));
            builder.push(format!(
                "{}Total: {:>14}",
                " ".repeat(43),
                human_bytes(total_bytes)
            ));
        }

        if !self.new.is_empty() {
            builder.push("\nThe following NEW packages will be INSTALLED:\n".to_string());
            for namekey in self.new.keys().sorted_by_key(|k| sortable_namekey(k)) {
                let prec = &self.new[namekey];
                builder.push(single_line(strip_global(namekey), &prec.dist_str()));
            }
        }

        if !self.removed.is_empty() {
            builder.push("\nThe following packages will be REMOVED:\n".to_string());
            for namekey in self.removed.keys().sorted_by_key(|k| sortable_namekey(k)) {
                let prec = &self.removed[namekey];
                builder.push(format!(
                    "  {}-{}-{}",
                    prec.name.as_normalized(),
                    prec.version,
                    prec.build
                ));
            }
        }

        for (title, bucket) in [
            ("\nThe following packages will be UPDATED:\n", &self.updated),
            (
                "\nThe following packages will be SUPERSEDED by a higher-priority channel:\n",
                &self.superseded,
            ),
            (
                "\nThe following packages will be DOWNGRADED:\n",
                &self.downgraded,
            ),
        ] {
            if bucket.is_empty() {
                continue;
            }
            builder.push(title.to_string());
            for namekey in bucket.keys().sorted_by_key(|k| sortable_namekey(k)) {
                let (unlink_prec, link_prec) = &bucket[namekey];
                let (left, right) = diff_strs(unlink_prec, link_prec);
                builder.push(double_line(strip_global(namekey), &left, &right));
            }
        }

        builder.push(String::new());
        builder.push(String::new());
        builder.join("\n")
    }
}

/// Renders `old --> new` columns showing only what actually changed.
fn diff_strs(unlink_prec: &PackageRecord, link_prec: &PackageRecord) -> (String, String) {
    let channel_change = unlink_prec.channel.name != link_prec.channel.name;
    let subdir_change = unlink_prec.subdir != link_prec.subdir;
    let version_change = unlink_prec.version != link_prec.version;
    let build_change = unlink_prec.build != link_prec.build;

    let mut left = Vec::new();
    let mut right = Vec::new();
    if channel_change || subdir_change {
        left.push(unlink_prec.channel.name.clone());
        right.push(link_prec.channel.name.clone());
    }
    if subdir_change {
        left.push(format!("/{}", unlink_prec.subdir));
        right.push(format!("/{}", link_prec.subdir));
    }
    if (channel_change || subdir_change) && (version_change || build_change) {
        left.push(format!("::{}-", unlink_prec.name.as_normalized()));
        right.push(format!("::{}-", link_prec.name.as_normalized()));
    }
    if version_change || build_change {
        left.push(format!("{}-{}", unlink_prec.version, unlink_prec.build));
        right.push(format!("{}-{}", link_prec.version, link_prec.build));
    }
    (left.concat(), right.concat())
}

fn single_line(display_key: &str, value: &str) -> String {
    format!("  {:<18} {value}", truncated(display_key, 18))
}

fn double_line(display_key: &str, left: &str, right: &str) -> String {
    format!(
        "  {:<18} {:>38} --> {right}",
        truncated(display_key, 18),
        truncated(left, 38)
    )
}

fn truncated(value: &str, max: usize) -> String {
    if value.len() > max {
        format!("{}~", &value[..max - 1])
    } else {
        value.to_string()
    }
}

fn dashlist<'a>(items: impl Iterator<Item = &'a String>) -> String {
    items.map(|item| format!("\n    - {item}")).collect()
}

/// Formats a byte count the way the download table expects it.
fn human_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let kb = bytes as f64 / 1024.0;
    if kb < 1024.0 {
        return format!("{} KB", kb.round() as u64);
    }
    let mb = kb / 1024.0;
    if mb < 1024.0 {
        return format!("{mb:.1} MB");
    }
    format!("{:.2} GB", mb / 1024.0)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::{
        record::Channel,
        test_utils::{record, test_config},
    };

    #[test]
    fn test_update_and_new_classification() {
        let unlink = vec![record("foo", "1.2", "0")];
        let link = vec![record("foo", "1.2", "1"), record("bar", "0.1", "0")];
        let download_urls: HashSet<Url> = link[1].url.iter().cloned().collect();

        let report = ChangeReport::compute(
            Path::new("/env"),
            &unlink,
            &link,
            &download_urls,
            &[],
            &[],
        );

        assert!(report.removed.is_empty());
        assert_eq!(report.new.len(), 1);
        assert!(report.new.contains_key("global:bar"));
        assert_eq!(report.updated.len(), 1);
        let (old, new) = &report.updated["global:foo"];
        assert_eq!(old.build, "0");
        assert_eq!(new.build, "1");
        assert_eq!(report.fetched.len(), 1);
        assert_eq!(report.fetched[0].name.as_normalized(), "bar");
    }

    #[test]
    fn test_version_increase_is_update() {
        let unlink = vec![record("foo", "1.2", "0")];
        let link = vec![record("foo", "1.10", "0")];
        let report = ChangeReport::compute(
            Path::new("/env"),
            &unlink,
            &link,
            &HashSet::new(),
            &[],
            &[],
        );
        // Conda version ordering: 1.10 > 1.2.
        assert_eq!(report.updated.len(), 1);
        assert!(report.downgraded.is_empty());
    }

    #[test]
    fn test_downgrade_and_supersede() {
        // Same channel: a version decrease is a downgrade.
        let report = ChangeReport::compute(
            Path::new("/env"),
            &[record("foo", "2.0", "0")],
            &[record("foo", "1.0", "0")],
            &HashSet::new(),
            &[],
            &[],
        );
        assert_eq!(report.downgraded.len(), 1);

        // Different channel: superseded instead.
        let mut from_other_channel = record("foo", "1.0", "0");
        from_other_channel.channel = Channel::named("other-channel");
        let report = ChangeReport::compute(
            Path::new("/env"),
            &[record("foo", "2.0", "0")],
            &[from_other_channel],
            &HashSet::new(),
            &[],
            &[],
        );
        assert_eq!(report.superseded.len(), 1);
        assert!(report.downgraded.is_empty());
    }

    #[test]
    fn test_identical_precs_are_dropped() {
        let prec = record("foo", "1.0", "0");
        let report = ChangeReport::compute(
            Path::new("/env"),
            std::slice::from_ref(&prec),
            std::slice::from_ref(&prec),
            &HashSet::new(),
            &[],
            &[],
        );
        assert!(report.updated.is_empty());
        assert!(report.downgraded.is_empty());
        assert!(report.superseded.is_empty());
        assert!(report.removed.is_empty());
        assert!(report.new.is_empty());
    }

    #[test]
    fn test_render_sections() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let link = vec![record("bar", "0.1", "0")];
        let download_urls: HashSet<Url> = link[0].url.iter().cloned().collect();
        let report = ChangeReport::compute(
            Path::new("/env"),
            &[record("foo", "1.0", "0")],
            &link,
            &download_urls,
            &["foo".to_string()],
            &["bar".to_string()],
        );
        let rendered = report.render(&config);
        assert!(rendered.contains("## Package Plan ##"));
        assert!(rendered.contains("environment location: /env"));
        assert!(rendered.contains("removed specs:"));
        assert!(rendered.contains("The following packages will be downloaded:"));
        assert!(rendered.contains("The following NEW packages will be INSTALLED:"));
        assert!(rendered.contains("The following packages will be REMOVED:"));
        assert!(rendered.contains("foo-1.0-0"));
        assert!(rendered.contains("Total:"));
    }

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2048), "2 KB");
        assert_eq!(human_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(human_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }
}
