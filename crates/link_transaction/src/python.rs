//! Information about the python distribution a transaction targets.
//!
//! Byte-code compilation and entry-point generation are parameterized by the
//! python that will be present in the prefix once the transaction finished.

use std::{
    borrow::Cow,
    path::{Path, PathBuf},
};

use rattler_conda_types::{Platform, Version};

/// Describes the python interpreter that will live in the target prefix.
#[derive(Debug, Clone)]
pub struct PythonInfo {
    /// The platform the prefix is used on.
    pub platform: Platform,

    /// The major and minor version of the interpreter.
    pub short_version: (u64, u64),

    /// Path of the interpreter relative to the prefix.
    pub path: PathBuf,

    /// Path of the site-packages directory relative to the prefix.
    pub site_packages_path: PathBuf,

    /// Directory entry points are generated into, relative to the prefix.
    pub bin_dir: PathBuf,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PythonInfoError {
    /// The version of the python package had no major/minor component.
    #[error("invalid python version '{0}'")]
    InvalidVersion(String),
}

impl PythonInfo {
    /// Builds an instance from the version of the python package being
    /// installed and the platform it is installed for.
    pub fn from_version(version: &Version, platform: Platform) -> Result<Self, PythonInfoError> {
        let (major, minor) = version
            .as_major_minor()
            .ok_or_else(|| PythonInfoError::InvalidVersion(version.to_string()))?;
        Ok(Self::from_short_version((major, minor), platform))
    }

    /// Builds an instance from an already-known `major.minor` pair.
    pub fn from_short_version(short_version: (u64, u64), platform: Platform) -> Self {
        let (major, minor) = short_version;
        let path = if platform.is_windows() {
            PathBuf::from("python.exe")
        } else {
            PathBuf::from(format!("bin/python{major}.{minor}"))
        };
        let site_packages_path = if platform.is_windows() {
            PathBuf::from("Lib/site-packages")
        } else {
            PathBuf::from(format!("lib/python{major}.{minor}/site-packages"))
        };
        let bin_dir = if platform.is_windows() {
            PathBuf::from("Scripts")
        } else {
            PathBuf::from("bin")
        };
        Self {
            platform,
            short_version,
            path,
            site_packages_path,
            bin_dir,
        }
    }

    /// Constructs a shebang that runs the rest of the file as python.
    pub fn shebang(&self, target_prefix: &Path) -> String {
        let target_path = target_prefix.join(&self.path);
        let target_path = target_path.to_string_lossy().replace('\\', "/");

        // Shebang lines longer than 127 bytes or containing spaces are not
        // reliably honored by kernels; fall back to the sh trampoline.
        if target_path.len() > 127 - 2 || target_path.contains(' ') {
            format!("#!/bin/sh\n'''exec' \"{target_path}\" \"$0\" \"$@\" #'''")
        } else {
            format!("#!{target_path}")
        }
    }

    /// Maps a path inside a noarch python package onto its location in the
    /// prefix: `site-packages/` moves under the versioned site-packages
    /// directory, `python-scripts/` into the binary directory.
    pub fn noarch_target_path<'a>(&self, relative_path: &'a Path) -> Cow<'a, Path> {
        if let Ok(rest) = relative_path.strip_prefix("site-packages") {
            self.site_packages_path.join(rest).into()
        } else if let Ok(rest) = relative_path.strip_prefix("python-scripts") {
            self.bin_dir.join(rest).into()
        } else {
            relative_path.into()
        }
    }

    /// The location of the byte-code file the interpreter would produce for
    /// `py_path`, e.g. `pkg/mod.py` becomes
    /// `pkg/__pycache__/mod.cpython-39.pyc`.
    pub fn pyc_path(&self, py_path: &Path) -> PathBuf {
        let (major, minor) = self.short_version;
        let stem = py_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file_name = format!("{stem}.cpython-{major}{minor}.pyc");
        match py_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                parent.join("__pycache__").join(file_name)
            }
            _ => PathBuf::from("__pycache__").join(file_name),
        }
    }

    /// Generates the executable python source for an entry point.
    pub fn entry_point_template(
        &self,
        target_prefix: &Path,
        command_module: &str,
        command_function: &str,
    ) -> String {
        let shebang = self.shebang(target_prefix);
        let import_name = command_function
            .split_once('.')
            .map_or(command_function, |(head, _)| head);
        format!(
            "{shebang}\n\
             # -*- coding: utf-8 -*-\n\
             import re\n\
             import sys\n\n\
             from {command_module} import {import_name}\n\n\
             if __name__ == '__main__':\n\
             \tsys.argv[0] = re.sub(r'(-script\\.pyw?|\\.exe)?$', '', sys.argv[0])\n\
             \tsys.exit({command_function}())\n"
        )
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_site_packages_path() {
        let info = PythonInfo::from_version(
            &Version::from_str("3.9.1").unwrap(),
            Platform::Linux64,
        )
        .unwrap();
        assert_eq!(info.short_version, (3, 9));
        assert_eq!(
            info.site_packages_path,
            PathBuf::from("lib/python3.9/site-packages")
        );
        assert_eq!(info.path, PathBuf::from("bin/python3.9"));
    }

    #[test]
    fn test_noarch_target_path() {
        let info = PythonInfo::from_short_version((3, 10), Platform::Linux64);
        assert_eq!(
            info.noarch_target_path(Path::new("site-packages/foo/__init__.py")),
            Cow::<Path>::Owned(PathBuf::from(
                "lib/python3.10/site-packages/foo/__init__.py"
            ))
        );
        assert_eq!(
            info.noarch_target_path(Path::new("python-scripts/tool")),
            Cow::<Path>::Owned(PathBuf::from("bin/tool"))
        );
        assert_eq!(
            info.noarch_target_path(Path::new("share/doc.txt")),
            Cow::<Path>::Borrowed(Path::new("share/doc.txt"))
        );
    }

    #[test]
    fn test_pyc_path() {
        let info = PythonInfo::from_short_version((3, 9), Platform::Linux64);
        assert_eq!(
            info.pyc_path(Path::new("lib/python3.9/site-packages/foo/mod.py")),
            PathBuf::from("lib/python3.9/site-packages/foo/__pycache__/mod.cpython-39.pyc")
        );
    }

    #[test]
    fn test_entry_point_template() {
        let info = PythonInfo::from_short_version((3, 11), Platform::Linux64);
        let script = info.entry_point_template(Path::new("/prefix"), "jupyterlab.labapp", "main");
        assert!(script.starts_with("#!/prefix/bin/python3.11\n"));
        assert!(script.contains("from jupyterlab.labapp import main"));
        assert!(script.contains("sys.exit(main())"));
    }
}
