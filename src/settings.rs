//! Run settings from the environment.

use anyhow::{Context, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::artifact::iso::DEFAULT_BOOTLOADER_DIRS;

pub const ENV_CONFIG_PATH: &str = "BUILD_CONFIG_PATH";
pub const ENV_OUTPUT_DIR: &str = "BUILD_OUTPUT_DIR";
pub const ENV_LAYERS_DIR: &str = "BUILD_LAYERS_DIR";
pub const ENV_TMP_DIR: &str = "BUILD_TMP_DIR";
pub const ENV_BOOTLOADER_DIR: &str = "BUILD_BOOTLOADER_DIR";

/// Directory next to the configuration file holding the base layers.
pub const DEFAULT_LAYERS_DIRNAME: &str = "base_layers";

/// Paths a build run works with.
#[derive(Debug, Clone)]
pub struct Settings {
    /// INI file describing the builds.
    pub config_path: PathBuf,

    /// Layer archives and finished ISO images.
    pub output_dir: PathBuf,

    /// One subdirectory per base layer.
    pub layers_dir: PathBuf,

    /// Parent of the per-run scratch directory.
    pub tmp_dir: PathBuf,

    /// Searched in order for the bootloader binaries.
    pub bootloader_dirs: Vec<PathBuf>,
}

impl Settings {
    /// Load settings from environment variables.
    pub fn from_env() -> Result<Self> {
        let exe = std::env::current_exe().context("resolving builder executable path")?;
        let cwd = std::env::current_dir().context("resolving current directory")?;
        Ok(Self::resolve(|name| std::env::var_os(name), &exe, &cwd))
    }

    /// Resolve settings from a variable lookup; unset or empty values fall back
    /// to defaults derived from the executable path and working directory.
    pub fn resolve<F>(lookup: F, exe: &Path, cwd: &Path) -> Self
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let var = |name: &str| {
            lookup(name)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .map(|p| if p.is_absolute() { p } else { cwd.join(p) })
        };

        let config_path = var(ENV_CONFIG_PATH).unwrap_or_else(|| exe.with_extension("ini"));
        let output_dir = var(ENV_OUTPUT_DIR).unwrap_or_else(|| cwd.to_path_buf());
        let layers_dir = var(ENV_LAYERS_DIR).unwrap_or_else(|| {
            config_path
                .parent()
                .unwrap_or(cwd)
                .join(DEFAULT_LAYERS_DIRNAME)
        });
        let tmp_dir = var(ENV_TMP_DIR).unwrap_or_else(std::env::temp_dir);
        let bootloader_dirs = match var(ENV_BOOTLOADER_DIR) {
            Some(dir) => vec![dir],
            None => DEFAULT_BOOTLOADER_DIRS.iter().map(PathBuf::from).collect(),
        };

        Self {
            config_path,
            output_dir,
            layers_dir,
            tmp_dir,
            bootloader_dirs,
        }
    }

    /// Settings with every directory under `root`, for tests and tooling.
    pub fn for_root(root: &Path) -> Self {
        Self {
            config_path: root.join("builds.ini"),
            output_dir: root.join("out"),
            layers_dir: root.join(DEFAULT_LAYERS_DIRNAME),
            tmp_dir: root.join("tmp"),
            bootloader_dirs: vec![root.join("bootloader")],
        }
    }
}
