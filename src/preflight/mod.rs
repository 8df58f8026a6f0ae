//! Preflight checks for a build run.
//!
//! Validates that the host has the required tools, that the process runs as
//! root, and that the layer and output directories are usable before any build
//! work starts.
//!
//! # Example
//!
//! ```rust
//! use livecd_builder::preflight::{check_required_tools, command_exists, REQUIRED_TOOLS};
//!
//! if !command_exists("mkisofs") {
//!     println!("install genisoimage to produce images");
//! }
//!
//! if let Err(err) = check_required_tools(REQUIRED_TOOLS) {
//!     eprintln!("{err}");
//! }
//! ```

use anyhow::{bail, Context, Result};
use std::fs;

use crate::settings::Settings;

/// Whether `cmd` resolves on `PATH`.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Host tools every build run needs, as `(command, package)`.
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("mkisofs", "genisoimage"),
    ("chroot", "coreutils"),
];

/// Needed only when a selected build clones a provisioning repository.
pub const GIT_TOOL: (&str, &str) = ("git", "git");

/// Fail with one line per missing command, naming the package that ships it.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<String> = tools
        .iter()
        .filter(|(command, _)| !command_exists(command))
        .map(|(command, package)| format!("  {command} (package: {package})"))
        .collect();

    if !missing.is_empty() {
        bail!("host tools not found on PATH:\n{}", missing.join("\n"));
    }
    Ok(())
}

/// Check the tools for a run; `needs_git` adds git.
pub fn check_host_tools(needs_git: bool) -> Result<()> {
    let mut tools = REQUIRED_TOOLS.to_vec();
    if needs_git {
        tools.push(GIT_TOOL);
    }
    check_required_tools(&tools)
}

/// chroot and ownership-preserving unpacks need root.
pub fn check_root() -> Result<()> {
    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        bail!("building images requires root privileges (running as uid {euid})");
    }
    Ok(())
}

/// The layers directory must exist; output and temp directories are created.
pub fn check_directories(settings: &Settings) -> Result<()> {
    if !settings.layers_dir.is_dir() {
        bail!(
            "base layers directory '{}' does not exist (set BUILD_LAYERS_DIR)",
            settings.layers_dir.display()
        );
    }
    fs::create_dir_all(&settings.output_dir).with_context(|| {
        format!(
            "creating output directory '{}'",
            settings.output_dir.display()
        )
    })?;
    fs::create_dir_all(&settings.tmp_dir).with_context(|| {
        format!(
            "creating temporary directory '{}'",
            settings.tmp_dir.display()
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn shell_is_found_and_garbage_is_not() {
        assert!(command_exists("sh"));
        assert!(!command_exists("livecd-builder-no-such-tool"));
    }

    #[test]
    fn missing_tools_are_listed_with_packages() {
        assert!(check_required_tools(&[("sh", "dash")]).is_ok());

        let err = check_required_tools(&[
            ("sh", "dash"),
            ("livecd-builder-no-such-tool", "imaginary"),
        ])
        .unwrap_err()
        .to_string();
        assert!(err.contains("livecd-builder-no-such-tool (package: imaginary)"), "{err}");
        assert!(!err.contains("dash"), "{err}");
    }

    #[test]
    fn layers_dir_must_exist_and_work_dirs_are_created() {
        let tmp = TempDir::new().unwrap();
        let mut settings = Settings::for_root(tmp.path());

        assert!(check_directories(&settings).is_err());

        fs::create_dir_all(&settings.layers_dir).unwrap();
        settings.output_dir = tmp.path().join("nested/out");
        check_directories(&settings).unwrap();
        assert!(settings.output_dir.is_dir());
        assert!(settings.tmp_dir.is_dir());
    }
}
