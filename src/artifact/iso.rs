//! ISO image assembly.
//!
//! Images boot through isolinux. The base layer's pre-image script writes the
//! kernel, initrd, squashed root filesystem and `isolinux/isolinux.cfg` into
//! the image directory; this module stages the bootloader binaries next to that
//! config and builds the `mkisofs` command line.

use anyhow::{bail, Context, Result};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

/// Directory inside the image holding the bootloader.
pub const ISOLINUX_DIR: &str = "isolinux";

/// Bootloader binaries copied into [`ISOLINUX_DIR`] for every image.
pub const BOOTLOADER_FILES: &[&str] = &["isolinux.bin", "ldlinux.c32"];

/// Where distributions install the syslinux binaries.
pub const DEFAULT_BOOTLOADER_DIRS: &[&str] = &[
    "/usr/lib/ISOLINUX",
    "/usr/lib/syslinux/modules/bios",
    "/usr/lib/syslinux/bios",
    "/usr/lib/syslinux",
    "/usr/share/syslinux",
];

/// ISO volume labels are limited to 32 characters.
const MAX_LABEL_LEN: usize = 32;

/// Options for building an ISO image.
#[derive(Debug, Clone)]
pub struct IsoOptions<'a> {
    /// Volume label.
    pub label: &'a str,

    /// El Torito boot image, relative to the image root.
    pub boot_image: &'a str,

    /// Boot catalog written by mkisofs, relative to the image root.
    pub boot_catalog: &'a str,
}

impl<'a> IsoOptions<'a> {
    /// Create options for an isolinux-booted image.
    pub fn isolinux(label: &'a str) -> Self {
        Self {
            label,
            boot_image: "isolinux/isolinux.bin",
            boot_catalog: "isolinux/boot.cat",
        }
    }
}

/// Volume label derived from a build name.
pub fn volume_label(build_name: &str) -> String {
    build_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .take(MAX_LABEL_LEN)
        .collect()
}

/// Arguments for `mkisofs` writing `output` from `image_dir`.
pub fn mkisofs_args(image_dir: &Path, output: &Path, options: &IsoOptions) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    args.push("-o".into());
    args.push(output.into());
    args.extend(
        [
            "-b",
            options.boot_image,
            "-c",
            options.boot_catalog,
            "-no-emul-boot",
            "-boot-load-size",
            "4",
            "-boot-info-table",
            "-J",
            "-R",
            "-V",
            options.label,
        ]
        .into_iter()
        .map(OsString::from),
    );
    args.push(image_dir.into());
    args
}

/// Find a bootloader file in the first search directory that has it.
pub fn locate_bootloader_file(name: &str, search_dirs: &[PathBuf]) -> Option<PathBuf> {
    search_dirs
        .iter()
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Copy [`BOOTLOADER_FILES`] into `<image_dir>/isolinux/`.
pub fn stage_bootloader(image_dir: &Path, search_dirs: &[PathBuf]) -> Result<()> {
    let dest_dir = image_dir.join(ISOLINUX_DIR);
    fs::create_dir_all(&dest_dir)
        .with_context(|| format!("creating bootloader directory '{}'", dest_dir.display()))?;

    for name in BOOTLOADER_FILES {
        let Some(source) = locate_bootloader_file(name, search_dirs) else {
            let searched = search_dirs
                .iter()
                .map(|d| d.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            bail!("bootloader file '{name}' not found (searched: {searched})");
        };
        let dest = dest_dir.join(name);
        fs::copy(&source, &dest).with_context(|| {
            format!(
                "copying bootloader file '{}' to '{}'",
                source.display(),
                dest.display()
            )
        })?;
    }

    Ok(())
}
