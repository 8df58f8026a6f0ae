//! Root filesystem archives.
//!
//! Base layers are stored as gzip-compressed tarballs. Ownership, modes,
//! mtimes, symlinks and device nodes are kept so an unpacked layer is a usable
//! chroot.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::BufReader;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tar::{Builder as TarBuilder, EntryType, HeaderMode};
use walkdir::WalkDir;

/// Archive the contents of `src_dir` (not the directory itself) as `.tar.gz`.
pub fn create_tar_gz(src_dir: &Path, out_path: &Path) -> Result<()> {
    let out = File::create(out_path)
        .with_context(|| format!("Failed to create {}", out_path.display()))?;
    let encoder = GzEncoder::new(out, Compression::default());
    let mut builder = TarBuilder::new(encoder);

    // Collect paths deterministically.
    let mut entries: Vec<PathBuf> = vec![];
    for ent in WalkDir::new(src_dir).follow_links(false) {
        let ent = ent.with_context(|| format!("Failed to walk {}", src_dir.display()))?;
        if ent.path() == src_dir {
            continue;
        }
        entries.push(ent.into_path());
    }
    entries.sort_by(|a, b| {
        let ra = a.strip_prefix(src_dir).unwrap_or(a).to_string_lossy();
        let rb = b.strip_prefix(src_dir).unwrap_or(b).to_string_lossy();
        ra.cmp(&rb)
    });

    for p in entries {
        let rel = p.strip_prefix(src_dir).unwrap_or(&p).to_path_buf();
        let md = fs::symlink_metadata(&p)
            .with_context(|| format!("Failed to stat {}", p.display()))?;
        let file_type = md.file_type();
        if file_type.is_socket() {
            continue;
        }

        let mut header = tar::Header::new_gnu();
        header.set_metadata_in_mode(&md, HeaderMode::Complete);

        if file_type.is_symlink() {
            let target = fs::read_link(&p)
                .with_context(|| format!("Failed to read link {}", p.display()))?;
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            builder
                .append_link(&mut header, &rel, &target)
                .with_context(|| format!("Failed to archive {}", p.display()))?;
        } else if file_type.is_file() {
            let mut f =
                File::open(&p).with_context(|| format!("Failed to open {}", p.display()))?;
            builder
                .append_data(&mut header, &rel, &mut f)
                .with_context(|| format!("Failed to archive {}", p.display()))?;
        } else {
            // Directories, device nodes and fifos carry no data.
            header.set_size(0);
            builder
                .append_data(&mut header, &rel, std::io::empty())
                .with_context(|| format!("Failed to archive {}", p.display()))?;
        }
    }

    let encoder = builder
        .into_inner()
        .with_context(|| "Failed to finalize tar builder")?;
    encoder
        .finish()
        .with_context(|| format!("Failed to finish {}", out_path.display()))?;
    Ok(())
}

/// Unpack a `.tar.gz` created by [`create_tar_gz`] into `dest_dir`.
pub fn extract_tar_gz(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    fs::create_dir_all(dest_dir)
        .with_context(|| format!("Failed to create {}", dest_dir.display()))?;

    let f = File::open(archive_path)
        .with_context(|| format!("Failed to open {}", archive_path.display()))?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(f)));
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);
    archive.unpack(dest_dir).with_context(|| {
        format!(
            "Failed to unpack {} into {}",
            archive_path.display(),
            dest_dir.display()
        )
    })?;
    Ok(())
}

/// Unique sibling name for in-progress writes.
pub(crate) fn tmp_name(prefix: &str) -> String {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{prefix}.partial-{}-{n}", std::process::id())
}

pub(crate) fn atomic_rename(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_e) => {
            // Fall back to copy+remove (e.g. EXDEV).
            fs::copy(src, dst).with_context(|| {
                format!("Failed to copy {} to {}", src.display(), dst.display())
            })?;
            fs::remove_file(src)
                .with_context(|| format!("Failed to remove tmp {}", src.display()))?;
            Ok(())
        }
    }
}
