//! Base layer cache.
//!
//! A base layer is a directory under the layers root holding a `.build.sh`
//! script (and optionally a `.pre_image.sh`). The script populates an empty
//! directory with a root filesystem; the result is archived to
//! `{name}-{tool_version}-{hash}.tar.gz` in the output directory, where `hash`
//! covers every file of the layer directory except the pre-image script.
//!
//! The archives are the durable cache: a later run with unchanged layer files
//! finds the archive and skips the build script entirely. Within one run each
//! layer is attempted at most once; a failure is remembered and returned to
//! every later caller.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::archive::{atomic_rename, create_tar_gz, tmp_name};
use crate::hash;
use crate::interrupt::Interrupt;
use crate::tools::HostTools;

/// Script that builds a layer. Takes the directory to populate.
pub const BUILD_SCRIPT: &str = ".build.sh";

/// Optional finalization script. Takes the chroot and image directories.
pub const PRE_IMAGE_SCRIPT: &str = ".pre_image.sh";

pub const ARCHIVE_SUFFIX: &str = ".tar.gz";

/// Version stamped into archive names so a new builder never reuses archives
/// produced by an older one.
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// How often a run waiting on another run's archive checks for Ctrl-C.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayerError {
    #[error("base layer '{layer}' is missing: {reason}")]
    Missing { layer: String, reason: String },

    #[error("base layer '{layer}' failed to build: {reason}")]
    BuildFailed { layer: String, reason: String },

    #[error("interrupted while waiting for base layer '{layer}'")]
    Interrupted { layer: String },
}

impl LayerError {
    fn build_failed(layer: &str, err: anyhow::Error) -> Self {
        LayerError::BuildFailed {
            layer: layer.to_string(),
            reason: format!("{err:#}"),
        }
    }
}

/// Resolves layer names to archive paths, building layers on demand.
#[derive(Debug)]
pub struct LayerCache {
    layers_dir: PathBuf,
    output_dir: PathBuf,
    scratch_dir: PathBuf,
    tool_version: String,
    interrupt: Interrupt,
    resolved: BTreeMap<String, Result<PathBuf, LayerError>>,
}

impl LayerCache {
    /// `scratch_dir` receives the temporary build trees.
    pub fn new(layers_dir: &Path, output_dir: &Path, scratch_dir: &Path) -> Self {
        Self {
            layers_dir: layers_dir.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            scratch_dir: scratch_dir.to_path_buf(),
            tool_version: TOOL_VERSION.to_string(),
            interrupt: Interrupt::new(),
            resolved: BTreeMap::new(),
        }
    }

    pub fn with_tool_version(mut self, version: &str) -> Self {
        self.tool_version = version.to_string();
        self
    }

    /// Stop waiting on another run's archive lock once `interrupt` is raised.
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn layer_dir(&self, layer: &str) -> PathBuf {
        self.layers_dir.join(layer)
    }

    /// The layer's pre-image script, if it has one.
    pub fn pre_image_script(&self, layer: &str) -> Option<PathBuf> {
        let path = self.layer_dir(layer).join(PRE_IMAGE_SCRIPT);
        path.is_file().then_some(path)
    }

    /// Content hash of the layer directory.
    pub fn layer_hash(&self, layer: &str) -> Result<String> {
        hash::hash_tree(&self.layer_dir(layer), &[PRE_IMAGE_SCRIPT])
    }

    pub fn archive_name(&self, layer: &str, hash: &str) -> String {
        format!("{layer}-{}-{hash}{ARCHIVE_SUFFIX}", self.tool_version)
    }

    /// Path of a ready archive for `layer`, building it if necessary.
    pub fn resolve(&mut self, layer: &str, tools: &dyn HostTools) -> Result<PathBuf, LayerError> {
        if let Some(cached) = self.resolved.get(layer) {
            debug!(layer = %layer, "Base layer already resolved in this run");
            return cached.clone();
        }

        let result = self.resolve_uncached(layer, tools);
        if let Err(err) = &result {
            warn!(layer = %layer, error = %err, "Base layer unavailable for the rest of this run");
        }
        self.resolved.insert(layer.to_string(), result.clone());
        result
    }

    fn resolve_uncached(&self, layer: &str, tools: &dyn HostTools) -> Result<PathBuf, LayerError> {
        if matches!(layer, "" | "." | "..") || layer.contains('/') {
            return Err(LayerError::Missing {
                layer: layer.to_string(),
                reason: format!(
                    "not a directory name under '{}'",
                    self.layers_dir.display()
                ),
            });
        }
        let layer_dir = self.layer_dir(layer);
        if !layer_dir.is_dir() {
            return Err(LayerError::Missing {
                layer: layer.to_string(),
                reason: format!("directory '{}' does not exist", layer_dir.display()),
            });
        }
        let script = layer_dir.join(BUILD_SCRIPT);
        if !script.is_file() {
            return Err(LayerError::Missing {
                layer: layer.to_string(),
                reason: format!("build script '{}' not found", script.display()),
            });
        }

        let hash = self
            .layer_hash(layer)
            .map_err(|e| LayerError::build_failed(layer, e.context("hashing layer files")))?;
        let archive = self.output_dir.join(self.archive_name(layer, &hash));

        if is_usable_archive(&archive) {
            info!(layer = %layer, archive = %archive.display(), "Reusing cached base layer");
            return Ok(archive);
        }

        let Some(_lock) = acquire_lock(&archive, &self.interrupt)
            .map_err(|e| LayerError::build_failed(layer, e))?
        else {
            return Err(LayerError::Interrupted {
                layer: layer.to_string(),
            });
        };
        // Another invocation may have finished the archive while we waited.
        if is_usable_archive(&archive) {
            info!(layer = %layer, archive = %archive.display(), "Base layer archived by a concurrent run");
            return Ok(archive);
        }

        info!(layer = %layer, hash = %hash, "Building base layer");
        self.build_archive(layer, &script, &archive, tools)
            .map_err(|e| LayerError::build_failed(layer, e))?;
        info!(layer = %layer, archive = %archive.display(), "Base layer archived");
        Ok(archive)
    }

    fn build_archive(
        &self,
        layer: &str,
        script: &Path,
        archive: &Path,
        tools: &dyn HostTools,
    ) -> Result<()> {
        let build_dir = self.scratch_dir.join(format!("layer-{layer}"));
        if build_dir.exists() {
            fs::remove_dir_all(&build_dir).with_context(|| {
                format!("removing stale layer build directory '{}'", build_dir.display())
            })?;
        }
        fs::create_dir_all(&build_dir).with_context(|| {
            format!("creating layer build directory '{}'", build_dir.display())
        })?;

        tools.run_layer_build(script, &build_dir)?;

        let file_name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| layer.to_string());
        let tmp = self.output_dir.join(tmp_name(&format!(".{file_name}")));
        if let Err(err) = create_tar_gz(&build_dir, &tmp) {
            let _ = fs::remove_file(&tmp);
            return Err(err.context("archiving layer build output"));
        }
        atomic_rename(&tmp, archive)?;

        if let Err(err) = fs::remove_dir_all(&build_dir) {
            debug!(dir = %build_dir.display(), error = %err, "Leaving layer build directory for run cleanup");
        }
        Ok(())
    }
}

fn is_usable_archive(path: &Path) -> bool {
    fs::metadata(path)
        .map(|md| md.is_file() && md.len() > 0)
        .unwrap_or(false)
}

/// Exclusive advisory lock held while an archive is produced.
///
/// Lock files stay on disk: unlinking one while another process waits on it
/// would let a newcomer lock a fresh inode at the same path.
#[derive(Debug)]
struct ArchiveLock {
    _file: File,
}

/// `None` when `interrupt` was raised while another run held the lock.
fn acquire_lock(archive: &Path, interrupt: &Interrupt) -> Result<Option<ArchiveLock>> {
    let mut lock_path = archive.as_os_str().to_owned();
    lock_path.push(".lock");
    let lock_path = PathBuf::from(lock_path);

    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .with_context(|| format!("Failed to create lock file: {}", lock_path.display()))?;

    let contended = fs2::lock_contended_error().raw_os_error();
    let mut waiting = false;
    loop {
        match lock_file.try_lock_exclusive() {
            Ok(()) => return Ok(Some(ArchiveLock { _file: lock_file })),
            Err(err) if err.raw_os_error() == contended => {}
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to lock {}", lock_path.display()))
            }
        }
        if interrupt.is_raised() {
            return Ok(None);
        }
        if !waiting {
            info!(lock = %lock_path.display(), "Waiting for another run to finish this archive");
            waiting = true;
        }
        thread::sleep(LOCK_POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::iso::IsoOptions;
    use std::cell::RefCell;
    use tempfile::TempDir;

    /// Counts build script runs; writes a tiny rootfs or fails on request.
    #[derive(Default)]
    struct ScriptRecorder {
        runs: RefCell<Vec<PathBuf>>,
        fail: bool,
    }

    impl HostTools for ScriptRecorder {
        fn run_layer_build(&self, script: &Path, build_dir: &Path) -> Result<()> {
            self.runs.borrow_mut().push(script.to_path_buf());
            if self.fail {
                anyhow::bail!("build script '{}' failed with exit code 1", script.display());
            }
            fs::create_dir_all(build_dir.join("etc"))?;
            fs::write(build_dir.join("etc/os-release"), b"ID=test\n")?;
            Ok(())
        }
        fn git_clone(&self, _: &str, _: u32, _: &Path) -> Result<()> {
            unreachable!()
        }
        fn git_checkout(&self, _: &Path, _: &str) -> Result<()> {
            unreachable!()
        }
        fn git_short_head(&self, _: &Path) -> Result<String> {
            unreachable!()
        }
        fn run_in_chroot(&self, _: &Path, _: &Path, _: &Path) -> Result<()> {
            unreachable!()
        }
        fn run_pre_image(&self, _: &Path, _: &Path, _: &Path) -> Result<()> {
            unreachable!()
        }
        fn make_iso(&self, _: &Path, _: &Path, _: &IsoOptions) -> Result<()> {
            unreachable!()
        }
    }

    struct Fixture {
        _tmp: TempDir,
        layers: PathBuf,
        output: PathBuf,
        scratch: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let layers = tmp.path().join("layers");
        let output = tmp.path().join("out");
        let scratch = tmp.path().join("scratch");
        for dir in [&layers, &output, &scratch] {
            fs::create_dir_all(dir).unwrap();
        }
        fs::create_dir_all(layers.join("debian")).unwrap();
        fs::write(layers.join("debian").join(BUILD_SCRIPT), b"#!/bin/sh\n").unwrap();
        Fixture {
            _tmp: tmp,
            layers,
            output,
            scratch,
        }
    }

    impl Fixture {
        fn cache(&self) -> LayerCache {
            LayerCache::new(&self.layers, &self.output, &self.scratch).with_tool_version("9.9.9")
        }
    }

    #[test]
    fn builds_once_per_run_and_reuses_archive() {
        let fx = fixture();
        let tools = ScriptRecorder::default();
        let mut cache = fx.cache();

        let first = cache.resolve("debian", &tools).unwrap();
        let second = cache.resolve("debian", &tools).unwrap();
        assert_eq!(first, second);
        assert_eq!(tools.runs.borrow().len(), 1);

        let name = first.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("debian-9.9.9-"), "{name}");
        assert!(name.ends_with(ARCHIVE_SUFFIX), "{name}");
        assert!(is_usable_archive(&first));
        assert!(!fx.scratch.join("layer-debian").exists());
    }

    #[test]
    fn archive_on_disk_is_a_cache_hit_for_a_new_run() {
        let fx = fixture();
        let tools = ScriptRecorder::default();
        let archive = fx.cache().resolve("debian", &tools).unwrap();

        let again = fx.cache().resolve("debian", &tools).unwrap();
        assert_eq!(archive, again);
        assert_eq!(tools.runs.borrow().len(), 1);
    }

    #[test]
    fn pre_image_script_does_not_change_the_hash() {
        let fx = fixture();
        let cache = fx.cache();
        let before = cache.layer_hash("debian").unwrap();
        fs::write(fx.layers.join("debian").join(PRE_IMAGE_SCRIPT), b"#!/bin/sh\n").unwrap();
        assert_eq!(before, cache.layer_hash("debian").unwrap());
        assert!(cache.pre_image_script("debian").is_some());

        fs::write(fx.layers.join("debian/packages.list"), b"vim\n").unwrap();
        assert_ne!(before, cache.layer_hash("debian").unwrap());
    }

    #[test]
    fn failure_is_remembered_without_retrying() {
        let fx = fixture();
        let tools = ScriptRecorder {
            fail: true,
            ..Default::default()
        };
        let mut cache = fx.cache();

        let first = cache.resolve("debian", &tools).unwrap_err();
        let second = cache.resolve("debian", &tools).unwrap_err();
        assert_eq!(first, second);
        assert!(matches!(first, LayerError::BuildFailed { .. }));
        assert!(first.to_string().contains("exit code 1"), "{first}");
        assert_eq!(tools.runs.borrow().len(), 1);

        let leftovers: Vec<_> = fs::read_dir(&fx.output)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(ARCHIVE_SUFFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn waiting_on_a_held_lock_ends_on_interrupt() {
        let fx = fixture();
        let tools = ScriptRecorder::default();
        let naming = fx.cache();
        let hash = naming.layer_hash("debian").unwrap();
        let archive = fx.output.join(naming.archive_name("debian", &hash));

        // Another run is building this archive.
        let held = acquire_lock(&archive, &Interrupt::new()).unwrap().unwrap();

        let interrupt = Interrupt::new();
        let raiser = {
            let interrupt = interrupt.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(300));
                interrupt.raise();
            })
        };

        let mut cache = fx.cache().with_interrupt(interrupt);
        let err = cache.resolve("debian", &tools).unwrap_err();
        raiser.join().unwrap();
        assert_eq!(
            err,
            LayerError::Interrupted {
                layer: "debian".to_string()
            }
        );
        assert!(tools.runs.borrow().is_empty());

        drop(held);
        let mut cache = fx.cache();
        assert!(cache.resolve("debian", &tools).is_ok());
    }

    #[test]
    fn layer_names_cannot_leave_the_layers_root() {
        let fx = fixture();
        fs::write(fx.layers.join(BUILD_SCRIPT), b"#!/bin/sh\n").unwrap();
        let tools = ScriptRecorder::default();
        let mut cache = fx.cache();

        for layer in ["..", ".", "debian/../debian", ""] {
            let err = cache.resolve(layer, &tools).unwrap_err();
            assert!(matches!(err, LayerError::Missing { .. }), "{layer}: {err}");
        }
        assert!(tools.runs.borrow().is_empty());
    }

    #[test]
    fn missing_layer_or_script() {
        let fx = fixture();
        let tools = ScriptRecorder::default();
        let mut cache = fx.cache();

        let err = cache.resolve("nope", &tools).unwrap_err();
        assert!(matches!(err, LayerError::Missing { .. }));

        fs::create_dir_all(fx.layers.join("empty")).unwrap();
        let err = cache.resolve("empty", &tools).unwrap_err();
        assert!(err.to_string().contains(BUILD_SCRIPT), "{err}");
        assert!(tools.runs.borrow().is_empty());
    }
}
