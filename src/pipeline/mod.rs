//! The per-build pipeline.
//!
//! Builds run one at a time in id order. Each goes through a fixed sequence
//! of stages:
//!
//! ```text
//! resolve layer ─> unpack ─> [clone ─> checkout ─> head] ─> identity
//!     ─> existence check ─> [provision] ─> [pre-image] ─> bootloader ─> ISO
//! ```
//!
//! A failing stage skips the build with a reason and the run moves on to the
//! next one. Only internal errors (the scratch tree cannot be created, a
//! build has no parameters) stop the run. All scratch state lives in one
//! directory that is removed when the run ends, however it ends.

pub mod identity;
pub mod scratch;

use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use time::Date;
use tracing::{debug, info, warn};

use crate::archive::{atomic_rename, extract_tar_gz, tmp_name};
use crate::artifact::iso::{stage_bootloader, volume_label, IsoOptions};
use crate::config::{BuildConfig, BuildId};
use crate::hash;
use crate::interrupt::Interrupt;
use crate::layer_cache::{LayerCache, LayerError};
use crate::report::{Outcome, StatusReport};
use crate::selection::Selection;
use crate::settings::Settings;
use crate::tools::HostTools;

use identity::ImageIdentity;
use scratch::ScratchDir;

/// Why a build stopped early.
#[derive(Debug, Error)]
pub enum StageError {
    /// Expected failure: the build is skipped, the run continues.
    #[error("{0}")]
    Skip(String),

    /// Something that should never fail did; the run stops.
    #[error("internal error: {0:#}")]
    Internal(anyhow::Error),
}

impl From<LayerError> for StageError {
    fn from(err: LayerError) -> Self {
        StageError::Skip(err.to_string())
    }
}

trait StageResultExt<T> {
    /// Turn a failure into a skip, prefixed with the failing stage.
    fn or_skip(self, stage: &str) -> Result<T, StageError>;

    fn or_internal(self) -> Result<T, StageError>;
}

impl<T> StageResultExt<T> for Result<T> {
    fn or_skip(self, stage: &str) -> Result<T, StageError> {
        self.map_err(|err| StageError::Skip(format!("{stage}: {err:#}")))
    }

    fn or_internal(self) -> Result<T, StageError> {
        self.map_err(StageError::Internal)
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Interrupted,
}

/// Everything a run reads but does not own.
pub struct RunContext<'a> {
    pub config: &'a BuildConfig,
    pub settings: &'a Settings,
    pub tools: &'a dyn HostTools,
    pub interrupt: &'a Interrupt,
    /// Date stamped into image names; fixed for the whole run.
    pub build_date: Date,
}

/// Run the selected builds inside a fresh scratch directory.
///
/// The report is returned even when the run stops on an internal error, so
/// the caller can always print it.
pub fn execute(ctx: &RunContext<'_>, selection: &Selection) -> (StatusReport, Result<RunOutcome>) {
    let mut report = StatusReport::new(selection, &ctx.config.registry);
    let result = ScratchDir::create(&ctx.settings.tmp_dir).and_then(|scratch| {
        let mut pipeline = Pipeline::new(ctx, scratch.path());
        pipeline.run(selection, &mut report)
    });
    (report, result)
}

/// Drives builds through their stages. Owns the run's layer cache.
pub struct Pipeline<'a> {
    ctx: &'a RunContext<'a>,
    scratch: PathBuf,
    layers: LayerCache,
}

impl<'a> Pipeline<'a> {
    pub fn new(ctx: &'a RunContext<'a>, scratch: &Path) -> Self {
        let layers = LayerCache::new(
            &ctx.settings.layers_dir,
            &ctx.settings.output_dir,
            scratch,
        )
        .with_interrupt(ctx.interrupt.clone());
        Self {
            ctx,
            scratch: scratch.to_path_buf(),
            layers,
        }
    }

    /// Process every selected build, recording outcomes in `report`.
    pub fn run(&mut self, selection: &Selection, report: &mut StatusReport) -> Result<RunOutcome> {
        for &id in &selection.ids {
            if self.ctx.interrupt.is_raised() {
                return Ok(RunOutcome::Interrupted);
            }

            let name = self
                .ctx
                .config
                .registry
                .name_of(id)
                .ok_or_else(|| anyhow!("build id {id} is not registered"))?
                .to_string();

            info!(build = %name, "Starting build");
            let result = self.build_one(id, &name, selection.force);

            if self.ctx.interrupt.is_raised() {
                warn!(build = %name, "Build aborted by interrupt");
                report.set(id, Outcome::Aborted);
                return Ok(RunOutcome::Interrupted);
            }

            match result {
                Ok(image) => {
                    info!(build = %name, image = %image.display(), "Build finished");
                    report.set(id, Outcome::Built(image));
                }
                Err(StageError::Skip(reason)) => {
                    warn!(build = %name, reason = %reason, "Skipping build");
                    report.set(id, Outcome::Skipped(reason));
                }
                Err(StageError::Internal(err)) => {
                    report.set(id, Outcome::Aborted);
                    return Err(err.context(format!("build '{name}'")));
                }
            }
        }
        Ok(RunOutcome::Completed)
    }

    fn build_one(&mut self, id: BuildId, name: &str, force: bool) -> Result<PathBuf, StageError> {
        let tools = self.ctx.tools;
        let settings = self.ctx.settings;
        let params = self
            .ctx
            .config
            .build_params(id)
            .ok_or_else(|| StageError::Internal(anyhow!("no parameters for build '{name}'")))?;

        let archive = self.layers.resolve(&params.base_layer, tools)?;
        self.checkpoint()?;

        let build_dir = self.scratch.join(format!("build-{name}"));
        let chroot = build_dir.join("chroot");
        let image_dir = build_dir.join("image");
        for dir in [&chroot, &image_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating '{}'", dir.display()))
                .or_internal()?;
        }

        debug!(build = %name, archive = %archive.display(), "Unpacking base layer");
        extract_tar_gz(&archive, &chroot).or_skip("unpacking base layer")?;
        self.checkpoint()?;

        let mut identity = ImageIdentity::new(&archive);
        let pre_image = self.layers.pre_image_script(&params.base_layer);
        if let Some(script) = &pre_image {
            identity.pre_image_hash = Some(hash::hash_file(script).or_skip("hashing pre-image script")?);
        }

        let mut provision = None;
        if params.uses_repo() {
            let repo_dir = chroot.join(params.clone_into());
            info!(build = %name, url = %params.repo_url, "Cloning repository");
            tools
                .git_clone(&params.repo_url, params.repo_depth, &repo_dir)
                .or_skip("cloning repository")?;
            self.checkpoint()?;
            tools
                .git_checkout(&repo_dir, &params.repo_checkout)
                .or_skip("checking out repository")?;
            let head = tools
                .git_short_head(&repo_dir)
                .or_skip("reading repository HEAD")?;
            debug!(build = %name, head = %head, "Repository checked out");
            identity.git_short_hash = Some(head);

            if let Some(run) = params.run_script() {
                identity.run_script = Some(run.to_string());
                if repo_dir.join(run).is_file() {
                    provision = Some(Path::new("/").join(params.clone_into()).join(run));
                } else {
                    warn!(build = %name, script = %run, "Run script not found in repository, not provisioning");
                }
            }
        }

        let filename = identity.image_filename(name, self.ctx.build_date);
        let output = settings.output_dir.join(&filename);
        if !force && output.exists() {
            return Err(StageError::Skip(format!("already built: {}", output.display())));
        }

        if let Some(script) = provision {
            info!(build = %name, script = %script.display(), "Provisioning in chroot");
            tools
                .run_in_chroot(&chroot, &script, &self.layers.layer_dir(&params.base_layer))
                .or_skip("provisioning")?;
            self.checkpoint()?;
        }

        if let Some(script) = &pre_image {
            info!(build = %name, "Running pre-image script");
            tools
                .run_pre_image(script, &chroot, &image_dir)
                .or_skip("pre-image script")?;
            self.checkpoint()?;
        }

        stage_bootloader(&image_dir, &settings.bootloader_dirs).or_skip("staging bootloader")?;

        let label = volume_label(name);
        let tmp = settings.output_dir.join(tmp_name(&format!(".{filename}")));
        info!(build = %name, image = %output.display(), "Creating ISO image");
        if let Err(err) = tools.make_iso(&image_dir, &tmp, &IsoOptions::isolinux(&label)) {
            let _ = fs::remove_file(&tmp);
            return Err(err).or_skip("creating ISO image");
        }
        atomic_rename(&tmp, &output).or_skip("moving ISO image into place")?;

        Ok(output)
    }

    fn checkpoint(&self) -> Result<(), StageError> {
        if self.ctx.interrupt.is_raised() {
            return Err(StageError::Skip("interrupted".to_string()));
        }
        Ok(())
    }
}
