//! Image identity and output naming.
//!
//! Everything that changes an image's content feeds the identity string; its
//! digest is the version token in the ISO filename. Same inputs, same name:
//! that is how a finished image is recognised on the next run.

use std::path::Path;
use time::{Date, OffsetDateTime};

use crate::hash;

/// Inputs that determine an image's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageIdentity {
    /// File name of the base layer archive (carries the layer content hash).
    pub layer_archive: String,
    /// Repo-relative provisioning script, when a repository is used.
    pub run_script: Option<String>,
    /// Content hash of the layer's pre-image script, when it has one.
    pub pre_image_hash: Option<String>,
    /// Abbreviated commit of the checked-out repository.
    pub git_short_hash: Option<String>,
}

impl ImageIdentity {
    pub fn new(layer_archive: &Path) -> Self {
        let layer_archive = layer_archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| layer_archive.display().to_string());
        Self {
            layer_archive,
            run_script: None,
            pre_image_hash: None,
            git_short_hash: None,
        }
    }

    /// The identity string that gets hashed.
    pub fn compose(&self) -> String {
        let mut parts = vec![format!("layer={}", self.layer_archive)];
        if let Some(run) = &self.run_script {
            parts.push(format!("run={run}"));
        }
        if let Some(pre) = &self.pre_image_hash {
            parts.push(format!("pre_image={pre}"));
        }
        if let Some(git) = &self.git_short_hash {
            parts.push(format!("git={git}"));
        }
        parts.join(";")
    }

    pub fn version_token(&self) -> String {
        hash::short_hash(self.compose().as_bytes())
    }

    /// `{build}-{YYMMDD}[-{git}]-{token}.iso`
    pub fn image_filename(&self, build_name: &str, date: Date) -> String {
        let mut name = format!("{build_name}-{}", date_stamp(date));
        if let Some(git) = &self.git_short_hash {
            name.push('-');
            name.push_str(git);
        }
        format!("{name}-{}.iso", self.version_token())
    }
}

/// `YYMMDD`
pub fn date_stamp(date: Date) -> String {
    format!(
        "{:02}{:02}{:02}",
        date.year().rem_euclid(100),
        u8::from(date.month()),
        date.day()
    )
}

/// Today's date, local time when the offset can be determined.
///
/// Call this before any other thread is spawned; the local offset is not
/// available to multi-threaded processes and UTC is used instead.
pub fn today() -> Date {
    OffsetDateTime::now_local()
        .unwrap_or_else(|_| OffsetDateTime::now_utc())
        .date()
}
