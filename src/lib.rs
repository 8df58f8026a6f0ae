//! Build orchestration for bootable LiveCD images.
//!
//! A configuration file names builds. Each build starts from a base layer (a
//! root filesystem produced by the layer's own build script and cached as a
//! content-addressed archive), optionally clones a provisioning repository
//! into it and runs a script from that repository inside a chroot, runs the
//! layer's pre-image hook, and finally packs everything into an ISO.
//!
//! # Architecture
//!
//! ```text
//! config ──> selection ──> pipeline ──> report
//!                             │
//!                             ├── layer_cache ──> hash, archive
//!                             ├── pipeline::identity ──> hash
//!                             └── tools (git, chroot, scripts, mkisofs)
//! ```
//!
//! Every external program goes through [`tools::HostTools`], so the pipeline
//! can be exercised without root or any of the host binaries.

pub mod archive;
pub mod artifact;
pub mod config;
pub mod hash;
pub mod interrupt;
pub mod layer_cache;
pub mod pipeline;
pub mod preflight;
pub mod report;
pub mod selection;
pub mod settings;
pub mod tools;

pub use config::{BuildConfig, BuildParams, ConfigError};
pub use pipeline::{execute, RunContext, RunOutcome};
pub use settings::Settings;
