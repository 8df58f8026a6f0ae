//! Image artifacts.
//!
//! - [`iso`] - bootloader staging and `mkisofs` invocation for the final image
//!
//! Base layer archives are handled by [`crate::archive`].

pub mod iso;
