//! Interrupt flag.
//!
//! The signal handler only records that SIGINT/SIGTERM arrived. The running
//! child gets the signal from the terminal as well and exits; the pipeline
//! sees the flag once that stage returns and stops the run.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    raised: Arc<AtomicBool>,
}

impl Interrupt {
    /// A flag no signal is wired to.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the process-wide handler. Only one may be installed.
    pub fn install() -> Result<Self> {
        let interrupt = Self::new();
        let flag = Arc::clone(&interrupt.raised);
        ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
            .context("installing interrupt handler")?;
        Ok(interrupt)
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }
}
