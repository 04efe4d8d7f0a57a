//! Tokio runtime for the instance event loop
//!
//! An instance runs on a single thread. WAV encoding, decoding and probing
//! go to the blocking pool, so nothing on the loop thread waits on disk.

use anyhow::{Context, Result};
use tokio::runtime::Runtime;

/// Build the current-thread runtime the instance runs on
pub fn build() -> Result<Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .thread_name("echolink")
        .build()
        .context("Failed to create Tokio runtime")
}
