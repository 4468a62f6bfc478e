//! Fatal error types.
//!
//! Only errors that must abort the whole run before or during capture
//! processing live here (see spec.md / SPEC_FULL.md §7). Transient parse
//! errors, association failures, and reassembly gaps are handled locally
//! (logged and discarded) and never reach this type.

use std::path::PathBuf;

/// A fatal error, returned from [`crate::orchestrator::Orchestrator::run`] or
/// from configuration validation that happens before any capture processing
/// begins.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("output directory {0:?} exists and is not a directory")]
    OutputDirNotADirectory(PathBuf),

    #[error("could not create output directory {0:?}: {1}")]
    CreateOutputDir(PathBuf, #[source] std::io::Error),

    #[error("unsupported default codec {0:?}")]
    UnsupportedDefaultCodec(String),

    #[error("unsupported output format {0:?}")]
    UnsupportedOutputFormat(String),

    #[error("failed to read capture file: {0}")]
    Capture(#[from] crate::capture::CaptureError),

    #[error("decoder backend error: {0}")]
    Backend(#[from] ffmpeg_next::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
