//! Engine error type.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("safetensors header parse failed: {0}")]
    HeaderParse(String),

    #[error("unsupported dtype for tensor {name}: {dtype}")]
    UnsupportedDtype { name: String, dtype: String },

    #[error("shape mismatch for tensor {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("missing tensor: {0}")]
    MissingTensor(String),

    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("invalid sample rate: {0} Hz, the engine requires 16000 Hz mono input")]
    InvalidSampleRate(u32),

    #[error("audio too long: {frames} encoder frames exceeds the maximum of {max_frames}")]
    AudioTooLong { frames: usize, max_frames: usize },

    #[error("out of memory")]
    OutOfMemory,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
