//! Error type shared by the library modules.

use std::path::PathBuf;

/// Errors raised while loading resources or running generation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid hyperparameter file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("vocabulary {path:?} is unusable: {reason}")]
    Vocab { path: PathBuf, reason: String },

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("malformed checkpoint: {0}")]
    Checkpoint(String),

    #[error("checkpoint has no tensor named `{0}`")]
    MissingTensor(String),

    #[error("tensor `{name}` has shape {found:?}, model expects {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("cannot sample next token: {0}")]
    Sampling(String),
}

pub type Result<T> = std::result::Result<T, Error>;
