//! Sampling-based sequence-to-sequence generation with an encoder-decoder
//! transformer.
//!
//! The binaries under `src/bin` wire these modules together: hyperparameters
//! and vocabularies are loaded, the model is built and filled from a
//! checkpoint, and [`generate::Generator`] decodes one line with top-k /
//! nucleus sampling.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod generate;
pub mod model;
pub mod sampling;
pub mod tokenizer;

pub use error::{Error, Result};
