//! The error taxonomy shared by streams, components and pipes.
//!
//! End-of-stream is deliberately absent: streams report it as `Ok(None)`.

use thiserror::Error;

/// Everything that can go wrong while wiring or running a pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A header or frame had the wrong kind or shape for the component
    /// receiving it. Fatal to the one pipe that hit it.
    #[error("validation error: {0}")]
    Validation(String),

    /// The topology itself is inconsistent: duplicate device ids, a pair
    /// count with no integer device count, and the like.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A non-blocking aggregate read found no contributing child.
    #[error("no child frame available")]
    WouldBlock,

    /// The pipe or stream has already been closed.
    #[error("pipeline closed")]
    ClosedPipeline,

    /// A point-to-point stream was used outside its protocol, e.g. a second
    /// `set_header`.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Returned when io fails when reading or writing trace files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Returned when the WAV reader fails.
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),

    /// Returned when a text trace line cannot be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// Returned when a configuration file is not valid RON.
    #[error("config error: {0}")]
    Config(#[from] ron::de::SpannedError),
}

/// Result alias used throughout the crate.
pub type PipelineResult<T> = Result<T, PipelineError>;
