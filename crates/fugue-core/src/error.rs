// src/error.rs
use std::io;
use thiserror::Error;

/// Central error type for the Fugue core engine.
#[derive(Debug, Error)]
pub enum FugueError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The listen address could not be parsed.
    #[error("Invalid listen address: {0}")]
    Address(String),
    /// A route pattern failed to compile.
    #[error("Invalid route pattern: {0}")]
    Pattern(#[from] regex::Error),
    /// A configuration value is missing or out of range.
    #[error("Invalid configuration: {0}")]
    Config(String),
    /// A worker thread panicked.
    #[error("Worker panic: {0}")]
    WorkerPanic(String),
}

pub type FugueResult<T> = Result<T, FugueError>;
