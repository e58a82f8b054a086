// src/error.rs

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {

    /// An iterator has been drained. Raised at stream and dataset
    /// boundaries; handled locally to advance to the next substream.
    #[error("end of stream")]
    EndOfStream,

    /// A data file has reached its size limit or its directory is full.
    /// Handled locally by output streams to roll over to the next file.
    #[error("end of space")]
    EndOfSpace,

    #[error("corrupt data in '{path}': {message}")]
    Corrupt {
        path: PathBuf,
        message: String,
    },

    #[error("I/O error at '{path}': {message}")]
    Io {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("decode error: {message}")]
    Decode {
        message: String,
    },

    #[error("configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;

// Convenience constructors
impl StoreError {

    pub fn corrupt(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Io {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn io_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Io {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// True for the drained-iterator signal.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }

    /// True for the file-full signal.
    pub fn is_end_of_space(&self) -> bool {
        matches!(self, Self::EndOfSpace)
    }
}
