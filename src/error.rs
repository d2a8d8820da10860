use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExifToolError {
    #[error("Failed to launch {executable}: {source}")]
    Launch {
        executable: PathBuf,
        source: std::io::Error,
    },

    #[error("Worker {index} of the pool failed to start: {source}")]
    PoolConstruction {
        index: usize,
        source: Box<ExifToolError>,
    },

    #[error("A pool needs at least one worker.")]
    EmptyPool,

    #[error("The stay-open process has been stopped.")]
    Stopped,

    #[error("Cannot send {value:?} as a single request line: {reason}")]
    InvalidInput { value: String, reason: &'static str },

    #[error("IO error writing request: {0}")]
    Write(#[source] std::io::Error),

    #[error("IO error reading response: {0}")]
    Read(#[source] std::io::Error),

    #[error("Process terminated unexpectedly.")]
    ProcessTerminated,

    #[error("Output ended before {{ready}} was seen ({} bytes left over).", partial.len())]
    Truncated { partial: Vec<u8> },

    #[error("File not found: {path}. command={command_args}")]
    FileNotFound { path: PathBuf, command_args: String },

    #[error("ExifTool error: {message}. command={command_args}")]
    ExifTool {
        message: String,
        command_args: String,
        payload: Vec<u8>,
    },
}

impl ExifToolError {
    /// Whether this error ended the worker that produced it.
    ///
    /// Stream failures take the process down with them; inline tool errors
    /// and rejected input leave it serving requests.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ExifToolError::Write(_)
                | ExifToolError::Read(_)
                | ExifToolError::ProcessTerminated
                | ExifToolError::Truncated { .. }
        )
    }
}
