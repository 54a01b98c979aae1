//! Engine error type
//!
//! Library-facing operations return `EngineResult<T>`. Background threads never
//! propagate these: they log and complete the caller's ticket with an empty result.

use std::path::{Path, PathBuf};

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// Source file missing, unreadable or rejected by the container layer
    #[error("failed to open '{path}': {reason}")]
    Open { path: PathBuf, reason: String },

    /// File opened but its stream info could not be determined
    #[error("failed to probe '{path}': {reason}")]
    Probe { path: PathBuf, reason: String },

    /// No registered backend accepts this file
    #[error("unsupported media: {0}")]
    Unsupported(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("seek error: {0}")]
    Seek(String),

    #[error("timeline error: {0}")]
    Timeline(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn open(path: &Path, reason: impl Into<String>) -> Self {
        Self::Open {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn probe(path: &Path, reason: impl Into<String>) -> Self {
        Self::Probe {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn seek(msg: impl Into<String>) -> Self {
        Self::Seek(msg.into())
    }

    pub fn timeline(msg: impl Into<String>) -> Self {
        Self::Timeline(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_path() {
        let err = EngineError::open(Path::new("/media/foo.mov"), "no such file");
        let text = err.to_string();
        assert!(text.contains("/media/foo.mov"));
        assert!(text.contains("no such file"));
    }

    #[test]
    fn test_io_converts() {
        fn fails() -> EngineResult<()> {
            Err(std::io::Error::other("boom"))?;
            Ok(())
        }
        let err = fails().unwrap_err();
        assert!(matches!(err, EngineError::Io(_)));
        assert!(err.to_string().contains("boom"));
    }
}
