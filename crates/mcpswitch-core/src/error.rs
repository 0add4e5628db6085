use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwitchError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown MCP server: {0}")]
    UnknownServer(String),

    #[error("Enabling {0} was cancelled")]
    Cancelled(String),

    #[error("{host} config at {path} changed on disk since it was last read")]
    HostConflict { host: String, path: PathBuf },

    #[error("Invalid manifest {path} (line {line}, column {column}): {message}")]
    ManifestParse {
        path: PathBuf,
        line: usize,
        column: usize,
        message: String,
    },

    #[error("{0} root must be a JSON object")]
    NotAnObject(String),

    #[error("Filesystem watch error: {0}")]
    Watch(#[from] notify::Error),
    #[error("Filesystem watcher stopped delivering events")]
    WatchClosed,
}

impl SwitchError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn manifest_parse(path: impl Into<PathBuf>, error: &serde_json::Error) -> Self {
        Self::ManifestParse {
            path: path.into(),
            line: error.line(),
            column: error.column(),
            message: error.to_string(),
        }
    }

    /// Line number reported by a manifest parse failure, if any.
    pub fn line(&self) -> Option<usize> {
        match self {
            Self::ManifestParse { line, .. } if *line > 0 => Some(*line),
            _ => None,
        }
    }
}
