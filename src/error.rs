use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Tmux error: {0}")]
    Tmux(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid {kind}: {value:?} contains unsafe characters")]
    InvalidName { kind: &'static str, value: String },

    #[error("Path {path} escapes {base}")]
    PathEscape { path: PathBuf, base: PathBuf },

    #[error("Task file not found or malformed: {0}")]
    TaskNotFound(String),

    #[error("Agent not available: {0}")]
    AgentNotAvailable(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Too many consecutive errors ({count}/{max})")]
    TooManyErrors { count: u32, max: u32 },
}

pub type Result<T> = std::result::Result<T, Error>;
