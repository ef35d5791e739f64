use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Missing or conflicting configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The token endpoint could not be reached.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The token endpoint answered with a non-success status.
    #[error("Token endpoint returned {status}: {body}")]
    Grant { status: u16, body: String },

    #[error("Failed to sign assertion: {0}")]
    Signing(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Fatal errors stop the process before any server is started.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Configuration(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
