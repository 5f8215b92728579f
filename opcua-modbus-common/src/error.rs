use thiserror::Error;

/// Common error type for gateway components.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Logging error: {0}")]
    Logging(String),
}

/// Result type alias using the gateway's common Error.
pub type Result<T> = std::result::Result<T, Error>;
