//! Error types for the shared service library

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CommonError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Logging error: {0}")]
    Logging(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CommonError>;

impl From<figment::Error> for CommonError {
    fn from(err: figment::Error) -> Self {
        CommonError::Config(err.to_string())
    }
}
