use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // Payload errors
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    // Command queue errors
    #[error("Invalid command id: {0}")]
    InvalidCommandId(String),

    #[error("Invalid command status: {0}")]
    InvalidCommandStatus(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // Trust boundary
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing configuration key: {0}")]
    MissingConfig(String),
}

pub type Result<T> = std::result::Result<T, Error>;
