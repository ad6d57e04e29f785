use thiserror::Error;

#[derive(Error, Debug)]
pub enum AxlError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid endpoint '{input}': {reason}")]
    InvalidEndpoint { input: String, reason: String },

    #[error("Invalid magic bytes - expected AXLN")]
    InvalidMagic,

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("Payload too large: {0} bytes exceeds maximum")]
    PayloadTooLarge(usize),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Credentials unavailable: {0}")]
    Credentials(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, AxlError>;
