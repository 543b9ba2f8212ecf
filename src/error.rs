//! K-Frame client error types.
//!
//! Errors fall into three groups:
//!
//! - **Validation**: a command was rejected before touching the network
//!   (out-of-range macro/AUX/source, unknown suite, not connected).
//! - **Transport**: a socket operation failed. Inside the engine these are
//!   funneled into the reconnection policy; they only surface to callers as
//!   a failed command result.
//! - **Config**: a configuration file or value could not be used.

use thiserror::Error;

/// K-Frame client errors.
#[derive(Error, Debug)]
pub enum KFrameError {
    /// Operation requires an established session.
    #[error("Not connected")]
    NotConnected,

    /// Macro number outside 1-999.
    #[error("Invalid macro number {0} (must be 1-999)")]
    InvalidMacro(u32),

    /// AUX bus number outside 1-96.
    #[error("Invalid aux number {0} (must be 1-96)")]
    InvalidAux(u32),

    /// Source number outside 1-850.
    #[error("Invalid source number {0} (must be 1-850)")]
    InvalidSource(u32),

    /// Suite id not in the suite table.
    #[error("Invalid suite: {0}")]
    UnknownSuite(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// Network communication error.
    #[error("Network error: {0}")]
    Network(String),

    /// The connection task is gone.
    #[error("Connection task closed")]
    ChannelClosed,

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for K-Frame operations
pub type Result<T> = std::result::Result<T, KFrameError>;

impl KFrameError {
    /// True for errors raised by argument or state validation, before any I/O.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            KFrameError::NotConnected
                | KFrameError::InvalidMacro(_)
                | KFrameError::InvalidAux(_)
                | KFrameError::InvalidSource(_)
                | KFrameError::UnknownSuite(_)
        )
    }
}

impl From<toml::de::Error> for KFrameError {
    fn from(err: toml::de::Error) -> Self {
        KFrameError::Config(format!("Failed to parse config: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            KFrameError::InvalidMacro(1000).to_string(),
            "Invalid macro number 1000 (must be 1-999)"
        );
        assert_eq!(KFrameError::NotConnected.to_string(), "Not connected");
        assert_eq!(
            KFrameError::UnknownSuite("suite9z".into()).to_string(),
            "Invalid suite: suite9z"
        );
    }

    #[test]
    fn test_validation_classification() {
        assert!(KFrameError::InvalidAux(0).is_validation());
        assert!(KFrameError::NotConnected.is_validation());
        assert!(!KFrameError::Network("down".into()).is_validation());
        let io = std::io::Error::other("boom");
        assert!(!KFrameError::from(io).is_validation());
    }
}
