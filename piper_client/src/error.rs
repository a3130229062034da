use crate::config::ConfigError;
use crate::fallback::FallbackError;
use crate::wav::EncodeError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use wyoming_protocol::ProtocolError;

#[derive(Error, Debug)]
pub enum SynthesisError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("Could not connect to Wyoming server at {address}")]
    Connection {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out after {elapsed:?} waiting for the Wyoming server")]
    Timeout { elapsed: Duration },

    #[error("Server error: {0}")]
    Server(String),

    #[error("No audio data received from server")]
    EmptyResult,

    #[error("Synthesis cancelled")]
    Cancelled,

    #[error("Fallback synthesis failed: {0}")]
    Fallback(#[from] FallbackError),

    #[error("Fallback synthesis failed: {fallback} (primary path: {primary})")]
    BothPathsFailed {
        #[source]
        fallback: FallbackError,
        primary: Box<SynthesisError>,
    },

    #[error("Failed to encode audio: {0}")]
    Encode(#[from] EncodeError),

    #[error("Failed to write {}: {source}", path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to synthesize speech: {0}")]
    Protocol(ProtocolError),
}

impl SynthesisError {
    /// Failures of the streaming path that the fallback may recover from.
    pub fn triggers_fallback(&self) -> bool {
        matches!(
            self,
            SynthesisError::Connection { .. }
                | SynthesisError::Timeout { .. }
                | SynthesisError::Server(_)
                | SynthesisError::EmptyResult
                | SynthesisError::Protocol(_)
        )
    }
}

impl From<ProtocolError> for SynthesisError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Connection { address, source } => {
                SynthesisError::Connection { address, source }
            }
            ProtocolError::Timeout { elapsed } => SynthesisError::Timeout { elapsed },
            ProtocolError::Server(message) => SynthesisError::Server(message),
            ProtocolError::Cancelled => SynthesisError::Cancelled,
            ProtocolError::InvalidRequest(message) => SynthesisError::InvalidRequest(message),
            other => SynthesisError::Protocol(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, SynthesisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_errors_map_to_categories() {
        let refused = ProtocolError::Connection {
            address: "localhost:10200".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        let err = SynthesisError::from(refused);
        assert_eq!(
            err.to_string(),
            "Could not connect to Wyoming server at localhost:10200"
        );
        assert!(err.triggers_fallback());

        let err = SynthesisError::from(ProtocolError::Server("model not found".to_string()));
        assert_eq!(err.to_string(), "Server error: model not found");
        assert!(err.triggers_fallback());

        let err = SynthesisError::from(ProtocolError::Cancelled);
        assert!(!err.triggers_fallback());

        let err = SynthesisError::from(ProtocolError::InvalidRequest(
            "Empty text provided".to_string(),
        ));
        assert_eq!(err.to_string(), "Empty text provided");
        assert!(!err.triggers_fallback());
    }

    #[test]
    fn test_both_paths_failed_names_both_causes() {
        let err = SynthesisError::BothPathsFailed {
            fallback: FallbackError::EmptyResult,
            primary: Box::new(SynthesisError::Server("model not found".to_string())),
        };
        let message = err.to_string();
        assert!(message.starts_with("Fallback synthesis failed: fallback produced no audio"));
        assert!(message.contains("Server error: model not found"));
        assert!(!err.triggers_fallback());
    }
}
