//! # Wyoming Protocol
//!
//! Blocking TCP client for the Wyoming Piper speech synthesis protocol.
//!
//! This crate provides:
//! - Wire types and a [`FrameParser`] for the newline-delimited JSON stream
//! - An [`AudioAssembler`] that buffers decoded PCM with a size guard
//! - A [`ProtocolSession`] that runs one synthesis request end to end
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use wyoming_protocol::{ProtocolSession, SessionConfig, SynthesisRequest};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let session = ProtocolSession::new(SessionConfig::default());
//! let request = SynthesisRequest::new("Hello from Piper", 0)?;
//!
//! let outcome = session.run(&request)?;
//! println!("Received {} bytes of PCM", outcome.audio.len());
//! # Ok(())
//! # }
//! ```

pub mod assembler;
pub mod client;
pub mod mock_server;
pub mod protocol;

// Re-export commonly used types
pub use assembler::{AppendOutcome, AudioAssembler, DEFAULT_MAX_AUDIO_BYTES};
pub use client::{
    ProtocolSession, SessionConfig, SessionFailure, SessionOutcome, SessionState, DEFAULT_HOST,
    DEFAULT_PORT,
};
pub use protocol::{FrameParser, ProtocolError, ResponseFrame, SynthesisRequest};
