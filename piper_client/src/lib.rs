//! # Piper Client
//!
//! Text to WAV through a Wyoming Piper server, with a `docker exec` side
//! channel for when the stream yields nothing usable.
//!
//! ```rust,no_run
//! use piper_client::{ClientConfig, PiperSynthesizer};
//! use std::path::Path;
//!
//! let synthesizer = PiperSynthesizer::new(ClientConfig::default());
//! let result = synthesizer.synthesize("Hello there", Some(Path::new("hello.wav")), 0);
//! println!("{}", result.message);
//! ```

pub mod config;
pub mod error;
pub mod fallback;
pub mod synthesis;
pub mod wav;

pub use config::{ClientConfig, ConfigError, FallbackConfig, SynthesisStrategy};
pub use error::{Result, SynthesisError};
pub use fallback::{DockerExecCapture, FallbackCapture, FallbackError};
pub use synthesis::{
    default_output_path, AudioSource, PiperSynthesizer, SynthesisReport, SynthesisResult,
    SynthesisStage,
};
pub use wav::{EncodeError, WavFormat};
