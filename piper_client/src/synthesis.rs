use crate::config::{ClientConfig, SynthesisStrategy};
use crate::error::{Result, SynthesisError};
use crate::fallback::{DockerExecCapture, FallbackCapture, FallbackError};
use crate::wav::{self, WavFormat};
use log::{error, info, warn};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use wyoming_protocol::{ProtocolSession, SynthesisRequest};

/// Terminal value of every synthesis call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisResult {
    pub success: bool,
    pub message: String,
}

/// Stages of one synthesis operation, logged as they are entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisStage {
    Init,
    TryingPrimary,
    TryingFallback,
    Success,
    Failed,
}

impl fmt::Display for SynthesisStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SynthesisStage::Init => "Init",
            SynthesisStage::TryingPrimary => "TryingPrimary",
            SynthesisStage::TryingFallback => "TryingFallback",
            SynthesisStage::Success => "Success",
            SynthesisStage::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Which path produced the audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioSource {
    Stream,
    Fallback,
}

/// Details of a successful synthesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisReport {
    pub path: PathBuf,
    pub pcm_bytes: usize,
    pub source: AudioSource,
    /// Size guard limit, if the stream was cut short
    pub truncated_at: Option<usize>,
}

impl SynthesisReport {
    pub fn message(&self) -> String {
        let mut message = format!(
            "Speech generated successfully and saved to {}",
            self.path.display()
        );
        if let Some(limit) = self.truncated_at {
            message.push_str(&format!(" (stream truncated at {} bytes)", limit));
        }
        message
    }
}

struct CollectedAudio {
    pcm: Vec<u8>,
    source: AudioSource,
    truncated_at: Option<usize>,
}

/// Turns text into a WAV file: streams from the Wyoming server first and
/// falls back to the side channel when that yields nothing usable.
pub struct PiperSynthesizer {
    config: ClientConfig,
    fallback: Option<Box<dyn FallbackCapture>>,
    format: WavFormat,
    cancel: Option<Arc<AtomicBool>>,
}

impl PiperSynthesizer {
    /// Build from configuration. A configured fallback section enables the
    /// docker side channel.
    pub fn new(config: ClientConfig) -> Self {
        let fallback = config
            .fallback
            .clone()
            .map(|fallback| Box::new(DockerExecCapture::new(fallback)) as Box<dyn FallbackCapture>);

        Self {
            config,
            fallback,
            format: WavFormat::default(),
            cancel: None,
        }
    }

    /// Replace the fallback side channel.
    pub fn with_fallback(mut self, fallback: Box<dyn FallbackCapture>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Synthesize `text` into a WAV file.
    ///
    /// Without `output`, the file goes to the configured output directory under
    /// a name derived from the text. Never panics and never leaves a partial
    /// file behind; every failure is reported in the result.
    pub fn synthesize(&self, text: &str, output: Option<&Path>, speaker_id: u32) -> SynthesisResult {
        match self.try_synthesize(text, output, speaker_id) {
            Ok(report) => SynthesisResult {
                success: true,
                message: report.message(),
            },
            Err(e) => SynthesisResult {
                success: false,
                message: e.to_string(),
            },
        }
    }

    /// Like [`synthesize`](Self::synthesize) but with structured results.
    pub fn try_synthesize(
        &self,
        text: &str,
        output: Option<&Path>,
        speaker_id: u32,
    ) -> Result<SynthesisReport> {
        info!("🔀 Stage: {}", SynthesisStage::Init);
        let request = SynthesisRequest::new(text, speaker_id)?;
        let path = output
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_output_path(&self.config.output_dir, text));

        let result = self
            .collect_audio(&request)
            .and_then(|audio| self.write_output(&path, audio));

        match &result {
            Ok(report) => info!(
                "🔀 Stage: {} ({} bytes from {:?})",
                SynthesisStage::Success,
                report.pcm_bytes,
                report.source
            ),
            Err(e) => error!("🔀 Stage: {} ({})", SynthesisStage::Failed, e),
        }
        result
    }

    fn collect_audio(&self, request: &SynthesisRequest) -> Result<CollectedAudio> {
        let mut stage = match self.config.strategy {
            SynthesisStrategy::PrimaryThenFallback => SynthesisStage::TryingPrimary,
            SynthesisStrategy::FallbackOnly => SynthesisStage::TryingFallback,
        };
        let mut primary_error = None;

        loop {
            info!("🔀 Stage: {}", stage);
            match stage {
                SynthesisStage::TryingPrimary => match self.run_primary(request) {
                    Ok(audio) => return Ok(audio),
                    Err(e) if e.triggers_fallback() => {
                        warn!("⚠️ Streaming synthesis failed: {}", e);
                        primary_error = Some(e);
                        stage = SynthesisStage::TryingFallback;
                    }
                    Err(e) => return Err(e),
                },
                _ => return self.run_fallback(request, primary_error),
            }
        }
    }

    fn run_primary(&self, request: &SynthesisRequest) -> Result<CollectedAudio> {
        let mut session = ProtocolSession::new(self.config.session.clone());
        if let Some(flag) = &self.cancel {
            session = session.with_cancel_flag(Arc::clone(flag));
        }

        let outcome = session.run(request)?;
        if outcome.is_empty() {
            return Err(SynthesisError::EmptyResult);
        }

        Ok(CollectedAudio {
            pcm: outcome.audio,
            source: AudioSource::Stream,
            truncated_at: outcome.truncated.then_some(self.config.session.max_audio_bytes),
        })
    }

    fn run_fallback(
        &self,
        request: &SynthesisRequest,
        primary_error: Option<SynthesisError>,
    ) -> Result<CollectedAudio> {
        let result = match &self.fallback {
            Some(fallback) => fallback.capture(request),
            None => Err(FallbackError::NotConfigured),
        };

        match (result, primary_error) {
            (Ok(pcm), _) if !pcm.is_empty() => Ok(CollectedAudio {
                pcm,
                source: AudioSource::Fallback,
                truncated_at: None,
            }),
            (Ok(_), primary) => Err(combine(FallbackError::EmptyResult, primary)),
            // Nothing was attempted, so the streaming error is the real cause
            (Err(FallbackError::NotConfigured), Some(primary)) => {
                warn!("⚠️ No fallback configured");
                Err(primary)
            }
            (Err(e), primary) => Err(combine(e, primary)),
        }
    }

    fn write_output(&self, path: &Path, audio: CollectedAudio) -> Result<SynthesisReport> {
        let container = wav::encode(&audio.pcm, self.format)?;

        let output_error = |source| SynthesisError::Output {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(output_error)?;
        }
        wav::save(path, &container).map_err(output_error)?;

        Ok(SynthesisReport {
            path: path.to_path_buf(),
            pcm_bytes: audio.pcm.len(),
            source: audio.source,
            truncated_at: audio.truncated_at,
        })
    }
}

fn combine(fallback: FallbackError, primary: Option<SynthesisError>) -> SynthesisError {
    match primary {
        Some(primary) => SynthesisError::BothPathsFailed {
            fallback,
            primary: Box::new(primary),
        },
        None => SynthesisError::Fallback(fallback),
    }
}

/// `output_dir/<first 30 chars of text, non-alphanumerics as '_'>.wav`
pub fn default_output_path(output_dir: &Path, text: &str) -> PathBuf {
    let safe: String = text
        .chars()
        .take(30)
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    output_dir.join(format!("{}.wav", safe))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_output_path() {
        let path = default_output_path(
            Path::new("output"),
            "Hello, this is a test of the Piper Text-to-Speech system",
        );
        assert_eq!(path, PathBuf::from("output/Hello__this_is_a_test_of_the_P.wav"));
    }

    #[test]
    fn test_default_output_path_keeps_unicode_letters() {
        let path = default_output_path(Path::new("out"), "Grüße, Zoë!");
        assert_eq!(path, PathBuf::from("out/Grüße__Zoë_.wav"));
    }

    #[test]
    fn test_report_message() {
        let mut report = SynthesisReport {
            path: PathBuf::from("output/a.wav"),
            pcm_bytes: 10,
            source: AudioSource::Stream,
            truncated_at: None,
        };
        assert_eq!(
            report.message(),
            "Speech generated successfully and saved to output/a.wav"
        );

        report.truncated_at = Some(100_000);
        assert!(report.message().ends_with("(stream truncated at 100000 bytes)"));
    }
}
