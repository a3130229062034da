use crate::assembler::{AppendOutcome, AudioAssembler, DEFAULT_MAX_AUDIO_BYTES};
use crate::protocol::{
    Connection, FrameParser, ProtocolError, ReadOutcome, ResponseFrame, SynthesisRequest,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 10200;

const READ_CHUNK_SIZE: usize = 4096;

/// Where to connect and how long to wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    /// Bound on a single read. Expiry only means "try again".
    pub read_timeout: Duration,
    /// Hard budget for the whole session, connect included.
    pub overall_timeout: Duration,
    pub max_audio_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            overall_timeout: Duration::from_secs(30),
            max_audio_bytes: DEFAULT_MAX_AUDIO_BYTES,
        }
    }
}

impl SessionConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Why a session ended without completing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionFailure {
    Server(String),
    Timeout(Duration),
    Cancelled,
}

impl From<SessionFailure> for ProtocolError {
    fn from(failure: SessionFailure) -> Self {
        match failure {
            SessionFailure::Server(message) => ProtocolError::Server(message),
            SessionFailure::Timeout(elapsed) => ProtocolError::Timeout { elapsed },
            SessionFailure::Cancelled => ProtocolError::Cancelled,
        }
    }
}

/// Session progress. Moves forward only; terminal states absorb every event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    AwaitingFrame,
    Completed,
    Failed(SessionFailure),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionState::AwaitingFrame)
    }

    /// Apply one frame. Returns the next state and, for audio frames, the
    /// decoded PCM to buffer. A payload that isn't valid base64 is skipped.
    pub fn on_frame(self, frame: ResponseFrame) -> (SessionState, Option<Vec<u8>>) {
        if self.is_terminal() {
            return (self, None);
        }

        match frame {
            ResponseFrame::Audio { payload } => match STANDARD.decode(payload.as_bytes()) {
                Ok(pcm) => (SessionState::AwaitingFrame, Some(pcm)),
                Err(e) => {
                    warn!("⚠️ Skipping audio chunk with invalid base64: {}", e);
                    (SessionState::AwaitingFrame, None)
                }
            },
            ResponseFrame::Error { message } => {
                (SessionState::Failed(SessionFailure::Server(message)), None)
            }
            ResponseFrame::End => (SessionState::Completed, None),
        }
    }

    /// The server closed the connection. Without an `end` frame whatever
    /// arrived so far is taken as the whole stream.
    pub fn on_close(self) -> SessionState {
        match self {
            SessionState::AwaitingFrame => SessionState::Completed,
            terminal => terminal,
        }
    }

    pub fn fail(self, failure: SessionFailure) -> SessionState {
        match self {
            SessionState::AwaitingFrame => SessionState::Failed(failure),
            terminal => terminal,
        }
    }
}

/// Audio collected by a completed session.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub audio: Vec<u8>,
    pub audio_frames: usize,
    pub truncated: bool,
    /// The server closed the socket instead of sending `end`.
    pub closed_early: bool,
}

impl SessionOutcome {
    pub fn is_empty(&self) -> bool {
        self.audio.is_empty()
    }
}

/// One request/response exchange over a fresh TCP connection.
#[derive(Debug, Clone)]
pub struct ProtocolSession {
    config: SessionConfig,
    cancel: Option<Arc<AtomicBool>>,
}

impl ProtocolSession {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            cancel: None,
        }
    }

    /// Abort the session between reads once `flag` is set.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Send `request` and collect audio until `end`, an error frame, the
    /// overall deadline, or cancellation. The connection is closed on return.
    pub fn run(&self, request: &SynthesisRequest) -> Result<SessionOutcome, ProtocolError> {
        let started = Instant::now();
        let deadline = started + self.config.overall_timeout;
        let address = self.config.address();

        info!("📡 Connecting to Wyoming server at {}", address);
        let connect_timeout = self.config.connect_timeout.min(self.config.overall_timeout);
        let mut connection = Connection::open(&address, connect_timeout)?;
        info!("✅ Connected to Wyoming server");

        debug!(
            "📤 Sending synthesize request ({} chars, speaker {})",
            request.text().chars().count(),
            request.speaker_id()
        );
        let remaining = deadline.saturating_duration_since(Instant::now());
        connection.write_line(&request.to_line()?, remaining)?;

        let mut parser = FrameParser::new();
        let mut assembler = AudioAssembler::new(self.config.max_audio_bytes);
        let mut closed_early = false;
        let mut state = SessionState::AwaitingFrame;
        let mut buf = [0u8; READ_CHUNK_SIZE];

        let failure = loop {
            match state {
                SessionState::Completed => break None,
                SessionState::Failed(failure) => break Some(failure),
                SessionState::AwaitingFrame => {}
            }

            if self.is_cancelled() {
                state = state.fail(SessionFailure::Cancelled);
                continue;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                state = state.fail(SessionFailure::Timeout(started.elapsed()));
                continue;
            }

            match connection.read_chunk(&mut buf, remaining.min(self.config.read_timeout))? {
                ReadOutcome::Data(n) => {
                    for frame in parser.feed(&buf[..n]) {
                        let (next, pcm) = state.on_frame(frame);
                        state = next;
                        if let Some(pcm) = pcm {
                            if let AppendOutcome::Truncated { dropped } = assembler.append(&pcm) {
                                debug!("✂️ Dropped {} bytes over the size guard", dropped);
                            }
                        }
                    }
                }
                ReadOutcome::Closed => {
                    if parser.pending_bytes() > 0 {
                        warn!(
                            "⚠️ Connection closed with {} bytes of unterminated frame",
                            parser.pending_bytes()
                        );
                    }
                    warn!("🔚 Server closed the connection before sending end");
                    closed_early = true;
                    state = state.on_close();
                }
                ReadOutcome::TimedOut => {
                    debug!(
                        "⏳ No data yet after {:?}, still waiting",
                        started.elapsed()
                    );
                }
            }
        };

        drop(connection);

        if let Some(failure) = failure {
            match &failure {
                SessionFailure::Server(message) => error!("❌ Server error: {}", message),
                SessionFailure::Timeout(elapsed) => {
                    error!("❌ Session timed out after {:?}", elapsed)
                }
                SessionFailure::Cancelled => warn!("🛑 Session cancelled"),
            }
            return Err(failure.into());
        }

        let audio_frames = assembler.chunk_count();
        let truncated = assembler.is_truncated();
        let audio = assembler.finalize().to_vec();
        info!(
            "✅ Session complete: {} audio frames, {} bytes in {:?}",
            audio_frames,
            audio.len(),
            started.elapsed()
        );

        Ok(SessionOutcome {
            audio,
            audio_frames,
            truncated,
            closed_early,
        })
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio(payload: &str) -> ResponseFrame {
        ResponseFrame::Audio {
            payload: payload.to_string(),
        }
    }

    #[test]
    fn test_audio_frame_decodes_payload() {
        let (state, pcm) = SessionState::AwaitingFrame.on_frame(audio("AAA="));
        assert_eq!(state, SessionState::AwaitingFrame);
        assert_eq!(pcm, Some(vec![0, 0]));
    }

    #[test]
    fn test_bad_base64_is_skipped() {
        let (state, pcm) = SessionState::AwaitingFrame.on_frame(audio("!!not base64!!"));
        assert_eq!(state, SessionState::AwaitingFrame);
        assert_eq!(pcm, None);
    }

    #[test]
    fn test_terminal_transitions() {
        let (state, _) = SessionState::AwaitingFrame.on_frame(ResponseFrame::End);
        assert_eq!(state, SessionState::Completed);

        let (state, _) = SessionState::AwaitingFrame.on_frame(ResponseFrame::Error {
            message: "model not found".to_string(),
        });
        assert_eq!(
            state,
            SessionState::Failed(SessionFailure::Server("model not found".to_string()))
        );
    }

    #[test]
    fn test_terminal_states_are_never_left() {
        let (state, pcm) = SessionState::Completed.on_frame(audio("AAA="));
        assert_eq!(state, SessionState::Completed);
        assert_eq!(pcm, None);

        let failed = SessionState::Failed(SessionFailure::Cancelled);
        assert_eq!(failed.clone().on_close(), failed);
        assert_eq!(
            SessionState::Completed.fail(SessionFailure::Cancelled),
            SessionState::Completed
        );
    }

    #[test]
    fn test_close_completes_pending_session() {
        assert_eq!(
            SessionState::AwaitingFrame.on_close(),
            SessionState::Completed
        );
    }

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.address(), "localhost:10200");
        assert_eq!(config.read_timeout, Duration::from_secs(10));
        assert_eq!(config.overall_timeout, Duration::from_secs(30));
        assert_eq!(config.max_audio_bytes, 100_000);
    }
}
