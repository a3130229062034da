use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Could not connect to Wyoming server at {address}: {source}")]
    Connection {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Timed out after {elapsed:?} waiting for the server to finish")]
    Timeout { elapsed: Duration },

    #[error("Server error: {0}")]
    Server(String),

    #[error("Session cancelled")]
    Cancelled,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One synthesis request. Immutable once built, consumed once per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisRequest {
    text: String,
    speaker_id: u32,
}

impl SynthesisRequest {
    pub fn new(text: impl Into<String>, speaker_id: u32) -> Result<Self, ProtocolError> {
        let text = text.into();
        if text.is_empty() {
            return Err(ProtocolError::InvalidRequest(
                "Empty text provided".to_string(),
            ));
        }
        Ok(Self { text, speaker_id })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn speaker_id(&self) -> u32 {
        self.speaker_id
    }

    /// Serialize to the wire form, newline terminator included.
    pub fn to_line(&self) -> Result<Vec<u8>, ProtocolError> {
        let message = ClientMessage::Synthesize {
            data: SynthesizeData {
                text: &self.text,
                speaker: self.speaker_id.to_string(),
            },
        };
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');
        Ok(line)
    }
}

// Client → Server
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientMessage<'a> {
    Synthesize { data: SynthesizeData<'a> },
}

#[derive(Serialize)]
struct SynthesizeData<'a> {
    text: &'a str,
    // The server expects the speaker id string-encoded
    speaker: String,
}

// Server → Client
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ServerMessage {
    Audio {
        data: AudioData,
    },
    Error {
        #[serde(default)]
        data: ErrorData,
    },
    End,
}

#[derive(Deserialize)]
struct AudioData {
    audio: String,
}

#[derive(Deserialize, Default)]
struct ErrorData {
    #[serde(default)]
    text: Option<String>,
}

/// A decoded response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseFrame {
    /// Base64 text as it came off the wire. Decoding is up to the session.
    Audio { payload: String },
    Error { message: String },
    End,
}

impl ResponseFrame {
    /// `End` and `Error` close the stream; nothing after them is emitted.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResponseFrame::Audio { .. })
    }
}

impl From<ServerMessage> for ResponseFrame {
    fn from(message: ServerMessage) -> Self {
        match message {
            ServerMessage::Audio { data } => ResponseFrame::Audio {
                payload: data.audio,
            },
            ServerMessage::Error { data } => ResponseFrame::Error {
                message: data.text.unwrap_or_else(|| "Unknown error".to_string()),
            },
            ServerMessage::End => ResponseFrame::End,
        }
    }
}

/// Decode a single line (without its `\n`). Anything unusable yields `None`.
fn decode_line(line: &[u8]) -> Option<ResponseFrame> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return None;
    }

    let text = match std::str::from_utf8(line) {
        Ok(text) => text,
        Err(e) => {
            warn!("⚠️ Discarding non UTF-8 line ({} bytes): {}", line.len(), e);
            return None;
        }
    };

    match serde_json::from_str::<ServerMessage>(text) {
        Ok(message) => Some(message.into()),
        Err(e) => {
            warn!("⚠️ Discarding malformed frame {:?}: {}", preview(text), e);
            None
        }
    }
}

fn preview(text: &str) -> String {
    const MAX_CHARS: usize = 80;
    if text.chars().count() <= MAX_CHARS {
        text.to_string()
    } else {
        let head: String = text.chars().take(MAX_CHARS).collect();
        format!("{}…", head)
    }
}

/// Once this many consumed bytes sit in front of the cursor they are dropped.
const COMPACT_THRESHOLD: usize = 8 * 1024;

/// Longest line the parser will hold while waiting for its `\n`.
pub const DEFAULT_MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// Splits an inbound byte stream into frames on `\n`.
///
/// Chunks may cut a line anywhere; the unterminated tail is kept until the
/// rest arrives. Consumed bytes are skipped with a cursor and only compacted
/// away once they pile up, so a long stream isn't copied on every line.
///
/// A line that grows past the size limit without a terminator is discarded
/// like a malformed one, up to and including its eventual `\n`.
#[derive(Debug)]
pub struct FrameParser {
    buffer: Vec<u8>,
    cursor: usize,
    // Bytes before this offset are known to contain no `\n`
    scanned: usize,
    max_line_bytes: usize,
    // Inside an oversized line; drop bytes up to the next `\n`
    skipping: bool,
    finished: bool,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            cursor: 0,
            scanned: 0,
            max_line_bytes,
            skipping: false,
            finished: false,
        }
    }

    /// Append a chunk and return every frame it completes, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ResponseFrame> {
        let mut frames = Vec::new();
        if self.finished {
            if !chunk.is_empty() {
                debug!("🔚 Ignoring {} bytes received after end of stream", chunk.len());
            }
            return frames;
        }

        self.buffer.extend_from_slice(chunk);

        while !self.finished {
            let search_from = self.scanned.max(self.cursor);
            let Some(offset) = self.buffer[search_from..].iter().position(|&b| b == b'\n')
            else {
                self.discard_oversized_tail();
                break;
            };

            let line_end = search_from + offset;
            let frame = if self.skipping {
                self.skipping = false;
                debug!("🗑️ Dropped the rest of an oversized line");
                None
            } else {
                decode_line(&self.buffer[self.cursor..line_end])
            };
            self.cursor = line_end + 1;
            self.scanned = self.cursor;

            if let Some(frame) = frame {
                self.finished = frame.is_terminal();
                frames.push(frame);
            }
        }

        self.compact();
        frames
    }

    /// True once an `End` or `Error` frame has been emitted.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Bytes held back waiting for a line terminator.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len() - self.cursor
    }

    fn discard_oversized_tail(&mut self) {
        let pending = self.buffer.len() - self.cursor;
        if pending > self.max_line_bytes {
            if !self.skipping {
                warn!(
                    "⚠️ Discarding line longer than {} bytes without a terminator",
                    self.max_line_bytes
                );
            }
            self.skipping = true;
            self.buffer.truncate(self.cursor);
        }
        self.scanned = self.buffer.len();
    }

    fn compact(&mut self) {
        if self.finished {
            self.buffer.clear();
            self.cursor = 0;
            self.scanned = 0;
        } else if self.cursor == self.buffer.len() || self.cursor >= COMPACT_THRESHOLD {
            self.buffer.drain(..self.cursor);
            self.scanned -= self.cursor;
            self.cursor = 0;
        }
    }
}

/// Result of one bounded read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    Closed,
    TimedOut,
}

/// An open TCP connection to the synthesis server. Shut down on drop.
pub struct Connection {
    stream: TcpStream,
    peer: String,
}

impl Connection {
    /// Connect to `address` (`host:port`), trying each resolved address in turn.
    /// Name resolution counts against `connect_timeout` too.
    pub fn open(address: &str, connect_timeout: Duration) -> Result<Self, ProtocolError> {
        let connection_error = |source: io::Error| ProtocolError::Connection {
            address: address.to_string(),
            source,
        };

        let addrs = resolve(address, connect_timeout).map_err(connection_error)?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(Connection {
                        stream,
                        peer: address.to_string(),
                    });
                }
                Err(e) => {
                    debug!("🔌 Connect to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(connection_error(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing")
        })))
    }

    /// Write one already-terminated line.
    pub fn write_line(&mut self, line: &[u8], timeout: Duration) -> Result<(), ProtocolError> {
        self.stream.set_write_timeout(Some(non_zero(timeout)))?;
        self.stream.write_all(line)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Read whatever is available, waiting at most `wait`.
    pub fn read_chunk(&mut self, buf: &mut [u8], wait: Duration) -> Result<ReadOutcome, ProtocolError> {
        self.stream.set_read_timeout(Some(non_zero(wait)))?;
        match self.stream.read(buf) {
            Ok(0) => Ok(ReadOutcome::Closed),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(ReadOutcome::TimedOut)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Already-closed sockets report NotConnected here
        let _ = self.stream.shutdown(Shutdown::Both);
        debug!("🔌 Closed connection to {}", self.peer);
    }
}

/// Resolve `address` within `timeout`. The lookup runs on a helper thread; if
/// it outlasts the timeout it finishes in the background and is dropped.
fn resolve(address: &str, timeout: Duration) -> io::Result<Vec<SocketAddr>> {
    resolve_with(address, timeout, |address| {
        address.to_socket_addrs().map(|addrs| addrs.collect())
    })
}

fn resolve_with<F>(address: &str, timeout: Duration, lookup: F) -> io::Result<Vec<SocketAddr>>
where
    F: FnOnce(&str) -> io::Result<Vec<SocketAddr>> + Send + 'static,
{
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(vec![addr]);
    }

    let (tx, rx) = mpsc::channel();
    let owned = address.to_string();
    thread::Builder::new()
        .name("wyoming-resolve".to_string())
        .spawn(move || {
            // The receiver is gone if we already gave up
            let _ = tx.send(lookup(owned.as_str()));
        })?;

    match rx.recv_timeout(non_zero(timeout)) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            warn!("⏳ Resolving {} took longer than {:?}", address, timeout);
            Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("resolving {} timed out", address),
            ))
        }
        Err(RecvTimeoutError::Disconnected) => Err(io::Error::new(
            io::ErrorKind::Other,
            "resolver thread exited without a result",
        )),
    }
}

// A zero timeout is rejected by the socket API
fn non_zero(timeout: Duration) -> Duration {
    timeout.max(Duration::from_millis(1))
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
    fn test_request_wire_format() {
        let request = SynthesisRequest::new("Hello there", 3).unwrap();
        let line = request.to_line().unwrap();

        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(
            std::str::from_utf8(&line).unwrap(),
            "{\"type\":\"synthesize\",\"data\":{\"text\":\"Hello there\",\"speaker\":\"3\"}}\n"
        );
    }

    #[test]
    fn test_request_escapes_text() {
        let request = SynthesisRequest::new("say \"hi\"\nnow", 0).unwrap();
        let line = request.to_line().unwrap();

        // The only newline is the terminator
        assert_eq!(line.iter().filter(|&&b| b == b'\n').count(), 1);
        let value: serde_json::Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(value["data"]["text"], "say \"hi\"\nnow");
    }

    #[test]
    fn test_empty_request_rejected() {
        let result = SynthesisRequest::new("", 0);
        assert!(matches!(result, Err(ProtocolError::InvalidRequest(_))));
    }

    #[test]
    fn test_parses_all_frame_kinds() {
        let mut parser = FrameParser::new();
        let frames = parser.feed(b"{\"type\":\"audio\",\"data\":{\"audio\":\"AAA=\"}}\n");
        assert_eq!(frames, vec![audio("AAA=")]);

        let mut parser = FrameParser::new();
        let frames = parser.feed(b"{\"type\":\"error\",\"data\":{\"text\":\"model not found\"}}\n");
        assert_eq!(
            frames,
            vec![ResponseFrame::Error {
                message: "model not found".to_string()
            }]
        );

        let mut parser = FrameParser::new();
        assert_eq!(parser.feed(b"{\"type\":\"end\"}\n"), vec![ResponseFrame::End]);
        assert!(parser.is_finished());
    }

    #[test]
    fn test_error_without_text() {
        let mut parser = FrameParser::new();
        let frames = parser.feed(b"{\"type\":\"error\"}\n");
        assert_eq!(
            frames,
            vec![ResponseFrame::Error {
                message: "Unknown error".to_string()
            }]
        );
    }

    #[test]
    fn test_line_split_across_chunks() {
        let stream = b"{\"type\":\"audio\",\"data\":{\"audio\":\"AQI=\"}}\n{\"type\":\"end\"}\n";
        let mut parser = FrameParser::new();
        let mut frames = Vec::new();

        // One byte at a time is the worst case for boundary handling
        for byte in stream.iter() {
            frames.extend(parser.feed(std::slice::from_ref(byte)));
        }

        assert_eq!(frames, vec![audio("AQI="), ResponseFrame::End]);
    }

    #[test]
    fn test_unterminated_tail_is_held() {
        let mut parser = FrameParser::new();
        assert!(parser.feed(b"{\"type\":\"en").is_empty());
        assert_eq!(parser.pending_bytes(), 11);
        assert_eq!(parser.feed(b"d\"}\n"), vec![ResponseFrame::End]);
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let mut parser = FrameParser::new();
        let mut chunk = Vec::new();
        chunk.extend_from_slice(b"{\"type\":\"audio\",\"data\":{\"audio\":\"AAA=\"}}\n");
        chunk.extend_from_slice(b"not-json\n");
        chunk.extend_from_slice(&[0xff, 0xfe, b'\n']);
        chunk.extend_from_slice(b"{\"type\":\"mystery\"}\n");
        chunk.extend_from_slice(b"{\"data\":{}}\n");
        chunk.extend_from_slice(b"{\"type\":\"audio\",\"data\":{}}\n");
        chunk.extend_from_slice(b"\n");
        chunk.extend_from_slice(b"{\"type\":\"audio\",\"data\":{\"audio\":\"AQI=\"}}\n");
        chunk.extend_from_slice(b"{\"type\":\"end\"}\n");

        let frames = parser.feed(&chunk);
        assert_eq!(frames, vec![audio("AAA="), audio("AQI="), ResponseFrame::End]);
    }

    #[test]
    fn test_oversized_line_is_discarded() {
        let mut parser = FrameParser::with_max_line_bytes(16);

        assert!(parser.feed(&[b'x'; 20]).is_empty());
        assert_eq!(parser.pending_bytes(), 0);
        // The buffer stays bounded while the runaway line keeps coming
        assert!(parser.feed(&[b'y'; 40]).is_empty());
        assert_eq!(parser.pending_bytes(), 0);

        let frames = parser.feed(b"zzz\n{\"type\":\"end\"}\n");
        assert_eq!(frames, vec![ResponseFrame::End]);
    }

    #[test]
    fn test_line_within_limit_survives_splitting() {
        let line = b"{\"type\":\"audio\",\"data\":{\"audio\":\"AAA=\"}}\n";
        let mut parser = FrameParser::with_max_line_bytes(line.len());

        assert!(parser.feed(&line[..30]).is_empty());
        assert_eq!(parser.feed(&line[30..]), vec![audio("AAA=")]);
    }

    #[test]
    fn test_resolution_respects_timeout() {
        let started = std::time::Instant::now();
        let result = resolve_with("slow.example:10200", Duration::from_millis(50), |_| {
            thread::sleep(Duration::from_secs(2));
            Ok(Vec::new())
        });

        let err = result.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_resolution_passes_through_lookup_result() {
        let expected: SocketAddr = "10.0.0.7:10200".parse().unwrap();
        let result = resolve_with("tts.local:10200", Duration::from_secs(1), move |address| {
            assert_eq!(address, "tts.local:10200");
            Ok(vec![expected])
        });
        assert_eq!(result.unwrap(), vec![expected]);
    }

    #[test]
    fn test_socket_address_literal_skips_lookup() {
        let result = resolve_with("127.0.0.1:10200", Duration::from_millis(1), |_| {
            Err(io::Error::new(io::ErrorKind::Other, "lookup should not run"))
        });
        assert_eq!(result.unwrap(), vec!["127.0.0.1:10200".parse().unwrap()]);
    }

    #[test]
    fn test_nothing_emitted_after_terminal_frame() {
        let mut parser = FrameParser::new();
        let frames = parser.feed(
            b"{\"type\":\"error\",\"data\":{\"text\":\"boom\"}}\n{\"type\":\"audio\",\"data\":{\"audio\":\"AAA=\"}}\n",
        );
        assert_eq!(frames.len(), 1);
        assert!(parser.is_finished());

        assert!(parser.feed(b"{\"type\":\"end\"}\n").is_empty());
        assert_eq!(parser.pending_bytes(), 0);
    }

    #[test]
    fn test_compaction_keeps_splitting_intact() {
        let line = b"{\"type\":\"audio\",\"data\":{\"audio\":\"AAAA\"}}\n";
        let mut parser = FrameParser::new();
        let mut count = 0;

        // Enough lines to cross the compaction threshold several times,
        // each fed with a partial line dangling at the end
        for _ in 0..1000 {
            count += parser.feed(&line[..10]).len();
            count += parser.feed(&line[10..]).len();
        }

        assert_eq!(count, 1000);
        assert_eq!(parser.pending_bytes(), 0);
    }
}
