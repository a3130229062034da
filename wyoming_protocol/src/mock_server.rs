//! Scripted single-connection Wyoming server for tests and local experiments.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::{debug, info};
use std::io::{self, BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// One step of the server's reply script.
#[derive(Debug, Clone)]
pub enum Step {
    /// Write these bytes as-is, in a single write.
    Send(Vec<u8>),
    /// Stay quiet for a while (the socket stays open).
    Pause(Duration),
}

impl Step {
    pub fn line(line: impl Into<String>) -> Self {
        let mut bytes = line.into().into_bytes();
        bytes.push(b'\n');
        Step::Send(bytes)
    }
}

/// `{"type":"audio",...}` carrying `pcm`, without the newline.
pub fn audio_frame(pcm: &[u8]) -> String {
    format!(
        "{{\"type\":\"audio\",\"data\":{{\"audio\":\"{}\"}}}}",
        STANDARD.encode(pcm)
    )
}

pub fn error_frame(text: &str) -> String {
    serde_json::json!({"type": "error", "data": {"text": text}}).to_string()
}

pub fn end_frame() -> String {
    "{\"type\":\"end\"}".to_string()
}

/// A port nothing is listening on, for connection-refused cases.
pub fn unused_port() -> io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Accepts one client, reads its request line, then plays the script and
/// closes the connection.
pub struct MockWyomingServer {
    listener: TcpListener,
    script: Vec<Step>,
}

impl MockWyomingServer {
    pub fn bind(script: Vec<Step>) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        Ok(Self { listener, script })
    }

    pub fn start(self) -> io::Result<MockServerHandle> {
        let address = self.listener.local_addr()?;
        let handle = thread::spawn(move || self.serve());
        Ok(MockServerHandle { address, handle })
    }

    fn serve(self) -> io::Result<String> {
        let (mut stream, peer) = self.listener.accept()?;
        info!("🎙️ Mock Wyoming server accepted {}", peer);

        let mut request = String::new();
        BufReader::new(stream.try_clone()?).read_line(&mut request)?;
        debug!("📥 Mock server got request: {}", request.trim_end());

        for step in self.script {
            let result = match step {
                Step::Send(bytes) => stream.write_all(&bytes).and_then(|_| stream.flush()),
                Step::Pause(duration) => {
                    thread::sleep(duration);
                    Ok(())
                }
            };
            // The client is allowed to hang up early
            if let Err(e) = result {
                debug!("📤 Mock server stopped writing: {}", e);
                break;
            }
        }

        info!("🛑 Mock Wyoming server closing connection");
        Ok(request)
    }
}

pub struct MockServerHandle {
    address: SocketAddr,
    handle: JoinHandle<io::Result<String>>,
}

impl MockServerHandle {
    pub fn host(&self) -> String {
        self.address.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }

    /// Wait for the script to finish and return the request line received.
    pub fn join(self) -> io::Result<String> {
        self.handle
            .join()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "mock server thread panicked"))?
    }
}
