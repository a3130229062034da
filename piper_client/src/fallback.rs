//! Out-of-band synthesis through `docker exec`, used when the Wyoming stream
//! yields nothing usable.
//!
//! The container that serves the Wyoming protocol also ships the `piper`
//! executable. We run it once with `--output_raw` into a scratch file inside
//! the container, copy that file out with `docker cp`, and read the raw PCM.
//! Both the remote scratch file and the local copy are removed on every path.

use crate::config::FallbackConfig;
use log::{debug, error, info, warn};
use std::ffi::OsString;
use std::io::{self, Write};
use std::process::{Command, ExitStatus, Output, Stdio};
use tempfile::NamedTempFile;
use thiserror::Error;
use uuid::Uuid;
use wyoming_protocol::SynthesisRequest;

#[derive(Error, Debug)]
pub enum FallbackError {
    #[error("no fallback capture is configured")]
    NotConfigured,

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{command} exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("synthesized audio could not be retrieved: {0}")]
    MissingArtifact(String),

    #[error("fallback produced no audio")]
    EmptyResult,

    #[error("temporary file error: {0}")]
    TempFile(#[source] io::Error),
}

/// A one-shot side channel that returns raw PCM for a request.
pub trait FallbackCapture: Send + Sync {
    fn capture(&self, request: &SynthesisRequest) -> Result<Vec<u8>, FallbackError>;
}

// Positional parameters keep user-controlled values out of the shell text
const SYNTHESIZE_SCRIPT: &str = r#"exec "$0" --model "$1" --speaker "$2" --output_raw > "$3""#;

/// Runs `piper` inside the Wyoming container via the docker CLI.
#[derive(Debug, Clone)]
pub struct DockerExecCapture {
    config: FallbackConfig,
}

impl DockerExecCapture {
    pub fn new(config: FallbackConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FallbackConfig {
        &self.config
    }

    fn remote_path(&self) -> String {
        format!(
            "{}/piper-fallback-{}.raw",
            self.config.remote_dir.trim_end_matches('/'),
            Uuid::new_v4()
        )
    }

    fn synthesize_args(&self, request: &SynthesisRequest, remote_path: &str) -> Vec<OsString> {
        let speaker = request.speaker_id().to_string();
        [
            "exec",
            "-i",
            self.config.container.as_str(),
            "sh",
            "-c",
            SYNTHESIZE_SCRIPT,
            self.config.piper_bin.as_str(),
            self.config.model.as_str(),
            speaker.as_str(),
            remote_path,
        ]
        .into_iter()
        .map(OsString::from)
        .collect()
    }

    fn copy_args(&self, remote_path: &str, local: &NamedTempFile) -> Vec<OsString> {
        vec![
            OsString::from("cp"),
            OsString::from(format!("{}:{}", self.config.container, remote_path)),
            local.path().as_os_str().to_os_string(),
        ]
    }

    /// Run the docker CLI, feeding `stdin` if given, and require success.
    fn docker(&self, args: &[OsString], stdin: Option<&[u8]>) -> Result<Output, FallbackError> {
        let program = self.config.docker_bin.display().to_string();
        let command_name = match args.first() {
            Some(sub) => format!("{} {}", program, sub.to_string_lossy()),
            None => program.clone(),
        };
        debug!("🐳 Running {} {:?}", program, args);

        let mut child = Command::new(&self.config.docker_bin)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| FallbackError::Spawn {
                program: program.clone(),
                source,
            })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            // A child that exits without reading stdin reports through its status
            if let Err(e) = pipe.write_all(input) {
                if e.kind() != io::ErrorKind::BrokenPipe {
                    warn!("⚠️ Failed to write text to {}: {}", command_name, e);
                }
            }
            // Dropping the pipe closes stdin
        }

        let output = child
            .wait_with_output()
            .map_err(|source| FallbackError::Spawn { program, source })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!("❌ {} failed ({}): {}", command_name, output.status, stderr);
            return Err(FallbackError::CommandFailed {
                command: command_name,
                status: output.status,
                stderr,
            });
        }

        Ok(output)
    }
}

impl FallbackCapture for DockerExecCapture {
    fn capture(&self, request: &SynthesisRequest) -> Result<Vec<u8>, FallbackError> {
        info!(
            "🐳 Fallback synthesis via docker exec in container '{}'",
            self.config.container
        );

        let remote = RemoteArtifact {
            capture: self,
            path: self.remote_path(),
        };

        self.docker(
            &self.synthesize_args(request, &remote.path),
            Some(request.text().as_bytes()),
        )?;

        let local = tempfile::Builder::new()
            .prefix("piper-fallback-")
            .suffix(".raw")
            .tempfile()
            .map_err(FallbackError::TempFile)?;

        self.docker(&self.copy_args(&remote.path, &local), None)
            .map_err(|e| match e {
                FallbackError::CommandFailed { stderr, .. } => FallbackError::MissingArtifact(stderr),
                other => other,
            })?;

        let pcm = std::fs::read(local.path()).map_err(FallbackError::TempFile)?;
        if pcm.is_empty() {
            warn!("⚠️ Fallback synthesis produced an empty file");
            return Err(FallbackError::EmptyResult);
        }

        info!("✅ Fallback retrieved {} bytes of PCM", pcm.len());
        Ok(pcm)
    }
}

/// Scratch file inside the container. Removed when dropped.
struct RemoteArtifact<'a> {
    capture: &'a DockerExecCapture,
    path: String,
}

impl Drop for RemoteArtifact<'_> {
    fn drop(&mut self) {
        let args: Vec<OsString> = [
            "exec",
            self.capture.config.container.as_str(),
            "rm",
            "-f",
            self.path.as_str(),
        ]
        .into_iter()
        .map(OsString::from)
        .collect();

        match self.capture.docker(&args, None) {
            Ok(_) => debug!("🧹 Removed {} from container", self.path),
            Err(e) => warn!("⚠️ Could not remove {} from container: {}", self.path, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture() -> DockerExecCapture {
        let mut config = FallbackConfig::new("/data/en_US-lessac-medium.onnx");
        config.container = "wyoming-piper".to_string();
        DockerExecCapture::new(config)
    }

    #[test]
    fn test_synthesize_args() {
        let request = SynthesisRequest::new("it's \"quoted\"; rm -rf /", 4).unwrap();
        let args = capture().synthesize_args(&request, "/tmp/out.raw");

        let args: Vec<String> = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "exec",
                "-i",
                "wyoming-piper",
                "sh",
                "-c",
                SYNTHESIZE_SCRIPT,
                "piper",
                "/data/en_US-lessac-medium.onnx",
                "4",
                "/tmp/out.raw",
            ]
        );
        // Text travels over stdin, never on the command line
        assert!(!args.iter().any(|a| a.contains("quoted")));
    }

    #[test]
    fn test_remote_paths_are_unique() {
        let capture = capture();
        let first = capture.remote_path();
        let second = capture.remote_path();

        assert!(first.starts_with("/tmp/piper-fallback-"));
        assert!(first.ends_with(".raw"));
        assert_ne!(first, second);
    }

    #[test]
    fn test_missing_docker_binary() {
        let mut config = FallbackConfig::new("model.onnx");
        config.docker_bin = "/nonexistent/docker-binary".into();
        let capture = DockerExecCapture::new(config);
        let request = SynthesisRequest::new("hello", 0).unwrap();

        let result = capture.capture(&request);
        assert!(matches!(result, Err(FallbackError::Spawn { .. })));
    }
}
