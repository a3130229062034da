use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use wyoming_protocol::SessionConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {var}: {reason}")]
    InvalidValue {
        var: String,
        value: String,
        reason: String,
    },
}

/// Which synthesis paths to try, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SynthesisStrategy {
    /// Stream over the Wyoming protocol; use the fallback only if that yields nothing.
    #[default]
    PrimaryThenFallback,
    /// Skip the protocol and go straight to the side channel.
    FallbackOnly,
}

impl fmt::Display for SynthesisStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SynthesisStrategy::PrimaryThenFallback => write!(f, "primary-then-fallback"),
            SynthesisStrategy::FallbackOnly => write!(f, "fallback-only"),
        }
    }
}

impl FromStr for SynthesisStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary-then-fallback" | "primary" => Ok(SynthesisStrategy::PrimaryThenFallback),
            "fallback-only" | "fallback" => Ok(SynthesisStrategy::FallbackOnly),
            other => Err(format!(
                "unknown strategy '{}', expected 'primary-then-fallback' or 'fallback-only'",
                other
            )),
        }
    }
}

/// How to reach Piper through `docker exec` when streaming fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackConfig {
    pub docker_bin: PathBuf,
    pub container: String,
    pub piper_bin: String,
    /// Voice model path inside the container
    pub model: String,
    /// Scratch directory inside the container
    pub remote_dir: String,
}

impl FallbackConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            docker_bin: PathBuf::from("docker"),
            container: "piper".to_string(),
            piper_bin: "piper".to_string(),
            model: model.into(),
            remote_dir: "/tmp".to_string(),
        }
    }
}

/// Everything the client needs from its surroundings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub session: SessionConfig,
    pub strategy: SynthesisStrategy,
    /// Where generated file names go when the caller gives no output path
    pub output_dir: PathBuf,
    pub fallback: Option<FallbackConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            strategy: SynthesisStrategy::default(),
            output_dir: PathBuf::from("output"),
            fallback: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from the environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Don't error if .env doesn't exist
        dotenvy::dotenv().ok();
        let config = Self::from_vars(|key| env::var(key).ok())?;
        log::debug!("⚙️ Loaded configuration: {:?}", config);
        Ok(config)
    }

    /// Build from an arbitrary variable lookup. Unset variables keep defaults.
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let session = &mut config.session;

        if let Some(host) = lookup("PIPER_HOST") {
            session.host = host;
        }
        if let Some(port) = parse_var(&lookup, "PIPER_PORT")? {
            session.port = port;
        }
        if let Some(secs) = parse_secs(&lookup, "PIPER_CONNECT_TIMEOUT_SECS")? {
            session.connect_timeout = secs;
        }
        if let Some(secs) = parse_secs(&lookup, "PIPER_READ_TIMEOUT_SECS")? {
            session.read_timeout = secs;
        }
        if let Some(secs) = parse_secs(&lookup, "PIPER_TIMEOUT_SECS")? {
            session.overall_timeout = secs;
        }
        if let Some(max) = parse_var(&lookup, "PIPER_MAX_AUDIO_BYTES")? {
            session.max_audio_bytes = max;
        }
        if let Some(strategy) = parse_var(&lookup, "PIPER_STRATEGY")? {
            config.strategy = strategy;
        }
        if let Some(dir) = lookup("PIPER_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(dir);
        }

        if let Some(model) = lookup("PIPER_MODEL") {
            let mut fallback = FallbackConfig::new(model);
            if let Some(docker) = lookup("PIPER_DOCKER_BIN") {
                fallback.docker_bin = PathBuf::from(docker);
            }
            if let Some(container) = lookup("PIPER_CONTAINER") {
                fallback.container = container;
            }
            if let Some(piper) = lookup("PIPER_BIN") {
                fallback.piper_bin = piper;
            }
            config.fallback = Some(fallback);
        }

        Ok(config)
    }
}

fn parse_var<F, T>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                var: var.to_string(),
                reason: e.to_string(),
                value,
            }),
    }
}

fn parse_secs<F>(lookup: &F, var: &str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match parse_var::<F, u64>(lookup, var)? {
        Some(0) => Err(ConfigError::InvalidValue {
            var: var.to_string(),
            value: "0".to_string(),
            reason: "timeout must be at least one second".to_string(),
        }),
        other => Ok(other.map(Duration::from_secs)),
    }
}
