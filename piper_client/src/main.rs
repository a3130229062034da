use anyhow::{Context, Result};
use clap::Parser;
use piper_client::{ClientConfig, FallbackConfig, PiperSynthesizer, SynthesisStrategy};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Synthesize speech with a Wyoming Piper server", long_about = None)]
pub struct Args {
    /// Text to speak
    text: String,

    /// Output WAV file (defaults to a name derived from the text)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Speaker id for multi-speaker voices
    #[arg(short, long, default_value_t = 0)]
    speaker: u32,

    /// Wyoming server host (overrides PIPER_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Wyoming server port (overrides PIPER_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Overall deadline in seconds (overrides PIPER_TIMEOUT_SECS)
    #[arg(long)]
    timeout: Option<u64>,

    /// Skip the stream and synthesize through docker exec only
    #[arg(long)]
    fallback_only: bool,

    /// Container running Piper (overrides PIPER_CONTAINER)
    #[arg(long)]
    container: Option<String>,

    /// Voice model inside the container; enables the docker fallback
    #[arg(long)]
    model: Option<String>,
}

fn apply_args(config: &mut ClientConfig, args: &Args) {
    if let Some(host) = &args.host {
        config.session.host = host.clone();
    }
    if let Some(port) = args.port {
        config.session.port = port;
    }
    if let Some(secs) = args.timeout.filter(|secs| *secs > 0) {
        config.session.overall_timeout = Duration::from_secs(secs);
    }
    if args.fallback_only {
        config.strategy = SynthesisStrategy::FallbackOnly;
    }
    if let Some(model) = &args.model {
        config
            .fallback
            .get_or_insert_with(|| FallbackConfig::new(model.clone()))
            .model = model.clone();
    }
    if let (Some(container), Some(fallback)) = (&args.container, config.fallback.as_mut()) {
        fallback.container = container.clone();
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    log::debug!("🚀 Starting piper-say with args: {:?}", args);

    let mut config = ClientConfig::from_env().context("Failed to load configuration")?;
    apply_args(&mut config, &args);
    if args.container.is_some() && config.fallback.is_none() {
        log::warn!("⚠️ --container has no effect without a model (--model or PIPER_MODEL)");
    }

    let synthesizer = PiperSynthesizer::new(config);
    let result = synthesizer.synthesize(&args.text, args.output.as_deref(), args.speaker);

    if result.success {
        println!("Success: {}", result.message);
        Ok(())
    } else {
        eprintln!("Error: {}", result.message);
        std::process::exit(1);
    }
}
