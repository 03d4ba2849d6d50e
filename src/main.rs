use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, anyhow};
use clap::Parser;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use waav_duplex::{
    DuplexConfig, FixedDelayGate, FunctionCallInfo, HandlerError, PlaybackRenderer,
    SessionEvent, SessionOrchestrator, SessionState,
};

/// Interval of the simulated output device callback.
const RENDER_PERIOD: Duration = Duration::from_millis(20);

/// Interval at which queued session work is applied.
const TICK_PERIOD: Duration = Duration::from_millis(10);

/// WaaV Duplex - talk to a live voice backend from the terminal
#[derive(Parser, Debug)]
#[command(name = "waav-duplex")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Prompt to send; repeat to send one per assistant turn
    #[arg(short = 't', long = "text", value_name = "PROMPT", required = true)]
    text: Vec<String>,

    /// Number of assistant turns to wait for (defaults to the number of prompts)
    #[arg(short = 'n', long = "turns", value_name = "N")]
    turns: Option<usize>,

    /// Write the rendered playback to a WAV file
    #[arg(short = 'r', long = "record", value_name = "FILE.wav")]
    record: Option<PathBuf>,

    /// Hold subtitles back by this many milliseconds before printing
    #[arg(long = "subtitle-delay-ms", value_name = "MS")]
    subtitle_delay_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Initialize crypto provider for TLS connections
    // This must be done before any TLS connections are attempted
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            DuplexConfig::from_file(path)?
        }
        None => DuplexConfig::from_env()?,
    };
    info!("Using model {} with voice {}", config.model, config.voice);

    let (mut session, renderer) = SessionOrchestrator::new(config.orchestrator_config())?;
    if let Some(ms) = cli.subtitle_delay_ms {
        session.register_gate(FixedDelayGate::new(Duration::from_millis(ms)));
    }
    session.set_function_handler(
        |call: &FunctionCallInfo| -> Result<Option<serde_json::Value>, HandlerError> {
            info!(call_id = %call.call_id, "Function call {} {}", call.name, call.args);
            Ok(Some(json!({ "acknowledged": true })))
        },
    );

    let device_cancel = CancellationToken::new();
    let device = tokio::spawn(run_output_device(
        renderer,
        config.playback_output_rate,
        config.output_channels,
        cli.record.clone(),
        device_cancel.clone(),
    ));

    session.connect().await?;

    let mut prompts = cli.text.into_iter();
    let turns = cli.turns.unwrap_or(prompts.len()).max(1);
    if let Some(prompt) = prompts.next() {
        println!("> {}", prompt);
        session.send_text(&prompt)?;
    }

    let mut completed = 0usize;
    let mut ticker = tokio::time::interval(TICK_PERIOD);
    let result = loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                break Ok(());
            }
        }

        let mut failed = None;
        for event in session.tick() {
            match event {
                SessionEvent::Packet(packet) => {
                    if !packet.text.is_empty() {
                        println!("[{}:{}] {}", packet.turn_id, packet.sequence, packet.text);
                    }
                }
                SessionEvent::InputTranscript { text } => println!("(you) {}", text),
                SessionEvent::AssistantSpeakingStopped { turn_id, interrupted } => {
                    info!(turn_id, interrupted, "Assistant finished speaking");
                    completed += 1;
                    if completed < turns {
                        if let Some(prompt) = prompts.next() {
                            println!("> {}", prompt);
                            if let Err(e) = session.send_text(&prompt) {
                                failed = Some(anyhow!(e));
                            }
                        }
                    }
                }
                SessionEvent::Error { message } => {
                    tracing::error!("Session error: {}", message);
                }
                SessionEvent::StateChanged { to: SessionState::Error, .. } => {
                    failed = Some(anyhow!("Session entered the error state"));
                }
                other => tracing::debug!(kind = other.kind(), "Session event"),
            }
        }

        if let Some(err) = failed {
            break Err(err);
        }
        if completed >= turns {
            break Ok(());
        }
    };

    session.disconnect().await?;
    device_cancel.cancel();
    device
        .await
        .context("Output device task panicked")?
        .context("Output device failed")?;

    let stats = session.playback().stats();
    info!(
        callbacks = stats.callbacks,
        rendered_frames = stats.rendered_frames,
        underrun_frames = stats.underrun_frames,
        dropped_samples = stats.dropped_samples,
        "Playback finished"
    );

    result
}

/// Pull audio from the renderer at device pace, optionally recording it.
async fn run_output_device(
    mut renderer: PlaybackRenderer,
    sample_rate: u32,
    channels: u16,
    record: Option<PathBuf>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut writer = match record {
        Some(path) => {
            let spec = hound::WavSpec {
                channels,
                sample_rate,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            };
            info!("Recording playback to {}", path.display());
            Some(
                hound::WavWriter::create(&path, spec)
                    .with_context(|| format!("Failed to create {}", path.display()))?,
            )
        }
        None => None,
    };

    let frames = (sample_rate as u64 * RENDER_PERIOD.as_millis() as u64 / 1000) as usize;
    let mut buffer = vec![0.0f32; frames * channels as usize];
    let mut ticker = tokio::time::interval(RENDER_PERIOD);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        renderer.render(&mut buffer, channels as usize);

        if let Some(writer) = writer.as_mut() {
            for sample in &buffer {
                let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
                writer.write_sample(value)?;
            }
        }
    }

    if let Some(writer) = writer {
        writer.finalize()?;
    }
    Ok(())
}
