use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use parley_engine::{
    AudioCaptureController, AudioPlayer, CloudAdapter, CloudTranscriber, CompletionClient, Config,
    DeviceCapabilities, EngineStatus, Orchestrator, RequestClient, SpeechSynthesis,
    SpeechSynthesizer, StatusSink, TranscriptionStrategy, VoiceActivityMonitor, VoiceParams,
};

/// Parley - real-time voice conversation engine
#[derive(Parser)]
#[command(name = "parley", version, about)]
struct Cli {
    /// Path to a configuration file (defaults to the platform config dir)
    #[arg(short, long, env = "PARLEY_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start a conversation (default)
    Run,
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Test TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the speech synthesis path.")]
        text: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,parley_engine=info",
        1 => "info,parley_engine=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_conversation(config).await,
        Command::TestMic { duration } => test_mic(&config, duration),
        Command::TestSpeaker => test_speaker(),
        Command::TestTts { text } => test_tts(&config, &text).await,
    }
}

#[allow(clippy::future_not_send)]
async fn run_conversation(config: Config) -> anyhow::Result<()> {
    let net = Arc::new(RequestClient::new());

    let transcriber = Arc::new(CloudTranscriber::new(&config.stt)?);
    let cloud = CloudAdapter::new(
        transcriber,
        Arc::clone(&net),
        config.retry.clone(),
        &config.stt,
        &config.capture,
        &config.vad,
    );

    // No platform recognizer is injected by the CLI host; the session
    // starts on the cloud adapter
    let capabilities = DeviceCapabilities {
        native_echo_cancellation: false,
        local_recognizer: false,
    };
    let strategy = TranscriptionStrategy::select(capabilities, None, cloud);

    let completion = Arc::new(CompletionClient::new(&config.completion)?);
    let synthesis = Arc::new(SpeechSynthesizer::new(&config.tts)?);
    let sink = Arc::new(AudioPlayer::new()?);
    let status = Arc::new(LogStatus);

    let capture = AudioCaptureController::new(&config.capture)?;

    let mut orchestrator = Orchestrator::new(
        config,
        capabilities,
        strategy,
        completion,
        synthesis,
        sink,
        status,
        net,
    )
    .with_capture(capture);

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(()).await;
        }
    });

    tracing::info!("starting conversation; press Ctrl-C to hang up");
    // Runs on the main thread: capture streams are not Send
    orchestrator.run(&mut shutdown_rx).await?;
    Ok(())
}

fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    let mut capture = AudioCaptureController::new(&config.capture)?;
    capture.start()?;
    tracing::info!(duration, "recording; speak into the microphone");

    std::thread::sleep(Duration::from_secs(duration));

    let chunk = capture
        .take_chunk()?
        .ok_or_else(|| anyhow::anyhow!("no audio captured"))?;
    let volume = VoiceActivityMonitor::chunk_volume(&chunk.bytes)?;
    capture.stop();

    tracing::info!(
        bytes = chunk.len(),
        volume_pct = volume,
        device_rate = chunk.source_sample_rate,
        "capture ok"
    );
    Ok(())
}

fn test_speaker() -> anyhow::Result<()> {
    let player = AudioPlayer::new()?;

    // One second 440 Hz tone
    let samples: Vec<f32> = (0..24_000)
        .map(|i| {
            let t = i as f32 / 24_000.0;
            (2.0 * std::f32::consts::PI * 440.0 * t).sin() * 0.4
        })
        .collect();

    tracing::info!("playing test tone");
    let handle = player.play_samples(samples)?;
    while !handle.is_finished() {
        std::thread::sleep(Duration::from_millis(50));
    }
    tracing::info!("speaker ok");
    Ok(())
}

async fn test_tts(config: &Config, text: &str) -> anyhow::Result<()> {
    let synthesizer = SpeechSynthesizer::new(&config.tts)?;
    let params = VoiceParams::from_config(&config.tts);

    tracing::info!(text, "synthesizing");
    let audio = synthesizer.synthesize(text, &params).await?;

    let player = AudioPlayer::new()?;
    let handle = parley_engine::AudioSink::play(&player, &audio)?;
    handle.finished().await;
    tracing::info!("tts ok");
    Ok(())
}

/// CLI status collaborator: renders engine state as log lines
struct LogStatus;

impl StatusSink for LogStatus {
    fn update(&self, status: EngineStatus, transcript_preview: Option<&str>, reply: Option<&str>) {
        match (transcript_preview, reply) {
            (Some(text), _) => tracing::info!(?status, transcript = %text, "status"),
            (_, Some(text)) => tracing::info!(?status, reply = %text, "status"),
            _ => tracing::info!(?status, "status"),
        }
    }
}
