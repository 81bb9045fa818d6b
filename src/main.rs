use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use hark::config::{TtsProvider, WakeEngineKind};
use hark::conversation::Update;
use hark::stream::StreamingTextClient;
use hark::voice::{
    AudioFrameSource, CaptureLoop, CloudSynthesizer, CloudTranscriber, ConsoleSynthesizer,
    ListenLimits, Microphone, PushToTalk, SentenceSegmenter, SpeechSynthesizer, TranscriptSpotter,
    UtteranceRecognizer, WakeWordEngine, pcm_to_f32, rms,
};
use hark::{Collaborators, Config, Orchestrator};

/// Hark - talk to a streaming AI assistant, hands free
#[derive(Parser)]
#[command(name = "hark", version, about)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, env = "HARK_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Wake on Enter instead of a spoken wake word
    #[arg(long)]
    push_to_talk: bool,

    /// Wait for the wake word before every question
    #[arg(long)]
    no_continuous: bool,

    /// Print replies instead of speaking them
    #[arg(long)]
    console_voice: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
    /// Send one query and print the streamed reply
    Ask {
        /// Question to send
        prompt: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity, RUST_LOG wins when set
    let filter = match cli.verbose {
        0 => "info,hark=info",
        1 => "info,hark=debug",
        2 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    if cli.push_to_talk {
        config.wake.engine = WakeEngineKind::PushToTalk;
    }
    if cli.no_continuous {
        config.dialog.continuous_dialog = false;
    }
    if cli.console_voice {
        config.speech.tts_provider = TtsProvider::Console;
    }

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration } => test_mic(&config, duration).await,
            Command::TestTts { text } => test_tts(&config, &text).await,
            Command::Ask { prompt } => ask(&config, &prompt).await,
        };
    }

    tracing::debug!(?config, "loaded configuration");
    converse(&config).await
}

/// Build the collaborators and run a session until Ctrl-C
async fn converse(config: &Config) -> anyhow::Result<()> {
    let runtime = Handle::current();
    let microphone = Microphone::new(config.audio.sample_rate);
    let frame_len = config.audio.frame_len();

    let transcriber = Arc::new(CloudTranscriber::from_config(&config.speech, runtime.clone())?);

    let wake = match config.wake.engine {
        WakeEngineKind::LocalModel => {
            let spotter = TranscriptSpotter::new(
                &config.wake.phrases,
                transcriber.clone(),
                microphone.sample_rate(),
            );
            WakeWordEngine::LocalModel(CaptureLoop::new(
                Box::new(microphone.tap()),
                Box::new(spotter),
                frame_len,
            ))
        }
        WakeEngineKind::PushToTalk => WakeWordEngine::ThirdPartyEngine(Box::new(PushToTalk::new())),
    };

    let recognizer = UtteranceRecognizer::new(
        Box::new(microphone.tap()),
        transcriber,
        ListenLimits::from(&config.speech),
        frame_len,
    );

    let orchestrator = Orchestrator::new(
        config,
        Collaborators {
            wake,
            recognizer: Box::new(recognizer),
            streamer: Arc::new(StreamingTextClient::new(&config.stream)?),
            synthesizer: synthesizer(config, runtime)?,
        },
    );

    let session = orchestrator.handle();
    let mut updates = orchestrator.subscribe();
    let mut running = tokio::spawn(orchestrator.run());

    session.start()?;
    match config.wake.engine {
        WakeEngineKind::LocalModel => {
            let phrases = config.wake.phrases.join("\", \"");
            tracing::info!("hark ready - say \"{phrases}\"");
        }
        WakeEngineKind::PushToTalk => tracing::info!("hark ready - press Enter to talk"),
    }

    loop {
        tokio::select! {
            result = &mut running => {
                result??;
                return Ok(());
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                session.shutdown()?;
                running.await??;
                return Ok(());
            }
            update = updates.recv() => match update {
                Ok(update) => show(&update),
                Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "update display lagging"),
                Err(RecvError::Closed) => {
                    running.await??;
                    return Ok(());
                }
            },
        }
    }
}

fn show(update: &Update) {
    match update {
        Update::Transcript(text) => println!("🗣  {text}"),
        Update::ResponseComplete(text) if !text.is_empty() => println!("🤖 {text}"),
        Update::Interrupted => println!("✋ interrupted"),
        Update::Error(message) => println!("⚠  {message}"),
        _ => {}
    }
}

fn synthesizer(config: &Config, runtime: Handle) -> anyhow::Result<Arc<dyn SpeechSynthesizer>> {
    let voice: Arc<dyn SpeechSynthesizer> = match config.speech.tts_provider {
        TtsProvider::Console => Arc::new(ConsoleSynthesizer::default()),
        _ => Arc::new(CloudSynthesizer::from_config(&config.speech, runtime)?),
    };
    Ok(voice)
}

/// Test microphone input
async fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let microphone = Microphone::new(config.audio.sample_rate);
    let mut tap = microphone.tap();
    let frame_len = config.audio.frame_len();

    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        tap.start()?;
        println!("Sample rate: {} Hz", tap.sample_rate());
        println!("---");

        let mut frame = vec![0i16; frame_len];
        for i in 0..duration {
            let second_end = Instant::now() + Duration::from_secs(1);
            let mut samples = Vec::new();
            while Instant::now() < second_end {
                let n = tap.read_frame(&mut frame)?;
                samples.extend(pcm_to_f32(&frame[..n]));
            }

            let energy = rms(&samples);
            let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

            // Visual meter
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let meter_len = (energy * 100.0).min(50.0) as usize;
            let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

            println!(
                "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
                i + 1,
                energy,
                peak,
                meter
            );
        }

        tap.stop();
        Ok(())
    })
    .await??;

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Test TTS output
async fn test_tts(config: &Config, text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let voice = synthesizer(config, Handle::current())?;
    voice.speak(text)?;

    // Synthesis happens off-thread; give it a moment to begin
    tokio::time::sleep(Duration::from_millis(200)).await;
    while voice.is_speaking() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    println!("\n---");
    println!("If you heard the speech, TTS is working!");
    Ok(())
}

/// Send one query and print each speakable unit as it is segmented
async fn ask(config: &Config, prompt: &str) -> anyhow::Result<()> {
    let client = StreamingTextClient::new(&config.stream)?;
    let mut segmenter = SentenceSegmenter::new(config.segmenter);

    let reply = client
        .query(prompt, |text| {
            for unit in segmenter.append(text) {
                println!("{unit}");
            }
        })
        .await?;
    if let Some(unit) = segmenter.flush() {
        println!("{unit}");
    }

    tracing::debug!(chars = reply.chars().count(), "reply complete");
    Ok(())
}
