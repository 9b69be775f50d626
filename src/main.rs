use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use clap::{Parser, Subcommand};
use cpal::traits::{DeviceTrait, HostTrait};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::Instrument;
use tracing_subscriber::EnvFilter;

use beacon_lens::camera::{CameraDevice, ImageBytes};
use beacon_lens::permission::{InputDevicePermissions, PermissionProvider, StaticPermissions};
use beacon_lens::speech::{
    CloudRecognizer, CloudSynthesizer, RecognitionEngine, SilentSynthesizer, SpeechEngine,
    UnsupportedRecognizer,
};
use beacon_lens::voice::{
    AudioCapture, AudioPlayback, Clip, SpeechToText, TextToSpeech, calculate_energy, decode_mp3,
};
use beacon_lens::{
    Config, Error, Facing, PermissionGate, PermissionState, SessionComponents, SessionHandle,
    SessionOrchestrator, SessionSnapshot, StillImageCamera, VisionQuery, VisionQueryService,
};

/// Beacon Lens - ask your camera questions out loud
#[derive(Parser)]
#[command(name = "lens", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Image served by the front camera
    #[arg(long)]
    front_image: Option<PathBuf>,

    /// Image served by the back camera
    #[arg(long)]
    back_image: Option<PathBuf>,

    /// Print answers instead of speaking them
    #[arg(long, env = "LENS_NO_VOICE_OUTPUT")]
    no_voice_output: bool,

    /// Treat the microphone as allowed without probing the device
    #[arg(long, env = "LENS_ASSUME_MIC_GRANTED")]
    assume_mic_granted: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive session (default)
    Run,
    /// Ask one question about an image file
    Describe {
        /// Image to analyze
        image: PathBuf,
        /// Question to ask
        question: String,
    },
    /// List cameras and audio devices
    Devices,
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
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,beacon_lens=info",
        1 => "info,beacon_lens=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if cli.front_image.is_some() {
        config.camera.front_image = cli.front_image;
    }
    if cli.back_image.is_some() {
        config.camera.back_image = cli.back_image;
    }
    if cli.no_voice_output {
        config.voice.output_enabled = false;
    }
    tracing::debug!(?config, "loaded configuration");

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let session_id = uuid::Uuid::new_v4();
            interactive(&config, cli.assume_mic_granted)
                .instrument(tracing::info_span!("session", id = %session_id))
                .await
        }
        Command::Describe { image, question } => describe(&config, &image, &question).await,
        Command::Devices => devices(&config).await,
        Command::TestMic { duration } => test_mic(duration).await,
        Command::TestSpeaker => test_speaker().await,
        Command::TestTts { text } => test_tts(&config, &text).await,
    }
}

/// Build the speech engines, falling back when no API key is configured
fn speech_engines(config: &Config) -> (Arc<dyn RecognitionEngine>, Arc<dyn SpeechEngine>) {
    let recognizer: Arc<dyn RecognitionEngine> = match config
        .api_keys
        .openai()
        .map(|key| SpeechToText::new_whisper(key, config.voice.stt_model.clone()))
    {
        Some(Ok(stt)) => Arc::new(CloudRecognizer::new(stt.with_locale(&config.voice.locale))),
        Some(Err(e)) => {
            tracing::warn!(error = %e, "speech recognition unavailable");
            Arc::new(UnsupportedRecognizer)
        }
        None => Arc::new(UnsupportedRecognizer),
    };

    let synthesizer: Arc<dyn SpeechEngine> = match config
        .api_keys
        .openai()
        .map(|key| TextToSpeech::new_openai(key, config.voice.tts_model.clone()))
    {
        Some(Ok(tts)) => Arc::new(CloudSynthesizer::new(
            tts,
            config.voice.tts_voice.clone(),
            config.voice.locale.clone(),
        )),
        Some(Err(e)) => {
            tracing::warn!(error = %e, "speech output unavailable");
            Arc::new(SilentSynthesizer)
        }
        None => Arc::new(SilentSynthesizer),
    };

    (recognizer, synthesizer)
}

/// Run an interactive session on stdin
async fn interactive(config: &Config, assume_mic_granted: bool) -> anyhow::Result<()> {
    let provider: Arc<dyn PermissionProvider> = if assume_mic_granted {
        Arc::new(StaticPermissions(PermissionState::Granted))
    } else {
        Arc::new(InputDevicePermissions::new())
    };
    let permission = PermissionGate::new(provider);
    let microphone = permission.query_microphone().await;
    let _permission_listener = permission.listen_for_changes();
    tracing::info!(%microphone, "microphone permission");

    let (recognizer, synthesizer) = speech_engines(config);
    let components = SessionComponents {
        permission,
        camera: Arc::new(StillImageCamera::new(
            config.camera.front_image.clone(),
            config.camera.back_image.clone(),
        )),
        recognizer,
        synthesizer,
        vision: Arc::new(VisionQueryService::new(
            config.api_keys.openai(),
            config.vision_settings(),
        )),
    };

    let (handle, session) = SessionOrchestrator::spawn(components, config.session_settings());
    let printer = tokio::spawn(print_updates(handle.subscribe()));

    let facing = if config.camera.back_image.is_some() {
        Facing::Back
    } else {
        Facing::Front
    };
    start_camera(&handle, facing).await?;

    println!("Beacon Lens ready.");
    println!("  Enter = ask   s = stop   f = switch camera   c = camera on/off");
    println!("  m = voice output on/off   q = quit\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        match line.trim() {
            "" => handle.begin_turn().await?,
            "s" => handle.stop().await?,
            "f" => match handle.switch_facing().await {
                Ok(facing) => println!("Using the {facing} camera."),
                Err(e) => println!("{}", describe_error(&e)),
            },
            "c" => {
                if handle.snapshot().camera_active {
                    handle.stop_camera().await?;
                    println!("Camera off.");
                } else {
                    start_camera(&handle, handle.snapshot().facing).await?;
                }
            }
            "m" => {
                let enabled = !handle.snapshot().speech_output;
                handle.set_speech_output(enabled).await?;
                println!("Voice output {}.", if enabled { "on" } else { "off" });
            }
            "q" => break,
            other => println!("Unknown command '{other}'."),
        }
    }

    handle.shutdown().await.ok();
    session.await?;
    printer.abort();
    Ok(())
}

async fn start_camera(handle: &SessionHandle, facing: Facing) -> anyhow::Result<()> {
    match handle.start_camera(facing).await {
        Ok(facing) => println!("Using the {facing} camera."),
        Err(Error::SessionClosed) => return Err(Error::SessionClosed.into()),
        Err(e) => println!("{}", describe_error(&e)),
    }
    Ok(())
}

fn describe_error(error: &Error) -> String {
    match error {
        Error::Capture(e) => e.user_message(),
        Error::Query(e) => e.user_message().to_string(),
        other => other.to_string(),
    }
}

/// Print what changed in each published snapshot
async fn print_updates(mut state: watch::Receiver<SessionSnapshot>) {
    let mut last = state.borrow_and_update().clone();

    while state.changed().await.is_ok() {
        let next = state.borrow_and_update().clone();
        print_changes(&last, &next);
        last = next;
    }
}

fn print_changes(last: &SessionSnapshot, next: &SessionSnapshot) {
    if next.phase != last.phase {
        println!("[{}]", next.phase);
    }
    if next.status != last.status
        && let Some(status) = &next.status
    {
        println!("  > {status}");
    }
    if next.last_answer != last.last_answer
        && let Some(answer) = &next.last_answer
    {
        println!("\nAnswer: {answer}\n");
    }
    if next.last_error != last.last_error
        && let Some(error) = &next.last_error
    {
        println!("\nError: {error}\n");
    }
}

/// Ask one question about an image file
async fn describe(config: &Config, image: &std::path::Path, question: &str) -> anyhow::Result<()> {
    let data = tokio::fs::read(image).await?;
    let format = image::guess_format(&data)?;
    let image = ImageBytes {
        data,
        mime_type: format.to_mime_type(),
    };

    let service = VisionQueryService::new(config.api_keys.openai(), config.vision_settings());
    match service.query(&image, question).await {
        Ok(answer) => {
            println!("{answer}");
            Ok(())
        }
        Err(e) => {
            println!("{}", e.user_message());
            Err(e.into())
        }
    }
}

/// List configured cameras and audio devices
async fn devices(config: &Config) -> anyhow::Result<()> {
    let camera = StillImageCamera::new(
        config.camera.front_image.clone(),
        config.camera.back_image.clone(),
    );

    println!("Cameras:");
    let cameras = camera.list_video_devices().await;
    if cameras.is_empty() {
        println!("  (none; pass --front-image or --back-image)");
    }
    for device in cameras {
        let facing = device.facing.map_or_else(|| "?".to_string(), |f| f.to_string());
        println!("  {} [{facing}] {}", device.id, device.label);
    }

    let host = cpal::default_host();
    println!("\nMicrophones:");
    for device in host.input_devices()? {
        println!("  {}", device.name().unwrap_or_default());
    }
    println!("\nSpeakers:");
    for device in host.output_devices()? {
        println!("  {}", device.name().unwrap_or_default());
    }

    Ok(())
}

/// Test microphone input
#[allow(clippy::future_not_send)]
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut capture = AudioCapture::new()?;
    capture.start()?;
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples = capture.take_buffer();
        let energy = calculate_energy(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );
    }

    capture.stop();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let sample_rate = 24000_u32;
    let frequency = 440.0_f32;
    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..sample_rate * 2)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3
        })
        .collect();
    let clip = Clip {
        samples,
        sample_rate,
    };

    tokio::task::spawn_blocking(move || {
        AudioPlayback::new()?.play(&clip, 1.0, &AtomicBool::new(false))
    })
    .await??;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}

/// Test TTS output
async fn test_tts(config: &Config, text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let key = config
        .api_keys
        .openai()
        .ok_or_else(|| anyhow::anyhow!("OPENAI_API_KEY is not set"))?;
    let tts = TextToSpeech::new_openai(key, config.voice.tts_model.clone())?;

    println!("Synthesizing speech...");
    let mp3_data = tts.synthesize(text, &config.voice.tts_voice, 1.0).await?;
    println!("Got {} bytes of audio data", mp3_data.len());

    println!("Playing audio...");
    tokio::task::spawn_blocking(move || {
        let clip = decode_mp3(&mp3_data)?;
        AudioPlayback::new()?.play(&clip, 1.0, &AtomicBool::new(false))
    })
    .await??;

    println!("\n---");
    println!("If you heard the speech, TTS is working!");

    Ok(())
}
