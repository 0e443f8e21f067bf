use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use perch_orchestrator::{capture, speech, Config, ControlHandler, EventWriter};

/// Perch - voice interaction orchestrator for an animatronic character
#[derive(Parser)]
#[command(name = "perch", version, about)]
struct Cli {
    /// Path to a perch.toml config file
    #[arg(short, long, env = "PERCH_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Record from the microphone and report signal levels
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u32,
    },
    /// Play a test tone on both speaker devices
    TestSpeaker,
    /// Synthesize and play a line of text
    TestTts {
        /// Text to speak
        #[arg(default_value = "Squawk! Testing one two three.")]
        text: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,perch_orchestrator=info",
        1 => "info,perch_orchestrator=debug",
        2 => "debug",
        _ => "trace",
    };

    // stdout belongs to the control protocol; all diagnostics go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?;

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration } => test_mic(&config, duration).await,
            Command::TestSpeaker => test_speaker(&config).await,
            Command::TestTts { text } => test_tts(&config, &text).await,
        };
    }

    tracing::info!(port = config.backend.port, "starting perch orchestrator");

    let mut handler = ControlHandler::new(Arc::new(config), EventWriter::stdout())?;
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    handler.run(stdin).await?;

    Ok(())
}

/// Record a clip and report its signal levels
async fn test_mic(config: &Config, duration: u32) -> anyhow::Result<()> {
    println!("Recording from {} for {duration} seconds...", config.audio.mic_device);
    println!("Speak into the microphone!\n");

    let mut audio = config.audio.clone();
    audio.record_seconds = duration;

    // event lines go to stdout here too; harmless on a bench
    let events = EventWriter::stdout();
    let clip = capture::record(&audio, &events).await?;

    let mut reader = hound::WavReader::open(clip.path())?;
    let samples: Vec<i16> = reader.samples::<i16>().filter_map(Result::ok).collect();

    let peak = samples.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);
    let mean = speech::amplitude_of(&samples) / 2;

    println!("Captured {} samples", samples.len());
    println!("Peak: {peak} / 32767");
    println!("Mean level: {mean} / 32767");
    println!("\n---");
    println!("If peak stayed near 0, check:");
    println!("  1. Is the mic plugged in?");
    println!("  2. Run: arecord -l (to list devices)");
    println!("  3. Check PERCH_MIC_DEVICE matches a listed device");

    Ok(())
}

/// Play a 440 Hz tone on both configured speaker devices
async fn test_speaker(config: &Config) -> anyhow::Result<()> {
    println!("Playing a 440Hz tone on both devices for 2 seconds...\n");

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: config.audio.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let tone = tempfile::Builder::new()
        .prefix("perch-tone-")
        .suffix(".wav")
        .tempfile()?
        .into_temp_path();

    {
        let mut writer = hound::WavWriter::create(&tone, spec)?;
        let num_samples = config.audio.sample_rate * 2;
        for i in 0..num_samples {
            let t = f64::from(i) / f64::from(config.audio.sample_rate);
            let value = (2.0 * std::f64::consts::PI * 440.0 * t).sin() * 0.3;
            #[allow(clippy::cast_possible_truncation)]
            let sample = (value * f64::from(i16::MAX)) as i16;
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }

    for device in [&config.audio.speaker_device, &config.audio.speaker_device_2] {
        println!("Playing on {device}...");
        let status = tokio::process::Command::new("aplay")
            .args(["-D", device])
            .arg("-q")
            .arg(tone.as_os_str())
            .status()
            .await?;
        if !status.success() {
            println!("  aplay failed on {device} (exit {:?})", status.code());
        }
    }

    println!("\n---");
    println!("If you heard the tone on both devices, playback is working!");
    println!("If not, run: aplay -l (to list devices)");

    Ok(())
}

/// Synthesize text with piper and play it with the full speaking envelope
async fn test_tts(config: &Config, text: &str) -> anyhow::Result<()> {
    println!("Synthesizing: \"{text}\"\n");

    let events = EventWriter::stdout();
    speech::speak(text, &config.tts, &config.audio, &events).await?;

    println!("\n---");
    println!("If you heard the line (and saw AMP events above), TTS is working!");

    Ok(())
}
