//! Speech synthesis and playback worker
//!
//! One worker per turn drains a FIFO queue of sentence chunks. Each chunk is
//! synthesized with piper, amplified in place, then played on both output
//! devices at once while amplitude telemetry paces itself against the
//! wall clock. Playback progress is not observable from here, so the duty
//! cycle of one frame's duration per frame is what keeps `AMP` events
//! roughly aligned with what is audible.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{AudioConfig, TtsConfig};
use crate::protocol::{ControlEvent, EventWriter};
use crate::{Error, Result};

/// Queue capacity between the streamer and the worker
const CHUNK_QUEUE_DEPTH: usize = 32;

/// A unit of work for the playback worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TtsChunk {
    /// A non-empty span of assistant text to synthesize and play
    Text(String),
    /// Terminator: no more chunks this turn
    Done,
}

/// Renders one text chunk to audible output.
///
/// The seam exists so the queue and event discipline of the worker can be
/// exercised without piper or audio hardware.
#[async_trait]
pub trait ChunkRenderer: Send {
    /// Synthesize and play one chunk to completion
    async fn render(&mut self, text: &str) -> Result<()>;
}

/// Production renderer: piper → gain → dual aplay with telemetry
pub struct PiperRenderer {
    tts: TtsConfig,
    audio: AudioConfig,
    events: EventWriter,
}

impl PiperRenderer {
    /// Create a renderer for the configured engines and devices
    #[must_use]
    pub fn new(tts: TtsConfig, audio: AudioConfig, events: EventWriter) -> Self {
        Self { tts, audio, events }
    }
}

#[async_trait]
impl ChunkRenderer for PiperRenderer {
    async fn render(&mut self, text: &str) -> Result<()> {
        tracing::debug!(chunk = %text, "rendering tts chunk");

        let wav = synthesize(text, &self.tts).await?;
        let size = std::fs::metadata(&wav).map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            tracing::warn!(chunk = %text, "synthesis produced no audio, skipping chunk");
            return Ok(());
        }

        amplify_wav_in_place(&wav, self.audio.gain)?;
        play_with_telemetry(&wav, &self.audio, &self.events).await?;

        // wav drops here, deleting the temp file before the next chunk
        Ok(())
    }
}

/// Spawn a playback worker for one turn.
///
/// Returns the chunk sender and the worker's join handle; the caller must
/// send [`TtsChunk::Done`] last and await the handle so at most one worker
/// is live per turn.
#[must_use]
pub fn spawn_worker<R>(events: EventWriter, renderer: R) -> (mpsc::Sender<TtsChunk>, JoinHandle<()>)
where
    R: ChunkRenderer + 'static,
{
    let (tx, rx) = mpsc::channel(CHUNK_QUEUE_DEPTH);
    let handle = tokio::spawn(run_worker(rx, events, renderer));
    (tx, handle)
}

/// Drain the chunk queue in FIFO order.
///
/// Emits exactly one `SPEAKING` when the worker starts and exactly one
/// `DONE_SPEAKING` when the terminator is consumed (or the queue closes),
/// never per chunk. A chunk that fails to render is logged and skipped;
/// the rest of the turn still plays.
pub async fn run_worker<R>(mut rx: mpsc::Receiver<TtsChunk>, events: EventWriter, mut renderer: R)
where
    R: ChunkRenderer,
{
    events.emit(&ControlEvent::Speaking);

    while let Some(chunk) = rx.recv().await {
        match chunk {
            TtsChunk::Text(text) => {
                if let Err(e) = renderer.render(&text).await {
                    tracing::error!(error = %e, chunk = %text, "chunk render failed");
                }
            }
            TtsChunk::Done => break,
        }
    }

    events.emit(&ControlEvent::DoneSpeaking);
}

/// Synthesize and play a single string with the full speaking envelope.
///
/// Used by the hardware-test path; conversation turns go through the queue.
///
/// # Errors
///
/// Returns error if synthesis or playback fails.
pub async fn speak(
    text: &str,
    tts: &TtsConfig,
    audio: &AudioConfig,
    events: &EventWriter,
) -> Result<()> {
    let mut renderer = PiperRenderer::new(tts.clone(), audio.clone(), events.clone());
    events.emit(&ControlEvent::Speaking);
    let result = renderer.render(text).await;
    events.emit(&ControlEvent::DoneSpeaking);
    result
}

/// Pipe text to piper, producing a temp WAV
async fn synthesize(text: &str, config: &TtsConfig) -> Result<TempPath> {
    let wav = tempfile::Builder::new()
        .prefix("perch-tts-")
        .suffix(".wav")
        .tempfile()
        .map_err(|e| Error::Tts(format!("cannot create synthesis file: {e}")))?
        .into_temp_path();

    let mut child = Command::new(&config.piper_bin)
        .arg("--model")
        .arg(&config.voice)
        .arg("--output_file")
        .arg(wav.as_os_str())
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| Error::Tts(format!("cannot spawn piper: {e}")))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(text.as_bytes())
            .await
            .map_err(|e| Error::Tts(format!("cannot write to piper stdin: {e}")))?;
        // closing stdin tells piper the utterance is complete
    }

    let status = child
        .wait()
        .await
        .map_err(|e| Error::Tts(format!("piper wait failed: {e}")))?;
    if !status.success() {
        tracing::warn!(code = ?status.code(), "piper exited abnormally");
    }

    Ok(wav)
}

/// Apply linear gain to every i16 sample of a WAV file, clamped to the valid
/// range so loud input saturates instead of wrapping around
pub fn amplify_wav_in_place(path: &Path, gain: i32) -> Result<()> {
    let mut reader =
        hound::WavReader::open(path).map_err(|e| Error::Tts(format!("wav open: {e}")))?;
    let spec = reader.spec();

    let amplified: Vec<i16> = reader
        .samples::<i16>()
        .map(|sample| {
            let sample = sample.map_err(|e| Error::Tts(format!("wav read: {e}")))?;
            Ok(amplify_sample(sample, gain))
        })
        .collect::<Result<_>>()?;
    drop(reader);

    let mut writer =
        hound::WavWriter::create(path, spec).map_err(|e| Error::Tts(format!("wav write: {e}")))?;
    for sample in amplified {
        writer
            .write_sample(sample)
            .map_err(|e| Error::Tts(format!("wav write: {e}")))?;
    }
    writer
        .finalize()
        .map_err(|e| Error::Tts(format!("wav finalize: {e}")))?;

    Ok(())
}

/// One sample through the gain stage
#[must_use]
pub fn amplify_sample(sample: i16, gain: i32) -> i16 {
    let scaled = i32::from(sample) * gain;
    #[allow(clippy::cast_possible_truncation)]
    let clamped = scaled.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
    clamped
}

/// Coarse loudness of one frame: doubled mean absolute value, capped at the
/// i16 maximum
#[must_use]
pub fn amplitude_of(frame: &[i16]) -> u16 {
    if frame.is_empty() {
        return 0;
    }
    let sum: i64 = frame.iter().map(|&s| i64::from(s).abs()).sum();
    #[allow(clippy::cast_possible_wrap)]
    let mean = sum / frame.len() as i64;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let amp = (mean * 2).min(i64::from(i16::MAX)) as u16;
    amp
}

/// Start both aplay children, then walk the WAV emitting one `AMP` event per
/// frame, sleeping each frame's real-time duration. Waits for both devices
/// to finish before returning.
async fn play_with_telemetry(
    path: &Path,
    config: &AudioConfig,
    events: &EventWriter,
) -> Result<()> {
    play_on(path, config, events, |device| spawn_aplay(device, path)).await
}

/// Playback drive loop over an injectable per-device player spawner
async fn play_on<F>(path: &Path, config: &AudioConfig, events: &EventWriter, spawn: F) -> Result<()>
where
    F: Fn(&str) -> Result<Child>,
{
    let mut primary = spawn(&config.speaker_device)?;
    let mut secondary = match spawn(&config.speaker_device_2) {
        Ok(child) => child,
        Err(e) => {
            // the primary is already playing; reap it before bailing out
            if let Err(kill_err) = primary.kill().await {
                tracing::warn!(error = %kill_err, "failed to reap primary player");
            }
            return Err(e);
        }
    };

    let mut reader =
        hound::WavReader::open(path).map_err(|e| Error::Playback(format!("wav open: {e}")))?;
    let sample_rate = reader.spec().sample_rate.max(1);
    let frame_len = config.amp_frame_samples.max(1);

    let mut samples = reader.samples::<i16>();
    loop {
        let frame: Vec<i16> = samples
            .by_ref()
            .take(frame_len)
            .filter_map(std::result::Result::ok)
            .collect();
        if frame.is_empty() {
            break;
        }

        events.emit(&ControlEvent::Amplitude(amplitude_of(&frame)));

        #[allow(clippy::cast_precision_loss)]
        let frame_secs = frame.len() as f64 / f64::from(sample_rate);
        tokio::time::sleep(Duration::from_secs_f64(frame_secs)).await;
    }

    wait_playback(&mut primary).await;
    wait_playback(&mut secondary).await;
    Ok(())
}

fn spawn_aplay(device: &str, path: &Path) -> Result<Child> {
    Command::new("aplay")
        .args(["-D", device])
        .arg("-q")
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| Error::Playback(format!("cannot spawn aplay on {device}: {e}")))
}

async fn wait_playback(child: &mut Child) {
    match child.wait().await {
        Ok(status) if !status.success() => {
            tracing::warn!(code = ?status.code(), "aplay exited abnormally");
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "aplay wait failed"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[tokio::test]
    async fn failed_secondary_spawn_reaps_the_primary_player() {
        let config = AudioConfig::default();
        let events = EventWriter::new(Box::new(std::io::sink()));
        let primary_pid = Arc::new(Mutex::new(None));

        let pid_slot = Arc::clone(&primary_pid);
        let primary_device = config.speaker_device.clone();
        let result = play_on(
            Path::new("/nonexistent.wav"),
            &config,
            &events,
            move |device| {
                if device == primary_device {
                    let child = Command::new("sleep").arg("30").spawn()?;
                    *pid_slot.lock().unwrap() = child.id();
                    Ok(child)
                } else {
                    Err(Error::Playback("no such device".to_string()))
                }
            },
        )
        .await;
        assert!(result.is_err());

        let pid = primary_pid.lock().unwrap().take().unwrap();
        assert!(
            !Path::new(&format!("/proc/{pid}")).exists(),
            "primary player must not outlive the failed turn"
        );
    }

    #[test]
    fn gain_clamps_instead_of_wrapping() {
        assert_eq!(amplify_sample(1000, 3), 3000);
        assert_eq!(amplify_sample(-1000, 3), -3000);
        assert_eq!(amplify_sample(i16::MAX, 3), i16::MAX);
        assert_eq!(amplify_sample(i16::MIN, 3), i16::MIN);
        assert_eq!(amplify_sample(20000, 3), i16::MAX);
        assert_eq!(amplify_sample(-20000, 3), i16::MIN);
    }

    #[test]
    fn amplitude_is_doubled_mean_abs_capped() {
        assert_eq!(amplitude_of(&[]), 0);
        assert_eq!(amplitude_of(&[0, 0, 0]), 0);
        assert_eq!(amplitude_of(&[100, -100, 100, -100]), 200);
        // loud frame caps at the i16 maximum
        assert_eq!(amplitude_of(&[i16::MAX; 8]), 32767);
        // i16::MIN must not overflow the abs computation
        assert_eq!(amplitude_of(&[i16::MIN; 8]), 32767);
    }

    #[test]
    fn amplify_rewrites_file_in_place() {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let file = tempfile::Builder::new().suffix(".wav").tempfile().unwrap();
        let path = file.path().to_path_buf();
        {
            let mut writer = hound::WavWriter::create(&path, spec).unwrap();
            for sample in [100_i16, -200, 20000, -20000, 0] {
                writer.write_sample(sample).unwrap();
            }
            writer.finalize().unwrap();
        }

        amplify_wav_in_place(&path, 3).unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![300, -600, i16::MAX, i16::MIN, 0]);
        assert_eq!(reader.spec().sample_rate, 16000);
    }
}
