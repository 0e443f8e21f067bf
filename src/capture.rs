//! Microphone capture and speech-to-text
//!
//! Both stages run external engines: `arecord` produces a fixed-duration WAV
//! clip, `whisper-cli` turns it into text. Clips are temp files owned by
//! [`AudioClip`]; the backing file is removed when the clip drops, so no
//! code path can leak a recording.

use std::path::Path;
use std::process::Stdio;

use tempfile::TempPath;
use tokio::process::Command;

use crate::config::{AudioConfig, SttConfig};
use crate::protocol::{ControlEvent, EventWriter};
use crate::{Error, Result};

/// A transient file-backed recording.
///
/// Ownership transfers from capture to transcription; dropping the clip
/// deletes the file unconditionally.
#[derive(Debug)]
pub struct AudioClip {
    path: TempPath,
}

impl AudioClip {
    /// Wrap an existing temp path (used by tests to stage fixture clips)
    #[must_use]
    pub fn from_temp_path(path: TempPath) -> Self {
        Self { path }
    }

    /// Location of the backing WAV file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Record a fixed-duration clip from the configured microphone.
///
/// Emits `LISTENING` before the recorder starts, then blocks (at an await
/// point) until the fixed duration elapses.
///
/// # Errors
///
/// Returns error if the recorder cannot be spawned or the temp file cannot
/// be created. A recorder that runs but captures nothing is not an error;
/// the resulting clip simply transcribes as blank.
pub async fn record(config: &AudioConfig, events: &EventWriter) -> Result<AudioClip> {
    let clip = tempfile::Builder::new()
        .prefix("perch-rec-")
        .suffix(".wav")
        .tempfile()
        .map_err(|e| Error::Audio(format!("cannot create clip file: {e}")))?
        .into_temp_path();

    events.emit(&ControlEvent::Listening);

    let status = Command::new("arecord")
        .args(["-D", &config.mic_device])
        .args(["-f", "S16_LE"])
        .args(["-r", &config.sample_rate.to_string()])
        .args(["-c", "1"])
        .args(["-d", &config.record_seconds.to_string()])
        .arg("-q")
        .arg(clip.as_os_str())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(|e| Error::Audio(format!("cannot spawn arecord: {e}")))?;

    if !status.success() {
        tracing::warn!(code = ?status.code(), "arecord exited abnormally");
    }

    Ok(AudioClip { path: clip })
}

/// Transcribe a clip with whisper-cli, consuming (and deleting) it.
///
/// # Errors
///
/// Returns error if the engine cannot be spawned or exits abnormally. The
/// clip file is gone when this returns, on every path.
pub async fn transcribe(clip: AudioClip, config: &SttConfig) -> Result<String> {
    let output = Command::new(&config.whisper_bin)
        .arg("-m")
        .arg(&config.model)
        .arg("-f")
        .arg(clip.path())
        .arg("--no-prints")
        .arg("-nt")
        .args(["--language", &config.language])
        .args(["--threads", &config.threads.to_string()])
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| Error::Stt(format!("cannot spawn whisper-cli: {e}")))?;

    // clip is dropped (and its file deleted) when this function returns,
    // including on the error paths above and below

    if !output.status.success() {
        return Err(Error::Stt(format!(
            "whisper-cli exited with {:?}",
            output.status.code()
        )));
    }

    let raw = String::from_utf8_lossy(&output.stdout);
    tracing::debug!(raw = %raw.trim(), "whisper output");
    Ok(parse_transcript(&raw))
}

/// Join whisper output lines, discarding blank lines and bracketed
/// diagnostic annotations like `[00:00.000 --> ...]` or `[BLANK_AUDIO]`
#[must_use]
pub fn parse_transcript(raw: &str) -> String {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('['))
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string()
}

/// "Nothing heard": empty result or the engine's blank-audio marker.
///
/// Both checks are kept even though bracket filtering usually removes the
/// marker line; whisper builds differ in whether `-nt` suppresses it.
#[must_use]
pub fn is_blank(text: &str, config: &SttConfig) -> bool {
    text.trim().is_empty() || text.contains(config.blank_marker.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged_clip() -> (AudioClip, std::path::PathBuf) {
        let file = tempfile::Builder::new()
            .suffix(".wav")
            .tempfile()
            .unwrap();
        let path = file.path().to_path_buf();
        (AudioClip::from_temp_path(file.into_temp_path()), path)
    }

    #[test]
    fn parse_drops_bracketed_and_blank_lines() {
        let raw = "[00:00.000 --> 00:02.000]\n Hello there \n\n[BLANK_AUDIO]\nhow are you\n";
        assert_eq!(parse_transcript(raw), "Hello there how are you");
    }

    #[test]
    fn parse_of_pure_diagnostics_is_empty() {
        assert_eq!(parse_transcript("[BLANK_AUDIO]\n"), "");
        assert_eq!(parse_transcript(""), "");
    }

    #[test]
    fn blank_detection() {
        let config = SttConfig::default();
        assert!(is_blank("", &config));
        assert!(is_blank("   ", &config));
        assert!(is_blank("something [BLANK_AUDIO] here", &config));
        assert!(!is_blank("hello", &config));
    }

    #[tokio::test]
    async fn clip_deleted_when_engine_is_missing() {
        let (clip, path) = staged_clip();
        let config = SttConfig {
            whisper_bin: "/nonexistent/whisper-cli".into(),
            ..SttConfig::default()
        };

        let result = transcribe(clip, &config).await;
        assert!(result.is_err());
        assert!(!path.exists(), "clip must be deleted on failure");
    }

    #[tokio::test]
    async fn clip_deleted_on_success() {
        let (clip, path) = staged_clip();
        // `true` accepts the arguments, produces no output, exits zero
        let config = SttConfig {
            whisper_bin: "true".into(),
            ..SttConfig::default()
        };

        let result = transcribe(clip, &config).await;
        assert_eq!(result.unwrap(), "");
        assert!(!path.exists(), "clip must be deleted on success");
    }
}
