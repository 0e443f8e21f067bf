//! Configuration management for the Perch orchestrator

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{Error, Result};

/// Orchestrator configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Inference backend (llama-server) configuration
    pub backend: BackendConfig,

    /// Audio device configuration
    pub audio: AudioConfig,

    /// Speech-to-text (whisper-cli) configuration
    pub stt: SttConfig,

    /// Speech synthesis (piper) configuration
    pub tts: TtsConfig,

    /// Character persona configuration
    pub persona: PersonaConfig,
}

/// Inference backend configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Path to the llama-server binary
    pub server_bin: PathBuf,

    /// Path to the GGUF model file
    pub model: PathBuf,

    /// Port the server listens on
    pub port: u16,

    /// Context window size passed to the server
    pub ctx_size: u32,

    /// Worker thread count passed to the server
    pub threads: u32,

    /// Batch size passed to the server
    pub batch_size: u32,

    /// Max tokens per completion
    pub n_predict: u32,

    /// Sampling temperature
    pub temperature: f64,

    /// Repeat penalty
    pub repeat_penalty: f64,

    /// Stop sequences for the completion request
    pub stop: Vec<String>,

    /// Seconds to wait for the server to become healthy after spawn
    pub startup_timeout_secs: u64,
}

/// Audio device configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// ALSA capture device for the microphone
    pub mic_device: String,

    /// Primary ALSA playback device
    pub speaker_device: String,

    /// Secondary ALSA playback device (driven in parallel)
    pub speaker_device_2: String,

    /// Fixed recording duration in seconds
    pub record_seconds: u32,

    /// Capture sample rate in Hz
    pub sample_rate: u32,

    /// Linear gain applied to synthesized audio
    pub gain: i32,

    /// Samples per amplitude telemetry frame
    pub amp_frame_samples: usize,
}

/// Speech-to-text configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Path to the whisper-cli binary
    pub whisper_bin: PathBuf,

    /// Path to the whisper model file
    pub model: PathBuf,

    /// Decoder thread count
    pub threads: u32,

    /// Recognition language
    pub language: String,

    /// Marker whisper emits for silent clips
    pub blank_marker: String,
}

/// Speech synthesis configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Path to the piper binary
    pub piper_bin: PathBuf,

    /// Path to the piper voice model
    pub voice: PathBuf,
}

/// Character persona configuration
///
/// All of this is content, not logic: the prompt preamble and labels shape
/// what the character says, the fallback lines keep it audible when the
/// pipeline degrades.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersonaConfig {
    /// System preamble prepended to every prompt
    pub preamble: String,

    /// Label for the human side of the prompt
    pub user_label: String,

    /// Label for the character side of the prompt
    pub assistant_label: String,

    /// Spoken when the backend produces no usable response
    pub fallback_line: String,

    /// Substituted user turn when nothing was heard
    pub unheard_line: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            audio: AudioConfig::default(),
            stt: SttConfig::default(),
            tts: TtsConfig::default(),
            persona: PersonaConfig::default(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            server_bin: home_path("llama.cpp/build/bin/llama-server"),
            model: home_path("models/perch.gguf"),
            port: 8765,
            ctx_size: 512,
            threads: 4,
            batch_size: 512,
            n_predict: 50,
            temperature: 0.7,
            repeat_penalty: 1.1,
            stop: vec!["\nHuman:".to_string(), "\n>".to_string(), "\n".to_string()],
            startup_timeout_secs: 120,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            mic_device: "plughw:CARD=Device,DEV=0".to_string(),
            speaker_device: "plughw:CARD=UACDemoV10,DEV=0".to_string(),
            speaker_device_2: "plughw:CARD=Device_1,DEV=0".to_string(),
            record_seconds: 5,
            sample_rate: 16000,
            gain: 3,
            amp_frame_samples: 1024,
        }
    }
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            whisper_bin: home_path("whisper.cpp/build/bin/whisper-cli"),
            model: home_path("whisper.cpp/models/ggml-tiny.en.bin"),
            threads: 4,
            language: "en".to_string(),
            blank_marker: "[BLANK_AUDIO]".to_string(),
        }
    }
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            piper_bin: home_path(".local/bin/piper"),
            voice: home_path("piper-voices/en_US-lessac-medium.onnx"),
        }
    }
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            preamble: "You are Perch the talking bird, the robotics club mascot. \
                       Keep replies short, spoken, and playful. \
                       Use plain language without any asterisks or stage directions."
                .to_string(),
            user_label: "Human".to_string(),
            assistant_label: "Perch".to_string(),
            fallback_line: "Squawk! My brain got scrambled. Try again?".to_string(),
            unheard_line: "Someone tried to talk to you but you couldn't hear them."
                .to_string(),
        }
    }
}

impl Config {
    /// Load configuration: defaults, then an optional TOML file, then
    /// `PERCH_*` environment overrides.
    ///
    /// When `path` is `None` the project config dir is checked for
    /// `perch.toml`; a missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns error if an explicitly given config file cannot be read or
    /// parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => match default_config_path() {
                Some(p) if p.exists() => Self::from_file(&p)?,
                _ => Self::default(),
            },
        };

        config.apply_env_overrides();
        config.check_engines();
        Ok(config)
    }

    /// Parse configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&raw)?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Apply `PERCH_*` environment overrides for the common knobs
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_var("PERCH_LLAMA_BIN") {
            self.backend.server_bin = PathBuf::from(v);
        }
        if let Some(v) = env_var("PERCH_LLAMA_MODEL") {
            self.backend.model = PathBuf::from(v);
        }
        if let Some(port) = env_var("PERCH_LLAMA_PORT").and_then(|v| v.parse().ok()) {
            self.backend.port = port;
        }
        if let Some(v) = env_var("PERCH_WHISPER_BIN") {
            self.stt.whisper_bin = PathBuf::from(v);
        }
        if let Some(v) = env_var("PERCH_WHISPER_MODEL") {
            self.stt.model = PathBuf::from(v);
        }
        if let Some(v) = env_var("PERCH_PIPER_BIN") {
            self.tts.piper_bin = PathBuf::from(v);
        }
        if let Some(v) = env_var("PERCH_PIPER_VOICE") {
            self.tts.voice = PathBuf::from(v);
        }
        if let Some(v) = env_var("PERCH_MIC_DEVICE") {
            self.audio.mic_device = v;
        }
        if let Some(v) = env_var("PERCH_SPEAKER_DEVICE") {
            self.audio.speaker_device = v;
        }
        if let Some(v) = env_var("PERCH_SPEAKER_DEVICE_2") {
            self.audio.speaker_device_2 = v;
        }
    }

    /// Warn about unresolvable external engine binaries.
    ///
    /// Warnings only: hardware-test subcommands may exercise a single engine
    /// on a bench setup where the others are absent.
    fn check_engines(&self) {
        for (name, path) in [
            ("llama-server", &self.backend.server_bin),
            ("whisper-cli", &self.stt.whisper_bin),
            ("piper", &self.tts.piper_bin),
        ] {
            if !binary_resolves(path) {
                tracing::warn!(engine = name, path = %path.display(), "engine binary not found");
            }
        }
        for tool in ["arecord", "aplay"] {
            if which::which(tool).is_err() {
                tracing::warn!(tool, "ALSA tool not found on PATH");
            }
        }
    }

    /// Health endpoint URL for the inference backend
    #[must_use]
    pub fn health_url(&self) -> String {
        format!("http://127.0.0.1:{}/health", self.backend.port)
    }

    /// Streaming completion endpoint URL for the inference backend
    #[must_use]
    pub fn completion_url(&self) -> String {
        format!("http://127.0.0.1:{}/completion", self.backend.port)
    }
}

/// Resolve a configured binary: bare names via PATH, paths by existence
fn binary_resolves(path: &Path) -> bool {
    if path.components().count() > 1 {
        path.exists()
    } else {
        which::which(path).is_ok()
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Default config file location (`<project config dir>/perch.toml`)
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "tea-ucsd", "perch")
        .map(|dirs| dirs.config_dir().join("perch.toml"))
}

/// A path under the user's home directory, falling back to relative
fn home_path(rest: &str) -> PathBuf {
    directories::BaseDirs::new()
        .map_or_else(|| PathBuf::from(rest), |dirs| dirs.home_dir().join(rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_constants() {
        let config = Config::default();
        assert_eq!(config.backend.port, 8765);
        assert_eq!(config.audio.record_seconds, 5);
        assert_eq!(config.audio.sample_rate, 16000);
        assert_eq!(config.audio.gain, 3);
        assert_eq!(config.backend.n_predict, 50);
        assert_eq!(config.backend.stop.len(), 3);
    }

    #[test]
    fn parses_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [backend]
            port = 9000

            [audio]
            mic_device = "plughw:CARD=Test,DEV=0"
            "#,
        )
        .unwrap();

        assert_eq!(config.backend.port, 9000);
        assert_eq!(config.audio.mic_device, "plughw:CARD=Test,DEV=0");
        // untouched sections keep their defaults
        assert_eq!(config.audio.record_seconds, 5);
        assert_eq!(config.stt.language, "en");
    }

    #[test]
    fn endpoint_urls_use_configured_port() {
        let mut config = Config::default();
        config.backend.port = 1234;
        assert_eq!(config.health_url(), "http://127.0.0.1:1234/health");
        assert_eq!(config.completion_url(), "http://127.0.0.1:1234/completion");
    }
}
