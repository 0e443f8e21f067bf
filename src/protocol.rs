//! Line-oriented control protocol with the motion controller
//!
//! Commands arrive one per line on stdin; status events leave one per line
//! on stdout. Everything diagnostic goes to stderr via `tracing` so the
//! event stream stays machine-readable.

use std::io::Write;
use std::sync::{Arc, Mutex};

/// Commands accepted from the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Start the autonomous conversation loop
    AutoOn,
    /// Stop the autonomous conversation loop
    AutoOff,
    /// Run one manual capture/respond cycle
    Listen,
    /// Terminate the orchestrator
    Quit,
}

impl Command {
    /// Parse one input line. Unrecognized lines yield `None` and are ignored
    /// by the caller, which keeps the protocol forward-compatible.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "AUTO_ON" => Some(Self::AutoOn),
            "AUTO_OFF" => Some(Self::AutoOff),
            "LISTEN" => Some(Self::Listen),
            "QUIT" => Some(Self::Quit),
            _ => None,
        }
    }
}

/// Status events emitted to the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// Idle and accepting commands
    Ready,
    /// Recording from the microphone
    Listening,
    /// Transcribing and generating a response
    Processing,
    /// Recognized user speech
    Transcript(String),
    /// Playback started for this turn
    Speaking,
    /// Loudness estimate for the current playback frame (0..=32767)
    Amplitude(u16),
    /// Playback finished for this turn
    DoneSpeaking,
}

impl ControlEvent {
    /// Wire representation, without the trailing newline
    #[must_use]
    pub fn to_line(&self) -> String {
        match self {
            Self::Ready => "READY".to_string(),
            Self::Listening => "LISTENING".to_string(),
            Self::Processing => "PROCESSING".to_string(),
            Self::Transcript(text) => format!("TRANSCRIPT:{text}"),
            Self::Speaking => "SPEAKING".to_string(),
            Self::Amplitude(amp) => format!("AMP:{amp}"),
            Self::DoneSpeaking => "DONE_SPEAKING".to_string(),
        }
    }
}

/// Serialized event sink shared by every task that reports status.
///
/// A single lock around the writer keeps concurrently emitted events on
/// whole lines. Emission is best-effort: a controller that has gone away
/// must not take the conversation loop down with it.
#[derive(Clone)]
pub struct EventWriter {
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl EventWriter {
    /// Wrap an output sink
    #[must_use]
    pub fn new(sink: Box<dyn Write + Send>) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    /// Event writer over process stdout
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    /// Emit one event as a single flushed line
    pub fn emit(&self, event: &ControlEvent) {
        let line = event.to_line();
        if let Ok(mut sink) = self.sink.lock() {
            if writeln!(sink, "{line}").and_then(|()| sink.flush()).is_err() {
                tracing::debug!(event = %line, "controller sink closed, event dropped");
            }
        }
    }
}

impl std::fmt::Debug for EventWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventWriter").finish_non_exhaustive()
    }
}
