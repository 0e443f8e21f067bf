//! Control protocol handler and auto-conversation loop
//!
//! The handler is the single conversational driver: it reads one command per
//! line, runs capture → transcribe → respond cycles, and guarantees the
//! controller always sees a terminal `READY` no matter how a turn ends.
//! `AUTO_ON` hands the same cycle to a background task with its own history;
//! manual `LISTEN` commands must not be issued while it runs (caller
//! responsibility, per the control protocol contract).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::task::JoinHandle;

use crate::backend::BackendSupervisor;
use crate::capture;
use crate::config::Config;
use crate::history::ConversationHistory;
use crate::protocol::{Command, ControlEvent, EventWriter};
use crate::stream::CompletionStreamer;
use crate::Result;

/// Cooperative cancellation token for the auto-conversation loop.
///
/// Checked at iteration granularity only: an in-flight recording or
/// synthesis call always completes before cancellation takes effect.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    flag: Arc<AtomicBool>,
}

impl StopToken {
    /// Fresh, unset token
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop
    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Clear a previous stop request
    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Whether a stop has been requested
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Outcome of one auto-loop cycle
enum CycleOutcome {
    /// Cycle ran to its end (including the skipped-turn blank case)
    Completed,
    /// Stop was observed right after recording; the clip was discarded
    Stopped,
}

/// Top-level command loop
pub struct ControlHandler {
    config: Arc<Config>,
    events: EventWriter,
    supervisor: BackendSupervisor,
    streamer: Arc<CompletionStreamer>,
    history: ConversationHistory,
    stop: StopToken,
    auto_task: Option<JoinHandle<()>>,
}

impl ControlHandler {
    /// Create a handler writing events to the given sink
    ///
    /// # Errors
    ///
    /// Returns error if the backing HTTP clients cannot be constructed.
    pub fn new(config: Arc<Config>, events: EventWriter) -> Result<Self> {
        let supervisor = BackendSupervisor::new(config.backend.clone())?;
        let streamer = Arc::new(CompletionStreamer::new(Arc::clone(&config))?);
        Ok(Self {
            config,
            events,
            supervisor,
            streamer,
            history: ConversationHistory::new(),
            stop: StopToken::new(),
            auto_task: None,
        })
    }

    /// Run the command loop until `QUIT` or end-of-input.
    ///
    /// Brings the backend up first (degraded service is logged, not fatal),
    /// then emits the initial `READY`.
    ///
    /// # Errors
    ///
    /// Returns error only on an unrecoverable input read failure.
    pub async fn run(&mut self, input: impl AsyncBufRead + Unpin) -> Result<()> {
        if !self.supervisor.ensure_ready().await {
            tracing::warn!("backend unavailable, responses will fall back");
        }
        self.events.emit(&ControlEvent::Ready);

        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            match Command::parse(&line) {
                Some(Command::AutoOn) => self.start_auto(),
                Some(Command::AutoOff) => self.stop.set(),
                Some(Command::Listen) => self.listen_turn().await,
                Some(Command::Quit) => break,
                // unrecognized lines are ignored for forward compatibility
                None => tracing::debug!(line = %line, "ignoring unknown command"),
            }
        }

        // let a live auto task wind down on its own; the process is exiting
        self.stop.set();
        tracing::info!("control loop finished");
        Ok(())
    }

    /// Start the auto-conversation loop unless one is already live
    fn start_auto(&mut self) {
        let running = self
            .auto_task
            .as_ref()
            .is_some_and(|task| !task.is_finished());
        if running {
            tracing::debug!("auto loop already running");
            return;
        }

        self.stop.clear();
        let task = tokio::spawn(auto_loop(
            Arc::clone(&self.config),
            Arc::clone(&self.streamer),
            self.events.clone(),
            self.stop.clone(),
        ));
        self.auto_task = Some(task);
        tracing::info!("auto loop started");
    }

    /// One manual conversation turn. Any stage failure is logged and the
    /// controller still gets its terminal `READY`.
    async fn listen_turn(&mut self) {
        if let Err(e) = self.try_listen_turn().await {
            tracing::error!(error = %e, "listen turn failed");
        }
        self.events.emit(&ControlEvent::Ready);
    }

    async fn try_listen_turn(&mut self) -> Result<()> {
        let clip = capture::record(&self.config.audio, &self.events).await?;
        self.events.emit(&ControlEvent::Processing);

        let text = capture::transcribe(clip, &self.config.stt).await?;
        apply_transcript(text, &self.config, &self.events, &mut self.history);

        let response = self.streamer.get_response(&self.history, &self.events).await;
        tracing::info!(response = %response, "turn complete");
        self.history.push_assistant(response);
        Ok(())
    }
}

/// Fold one manual-turn transcription into the history.
///
/// A blank transcript emits no `TRANSCRIPT` event and substitutes the
/// configured placeholder as the user turn, so the character still reacts
/// to being addressed.
fn apply_transcript(
    text: String,
    config: &Config,
    events: &EventWriter,
    history: &mut ConversationHistory,
) {
    if capture::is_blank(&text, &config.stt) {
        history.push_user(config.persona.unheard_line.clone());
    } else {
        events.emit(&ControlEvent::Transcript(text.clone()));
        history.push_user(text);
    }
}

/// Autonomous capture/respond loop with its own bounded history.
///
/// Stop is observed before each cycle and immediately after recording; the
/// recording itself is deliberately allowed to complete so clips are never
/// truncated, which bounds `AUTO_OFF` latency by one cycle. Every completed
/// iteration ends in `READY`, and one final `READY` follows loop exit so the
/// controller's view never stalls.
pub async fn auto_loop(
    config: Arc<Config>,
    streamer: Arc<CompletionStreamer>,
    events: EventWriter,
    stop: StopToken,
) {
    let mut history = ConversationHistory::new();

    while !stop.is_set() {
        match auto_cycle(&config, &streamer, &events, &stop, &mut history).await {
            Ok(CycleOutcome::Stopped) => break,
            Ok(CycleOutcome::Completed) => events.emit(&ControlEvent::Ready),
            Err(e) => {
                tracing::error!(error = %e, "auto cycle failed");
                events.emit(&ControlEvent::Ready);
            }
        }
    }

    events.emit(&ControlEvent::Ready);
    tracing::info!("auto loop stopped");
}

async fn auto_cycle(
    config: &Config,
    streamer: &CompletionStreamer,
    events: &EventWriter,
    stop: &StopToken,
    history: &mut ConversationHistory,
) -> Result<CycleOutcome> {
    let clip = capture::record(&config.audio, events).await?;
    if stop.is_set() {
        drop(clip); // discard the recording unplayed; the file goes with it
        return Ok(CycleOutcome::Stopped);
    }
    events.emit(&ControlEvent::Processing);

    let text = capture::transcribe(clip, &config.stt).await?;
    if capture::is_blank(&text, &config.stt) {
        return Ok(CycleOutcome::Completed);
    }

    events.emit(&ControlEvent::Transcript(text.clone()));
    history.push_user(text);

    let response = streamer.get_response(history, events).await;
    history.push_assistant(response);
    Ok(CycleOutcome::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_token_round_trip() {
        let stop = StopToken::new();
        assert!(!stop.is_set());

        let observer = stop.clone();
        stop.set();
        assert!(observer.is_set());

        stop.clear();
        assert!(!observer.is_set());
    }

    #[test]
    fn blank_transcript_substitutes_placeholder_without_event() {
        let config = Config::default();
        let buf = Arc::new(std::sync::Mutex::new(Vec::new()));
        let events = EventWriter::new(Box::new(SharedBuf(Arc::clone(&buf))));
        let mut history = ConversationHistory::new();

        for blank in ["", "   ", "[BLANK_AUDIO]"] {
            apply_transcript(blank.to_string(), &config, &events, &mut history);
        }

        let out = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
        assert!(out.is_empty(), "no event may be emitted, got {out:?}");
        // the turn still proceeds, with the placeholder standing in
        assert_eq!(
            history.last_user(),
            Some(config.persona.unheard_line.as_str())
        );
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn heard_transcript_emits_event_and_becomes_user_turn() {
        let config = Config::default();
        let buf = Arc::new(std::sync::Mutex::new(Vec::new()));
        let events = EventWriter::new(Box::new(SharedBuf(Arc::clone(&buf))));
        let mut history = ConversationHistory::new();

        apply_transcript("hello bird".to_string(), &config, &events, &mut history);

        let out = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
        assert_eq!(out, "TRANSCRIPT:hello bird\n");
        assert_eq!(history.last_user(), Some("hello bird"));
    }

    #[tokio::test]
    async fn pre_stopped_auto_loop_emits_single_final_ready() {
        let config = Arc::new(Config::default());
        let streamer = Arc::new(CompletionStreamer::new(Arc::clone(&config)).unwrap());

        let buf = Arc::new(std::sync::Mutex::new(Vec::new()));
        let events = EventWriter::new(Box::new(SharedBuf(Arc::clone(&buf))));

        let stop = StopToken::new();
        stop.set();
        auto_loop(config, streamer, events, stop).await;

        let out = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
        assert_eq!(out, "READY\n");
    }

    struct SharedBuf(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for SharedBuf {
        fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
