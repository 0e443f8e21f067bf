//! Perch - voice interaction orchestrator for an animatronic character
//!
//! This library coordinates audio capture, speech-to-text, a streaming
//! language-model backend, and chunked speech synthesis into one responsive
//! conversation loop, driven over a line-oriented control protocol by the
//! character's motion controller.
//!
//! # Architecture
//!
//! ```text
//! controller stdin ──► Control Handler ──► record ──► transcribe
//!                           │                              │
//!                           ▼                              ▼
//!                    Backend Supervisor          Completion Streamer
//!                     (llama-server)              (SSE → sentences)
//!                                                        │
//!                                                        ▼
//!                                         Playback Worker (piper → 2× aplay)
//!                                                        │
//! controller stdout ◄── READY / TRANSCRIPT / AMP ◄───────┘
//! ```
//!
//! The speech engines (whisper-cli, llama-server, piper, arecord/aplay) are
//! external processes; this crate owns their lifecycles and the protocol,
//! not their internals.

pub mod backend;
pub mod capture;
pub mod config;
pub mod control;
pub mod error;
pub mod history;
pub mod protocol;
pub mod speech;
pub mod stream;

pub use backend::{BackendSupervisor, SupervisorState};
pub use capture::AudioClip;
pub use config::Config;
pub use control::{ControlHandler, StopToken};
pub use error::{Error, Result};
pub use history::{ConversationHistory, Role, Turn};
pub use protocol::{Command, ControlEvent, EventWriter};
pub use speech::{ChunkRenderer, PiperRenderer, TtsChunk};
pub use stream::{CompletionStreamer, SentenceSplitter, StreamEvent};
