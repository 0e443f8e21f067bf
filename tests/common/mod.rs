//! Shared helpers for orchestrator integration tests

use std::io::Write;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use perch_orchestrator::{ChunkRenderer, EventWriter, Result};

/// In-memory event sink
#[derive(Clone, Default)]
pub struct SharedBuf(pub Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// An `EventWriter` capturing emitted lines, plus a handle to read them back
pub fn capturing_event_writer() -> (EventWriter, SharedBuf) {
    let buf = SharedBuf::default();
    (EventWriter::new(Box::new(buf.clone())), buf)
}

impl SharedBuf {
    /// Emitted event lines so far
    pub fn lines(&self) -> Vec<String> {
        String::from_utf8(self.0.lock().unwrap().clone())
            .unwrap()
            .lines()
            .map(ToString::to_string)
            .collect()
    }
}

/// Chunk renderer that records what it was asked to play, in order
#[derive(Clone, Default)]
pub struct RecordingRenderer {
    pub rendered: Arc<Mutex<Vec<String>>>,
}

impl RecordingRenderer {
    pub fn rendered(&self) -> Vec<String> {
        self.rendered.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChunkRenderer for RecordingRenderer {
    async fn render(&mut self, text: &str) -> Result<()> {
        self.rendered.lock().unwrap().push(text.to_string());
        Ok(())
    }
}
