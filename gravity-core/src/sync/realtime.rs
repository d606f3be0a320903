//! Realtime note-change stream (`GET /notes/stream`).
//!
//! The backend pushes server-sent events to every open stream of a user:
//! `note-change` when another device writes notes, and `heartbeat` while idle.

use crate::sync::remote::RemoteError;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

pub const NOTE_CHANGE_EVENT: &str = "note-change";
pub const HEARTBEAT_EVENT: &str = "heartbeat";

/// Event name used when a frame carries no `event:` field.
const DEFAULT_EVENT: &str = "message";

/// One decoded event from the change stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeEvent {
    NoteChange {
        note_ids: Vec<String>,
        timestamp: Option<String>,
    },
    Heartbeat,
    Other(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NoteChangeData {
    #[serde(default)]
    note_ids: Vec<String>,
    #[serde(default)]
    timestamp: Option<String>,
}

impl RealtimeEvent {
    fn from_frame(name: &str, data: &str) -> Self {
        match name {
            NOTE_CHANGE_EVENT => {
                // A change we cannot read is still a change.
                let data = serde_json::from_str::<NoteChangeData>(data).unwrap_or_else(|e| {
                    warn!("Unreadable note-change data: {}", e);
                    NoteChangeData::default()
                });
                Self::NoteChange {
                    note_ids: data.note_ids,
                    timestamp: data.timestamp,
                }
            }
            HEARTBEAT_EVENT => Self::Heartbeat,
            other => Self::Other(other.to_string()),
        }
    }
}

/// An open change stream.
#[async_trait]
pub trait NoteEvents: Send {
    /// The next event, or `None` once the server has closed the stream.
    async fn next_event(&mut self) -> Result<Option<RealtimeEvent>, RemoteError>;
}

/// Incremental `text/event-stream` decoder. Chunks may split lines (and
/// UTF-8 sequences) anywhere.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk and return the events it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<RealtimeEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(&['\n', '\r'][..]);
            if let Some(event) = self.line(line) {
                events.push(event);
            }
        }
        events
    }

    fn line(&mut self, line: &str) -> Option<RealtimeEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<RealtimeEvent> {
        let name = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = self.data.join("\n");
        self.data.clear();
        Some(RealtimeEvent::from_frame(
            name.as_deref().unwrap_or(DEFAULT_EVENT),
            &data,
        ))
    }
}
