//! Note record model

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A single note as persisted locally and carried in sync payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteRecord {
    pub note_id: String,
    #[serde(default)]
    pub markdown_text: String,
    /// Attachment id to blob reference.
    #[serde(default)]
    pub attachments: BTreeMap<String, String>,
    pub created_at_iso: String,
    pub updated_at_iso: String,
    pub last_activity_iso: String,
    #[serde(default)]
    pub pinned: bool,
}

impl NoteRecord {
    /// Create a new note with a fresh identifier.
    pub fn new(markdown_text: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), markdown_text, now)
    }

    /// Create a new note with a caller-chosen identifier.
    pub fn with_id(note_id: impl Into<String>, markdown_text: impl Into<String>, now: DateTime<Utc>) -> Self {
        let stamp = format_iso(now);
        Self {
            note_id: note_id.into(),
            markdown_text: markdown_text.into(),
            attachments: BTreeMap::new(),
            created_at_iso: stamp.clone(),
            updated_at_iso: stamp.clone(),
            last_activity_iso: stamp,
            pinned: false,
        }
    }

    /// Replace the text, advancing `updatedAtIso` without ever moving it backwards.
    pub fn edit(&mut self, markdown_text: impl Into<String>, now: DateTime<Utc>) {
        self.markdown_text = markdown_text.into();
        self.touch(now);
    }

    /// Toggle the pinned flag as an edit.
    pub fn set_pinned(&mut self, pinned: bool, now: DateTime<Utc>) {
        self.pinned = pinned;
        self.touch(now);
    }

    /// Advance the edit timestamps to `max(previous, now)`.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        let next = match self.updated_at() {
            Some(previous) if previous > now => previous,
            _ => now,
        };
        let stamp = format_iso(next);
        self.updated_at_iso = stamp.clone();
        self.last_activity_iso = stamp;
    }

    /// Raise the edit timestamps to those of `previous` where they are older,
    /// so a write never moves a note back in time.
    pub fn not_older_than(&mut self, previous: &NoteRecord) {
        if is_older(&self.updated_at_iso, &previous.updated_at_iso) {
            self.updated_at_iso = previous.updated_at_iso.clone();
        }
        if is_older(&self.last_activity_iso, &previous.last_activity_iso) {
            self.last_activity_iso = previous.last_activity_iso.clone();
        }
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        parse_iso(&self.created_at_iso)
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        parse_iso(&self.updated_at_iso)
    }

    /// Title line for listings.
    pub fn title(&self) -> &str {
        self.markdown_text
            .lines()
            .map(|line| line.trim_start_matches('#').trim())
            .find(|line| !line.is_empty())
            .unwrap_or("")
    }
}

/// Format a timestamp as ISO-8601 UTC with millisecond precision.
pub fn format_iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn is_older(current: &str, previous: &str) -> bool {
    match (parse_iso(current), parse_iso(previous)) {
        (Some(current), Some(previous)) => current < previous,
        (None, Some(_)) => true,
        _ => false,
    }
}

/// Parse an RFC 3339 timestamp into UTC.
pub fn parse_iso(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}
