//! Per-session transcript files.
//!
//! Every line exchanged with a bridge process can be appended to
//! `{log_dir}/{session_id}.log` with a UTC timestamp and a direction tag.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
    sync::{Arc, Mutex, PoisonError},
};

use chrono::{SecondsFormat, Utc};

/// Thread-safe handle to an append-only transcript file.
pub type TranscriptHandle = Arc<Mutex<Option<File>>>;

/// Current UTC time as ISO 8601 with milliseconds (e.g. 2026-02-04T10:15:30.123Z).
fn utc_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Write a timestamped line to the transcript (if one is open).
pub fn log_line(handle: &TranscriptHandle, direction: &str, data: &str) {
    if let Ok(mut guard) = handle.lock() {
        if let Some(ref mut file) = *guard {
            let _ = writeln!(file, "[{}] {}: {}", utc_timestamp(), direction, data);
            let _ = file.flush();
        }
    }
}

/// Point `handle` at `{log_dir}/{session_id}.log`, creating it if needed.
///
/// Without a log directory, or if the file cannot be opened, the handle is
/// left empty and [`log_line`] stays a no-op. Returns whether a file is open.
pub fn open_transcript(handle: &TranscriptHandle, log_dir: Option<&Path>, session_id: &str) -> bool {
    let file = log_dir.and_then(|dir| {
        std::fs::create_dir_all(dir).ok()?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{session_id}.log")))
            .ok()
    });
    let opened = file.is_some();
    *handle.lock().unwrap_or_else(PoisonError::into_inner) = file;
    opened
}
