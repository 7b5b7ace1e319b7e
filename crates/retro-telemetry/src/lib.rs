use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use retro_core::{TelemetryEvent, TelemetrySink};
use serde::Serialize;

pub const SINK_ENV: &str = "RETRO_LENS_TELEMETRY_SINK";
pub const FILE_ENV: &str = "RETRO_LENS_TELEMETRY_FILE";
pub const ENDPOINT_ENV: &str = "RETRO_LENS_TELEMETRY_ENDPOINT";

pub fn sink_from_env() -> Option<Box<dyn TelemetrySink>> {
    let mode = std::env::var(SINK_ENV).ok()?;
    match mode.trim().to_ascii_lowercase().as_str() {
        "stderr" => Some(Box::new(StderrSink)),
        "file" => {
            let path = std::env::var(FILE_ENV).ok().filter(|v| !v.trim().is_empty())?;
            Some(Box::new(FileSink::new(PathBuf::from(path))))
        }
        "http" => {
            let endpoint = std::env::var(ENDPOINT_ENV).ok().filter(|v| !v.trim().is_empty())?;
            Some(Box::new(HttpSink::new(endpoint)))
        }
        other => {
            log::warn!("ignoring unknown telemetry sink '{}'", other);
            None
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TelemetryEnvelope {
    event_type: String,
    style: String,
    duration_ms: Option<u64>,
    detail: Option<String>,
}

impl From<&TelemetryEvent> for TelemetryEnvelope {
    fn from(event: &TelemetryEvent) -> Self {
        Self {
            event_type: format!("{:?}", event.event_type),
            style: event.style.id().to_string(),
            duration_ms: event.duration_ms,
            detail: event.detail.clone(),
        }
    }
}

fn envelope_line(event: &TelemetryEvent) -> Option<String> {
    serde_json::to_string(&TelemetryEnvelope::from(event)).ok()
}

/// Writes one JSON line per event to stderr so it never mixes with the CLI report on stdout.
pub struct StderrSink;

impl TelemetrySink for StderrSink {
    fn emit(&self, event: TelemetryEvent) {
        if let Some(line) = envelope_line(&event) {
            eprintln!("{}", line);
        }
    }
}

pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn write_line(&self, line: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("creating telemetry log parent directory")?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("opening telemetry file")?;
        writeln!(file, "{}", line).context("writing telemetry line")?;
        Ok(())
    }
}

impl TelemetrySink for FileSink {
    fn emit(&self, event: TelemetryEvent) {
        if let Some(line) = envelope_line(&event) {
            if let Err(err) = self.write_line(&line) {
                log::warn!("telemetry file sink failed: {:#}", err);
            }
        }
    }
}

pub struct HttpSink {
    endpoint: String,
    client: Client,
}

impl HttpSink {
    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            client: Client::new(),
        }
    }
}

impl TelemetrySink for HttpSink {
    fn emit(&self, event: TelemetryEvent) {
        let payload = TelemetryEnvelope::from(&event);
        if let Err(err) = self.client.post(&self.endpoint).json(&payload).send() {
            log::debug!("telemetry post to {} failed: {}", self.endpoint, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use retro_core::{RetroStyle, TelemetryEventType};

    use super::*;

    #[test]
    fn file_sink_appends_json_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("events.jsonl");
        let sink = FileSink::new(path.clone());
        sink.emit(TelemetryEvent::new(TelemetryEventType::TransformStart, RetroStyle::BwCcd));
        sink.emit(TelemetryEvent {
            event_type: TelemetryEventType::TransformError,
            style: RetroStyle::BwCcd,
            duration_ms: Some(12),
            detail: Some("network error: refused".to_string()),
        });

        let contents = std::fs::read_to_string(&path).expect("read telemetry file");
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["eventType"], "TransformStart");
        assert_eq!(lines[0]["style"], "BW_CCD");
        assert_eq!(lines[1]["durationMs"], 12);
        assert_eq!(lines[1]["detail"], "network error: refused");
    }
}
