use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::RuntimeConfig;

/// Keys every line carries; payload fields with these names are dropped.
const ENVELOPE_KEYS: [&str; 4] = ["ts_unix_ms", "event", "run_id", "command"];

pub fn unix_ms_now() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

#[derive(Serialize)]
struct EventLine<'a> {
    ts_unix_ms: u128,
    event: &'a str,
    run_id: &'a str,
    command: &'a str,
    #[serde(flatten)]
    payload: Map<String, Value>,
}

#[derive(Debug)]
struct EventFile {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl EventFile {
    fn append(&self, line: &EventLine<'_>) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create telemetry directory '{}'", parent.display())
            })?;
        }
        let mut encoded = serde_json::to_vec(line)
            .with_context(|| format!("failed to encode telemetry event '{}'", line.event))?;
        encoded.push(b'\n');

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(&encoded))
            .with_context(|| format!("failed to append to telemetry file '{}'", self.path.display()))
    }
}

/// Cheap to clone; clones share the file and its write lock.
#[derive(Debug, Clone)]
pub struct TelemetrySink {
    file: Option<Arc<EventFile>>,
    run_id: String,
    command: String,
}

impl TelemetrySink {
    pub fn new(cfg: &RuntimeConfig, command: String) -> Self {
        let file = cfg.telemetry_enabled.then(|| {
            Arc::new(EventFile {
                path: PathBuf::from(&cfg.telemetry_path),
                write_lock: Mutex::new(()),
            })
        });
        Self {
            file,
            run_id: format!("run-{}-{}", unix_ms_now(), std::process::id()),
            command,
        }
    }

    pub fn disabled() -> Self {
        Self {
            file: None,
            run_id: "run-disabled".to_string(),
            command: String::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.file.is_some()
    }

    /// Write failures are logged and otherwise ignored.
    pub fn emit(&self, event: &str, payload: Value) {
        let Some(file) = self.file.as_ref() else {
            return;
        };
        let mut fields = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => Map::from_iter([("value".to_string(), other)]),
        };
        fields.retain(|key, _| !ENVELOPE_KEYS.contains(&key.as_str()));

        let line = EventLine {
            ts_unix_ms: unix_ms_now(),
            event,
            run_id: &self.run_id,
            command: &self.command,
            payload: fields,
        };
        if let Err(err) = file.append(&line) {
            tracing::warn!(event, path = %file.path.display(), error = %err, "telemetry write failed");
        }
    }
}

/// The envelope fields of one line; payload fields are ignored.
#[derive(Debug, Deserialize)]
struct RecordedEvent {
    #[serde(default)]
    event: String,
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    ts_unix_ms: Option<u64>,
}

#[derive(Debug, Default)]
pub struct TelemetrySummary {
    pub total_lines: usize,
    pub parsed_events: usize,
    pub parse_errors: usize,
    pub unique_runs: BTreeSet<String>,
    pub command_counts: BTreeMap<String, usize>,
    pub command_completed: usize,
    pub command_failed: usize,
    pub missions_accepted: usize,
    pub missions_completed: usize,
    pub missions_failed: usize,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub tasks_retried: usize,
    pub last_event_ts_unix_ms: Option<u128>,
}

impl TelemetrySummary {
    fn record(&mut self, event: RecordedEvent) {
        self.parsed_events += 1;
        if let Some(run_id) = event.run_id.filter(|id| !id.is_empty()) {
            self.unique_runs.insert(run_id);
        }
        if let Some(command) = event.command.filter(|name| !name.is_empty()) {
            *self.command_counts.entry(command).or_default() += 1;
        }
        if let Some(ts) = event.ts_unix_ms.map(u128::from) {
            self.last_event_ts_unix_ms = Some(self.last_event_ts_unix_ms.map_or(ts, |last| last.max(ts)));
        }

        let counter = match event.event.as_str() {
            "command.completed" => &mut self.command_completed,
            "command.failed" => &mut self.command_failed,
            "mission.accepted" => &mut self.missions_accepted,
            "mission.completed" => &mut self.missions_completed,
            "mission.failed" | "mission.timed_out" => &mut self.missions_failed,
            "task.completed" => &mut self.tasks_completed,
            "task.failed" => &mut self.tasks_failed,
            "task.retrying" => &mut self.tasks_retried,
            _ => return,
        };
        *counter += 1;
    }

    /// Commands by descending count, ties by name.
    pub fn top_commands(&self, n: usize) -> Vec<(&str, usize)> {
        let mut commands = self
            .command_counts
            .iter()
            .map(|(name, count)| (name.as_str(), *count))
            .collect::<Vec<_>>();
        commands.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        commands.truncate(n);
        commands
    }
}

/// Summarizes the newest `limit` lines.
pub fn summarize_telemetry_lines(lines: Vec<String>, limit: usize) -> TelemetrySummary {
    let mut summary = TelemetrySummary {
        total_lines: lines.len(),
        ..TelemetrySummary::default()
    };
    let skip = lines.len().saturating_sub(limit.max(1));
    for line in lines.iter().skip(skip).map(|line| line.trim()) {
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<RecordedEvent>(line) {
            Ok(event) => summary.record(event),
            Err(_) => summary.parse_errors += 1,
        }
    }
    summary
}

pub fn render_telemetry_report(path: &Path, summary: &TelemetrySummary) -> String {
    let mut out = vec![
        "Telemetry report".to_string(),
        format!("Path: {}", path.display()),
        format!("Lines in file: {}", summary.total_lines),
        format!(
            "Events analyzed: {} (parse_errors={})",
            summary.parsed_events, summary.parse_errors
        ),
        format!("Unique runs: {}", summary.unique_runs.len()),
        format!(
            "Command outcomes: completed={} failed={}",
            summary.command_completed, summary.command_failed
        ),
        format!(
            "Missions: accepted={} completed={} failed={}",
            summary.missions_accepted, summary.missions_completed, summary.missions_failed
        ),
        format!(
            "Tasks: completed={} failed={} retried={}",
            summary.tasks_completed, summary.tasks_failed, summary.tasks_retried
        ),
    ];
    let top = summary.top_commands(5);
    if !top.is_empty() {
        out.push("Top commands:".to_string());
        out.extend(top.into_iter().map(|(name, count)| format!("- {name}: {count}")));
    }
    if let Some(ts) = summary.last_event_ts_unix_ms {
        out.push(format!("Last event ts_unix_ms: {ts}"));
    }
    out.join("\n")
}

pub fn run_telemetry_report(cfg: &RuntimeConfig, path_override: Option<String>, limit: usize) -> Result<()> {
    let path = PathBuf::from(path_override.unwrap_or_else(|| cfg.telemetry_path.clone()));
    if !path.exists() {
        println!("No telemetry file found at '{}'.", path.display());
        return Ok(());
    }
    let file = std::fs::File::open(&path)
        .with_context(|| format!("failed to open telemetry file '{}'", path.display()))?;
    let lines = BufReader::new(file)
        .lines()
        .collect::<std::io::Result<Vec<String>>>()
        .with_context(|| format!("failed to read telemetry file '{}'", path.display()))?;

    let summary = summarize_telemetry_lines(lines, limit);
    println!("{}", render_telemetry_report(&path, &summary));
    Ok(())
}
