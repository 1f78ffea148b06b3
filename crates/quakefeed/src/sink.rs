//! Notification sinks
//!
//! `LogSink` renders a one-line summary of each event; `FileSink` appends the
//! raw payload to date-partitioned JSONL files.

use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

use quakefeed_connector_lib::{Clock, NotificationSink, SinkError, SystemClock};

/// Message kinds that only keep the socket warm
const HEARTBEAT_KINDS: &[&str] = &["heartbeat", "pong"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub kind: String,
    pub id: Option<String>,
    pub title: Option<String>,
}

impl Summary {
    pub fn is_heartbeat(&self) -> bool {
        HEARTBEAT_KINDS.contains(&self.kind.as_str())
    }
}

fn field(data: &Value, key: &str) -> Option<String> {
    match data.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Pull the event kind and identity out of a feed payload. P2P messages are
/// tagged by a numeric `code`, Wolfx messages by a `type` string.
pub fn summarize(payload: &str) -> Result<Summary, SinkError> {
    let data: Value =
        serde_json::from_str(payload).map_err(|e| SinkError::Malformed(e.to_string()))?;
    if !data.is_object() {
        return Err(SinkError::Malformed("expected a JSON object".to_string()));
    }

    let kind = field(&data, "code")
        .or_else(|| field(&data, "type"))
        .unwrap_or_else(|| "unknown".to_string());
    let id = field(&data, "id")
        .or_else(|| field(&data, "_id"))
        .or_else(|| field(&data, "EventID"));
    let title = field(&data, "Title");

    Ok(Summary { kind, id, title })
}

/// Logs every event as one structured line
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, feed_type: &str, payload: &str) -> Result<(), SinkError> {
        let summary = summarize(payload)?;
        if summary.is_heartbeat() {
            debug!(feed = %feed_type, kind = %summary.kind, "Feed heartbeat");
            return Ok(());
        }
        info!(
            feed = %feed_type,
            kind = %summary.kind,
            id = summary.id.as_deref().unwrap_or("-"),
            title = summary.title.as_deref().unwrap_or("-"),
            "Feed event"
        );
        Ok(())
    }
}

/// Writes events to `<base_dir>/<YYYY-MM-DD>/<feed>.jsonl`, dated by the
/// same local calendar day the replay cache expires on
pub struct FileSink {
    base_dir: PathBuf,
    clock: Arc<dyn Clock>,
    inner: Mutex<FileSinkInner>,
}

#[derive(Default)]
struct FileSinkInner {
    current_date: String,
    writers: Vec<(String, BufWriter<File>)>,
}

impl FileSink {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self::with_clock(base_dir, Arc::new(SystemClock))
    }

    pub fn with_clock(base_dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            base_dir: base_dir.into(),
            clock,
            inner: Mutex::new(FileSinkInner::default()),
        }
    }

    pub fn flush(&self) -> Result<(), SinkError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, writer) in inner.writers.iter_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

impl NotificationSink for FileSink {
    fn notify(&self, feed_type: &str, payload: &str) -> Result<(), SinkError> {
        // Payloads must be JSON to be embedded verbatim
        summarize(payload)?;

        let now = chrono::Local::now();
        let date = self.clock.today().format("%Y-%m-%d").to_string();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        // Rotate every file when the date changes
        if date != inner.current_date {
            for (_, writer) in inner.writers.iter_mut() {
                writer.flush()?;
            }
            inner.writers.clear();
            inner.current_date = date.clone();
        }

        let index = match inner.writers.iter().position(|(feed, _)| feed == feed_type) {
            Some(index) => index,
            None => {
                let dir = self.base_dir.join(&date);
                fs::create_dir_all(&dir)?;
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(dir.join(format!("{}.jsonl", feed_type)))?;
                inner
                    .writers
                    .push((feed_type.to_string(), BufWriter::new(file)));
                inner.writers.len() - 1
            }
        };

        // {"ts":"...","feed":"...","data":<raw payload>}
        let writer = &mut inner.writers[index].1;
        write!(
            writer,
            "{{\"ts\":\"{}\",\"feed\":{},\"data\":",
            now.to_rfc3339(),
            Value::String(feed_type.to_string())
        )?;
        writer.write_all(payload.as_bytes())?;
        writeln!(writer, "}}")?;
        writer.flush()?;
        Ok(())
    }
}
