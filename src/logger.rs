//! Transfer logging.
//!
//! There is no global logger: whoever builds the orchestrator or a worker
//! hands it an `Arc<dyn Logger>`. `NoopLogger` costs nothing on hot paths.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

pub trait Logger: Send + Sync {
    fn start(&self, _source: &str, _destination: &str) {}
    fn retry(&self, _source: &str, _attempt: u32, _cause: &str) {}
    fn url_refreshed(&self, _source: &str) {}
    fn skipped(&self, _source: &str, _destination: &str, _reason: &str) {}
    fn finished(&self, _source: &str, _destination: &str, _bytes: u64) {}
    fn error(&self, _context: &str, _source: &str, _msg: &str) {}
    fn done(&self, _succeeded: usize, _failed: usize, _aggregate: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}

/// Human-readable `[timestamp] VERB key=value` lines.
pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            file: Mutex::new(open_append(path.as_ref())?),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn start(&self, source: &str, destination: &str) {
        self.line(&format!("START src={source} dst={destination}"));
    }
    fn retry(&self, source: &str, attempt: u32, cause: &str) {
        self.line(&format!("RETRY src={source} attempt={attempt} cause={cause}"));
    }
    fn url_refreshed(&self, source: &str) {
        self.line(&format!("REFRESH src={source}"));
    }
    fn skipped(&self, source: &str, destination: &str, reason: &str) {
        self.line(&format!("SKIP src={source} dst={destination} reason={reason}"));
    }
    fn finished(&self, source: &str, destination: &str, bytes: u64) {
        self.line(&format!("DONE src={source} dst={destination} bytes={bytes}"));
    }
    fn error(&self, context: &str, source: &str, msg: &str) {
        self.line(&format!("ERROR ctx={context} src={source} msg={msg}"));
    }
    fn done(&self, succeeded: usize, failed: usize, aggregate: u64, seconds: f64) {
        self.line(&format!(
            "JOB ok={succeeded} failed={failed} aggregate={aggregate} seconds={seconds:.3}"
        ));
    }
}

#[derive(Serialize)]
struct JsonRecord<'a> {
    timestamp: String,
    event: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    destination: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bytes: Option<u64>,
}

impl<'a> JsonRecord<'a> {
    fn new(event: &'a str) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            event,
            source: None,
            destination: None,
            context: None,
            message: None,
            attempt: None,
            bytes: None,
        }
    }
}

/// One JSON object per line, for machine consumption.
pub struct JsonLogger {
    file: Mutex<File>,
}

impl JsonLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            file: Mutex::new(open_append(path.as_ref())?),
        })
    }

    fn record(&self, record: JsonRecord<'_>) {
        if let Ok(mut f) = self.file.lock() {
            if serde_json::to_writer(&mut *f, &record).is_ok() {
                let _ = f.write_all(b"\n");
            }
        }
    }
}

impl Logger for JsonLogger {
    fn start(&self, source: &str, destination: &str) {
        self.record(JsonRecord {
            source: Some(source),
            destination: Some(destination),
            ..JsonRecord::new("start")
        });
    }
    fn retry(&self, source: &str, attempt: u32, cause: &str) {
        self.record(JsonRecord {
            source: Some(source),
            attempt: Some(attempt),
            message: Some(cause),
            ..JsonRecord::new("retry")
        });
    }
    fn url_refreshed(&self, source: &str) {
        self.record(JsonRecord {
            source: Some(source),
            ..JsonRecord::new("refresh")
        });
    }
    fn skipped(&self, source: &str, destination: &str, reason: &str) {
        self.record(JsonRecord {
            source: Some(source),
            destination: Some(destination),
            message: Some(reason),
            ..JsonRecord::new("skip")
        });
    }
    fn finished(&self, source: &str, destination: &str, bytes: u64) {
        self.record(JsonRecord {
            source: Some(source),
            destination: Some(destination),
            bytes: Some(bytes),
            ..JsonRecord::new("finish")
        });
    }
    fn error(&self, context: &str, source: &str, msg: &str) {
        self.record(JsonRecord {
            source: Some(source),
            context: Some(context),
            message: Some(msg),
            ..JsonRecord::new("error")
        });
    }
    fn done(&self, succeeded: usize, failed: usize, aggregate: u64, seconds: f64) {
        let summary = format!("ok={succeeded} failed={failed} seconds={seconds:.3}");
        self.record(JsonRecord {
            message: Some(&summary),
            bytes: Some(aggregate),
            ..JsonRecord::new("job")
        });
    }
}
