//! Append-only JSONL sinks, one file per day. Sink failures are logged and
//! swallowed; they never fail the operation that produced the event.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;

struct JsonlAppender {
    dir: PathBuf,
    prefix: &'static str,
    // (day stamp, open handle); reopened when the day rolls over.
    current: Mutex<Option<(String, std::fs::File)>>,
}

impl JsonlAppender {
    fn new(dir: PathBuf, prefix: &'static str) -> Self {
        Self {
            dir,
            prefix,
            current: Mutex::new(None),
        }
    }

    fn append(&self, entry: &serde_json::Value) {
        let day = Utc::now().format("%Y-%m-%d").to_string();
        let mut current = self.current.lock();
        let needs_open = match current.as_ref() {
            Some((open_day, _)) => *open_day != day,
            None => true,
        };
        if needs_open {
            if let Err(e) = std::fs::create_dir_all(&self.dir) {
                tracing::warn!("[{}] cannot create {}: {e}", self.prefix, self.dir.display());
                return;
            }
            let path = self.dir.join(format!("{}-{day}.jsonl", self.prefix));
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => *current = Some((day, file)),
                Err(e) => {
                    tracing::warn!("[{}] cannot open {}: {e}", self.prefix, path.display());
                    return;
                }
            }
        }
        if let Some((_, file)) = current.as_mut() {
            let line = format!("{entry}\n");
            if let Err(e) = file.write_all(line.as_bytes()) {
                tracing::warn!("[{}] append failed: {e}", self.prefix);
                *current = None;
            }
        }
    }
}

pub struct AuditSink {
    audit: JsonlAppender,
    analytics: JsonlAppender,
}

impl AuditSink {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            audit: JsonlAppender::new(data_dir.join("audit"), "audit"),
            analytics: JsonlAppender::new(data_dir.join("analytics"), "analytics"),
        }
    }

    pub fn audit(&self, event: &str, user: &str, data: serde_json::Value) {
        self.audit.append(&serde_json::json!({
            "ts": Utc::now(),
            "event": event,
            "user": user,
            "data": data,
        }));
    }

    pub fn analytics(&self, event: &str, user: &str, data: serde_json::Value) {
        self.analytics.append(&serde_json::json!({
            "ts": Utc::now(),
            "event": event,
            "user": user,
            "data": data,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_one_json_line_per_event() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sink = AuditSink::new(tmp.path());
        sink.audit("file_write", "a@x", serde_json::json!({"path": "x.txt"}));
        sink.audit("file_delete", "a@x", serde_json::json!({"path": "x.txt"}));

        let day = Utc::now().format("%Y-%m-%d");
        let contents =
            std::fs::read_to_string(tmp.path().join("audit").join(format!("audit-{day}.jsonl")))
                .unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "file_write");
        assert_eq!(first["user"], "a@x");
    }

    #[test]
    fn sink_failure_is_swallowed() {
        // Point the sink at a path that cannot be a directory.
        let tmp = tempfile::TempDir::new().unwrap();
        let blocker = tmp.path().join("blocked");
        std::fs::write(&blocker, "not a dir").unwrap();
        let sink = AuditSink::new(&blocker);
        // Must not panic or error.
        sink.audit("noop", "a@x", serde_json::json!({}));
    }
}
