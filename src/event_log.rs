// Append-only NDJSON event log
//
// One line per event: {"ts": "...", "type": "...", ...fields}. Writes go
// through a single async mutex so concurrent pair scans never interleave
// partial lines. Rotation (when enabled) checks the file size before each
// write and shifts path -> path.1 -> path.2 -> ... up to max_files.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Closed set of event types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Startup,
    ScanSummary,
    Candidate,
    CandidateError,
    Skip,
    TriggerStart,
    TriggerStats,
    TriggerArm,
    TriggerFire,
    Preflight,
    Built,
    Simulate,
    Executed,
    JitoBundle,
    ConfirmError,
    RateLimit,
    OpenOceanSkip,
    Warning,
    Error,
    Exit,
    Shutdown,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Startup => "startup",
            EventType::ScanSummary => "scan_summary",
            EventType::Candidate => "candidate",
            EventType::CandidateError => "candidate_error",
            EventType::Skip => "skip",
            EventType::TriggerStart => "trigger_start",
            EventType::TriggerStats => "trigger_stats",
            EventType::TriggerArm => "trigger_arm",
            EventType::TriggerFire => "trigger_fire",
            EventType::Preflight => "preflight",
            EventType::Built => "built",
            EventType::Simulate => "simulate",
            EventType::Executed => "executed",
            EventType::JitoBundle => "jito_bundle",
            EventType::ConfirmError => "confirm_error",
            EventType::RateLimit => "rate_limit",
            EventType::OpenOceanSkip => "openocean_skip",
            EventType::Warning => "warning",
            EventType::Error => "error",
            EventType::Exit => "exit",
            EventType::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone)]
struct RotationPolicy {
    max_bytes: u64,
    max_files: u32,
}

struct LogSink {
    path: PathBuf,
    file: File,
    rotation: Option<RotationPolicy>,
}

impl LogSink {
    fn open(path: &PathBuf) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open event log {}", path.display()))
    }

    /// Shift path.(n-1) -> path.n for n = max_files..1, then reopen fresh
    fn rotate(&mut self, policy: &RotationPolicy) -> Result<()> {
        let base = self.path.display().to_string();
        for n in (1..policy.max_files).rev() {
            let from = PathBuf::from(format!("{}.{}", base, n));
            let to = PathBuf::from(format!("{}.{}", base, n + 1));
            if from.exists() {
                std::fs::rename(&from, &to)
                    .with_context(|| format!("rotate {} -> {}", from.display(), to.display()))?;
            }
        }
        if policy.max_files >= 1 {
            let to = PathBuf::from(format!("{}.1", base));
            std::fs::rename(&self.path, &to)
                .with_context(|| format!("rotate {} -> {}", base, to.display()))?;
        }
        self.file = Self::open(&self.path)?;
        debug!("rotated event log {}", base);
        Ok(())
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        if let Some(policy) = self.rotation.clone() {
            let size = self.file.metadata().map(|m| m.len()).unwrap_or(0);
            if size >= policy.max_bytes {
                self.rotate(&policy)?;
            }
        }
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        Ok(())
    }
}

/// Shared event log handle
pub struct EventLog {
    sink: Mutex<LogSink>,
    verbose: bool,
}

impl EventLog {
    pub fn open(
        path: &str,
        verbose: bool,
        rotate: bool,
        max_bytes: u64,
        max_files: u32,
    ) -> Result<Self> {
        let path = PathBuf::from(path);
        let file = LogSink::open(&path)?;
        let rotation = if rotate {
            Some(RotationPolicy {
                max_bytes: max_bytes.max(1),
                max_files: max_files.max(1),
            })
        } else {
            None
        };
        info!("📒 Event log: {} (rotation: {})", path.display(), rotate);
        Ok(Self {
            sink: Mutex::new(LogSink {
                path,
                file,
                rotation,
            }),
            verbose,
        })
    }

    /// Append one event. `fields` must be a JSON object.
    pub async fn emit(&self, ty: EventType, mut fields: Value) {
        let obj = fields.as_object_mut();
        let line = match obj {
            Some(map) => {
                let mut out = serde_json::Map::with_capacity(map.len() + 2);
                out.insert("ts".to_string(), json!(chrono::Utc::now().to_rfc3339()));
                out.insert("type".to_string(), json!(ty.as_str()));
                out.append(map);
                Value::Object(out).to_string()
            }
            None => json!({
                "ts": chrono::Utc::now().to_rfc3339(),
                "type": ty.as_str(),
                "value": fields,
            })
            .to_string(),
        };

        self.echo(ty, &line);

        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.write_line(&line) {
            warn!("❌ event log write failed: {}", e);
        }
    }

    /// Console echo; quiet mode drops simulate events and unprofitable
    /// candidates from stdout while still persisting them
    fn echo(&self, ty: EventType, line: &str) {
        if !self.verbose {
            match ty {
                EventType::Simulate => return,
                EventType::Candidate if line.contains("\"profitable\":false") => return,
                _ => {}
            }
        }
        match ty {
            EventType::Error | EventType::ConfirmError | EventType::Exit => {
                tracing::error!(target: "events", "{}", line)
            }
            EventType::Warning | EventType::RateLimit => {
                tracing::warn!(target: "events", "{}", line)
            }
            _ => tracing::info!(target: "events", "{}", line),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;

    fn read_lines(path: &std::path::Path) -> Vec<String> {
        if !path.exists() {
            return Vec::new();
        }
        let file = std::fs::File::open(path).unwrap();
        std::io::BufReader::new(file)
            .lines()
            .map(|l| l.unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_emit_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        let log = EventLog::open(path.to_str().unwrap(), true, false, 0, 0).unwrap();

        log.emit(EventType::Skip, json!({"pair": "SOL/USDC", "reason": "not-profitable"}))
            .await;

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 1);
        let parsed: Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(parsed["type"], "skip");
        assert_eq!(parsed["reason"], "not-profitable");
        assert!(parsed["ts"].as_str().unwrap().contains('T'));
    }

    #[tokio::test]
    async fn test_rotation_preserves_line_ordering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        // Tiny size cap so every write after the first rotates
        let log = EventLog::open(path.to_str().unwrap(), true, true, 64, 3).unwrap();

        for i in 0..6 {
            log.emit(EventType::ScanSummary, json!({"seq": i})).await;
        }

        // Reconstruct stream: oldest backup first, live tail last
        let mut stream = Vec::new();
        for n in (1..=3).rev() {
            stream.extend(read_lines(&PathBuf::from(format!(
                "{}.{}",
                path.display(),
                n
            ))));
        }
        stream.extend(read_lines(&path));

        let seqs: Vec<i64> = stream
            .iter()
            .map(|l| serde_json::from_str::<Value>(l).unwrap()["seq"].as_i64().unwrap())
            .collect();
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted, "rotation must preserve ordering");
        assert!(seqs.len() >= 4, "older lines beyond max_files may be dropped");
    }
}
