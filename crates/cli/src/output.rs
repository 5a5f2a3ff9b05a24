//! Human and NDJSON event output.
//!
//! In `--json` mode every event is one JSON object per line on stdout;
//! logs go to stderr, so the stream stays parseable. Human mode favours a
//! single rewriting progress line and a short summary.

use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

use serde_json::json;

/// Event sink for one command invocation.
#[derive(Clone, Copy, Debug)]
pub struct Reporter {
    json: bool,
}

impl Reporter {
    /// Creates a reporter in human or JSON mode.
    #[must_use]
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    fn emit(&self, value: serde_json::Value) {
        println!("{value}");
    }

    /// Connection state transition.
    pub fn status(&self, state: &str) {
        if self.json {
            self.emit(json!({"event": "status", "state": state}));
        } else {
            eprintln!("status: {state}");
        }
    }

    /// Metadata of the file being transferred.
    pub fn file_info(&self, name: &str, size: u64, sha256: &[u8; 32]) {
        if self.json {
            self.emit(json!({
                "event": "file_info",
                "name": name,
                "size": size,
                "sha256": hex(sha256),
            }));
        } else {
            eprintln!("file: {name} ({size} bytes, sha256 {})", hex(sha256));
        }
    }

    /// Transfer progress snapshot.
    pub fn progress(&self, bytes: u64, total: u64, speed_bps: u64, eta_seconds: u64) {
        let percent = if total == 0 {
            100.0
        } else {
            bytes as f64 * 100.0 / total as f64
        };
        if self.json {
            self.emit(json!({
                "event": "progress",
                "bytes": bytes,
                "total": total,
                "speed_bps": speed_bps,
                "eta_seconds": eta_seconds,
                "percent": percent,
            }));
        } else {
            print!(
                "\r{percent:5.1}%  {}/{}  {}/s  eta {eta_seconds}s   ",
                human_bytes(bytes),
                human_bytes(total),
                human_bytes(speed_bps),
            );
            let _ = std::io::stdout().flush();
        }
    }

    /// Final success event.
    pub fn complete(
        &self,
        bytes: u64,
        packets: u64,
        retransmissions: u64,
        duration_ms: u64,
        path: Option<&Path>,
    ) {
        if self.json {
            let mut value = json!({
                "event": "complete",
                "bytes": bytes,
                "packets": packets,
                "retransmissions": retransmissions,
                "duration_ms": duration_ms,
            });
            if let Some(path) = path {
                value["path"] = json!(path.display().to_string());
            }
            self.emit(value);
        } else {
            println!();
            let seconds = (duration_ms as f64 / 1000.0).max(0.001);
            println!(
                "done: {} in {seconds:.1}s ({}/s, {packets} packets, {retransmissions} retransmitted)",
                human_bytes(bytes),
                human_bytes((bytes as f64 / seconds) as u64),
            );
            if let Some(path) = path {
                println!("saved to {}", path.display());
            }
        }
    }

    /// Terminal failure event.
    pub fn error(&self, message: &str) {
        if self.json {
            self.emit(json!({"event": "error", "message": message}));
        } else {
            eprintln!("error: {message}");
        }
    }
}

/// Rate/ETA bookkeeping between progress callbacks.
pub struct ProgressMeter {
    reporter: Reporter,
    started: Instant,
    last_emit: Mutex<Instant>,
}

impl ProgressMeter {
    /// Starts the clock.
    #[must_use]
    pub fn new(reporter: Reporter) -> Self {
        let now = Instant::now();
        Self {
            reporter,
            started: now,
            last_emit: Mutex::new(now),
        }
    }

    /// Feeds one `(bytes, total)` observation; emits at most ~5 events/s,
    /// plus always the final one.
    pub fn observe(&self, bytes: u64, total: u64) {
        let finished = bytes >= total;
        {
            let mut last = self.last_emit.lock().expect("progress lock");
            if !finished && last.elapsed().as_millis() < 200 {
                return;
            }
            *last = Instant::now();
        }

        let elapsed = self.started.elapsed().as_secs_f64().max(0.001);
        let speed_bps = (bytes as f64 / elapsed) as u64;
        let eta_seconds = if speed_bps == 0 {
            0
        } else {
            total.saturating_sub(bytes) / speed_bps.max(1)
        };
        self.reporter.progress(bytes, total, speed_bps, eta_seconds);
    }
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

fn human_bytes(value: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = value as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{value} {}", UNITS[0])
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}
