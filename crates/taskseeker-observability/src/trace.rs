use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, OnceLock},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::Error as AnyhowError;
use serde::Serialize;
use serde_json::Value;

const DEFAULT_TRACE_MAX_BYTES: u64 = 10_000_000; // 10MB
const DEFAULT_TRACE_MAX_FILES: usize = 5;
const DEFAULT_BACKTRACE_MAX_CHARS: usize = 12_000;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn env_bool_default_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(v) => {
            let t = v.trim().to_ascii_lowercase();
            !(t == "0" || t == "false" || t == "no" || t == "off")
        }
        Err(_) => true,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(v) => v.trim().parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}

pub fn enabled() -> bool {
    env_bool_default_true("TASKSEEKER_TRACE_ENABLED")
}

fn backtrace_enabled() -> bool {
    env_bool_default_true("TASKSEEKER_TRACE_BACKTRACE")
}

pub fn trace_path(data_dir: &Path) -> PathBuf {
    data_dir.join("trace.jsonl")
}

#[derive(Debug, Clone, Copy)]
struct RotationLimits {
    max_bytes: u64,
    max_files: usize,
}

impl RotationLimits {
    fn from_env() -> Self {
        Self {
            max_bytes: env_parse("TASKSEEKER_TRACE_MAX_BYTES", DEFAULT_TRACE_MAX_BYTES),
            max_files: env_parse("TASKSEEKER_TRACE_MAX_FILES", DEFAULT_TRACE_MAX_FILES),
        }
    }
}

fn rotated_path(data_dir: &Path, n: usize) -> PathBuf {
    data_dir.join(format!("trace.jsonl.{n}"))
}

/// Shifts trace.jsonl -> .1 -> .2 ... once it outgrows `max_bytes`.
fn rotate(data_dir: &Path, limits: RotationLimits) {
    if limits.max_files == 0 {
        return;
    }
    let current = trace_path(data_dir);
    let too_big = std::fs::metadata(&current)
        .map(|m| m.len() > limits.max_bytes)
        .unwrap_or(false);
    if !too_big {
        return;
    }

    let _ = std::fs::remove_file(rotated_path(data_dir, limits.max_files));
    for n in (1..limits.max_files).rev() {
        let from = rotated_path(data_dir, n);
        if from.exists() {
            let _ = std::fs::rename(&from, rotated_path(data_dir, n + 1));
        }
    }
    let _ = std::fs::rename(&current, rotated_path(data_dir, 1));
}

fn write_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

/// Appends one JSON line. All emitters in the process share one lock so
/// concurrent lines never interleave.
pub fn emit_best_effort(data_dir: &Path, ev: &TraceEvent) {
    if !enabled() {
        return;
    }
    let line = match serde_json::to_string(ev) {
        Ok(s) => s,
        Err(e) => {
            crate::safe_eprintln!("trace: serialize failed: {e}");
            return;
        }
    };

    let _guard = write_lock().lock().unwrap_or_else(|e| e.into_inner());
    let _ = std::fs::create_dir_all(data_dir);
    rotate(data_dir, RotationLimits::from_env());

    let p = trace_path(data_dir);
    let written = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&p)
        .and_then(|mut f| writeln!(f, "{line}"));
    if let Err(e) = written {
        crate::safe_eprintln!("trace: append to {} failed: {e}", p.display());
    }
}

fn clamp_chars(s: &str, max_chars: usize) -> String {
    s.chars().filter(|&c| c != '\0').take(max_chars).collect()
}

fn redact_user_paths(s: &str) -> String {
    // Scrub the account name out of common home-dir prefixes.
    fn scrub_after(hay: &str, marker: &str, sep: char) -> String {
        let mut out = String::with_capacity(hay.len());
        let mut i = 0;
        while let Some(pos) = hay[i..].find(marker) {
            let abs = i + pos;
            out.push_str(&hay[i..abs]);
            out.push_str(marker);
            let name_start = abs + marker.len();
            let name_len: usize = hay[name_start..]
                .chars()
                .take_while(|&c| c != sep)
                .map(char::len_utf8)
                .sum();
            out.push_str("<redacted>");
            i = name_start + name_len;
        }
        out.push_str(&hay[i..]);
        out
    }

    let t = scrub_after(s, "\\Users\\", '\\');
    let t = scrub_after(&t, "/Users/", '/');
    scrub_after(&t, "/home/", '/')
}

fn maybe_backtrace_string() -> Option<String> {
    if !backtrace_enabled() {
        return None;
    }
    let bt = std::backtrace::Backtrace::force_capture();
    Some(clamp_chars(
        &redact_user_paths(&format!("{bt:?}")),
        DEFAULT_BACKTRACE_MAX_CHARS,
    ))
}

fn merge_ctx(base: serde_json::Map<String, Value>, extra: Option<Value>) -> Value {
    match extra {
        None => Value::Object(base),
        Some(Value::Object(m)) => {
            let mut out = base;
            out.extend(m);
            Value::Object(out)
        }
        Some(v) => {
            let mut out = base;
            out.insert("extra".to_string(), v);
            Value::Object(out)
        }
    }
}

fn ctx_with_backtrace(err: Option<&AnyhowError>, extra: Option<Value>) -> Option<Value> {
    let mut m = serde_json::Map::new();
    if let Some(err) = err {
        let chain: Vec<String> = err.chain().map(|e| e.to_string()).collect();
        m.insert("err_chain".to_string(), serde_json::json!(chain));
    }
    if let Some(bt) = maybe_backtrace_string() {
        m.insert("backtrace".to_string(), serde_json::json!(bt));
    }
    if m.is_empty() {
        return extra;
    }
    Some(merge_ctx(m, extra))
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceError {
    pub kind: String,    // runner|http|io|process|logic|parse|unknown
    pub code: String,    // E_* | HTTP_401
    pub message: String, // short
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub ts_ms: i64,
    pub job_id: Option<String>,
    pub stage: String,
    pub step_id: String,
    pub op: String,     // start|end|event
    pub status: String, // ok|err|skipped|aborted
    pub duration_ms: Option<u128>,
    pub error: Option<TraceError>,
    pub ctx: Option<Value>,
}

pub fn event(
    data_dir: &Path,
    job_id: Option<&str>,
    stage: &str,
    step_id: &str,
    status: &str,
    ctx: Option<Value>,
) {
    emit_best_effort(
        data_dir,
        &TraceEvent {
            ts_ms: now_ms(),
            job_id: job_id.map(|s| s.to_string()),
            stage: stage.to_string(),
            step_id: step_id.to_string(),
            op: "event".to_string(),
            status: status.to_string(),
            duration_ms: None,
            error: None,
            ctx,
        },
    );
}

/// Point-in-time failure without a surrounding span (e.g. a forced teardown).
#[allow(clippy::too_many_arguments)]
pub fn error_event(
    data_dir: &Path,
    job_id: Option<&str>,
    stage: &str,
    step_id: &str,
    kind: &str,
    code: &str,
    message: &str,
    ctx: Option<Value>,
) {
    emit_best_effort(
        data_dir,
        &TraceEvent {
            ts_ms: now_ms(),
            job_id: job_id.map(|s| s.to_string()),
            stage: stage.to_string(),
            step_id: step_id.to_string(),
            op: "event".to_string(),
            status: "err".to_string(),
            duration_ms: None,
            error: Some(TraceError {
                kind: kind.to_string(),
                code: code.to_string(),
                message: message.to_string(),
            }),
            ctx,
        },
    );
}

pub struct Span {
    data_dir: PathBuf,
    job_id: Option<String>,
    stage: String,
    step_id: String,
    t0: Instant,
    finished: bool,
}

impl Span {
    pub fn start(
        data_dir: &Path,
        job_id: Option<&str>,
        stage: &str,
        step_id: &str,
        ctx: Option<Value>,
    ) -> Self {
        let span = Self {
            data_dir: data_dir.to_path_buf(),
            job_id: job_id.map(|s| s.to_string()),
            stage: stage.to_string(),
            step_id: step_id.to_string(),
            t0: Instant::now(),
            finished: false,
        };
        span.emit("start", "ok", None, None, ctx);
        span
    }

    fn emit(
        &self,
        op: &str,
        status: &str,
        duration_ms: Option<u128>,
        error: Option<TraceError>,
        ctx: Option<Value>,
    ) {
        emit_best_effort(
            &self.data_dir,
            &TraceEvent {
                ts_ms: now_ms(),
                job_id: self.job_id.clone(),
                stage: self.stage.clone(),
                step_id: self.step_id.clone(),
                op: op.to_string(),
                status: status.to_string(),
                duration_ms,
                error,
                ctx,
            },
        );
    }

    fn end(&mut self, status: &str, error: Option<TraceError>, ctx: Option<Value>) {
        self.finished = true;
        let elapsed = Some(self.t0.elapsed().as_millis());
        self.emit("end", status, elapsed, error, ctx);
    }

    pub fn ok(mut self, ctx: Option<Value>) {
        self.end("ok", None, ctx);
    }

    pub fn skipped(mut self, reason: &str, ctx: Option<Value>) {
        let error = TraceError {
            kind: "logic".to_string(),
            code: "SKIPPED".to_string(),
            message: reason.to_string(),
        };
        self.end("skipped", Some(error), ctx);
    }

    pub fn err(mut self, kind: &str, code: &str, message: &str, ctx: Option<Value>) {
        let error = TraceError {
            kind: kind.to_string(),
            code: code.to_string(),
            message: message.to_string(),
        };
        self.end("err", Some(error), ctx_with_backtrace(None, ctx));
    }

    pub fn err_anyhow(mut self, kind: &str, code: &str, err: &AnyhowError, ctx: Option<Value>) {
        let error = TraceError {
            kind: kind.to_string(),
            code: code.to_string(),
            message: err.to_string(),
        };
        self.end("err", Some(error), ctx_with_backtrace(Some(err), ctx));
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let error = TraceError {
            kind: "logic".to_string(),
            code: "ABORTED".to_string(),
            message: "span dropped without explicit ok/err".to_string(),
        };
        self.finished = true;
        let elapsed = Some(self.t0.elapsed().as_millis());
        self.emit("end", "aborted", elapsed, Some(error), ctx_with_backtrace(None, None));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, thread};

    fn read_lines(dir: &Path) -> Vec<serde_json::Value> {
        let raw = fs::read_to_string(trace_path(dir)).expect("read trace");
        raw.lines()
            .map(|l| serde_json::from_str(l).expect("valid json line"))
            .collect()
    }

    #[test]
    fn concurrent_emit_keeps_jsonl_lines_parseable() {
        let td = tempfile::tempdir().expect("tempdir");
        let dir = td.path().to_path_buf();
        let threads = 8;
        let per_thread = 120;

        let mut joins = Vec::new();
        for i in 0..threads {
            let dir2 = dir.clone();
            joins.push(thread::spawn(move || {
                for j in 0..per_thread {
                    event(
                        &dir2,
                        Some("job-concurrent"),
                        "TraceTest",
                        "TRACE.concurrent_emit",
                        "ok",
                        Some(serde_json::json!({"i": i, "j": j})),
                    );
                }
            }));
        }
        for j in joins {
            j.join().expect("join");
        }

        let lines = read_lines(&dir);
        assert_eq!(lines.len(), threads * per_thread);
        assert!(lines.iter().all(|v| v.get("step_id").is_some()));
    }

    #[test]
    fn dropped_span_is_recorded_as_aborted() {
        let td = tempfile::tempdir().expect("tempdir");
        {
            let _span = Span::start(td.path(), Some("job-1"), "Runner", "RUNNER.test", None);
        }
        let lines = read_lines(td.path());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["op"], "end");
        assert_eq!(lines[1]["status"], "aborted");
        assert_eq!(lines[1]["job_id"], "job-1");
    }

    #[test]
    fn redaction_scrubs_home_directories() {
        let s = redact_user_paths("at /home/alice/src/lib.rs and C:\\Users\\bob\\x.rs");
        assert!(!s.contains("alice"));
        assert!(!s.contains("bob"));
        assert!(s.contains("/home/<redacted>/src/lib.rs"));
    }

    #[test]
    fn oversized_trace_is_shifted_and_oldest_dropped() {
        let td = tempfile::tempdir().expect("tempdir");
        let dir = td.path();
        let limits = RotationLimits {
            max_bytes: 4,
            max_files: 2,
        };
        fs::write(trace_path(dir), "newest").expect("write current");
        fs::write(rotated_path(dir, 1), "middle").expect("write .1");
        fs::write(rotated_path(dir, 2), "oldest").expect("write .2");

        rotate(dir, limits);
        assert!(!trace_path(dir).exists());
        assert_eq!(fs::read_to_string(rotated_path(dir, 1)).expect(".1"), "newest");
        assert_eq!(fs::read_to_string(rotated_path(dir, 2)).expect(".2"), "middle");

        // Small files stay put.
        fs::write(trace_path(dir), "ok").expect("write small");
        rotate(dir, limits);
        assert!(trace_path(dir).exists());
    }
}
