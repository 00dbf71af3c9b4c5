use std::{
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use sha2::{Digest, Sha256};

use crate::metrics;

const DEFAULT_MAX_PAYLOAD_BYTES: usize = 2_000_000; // 2MB
const DEFAULT_MAX_JOBS: usize = 50;
const TRUNCATED_SUFFIX: &[u8] = b"\n...(truncated)\n";

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn env_bool(key: &str) -> bool {
    match std::env::var(key) {
        Ok(v) => {
            let t = v.trim().to_ascii_lowercase();
            t == "1" || t == "true" || t == "yes" || t == "on"
        }
        Err(_) => false,
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(v) => v.trim().parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Where and how much to persist. `from_env` is what production uses;
/// tests build one directly so they never touch process env.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugLimits {
    pub enabled: bool,
    pub max_payload_bytes: usize,
    pub max_jobs: usize,
}

impl DebugLimits {
    pub fn from_env() -> Self {
        Self {
            enabled: env_bool("TASKSEEKER_DEBUG_VERBOSE"),
            max_payload_bytes: env_usize(
                "TASKSEEKER_DEBUG_MAX_PAYLOAD_BYTES",
                DEFAULT_MAX_PAYLOAD_BYTES,
            ),
            max_jobs: env_usize("TASKSEEKER_DEBUG_MAX_JOBS", DEFAULT_MAX_JOBS),
        }
    }
}

pub fn verbose_enabled() -> bool {
    env_bool("TASKSEEKER_DEBUG_VERBOSE")
}

pub fn debug_root(data_dir: &Path) -> PathBuf {
    data_dir.join("debug")
}

pub fn debug_job_dir(data_dir: &Path, job_id: &str) -> PathBuf {
    debug_root(data_dir).join(job_id)
}

#[derive(Debug, Clone)]
pub struct PayloadInfo {
    pub path: PathBuf,
    pub bytes_written: usize,
    pub truncated: bool,
    pub sha256: String,
}

fn sha256_hex(b: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(b);
    hex::encode(h.finalize())
}

fn truncate_with_suffix(mut b: Vec<u8>, max_bytes: usize, suffix: &[u8]) -> (Vec<u8>, bool) {
    if b.len() <= max_bytes {
        return (b, false);
    }
    let keep = max_bytes.saturating_sub(suffix.len());
    b.truncate(keep);
    b.extend_from_slice(suffix);
    (b, true)
}

pub fn write_payload_best_effort(
    data_dir: &Path,
    job_id: &str,
    filename: &str,
    bytes: Vec<u8>,
) -> Option<PayloadInfo> {
    write_payload_with(&DebugLimits::from_env(), data_dir, job_id, filename, bytes)
}

pub fn write_payload_with(
    limits: &DebugLimits,
    data_dir: &Path,
    job_id: &str,
    filename: &str,
    bytes: Vec<u8>,
) -> Option<PayloadInfo> {
    if !limits.enabled {
        return None;
    }

    let (out, truncated) = truncate_with_suffix(bytes, limits.max_payload_bytes, TRUNCATED_SUFFIX);
    let sha256 = sha256_hex(&out);

    let dir = debug_job_dir(data_dir, job_id);
    if let Err(e) = fs::create_dir_all(&dir) {
        crate::safe_eprintln!("debug_log: create_dir_all failed: {}: {e}", dir.display());
        return None;
    }
    let path = dir.join(filename);
    if let Err(e) = fs::write(&path, &out) {
        crate::safe_eprintln!("debug_log: write failed: {}: {e}", path.display());
        return None;
    }

    prune_debug_dir(data_dir, limits.max_jobs);

    Some(PayloadInfo {
        path,
        bytes_written: out.len(),
        truncated,
        sha256,
    })
}

/// Records a pointer to a persisted payload in metrics.jsonl.
pub fn emit_debug_event_best_effort(
    data_dir: &Path,
    event_type: &str,
    job_id: &str,
    info: &PayloadInfo,
    note: Option<String>,
) {
    let obj = serde_json::json!({
        "type": event_type,
        "ts_ms": now_ms(),
        "job_id": job_id,
        "payload_path": info.path.to_string_lossy().to_string(),
        "payload_bytes": info.bytes_written,
        "truncated": info.truncated,
        "sha256": info.sha256,
        "note": note,
    });
    if let Err(e) = metrics::append_jsonl(data_dir, &obj) {
        crate::safe_eprintln!("debug_log: metrics append failed: {e:#}");
    }
}

/// Keeps the `max_keep` most recently modified job directories.
fn prune_debug_dir(data_dir: &Path, max_keep: usize) {
    let Ok(entries) = fs::read_dir(debug_root(data_dir)) else {
        return;
    };
    let mut dirs: Vec<(SystemTime, PathBuf)> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .map(|e| {
            let modified = e
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(UNIX_EPOCH);
            (modified, e.path())
        })
        .collect();
    if dirs.len() <= max_keep {
        return;
    }
    dirs.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, stale) in dirs.drain(max_keep..) {
        if let Err(e) = fs::remove_dir_all(&stale) {
            crate::safe_eprintln!("debug_log: prune {} failed: {e}", stale.display());
        }
    }
}
