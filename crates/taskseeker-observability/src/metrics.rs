use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::Serialize;

pub fn metrics_path(data_dir: &Path) -> PathBuf {
    data_dir.join("metrics.jsonl")
}

pub fn append_jsonl<T: Serialize>(data_dir: &Path, obj: &T) -> Result<()> {
    std::fs::create_dir_all(data_dir).context("create data dir failed")?;
    let p = metrics_path(data_dir);
    let mut line = serde_json::to_string(obj).context("serialize metrics json failed")?;
    line.push('\n');
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&p)
        .with_context(|| format!("open metrics jsonl failed: {}", p.display()))?;
    f.write_all(line.as_bytes())
        .context("write metrics line failed")?;
    Ok(())
}

/// Appends and reports failures on stderr instead of returning them.
pub fn append_jsonl_best_effort<T: Serialize>(data_dir: &Path, what: &str, obj: &T) {
    if let Err(e) = append_jsonl(data_dir, obj) {
        crate::safe_eprintln!("metrics append failed ({what}): {e:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_one_line_per_record() {
        let td = tempfile::tempdir().expect("tempdir");
        append_jsonl(td.path(), &serde_json::json!({"type": "a"})).expect("append a");
        append_jsonl_best_effort(td.path(), "b", &serde_json::json!({"type": "b"}));
        let raw = std::fs::read_to_string(metrics_path(td.path())).expect("read");
        let types: Vec<String> = raw
            .lines()
            .map(|l| {
                let v: serde_json::Value = serde_json::from_str(l).expect("json");
                v["type"].as_str().unwrap_or_default().to_string()
            })
            .collect();
        assert_eq!(types, vec!["a", "b"]);
    }
}
