use std::{
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Settings {
    pub llm_base_url: Option<String>,
    pub llm_model: Option<String>,
    pub llm_system_prompt: Option<String>,
    pub llm_temperature: Option<f32>,
    pub llm_max_tokens: Option<u32>,
    pub llm_timeout_secs: Option<u64>,
    pub llm_max_retries: Option<u32>,
    pub llm_retry_max_delay_secs: Option<f64>,

    pub ocr_tesseract_path: Option<String>,
    pub ocr_languages: Option<String>, // tesseract -l, e.g. eng+chi_sim
    pub ocr_test_mode: Option<bool>,

    pub stream_responses: Option<bool>,
    pub stream_flush_ms: Option<u64>,
    pub job_join_timeout_ms: Option<u64>,
    pub max_query_chars: Option<usize>,
}

/// Partial update; `Some` fields overwrite, `None` fields are left alone.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SettingsPatch {
    pub llm_base_url: Option<String>,
    pub llm_model: Option<String>,
    pub llm_system_prompt: Option<String>,
    pub llm_temperature: Option<f32>,
    pub llm_max_tokens: Option<u32>,
    pub llm_timeout_secs: Option<u64>,
    pub llm_max_retries: Option<u32>,
    pub llm_retry_max_delay_secs: Option<f64>,
    pub ocr_tesseract_path: Option<String>,
    pub ocr_languages: Option<String>,
    pub ocr_test_mode: Option<bool>,
    pub stream_responses: Option<bool>,
    pub stream_flush_ms: Option<u64>,
    pub job_join_timeout_ms: Option<u64>,
    pub max_query_chars: Option<usize>,
}

macro_rules! patch_fields {
    ($dst:expr, $src:expr, $($field:ident),+ $(,)?) => {
        $(
            if let Some(v) = $src.$field {
                $dst.$field = Some(v);
            }
        )+
    };
}

impl Settings {
    pub fn apply_patch(&mut self, patch: SettingsPatch) {
        patch_fields!(
            self,
            patch,
            llm_base_url,
            llm_model,
            llm_system_prompt,
            llm_temperature,
            llm_max_tokens,
            llm_timeout_secs,
            llm_max_retries,
            llm_retry_max_delay_secs,
            ocr_tesseract_path,
            ocr_languages,
            ocr_test_mode,
            stream_responses,
            stream_flush_ms,
            job_join_timeout_ms,
            max_query_chars,
        );
    }
}

pub fn settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join("settings.json")
}

pub fn load_settings(data_dir: &Path) -> Result<Settings> {
    let p = settings_path(data_dir);
    if !p.exists() {
        return Ok(Settings::default());
    }
    let s = fs::read_to_string(&p).context("read settings.json failed")?;
    let v: Settings = serde_json::from_str(&s).context("parse settings.json failed")?;
    Ok(v)
}

/// Like `load_settings`, but a corrupt file is moved aside and defaults are used.
pub fn load_settings_or_recover(data_dir: &Path) -> Settings {
    match load_settings(data_dir) {
        Ok(s) => s,
        Err(_) => {
            let p = settings_path(data_dir);
            let ts = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or(0);
            let aside = data_dir.join(format!("settings.json.corrupt-{ts}"));
            let _ = fs::rename(&p, &aside);
            Settings::default()
        }
    }
}

pub fn save_settings(data_dir: &Path, settings: &Settings) -> Result<()> {
    fs::create_dir_all(data_dir).ok();
    let p = settings_path(data_dir);
    let s = serde_json::to_string_pretty(settings).context("serialize settings failed")?;
    fs::write(&p, s).context("write settings.json failed")?;
    Ok(())
}

pub fn update_settings(data_dir: &Path, patch: SettingsPatch) -> Result<Settings> {
    let mut s = load_settings(data_dir)?;
    s.apply_patch(patch);
    save_settings(data_dir, &s)?;
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let td = tempfile::tempdir().expect("tempdir");
        let s = load_settings(td.path()).expect("load");
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn patch_overwrites_only_given_fields() {
        let td = tempfile::tempdir().expect("tempdir");
        save_settings(
            td.path(),
            &Settings {
                llm_model: Some("deepseek-chat".to_string()),
                max_query_chars: Some(100),
                ..Settings::default()
            },
        )
        .expect("save");

        let s = update_settings(
            td.path(),
            SettingsPatch {
                max_query_chars: Some(200),
                ..SettingsPatch::default()
            },
        )
        .expect("update");
        assert_eq!(s.llm_model.as_deref(), Some("deepseek-chat"));
        assert_eq!(s.max_query_chars, Some(200));
        assert_eq!(load_settings(td.path()).expect("reload"), s);
    }

    #[test]
    fn corrupt_file_is_moved_aside() {
        let td = tempfile::tempdir().expect("tempdir");
        fs::write(settings_path(td.path()), "{not json").expect("write");
        let s = load_settings_or_recover(td.path());
        assert_eq!(s, Settings::default());
        assert!(!settings_path(td.path()).exists());
        let moved = fs::read_dir(td.path())
            .expect("read_dir")
            .flatten()
            .any(|e| e.file_name().to_string_lossy().starts_with("settings.json.corrupt-"));
        assert!(moved);
    }
}
