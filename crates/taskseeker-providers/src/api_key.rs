use std::sync::{Mutex, OnceLock};

use anyhow::{anyhow, Result};
use serde::Serialize;

const KEYRING_SERVICE: &str = "taskseeker";
const KEYRING_USER: &str = "llm_api_key";
const ENV_KEYS: [&str; 2] = ["TASKSEEKER_LLM_API_KEY", "DEEPSEEK_API_KEY"];

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ApiKeyStatus {
    pub configured: bool,
    pub source: String, // env|memory|keyring
    pub reason: Option<String>,
}

fn api_key_cache() -> &'static Mutex<Option<String>> {
    static CACHE: OnceLock<Mutex<Option<String>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(None))
}

fn load_api_key_from_memory() -> Option<String> {
    let g = api_key_cache().lock().unwrap_or_else(|e| e.into_inner());
    g.as_ref().cloned().filter(|s| !s.trim().is_empty())
}

fn set_api_key_memory(key: Option<&str>) {
    let mut g = api_key_cache().lock().unwrap_or_else(|e| e.into_inner());
    *g = key.map(|s| s.to_string()).filter(|s| !s.trim().is_empty());
}

fn keyring_entry() -> Result<keyring::Entry> {
    keyring::Entry::new(KEYRING_SERVICE, KEYRING_USER)
        .map_err(|e| anyhow!("keyring entry init failed: {e:?}"))
}

fn key_from_env(lookup: &dyn Fn(&str) -> Option<String>) -> Option<String> {
    ENV_KEYS
        .iter()
        .filter_map(|k| lookup(k))
        .find(|v| !v.trim().is_empty())
}

fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn load_api_key_with(lookup: &dyn Fn(&str) -> Option<String>) -> Result<String> {
    if let Some(k) = key_from_env(lookup) {
        return Ok(k);
    }
    if let Some(k) = load_api_key_from_memory() {
        return Ok(k);
    }
    let k = keyring_entry()?
        .get_password()
        .map_err(|e| anyhow!("keyring get failed: {e:?}"))?;
    if k.trim().is_empty() {
        return Err(anyhow!("empty api key"));
    }
    Ok(k)
}

pub fn load_api_key() -> Result<String> {
    load_api_key_with(&process_env)
}

pub fn set_api_key(key: &str) -> Result<()> {
    // The in-memory copy keeps this session working even if the keyring write fails.
    set_api_key_memory(Some(key));
    keyring_entry()?
        .set_password(key)
        .map_err(|e| anyhow!("keyring set failed: {e:?}"))?;
    Ok(())
}

pub fn clear_api_key() -> Result<()> {
    set_api_key_memory(None);
    match keyring_entry()?.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(anyhow!("keyring delete failed: {e:?}")),
    }
}

fn api_key_status_with(lookup: &dyn Fn(&str) -> Option<String>) -> ApiKeyStatus {
    let status = |configured: bool, source: &str, reason: Option<String>| ApiKeyStatus {
        configured,
        source: source.to_string(),
        reason,
    };
    if key_from_env(lookup).is_some() {
        return status(true, "env", None);
    }
    if load_api_key_from_memory().is_some() {
        return status(true, "memory", None);
    }
    let entry = match keyring_entry() {
        Ok(e) => e,
        Err(e) => return status(false, "keyring", Some(format!("keyring_entry_init_failed:{e}"))),
    };
    match entry.get_password() {
        Ok(k) if k.trim().is_empty() => status(false, "keyring", Some("empty".to_string())),
        Ok(_) => status(true, "keyring", None),
        Err(e) => status(false, "keyring", Some(format!("keyring_get_failed:{e:?}"))),
    }
}

pub fn api_key_status() -> ApiKeyStatus {
    api_key_status_with(&process_env)
}
