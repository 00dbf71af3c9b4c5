use std::path::PathBuf;

use anyhow::{anyhow, Result};

pub fn data_dir() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("TASKSEEKER_DATA_DIR") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    if cfg!(windows) {
        let appdata = std::env::var("APPDATA").map_err(|_| anyhow!("APPDATA is not set"))?;
        return Ok(PathBuf::from(appdata).join("TaskSeeker"));
    }

    if let Ok(p) = std::env::var("XDG_CONFIG_HOME") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p).join("taskseeker"));
        }
    }
    let home = std::env::var("HOME").map_err(|_| anyhow!("HOME is not set"))?;
    Ok(PathBuf::from(home).join(".config").join("taskseeker"))
}
