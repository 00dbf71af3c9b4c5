use std::{
    process::Command,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Context, Result};

/// Pid of the child process a job is currently waiting on, if any.
/// Shared between the job and the runner so a stuck child can be killed from outside.
pub type PidSlot = Arc<Mutex<Option<u32>>>;

pub fn new_pid_slot() -> PidSlot {
    Arc::new(Mutex::new(None))
}

pub fn set_pid(slot: &PidSlot, pid: Option<u32>) {
    *slot.lock().unwrap_or_else(|e| e.into_inner()) = pid;
}

pub fn take_pid(slot: &PidSlot) -> Option<u32> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

#[cfg(unix)]
pub fn kill_pid(pid: u32) -> Result<()> {
    let status = Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .context("kill failed")?;
    if !status.success() {
        return Err(anyhow!("kill exit={status}"));
    }
    Ok(())
}

#[cfg(windows)]
pub fn kill_pid(pid: u32) -> Result<()> {
    let status = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .status()
        .context("taskkill failed")?;
    if !status.success() {
        return Err(anyhow!("taskkill exit={status}"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_clears_slot() {
        let slot = new_pid_slot();
        set_pid(&slot, Some(42));
        assert_eq!(take_pid(&slot), Some(42));
        assert_eq!(take_pid(&slot), None);
    }

    #[cfg(unix)]
    #[test]
    fn kill_pid_terminates_child() {
        let _g = crate::test_spawn_lock();
        let mut child = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
        kill_pid(child.id()).expect("kill");
        let status = child.wait().expect("wait");
        assert!(!status.success());
    }
}
