use std::{
    fs::OpenOptions,
    io::Write,
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

// Panics on worker threads are caught at the job boundary, but the default hook
// would still print them to stderr mid-render. Route them to <data_dir>/panic.log
// instead, and never panic from inside the hook.
pub fn install_best_effort(data_dir: PathBuf) {
    std::panic::set_hook(Box::new(move |info| {
        let ts_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let thread = std::thread::current()
            .name()
            .unwrap_or("<unnamed>")
            .to_string();
        let bt = std::backtrace::Backtrace::force_capture();
        let msg = format!("ts_ms={ts_ms}\nthread={thread}\npanic={info}\nbacktrace={bt}\n---\n");

        let _ = std::fs::create_dir_all(&data_dir);
        let path = data_dir.join("panic.log");
        if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(&path) {
            let _ = f.write_all(msg.as_bytes());
        }
    }));
}
