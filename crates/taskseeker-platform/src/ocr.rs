use std::{
    fmt,
    io::Read,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use taskseeker_core::{settings::Settings, text::postprocess_ocr_text, CapturedImage};
use taskseeker_observability::trace::Span;
use tokio_util::sync::CancellationToken;

use crate::{png_codec, process};

const DEFAULT_LANGUAGES: &str = "eng+chi_sim";
const CONTRAST: f32 = 1.5;
const POLL_INTERVAL: Duration = Duration::from_millis(20);
const STDERR_MAX_CHARS: usize = 400;

#[cfg(windows)]
const PLATFORM_DEFAULT_BIN: &str = r"C:\Program Files\Tesseract-OCR\tesseract.exe";
#[cfg(not(windows))]
const PLATFORM_DEFAULT_BIN: &str = "/usr/bin/tesseract";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcrError {
    pub code: String,
    pub message: String,
}

impl OcrError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new("E_CANCELLED", "cancelled")
    }
}

impl fmt::Display for OcrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for OcrError {}

/// Runs the tesseract CLI on a captured image.
#[derive(Debug, Clone)]
pub struct TesseractOcr {
    pub bin: PathBuf,
    pub languages: String,
    pub test_mode: bool,
    pub data_dir: PathBuf,
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub fn resolve_tesseract_bin(configured: Option<&str>) -> PathBuf {
    if let Some(p) = configured.filter(|p| !p.trim().is_empty()) {
        return PathBuf::from(p.trim());
    }
    if let Some(p) = env_nonempty("TASKSEEKER_TESSERACT") {
        return PathBuf::from(p.trim());
    }
    let default = Path::new(PLATFORM_DEFAULT_BIN);
    if default.exists() {
        return default.to_path_buf();
    }
    PathBuf::from("tesseract")
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

fn clamp_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn spawn_reader<R: Read + Send + 'static>(mut r: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = r.read_to_end(&mut buf);
        buf
    })
}

impl TesseractOcr {
    pub fn from_settings(data_dir: &Path, s: &Settings) -> Self {
        Self {
            bin: resolve_tesseract_bin(s.ocr_tesseract_path.as_deref()),
            languages: s
                .ocr_languages
                .clone()
                .filter(|l| !l.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_LANGUAGES.to_string()),
            test_mode: s.ocr_test_mode.unwrap_or(false),
            data_dir: data_dir.to_path_buf(),
        }
    }

    fn tmp_png_path(&self, job_id: &str) -> PathBuf {
        self.data_dir.join("tmp").join(format!("ocr-{job_id}.png"))
    }

    /// Blocking. Polls the child so `token` can interrupt a slow recognition;
    /// the child pid is published in `pid_slot` while it runs.
    pub fn recognize(
        &self,
        job_id: &str,
        img: &CapturedImage,
        token: &CancellationToken,
        pid_slot: &process::PidSlot,
    ) -> Result<String, OcrError> {
        if token.is_cancelled() {
            return Err(OcrError::cancelled());
        }
        let span = Span::start(
            &self.data_dir,
            Some(job_id),
            "Ocr",
            "OCR.tesseract",
            Some(serde_json::json!({
                "bin": self.bin.to_string_lossy(),
                "languages": self.languages,
                "width": img.width,
                "height": img.height,
            })),
        );

        let png_path = self.tmp_png_path(job_id);
        let res = self.run_on_png(img, &png_path, token, pid_slot);
        process::set_pid(pid_slot, None);
        self.dispose_png(&png_path);

        match res {
            Ok(raw) => {
                let text = postprocess_ocr_text(&raw);
                span.ok(Some(serde_json::json!({
                    "raw_chars": raw.chars().count(),
                    "text_chars": text.chars().count(),
                })));
                Ok(text)
            }
            Err(e) if e.code == "E_CANCELLED" => {
                span.skipped("cancelled", None);
                Err(e)
            }
            Err(e) => {
                span.err("process", &e.code, &e.message, None);
                Err(e)
            }
        }
    }

    fn run_on_png(
        &self,
        img: &CapturedImage,
        png_path: &Path,
        token: &CancellationToken,
        pid_slot: &process::PidSlot,
    ) -> Result<String, OcrError> {
        let enhanced = png_codec::enhance_for_ocr(img, CONTRAST);
        let bytes = png_codec::encode_png_rgba(&enhanced)
            .map_err(|e| OcrError::new("E_OCR_ENCODE", format!("{e:#}")))?;
        if let Some(dir) = png_path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| OcrError::new("E_OCR_IO", format!("create tmp dir failed: {e}")))?;
        }
        std::fs::write(png_path, bytes)
            .map_err(|e| OcrError::new("E_OCR_IO", format!("write tmp png failed: {e}")))?;

        let mut child = Command::new(&self.bin)
            .arg(png_path)
            .args(["stdout", "-l", &self.languages, "--psm", "6", "--oem", "3"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    OcrError::new(
                        "E_OCR_NOT_FOUND",
                        format!("tesseract not found: {}", self.bin.display()),
                    )
                } else {
                    OcrError::new("E_OCR_FAILED", format!("spawn tesseract failed: {e}"))
                }
            })?;
        process::set_pid(pid_slot, Some(child.id()));

        let out = child.stdout.take().map(spawn_reader);
        let err = child.stderr.take().map(spawn_reader);

        let status = wait_or_cancel(&mut child, token)?;
        let stdout = out.and_then(|h| h.join().ok()).unwrap_or_default();
        let stderr = err.and_then(|h| h.join().ok()).unwrap_or_default();

        if !status.success() {
            let tail = clamp_chars(String::from_utf8_lossy(&stderr).trim(), STDERR_MAX_CHARS);
            return Err(OcrError::new(
                "E_OCR_FAILED",
                format!("tesseract exit={status}: {tail}"),
            ));
        }
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }

    fn dispose_png(&self, png_path: &Path) {
        if !png_path.exists() {
            return;
        }
        if self.test_mode {
            let dir = self.data_dir.join("test");
            let _ = std::fs::create_dir_all(&dir);
            let dst = dir.join(format!("processed_{}.png", now_ms()));
            if std::fs::rename(png_path, &dst).is_ok() {
                return;
            }
        }
        let _ = std::fs::remove_file(png_path);
    }
}

fn wait_or_cancel(
    child: &mut Child,
    token: &CancellationToken,
) -> Result<std::process::ExitStatus, OcrError> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {}
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(OcrError::new("E_OCR_FAILED", format!("wait failed: {e}")));
            }
        }
        if token.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(OcrError::cancelled());
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn tiny_image() -> CapturedImage {
        CapturedImage::new(2, 2, vec![128; 16]).unwrap()
    }

    fn ocr_with_bin(dir: &Path, bin: PathBuf) -> TesseractOcr {
        TesseractOcr {
            bin,
            languages: "eng".to_string(),
            test_mode: false,
            data_dir: dir.to_path_buf(),
        }
    }

    #[cfg(unix)]
    fn write_script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let p = dir.join("fake-tesseract.sh");
        {
            let mut f = std::fs::File::create(&p).unwrap();
            std::io::Write::write_all(&mut f, format!("#!/bin/sh\n{body}\n").as_bytes()).unwrap();
            f.sync_all().unwrap();
        }
        std::fs::set_permissions(&p, std::fs::Permissions::from_mode(0o755)).unwrap();
        p
    }

    #[test]
    fn configured_path_wins() {
        assert_eq!(
            resolve_tesseract_bin(Some(" /opt/tess/bin/tesseract ")),
            PathBuf::from("/opt/tess/bin/tesseract")
        );
    }

    #[test]
    fn from_settings_defaults_languages() {
        let td = tempfile::tempdir().unwrap();
        let ocr = TesseractOcr::from_settings(td.path(), &Settings::default());
        assert_eq!(ocr.languages, "eng+chi_sim");
        assert!(!ocr.test_mode);
    }

    #[test]
    fn missing_binary_is_not_found_and_cleans_tmp() {
        let _g = crate::test_spawn_lock();
        let td = tempfile::tempdir().unwrap();
        let ocr = ocr_with_bin(td.path(), td.path().join("no-such-tesseract"));
        let err = ocr
            .recognize("j1", &tiny_image(), &CancellationToken::new(), &process::new_pid_slot())
            .unwrap_err();
        assert_eq!(err.code, "E_OCR_NOT_FOUND");
        assert!(!ocr.tmp_png_path("j1").exists());
    }

    #[test]
    fn already_cancelled_token_short_circuits() {
        let td = tempfile::tempdir().unwrap();
        let ocr = ocr_with_bin(td.path(), td.path().join("unused"));
        let token = CancellationToken::new();
        token.cancel();
        let err = ocr
            .recognize("j1", &tiny_image(), &token, &process::new_pid_slot())
            .unwrap_err();
        assert_eq!(err.code, "E_CANCELLED");
    }

    #[cfg(unix)]
    #[test]
    fn script_output_is_postprocessed() {
        let _g = crate::test_spawn_lock();
        let td = tempfile::tempdir().unwrap();
        let bin = write_script(td.path(), r"printf 'conti-\n  nuous line\nwrap\n'");
        let ocr = ocr_with_bin(td.path(), bin);
        let text = ocr
            .recognize("j2", &tiny_image(), &CancellationToken::new(), &process::new_pid_slot())
            .unwrap();
        assert_eq!(text, "continuous line wrap");
        assert!(!ocr.tmp_png_path("j2").exists());
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_maps_to_failed() {
        let _g = crate::test_spawn_lock();
        let td = tempfile::tempdir().unwrap();
        let bin = write_script(td.path(), "echo 'bad lang' >&2; exit 1");
        let ocr = ocr_with_bin(td.path(), bin);
        let err = ocr
            .recognize("j3", &tiny_image(), &CancellationToken::new(), &process::new_pid_slot())
            .unwrap_err();
        assert_eq!(err.code, "E_OCR_FAILED");
        assert!(err.message.contains("bad lang"));
    }

    #[cfg(unix)]
    #[test]
    fn cancellation_kills_slow_child() {
        let _g = crate::test_spawn_lock();
        let td = tempfile::tempdir().unwrap();
        let bin = write_script(td.path(), "exec sleep 30");
        let ocr = ocr_with_bin(td.path(), bin);
        let token = CancellationToken::new();
        let pid_slot = process::new_pid_slot();

        let t2 = token.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            t2.cancel();
        });
        let t0 = Instant::now();
        let err = ocr.recognize("j4", &tiny_image(), &token, &pid_slot).unwrap_err();
        canceller.join().unwrap();

        assert_eq!(err.code, "E_CANCELLED");
        assert!(t0.elapsed() < Duration::from_secs(5));
        assert_eq!(process::take_pid(&pid_slot), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_mode_keeps_processed_png() {
        let _g = crate::test_spawn_lock();
        let td = tempfile::tempdir().unwrap();
        let bin = write_script(td.path(), "echo hi");
        let mut ocr = ocr_with_bin(td.path(), bin);
        ocr.test_mode = true;
        ocr.recognize("j5", &tiny_image(), &CancellationToken::new(), &process::new_pid_slot())
            .unwrap();
        let kept = std::fs::read_dir(td.path().join("test")).unwrap().count();
        assert_eq!(kept, 1);
    }
}
