pub mod ocr;
pub mod png_codec;
pub mod process;
pub mod selection;

pub use ocr::{OcrError, TesseractOcr};
pub use selection::{ClipboardSelection, SelectionError};

// Tests that write an executable and then spawn processes race with each other
// (ETXTBSY when a sibling fork inherits the still-open write handle).
#[cfg(test)]
pub(crate) fn test_spawn_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}
