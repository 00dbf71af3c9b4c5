use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionError {
    pub code: String,
    pub message: String,
}

impl SelectionError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for SelectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for SelectionError {}

/// Reads "the text the user has selected" from the system clipboard.
///
/// On Linux the PRIMARY selection holds the current highlight without any
/// copy action, so it is tried first. Other platforms only have the regular
/// clipboard, which the user fills with a copy before triggering.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClipboardSelection;

impl ClipboardSelection {
    pub fn read_selection(&self) -> Result<Option<String>, SelectionError> {
        let mut clipboard = arboard::Clipboard::new().map_err(|e| {
            SelectionError::new(
                "E_SELECTION_UNAVAILABLE",
                format!("clipboard init failed: {e}"),
            )
        })?;

        #[cfg(target_os = "linux")]
        {
            use arboard::{GetExtLinux, LinuxClipboardKind};
            if let Ok(t) = clipboard
                .get()
                .clipboard(LinuxClipboardKind::Primary)
                .text()
            {
                if !t.trim().is_empty() {
                    return Ok(Some(t));
                }
            }
        }

        match clipboard.get_text() {
            Ok(t) if t.trim().is_empty() => Ok(None),
            Ok(t) => Ok(Some(t)),
            Err(arboard::Error::ContentNotAvailable) => Ok(None),
            Err(e) => Err(SelectionError::new(
                "E_SELECTION_UNAVAILABLE",
                format!("clipboard read failed: {e}"),
            )),
        }
    }
}

pub fn copy_to_clipboard(text: &str) -> Result<(), SelectionError> {
    if text.trim().is_empty() {
        return Err(SelectionError::new(
            "E_COPY_EMPTY_TEXT",
            "empty text cannot be copied",
        ));
    }
    let mut clipboard = arboard::Clipboard::new().map_err(|e| {
        SelectionError::new(
            "E_SELECTION_UNAVAILABLE",
            format!("clipboard init failed: {e}"),
        )
    })?;
    clipboard.set_text(text.to_string()).map_err(|e| {
        SelectionError::new("E_COPY_FAILED", format!("clipboard write failed: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_rejects_blank_text_before_touching_clipboard() {
        let err = copy_to_clipboard("  \n").unwrap_err();
        assert_eq!(err.code, "E_COPY_EMPTY_TEXT");
    }

    #[test]
    fn error_display_includes_code() {
        let e = SelectionError::new("E_SELECTION_UNAVAILABLE", "no display");
        assert_eq!(e.to_string(), "E_SELECTION_UNAVAILABLE: no display");
    }
}
