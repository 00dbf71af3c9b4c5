use std::{
    io::Write,
    sync::{Arc, Mutex},
};

use taskseeker_engine::{ResultSink, SlotName, TerminalEvent};

#[derive(Debug, Default)]
struct Shared {
    answer: Option<String>,
    errored: bool,
}

/// Prints a query the way the overlay renders it, to stdout: the committed
/// text grows in place and the annotation lands on its own line.
pub struct ConsoleSink<W: Write> {
    out: W,
    printed: usize,
    shared: Arc<Mutex<Shared>>,
}

/// What the CLI needs after the dispatcher has finished.
#[derive(Clone, Default)]
pub struct SinkReport {
    shared: Arc<Mutex<Shared>>,
}

impl SinkReport {
    /// Text of the last completed query, without the annotation.
    pub fn answer(&self) -> Option<String> {
        self.shared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .answer
            .clone()
    }

    pub fn errored(&self) -> bool {
        self.shared.lock().unwrap_or_else(|e| e.into_inner()).errored
    }
}

impl<W: Write> ConsoleSink<W> {
    pub fn new(out: W) -> (Self, SinkReport) {
        let report = SinkReport::default();
        let sink = Self {
            out,
            printed: 0,
            shared: report.shared.clone(),
        };
        (sink, report)
    }

    // Committed text only grows, so everything past `printed` is new.
    fn print_tail(&mut self, committed: &str) {
        let tail = committed.get(self.printed..).unwrap_or(committed);
        let _ = self.out.write_all(tail.as_bytes());
        let _ = self.out.flush();
        self.printed = committed.len();
    }
}

impl<W: Write> ResultSink for ConsoleSink<W> {
    fn show_loading(&mut self) {
        self.printed = 0;
        let _ = writeln!(self.out, "…");
    }

    fn append_partial(&mut self, committed: &str) {
        self.print_tail(committed);
    }

    fn show_final(&mut self, text: &str, _annotation: &str) {
        self.print_tail(text);
        let _ = writeln!(self.out);
        self.printed = 0;
    }

    fn show_error(&mut self, message: &str) {
        self.shared.lock().unwrap_or_else(|e| e.into_inner()).errored = true;
        let _ = writeln!(self.out, "error: {message}");
    }

    fn terminal(&mut self, _job_id: &str, slot: SlotName, event: &TerminalEvent) {
        if slot != SlotName::Query {
            return;
        }
        let mut g = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        g.answer = match event {
            TerminalEvent::Completed { text, .. } => Some(text.clone()),
            _ => None,
        };
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[test]
    fn prints_only_new_text_and_remembers_answer() {
        let out = Captured::default();
        let (mut sink, report) = ConsoleSink::new(out.clone());
        sink.show_loading();
        sink.append_partial("Hello");
        sink.append_partial("Hello, world");
        sink.show_final("Hello, world\n\n[elapsed 0.3s]", "[elapsed 0.3s]");
        sink.terminal(
            "job",
            SlotName::Query,
            &TerminalEvent::Completed {
                text: "Hello, world".to_string(),
                elapsed: Duration::from_millis(300),
            },
        );

        assert_eq!(out.text(), "…\nHello, world\n\n[elapsed 0.3s]\n");
        assert_eq!(report.answer().as_deref(), Some("Hello, world"));
        assert!(!report.errored());
    }

    #[test]
    fn errors_are_flagged() {
        let out = Captured::default();
        let (mut sink, report) = ConsoleSink::new(out.clone());
        sink.show_error("Text recognition failed");
        assert!(report.errored());
        assert_eq!(out.text(), "error: Text recognition failed\n");
        assert_eq!(report.answer(), None);
    }
}
