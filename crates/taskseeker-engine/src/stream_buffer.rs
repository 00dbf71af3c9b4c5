use std::time::{Duration, Instant};

use crate::job::TerminalEvent;

/// What the sink should render once a job is finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finalized {
    /// `committed` with the annotation appended.
    pub text: String,
    pub annotation: String,
    /// Fragments that arrived after the error latch. Never rendered.
    pub diagnostic_tail: String,
}

/// Turns a trickle of fragments into periodic full-text updates.
///
/// `committed` is what the sink has (or is about to have) on screen; `pending`
/// is what arrived since the last flush. A flush happens at most once per
/// `flush_interval`, except after an error fragment, which flushes immediately.
#[derive(Debug)]
pub struct StreamBuffer {
    committed: String,
    pending: String,
    last_flush: Instant,
    flush_interval: Duration,
    error_latched: bool,
    diagnostic_tail: String,
    unannounced_flush: bool,
    retired: bool,
}

pub fn annotation_for(ev: &TerminalEvent) -> String {
    match ev {
        TerminalEvent::Completed { elapsed, .. } => {
            format!("[elapsed {:.1}s]", elapsed.as_secs_f64())
        }
        TerminalEvent::Failed { elapsed, .. } => {
            format!("[request aborted after {:.1}s]", elapsed.as_secs_f64())
        }
        TerminalEvent::Cancelled => "[cancelled]".to_string(),
    }
}

pub fn error_fragment(message: &str) -> String {
    format!("[API error: {message}]")
}

impl StreamBuffer {
    pub fn new(flush_interval: Duration) -> Self {
        Self::new_at(flush_interval, Instant::now())
    }

    pub fn new_at(flush_interval: Duration, now: Instant) -> Self {
        Self {
            committed: String::new(),
            pending: String::new(),
            last_flush: now,
            flush_interval,
            error_latched: false,
            diagnostic_tail: String::new(),
            unannounced_flush: false,
            retired: false,
        }
    }

    pub fn committed(&self) -> &str {
        &self.committed
    }

    pub fn pending(&self) -> &str {
        &self.pending
    }

    pub fn is_error_latched(&self) -> bool {
        self.error_latched
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    pub fn diagnostic_tail(&self) -> &str {
        &self.diagnostic_tail
    }

    /// Everything accepted for display so far, flushed or not.
    pub fn visible_text(&self) -> String {
        format!("{}{}", self.committed, self.pending)
    }

    /// Returns true when the fragment was queued for display.
    pub fn on_fragment(&mut self, text: &str) -> bool {
        if self.retired || text.is_empty() {
            return false;
        }
        if self.error_latched {
            self.diagnostic_tail.push_str(text);
            return false;
        }
        self.pending.push_str(text);
        true
    }

    /// Latches the error state and flushes right away. Returns the new
    /// `committed`, or None if the buffer was already latched or retired.
    pub fn on_error_fragment(&mut self, text: &str) -> Option<String> {
        if self.retired || self.error_latched {
            if !self.retired {
                self.diagnostic_tail.push_str(text);
            }
            return None;
        }
        self.error_latched = true;
        self.pending.push_str(text);
        self.flush(Instant::now());
        self.unannounced_flush = true;
        Some(self.committed.clone())
    }

    pub fn tick(&mut self) -> Option<String> {
        self.tick_at(Instant::now())
    }

    /// Flushes when the period has elapsed and there is something to show.
    /// Also reports a forced flush the sink has not seen yet.
    pub fn tick_at(&mut self, now: Instant) -> Option<String> {
        if self.retired {
            return None;
        }
        let due = now.saturating_duration_since(self.last_flush) >= self.flush_interval;
        if !self.pending.is_empty() && due {
            self.flush(now);
            self.unannounced_flush = false;
            return Some(self.committed.clone());
        }
        if self.unannounced_flush {
            self.unannounced_flush = false;
            return Some(self.committed.clone());
        }
        None
    }

    fn flush(&mut self, now: Instant) {
        let p = std::mem::take(&mut self.pending);
        self.committed.push_str(&p);
        self.last_flush = now;
    }

    /// Final reconciliation. Runs at most once; later calls return None.
    pub fn finalize(&mut self, outcome: &TerminalEvent) -> Option<Finalized> {
        if self.retired {
            return None;
        }
        self.flush(Instant::now());
        let annotation = annotation_for(outcome);
        if !self.committed.is_empty() {
            self.committed.push_str("\n\n");
        }
        self.committed.push_str(&annotation);
        self.retired = true;
        self.unannounced_flush = false;
        Some(Finalized {
            text: self.committed.clone(),
            annotation,
            diagnostic_tail: std::mem::take(&mut self.diagnostic_tail),
        })
    }
}
