use std::sync::{Arc, Mutex};

use crate::job::{SlotName, TerminalEvent};

/// The consumer of job output, typically the overlay window. Every call is
/// made from the thread that drives the dispatcher.
pub trait ResultSink {
    /// Placeholder while a query is being sent.
    fn show_loading(&mut self);
    /// Full committed text so far. The first call replaces the placeholder.
    fn append_partial(&mut self, committed: &str);
    fn show_final(&mut self, text: &str, annotation: &str);
    fn show_error(&mut self, message: &str);
    /// Observer hook, called once per job after its terminal event was handled.
    fn terminal(&mut self, _job_id: &str, _slot: SlotName, _event: &TerminalEvent) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkCall {
    Loading,
    Partial(String),
    Final { text: String, annotation: String },
    Error(String),
    Terminal {
        job_id: String,
        slot: SlotName,
        event: TerminalEvent,
    },
}

/// Records every call; clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    calls: Arc<Mutex<Vec<SinkCall>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Terminal events seen for `job_id`, in delivery order.
    pub fn terminals_for(&self, job_id: &str) -> Vec<TerminalEvent> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SinkCall::Terminal { job_id: id, event, .. } if id == job_id => Some(event),
                _ => None,
            })
            .collect()
    }

    fn push(&self, c: SinkCall) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(c);
    }
}

impl ResultSink for RecordingSink {
    fn show_loading(&mut self) {
        self.push(SinkCall::Loading);
    }

    fn append_partial(&mut self, committed: &str) {
        self.push(SinkCall::Partial(committed.to_string()));
    }

    fn show_final(&mut self, text: &str, annotation: &str) {
        self.push(SinkCall::Final {
            text: text.to_string(),
            annotation: annotation.to_string(),
        });
    }

    fn show_error(&mut self, message: &str) {
        self.push(SinkCall::Error(message.to_string()));
    }

    fn terminal(&mut self, job_id: &str, slot: SlotName, event: &TerminalEvent) {
        self.push(SinkCall::Terminal {
            job_id: job_id.to_string(),
            slot,
            event: event.clone(),
        });
    }
}
