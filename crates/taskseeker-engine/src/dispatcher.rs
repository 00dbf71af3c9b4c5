use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::{
        mpsc::{self, RecvTimeoutError},
        Arc, Mutex,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use serde_json::json;
use taskseeker_core::{text, CapturedImage};
use taskseeker_observability::{debug_log, metrics, trace};

use crate::{
    config::EngineConfig,
    job::{Job, JobEvent, JobInput, SharedBuffer, SlotName, TerminalEvent},
    ops::{self, QueryClient, SelectionSource, TextRecognizer},
    runner::{JobRunner, JoinOutcome},
    sink::ResultSink,
    stream_buffer::{error_fragment, StreamBuffer},
};

pub const OCR_FAILED_MESSAGE: &str = "Text recognition failed";
pub const SELECTION_FAILED_MESSAGE: &str = "Could not read the selected text";

/// Lifecycle of the query shown in the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPhase {
    Idle,
    Loading,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl QueryPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryPhase::Idle => "idle",
            QueryPhase::Loading => "loading",
            QueryPhase::Streaming => "streaming",
            QueryPhase::Completed => "completed",
            QueryPhase::Failed => "failed",
            QueryPhase::Cancelled => "cancelled",
        }
    }

    fn terminal(ev: &TerminalEvent) -> Self {
        match ev {
            TerminalEvent::Completed { .. } => QueryPhase::Completed,
            TerminalEvent::Failed { .. } => QueryPhase::Failed,
            TerminalEvent::Cancelled => QueryPhase::Cancelled,
        }
    }
}

/// The external services the dispatcher builds jobs from.
#[derive(Clone)]
pub struct Collaborators {
    pub recognizer: Arc<dyn TextRecognizer>,
    pub query: Arc<dyn QueryClient>,
    pub selection: Arc<dyn SelectionSource>,
}

/// Where query text came from; picks the truncation trace step.
#[derive(Debug, Clone, Copy)]
enum QuerySource {
    Selection,
    Trigger,
}

impl QuerySource {
    fn as_str(self) -> &'static str {
        match self {
            QuerySource::Selection => "selection",
            QuerySource::Trigger => "query",
        }
    }

    fn truncate_step(self) -> &'static str {
        match self {
            QuerySource::Selection => "DISPATCH.truncate_selection",
            QuerySource::Trigger => "DISPATCH.truncate_query",
        }
    }
}

struct ActiveQuery {
    job_id: String,
    buffer: SharedBuffer,
    started: Instant,
    first_fragment: Option<Duration>,
    prompt_chars: usize,
    truncated: bool,
    streaming: bool,
}

/// Turns user intents into jobs and routes their output to the sink.
///
/// Not `Send`: it lives on the UI control thread, which must call `pump()`
/// (or `run_until_idle`) regularly. Every sink call happens inside one of
/// the dispatcher's methods.
pub struct Dispatcher {
    data_dir: PathBuf,
    cfg: EngineConfig,
    runner: JobRunner,
    events: mpsc::Receiver<JobEvent>,
    sink: Box<dyn ResultSink>,
    collab: Collaborators,
    current_query: Option<ActiveQuery>,
    current_ocr: Option<String>,
    // OCR results waiting to become query triggers.
    deferred: VecDeque<String>,
    phase: QueryPhase,
    last_terminal: Option<(SlotName, TerminalEvent)>,
    closed: bool,
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

impl Dispatcher {
    pub fn new(
        data_dir: &Path,
        cfg: EngineConfig,
        sink: Box<dyn ResultSink>,
        collab: Collaborators,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        let runner = JobRunner::new(data_dir, &cfg, tx);
        Self {
            data_dir: data_dir.to_path_buf(),
            cfg,
            runner,
            events: rx,
            sink,
            collab,
            current_query: None,
            current_ocr: None,
            deferred: VecDeque::new(),
            phase: QueryPhase::Idle,
            last_terminal: None,
            closed: false,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn query_phase(&self) -> QueryPhase {
        self.phase
    }

    /// The most recent terminal event of any slot.
    pub fn last_terminal(&self) -> Option<&(SlotName, TerminalEvent)> {
        self.last_terminal.as_ref()
    }

    pub fn live_contexts(&self) -> usize {
        self.runner.live_contexts()
    }

    pub fn current_query_job(&self) -> Option<&str> {
        self.current_query.as_ref().map(|q| q.job_id.as_str())
    }

    /// No job in flight and no OCR result waiting to be queried.
    pub fn is_idle(&self) -> bool {
        self.current_query.is_none() && self.current_ocr.is_none() && self.deferred.is_empty()
    }

    pub fn reconfigure(&mut self, cfg: EngineConfig) {
        self.runner.reconfigure(&cfg);
        trace::event(
            &self.data_dir,
            None,
            "Dispatch",
            "DISPATCH.reconfigure",
            "ok",
            Some(json!({
                "flush_ms": cfg.flush_interval.as_millis(),
                "join_timeout_ms": cfg.join_timeout.as_millis(),
                "max_query_chars": cfg.max_query_chars,
                "stream_responses": cfg.stream_responses,
            })),
        );
        self.cfg = cfg;
    }

    fn refuse_if_closed(&self, step_id: &str) -> bool {
        if self.closed {
            trace::event(
                &self.data_dir,
                None,
                "Dispatch",
                step_id,
                "skipped",
                Some(json!({"reason": "shut_down"})),
            );
        }
        self.closed
    }

    /// Starts OCR on a fresh capture. Its text becomes a query trigger once
    /// recognition completes.
    pub fn on_capture_ready(&mut self, image: CapturedImage) {
        if self.refuse_if_closed("DISPATCH.capture_ready") {
            return;
        }
        let job = Job::new(
            ops::ocr_operation(self.collab.recognizer.clone()),
            JobInput::Image(image),
        );
        trace::event(
            &self.data_dir,
            Some(&job.id),
            "Dispatch",
            "DISPATCH.capture_ready",
            "ok",
            None,
        );
        self.current_ocr = Some(job.id.clone());
        self.runner.submit(SlotName::Ocr, job);
    }

    pub fn on_text_selected(&mut self, selected: &str) {
        if self.refuse_if_closed("DISPATCH.text_selected") {
            return;
        }
        let (query, _) = self.limit_query(selected, QuerySource::Selection);
        self.on_query_trigger(&query);
    }

    /// Reads the current selection from the selection source and queries it.
    pub fn on_selection_hotkey(&mut self) {
        if self.refuse_if_closed("DISPATCH.selection_hotkey") {
            return;
        }
        match self.collab.selection.read_selection() {
            Ok(Some(selected)) => self.on_text_selected(&selected),
            Ok(None) => {
                trace::event(
                    &self.data_dir,
                    None,
                    "Dispatch",
                    "DISPATCH.selection_hotkey",
                    "skipped",
                    Some(json!({"reason": "empty_selection"})),
                );
            }
            Err(e) => {
                trace::error_event(
                    &self.data_dir,
                    None,
                    "Dispatch",
                    "DISPATCH.selection_hotkey",
                    "selection",
                    &e.code,
                    &e.message,
                    None,
                );
                self.sink.show_error(SELECTION_FAILED_MESSAGE);
            }
        }
    }

    fn limit_query(&self, raw: &str, source: QuerySource) -> (String, bool) {
        let (kept, truncated) = text::truncate_head(raw, self.cfg.max_query_chars);
        if truncated {
            trace::event(
                &self.data_dir,
                None,
                "Dispatch",
                source.truncate_step(),
                "ok",
                Some(json!({
                    "source": source.as_str(),
                    "original_chars": raw.chars().count(),
                    "kept_chars": self.cfg.max_query_chars,
                })),
            );
        }
        (kept, truncated)
    }

    /// Replaces whatever query is running with one for `query`. Blank input
    /// does nothing at all.
    pub fn on_query_trigger(&mut self, query: &str) {
        if self.refuse_if_closed("DISPATCH.query_trigger") {
            return;
        }
        if text::is_blank(query) {
            trace::event(
                &self.data_dir,
                None,
                "Dispatch",
                "DISPATCH.query_trigger",
                "skipped",
                Some(json!({"reason": "blank"})),
            );
            return;
        }
        let (prompt, truncated) = self.limit_query(query, QuerySource::Trigger);

        // The previous generation must be gone, and its terminal rendered,
        // before the new one shows anything.
        let outcome = self.runner.cancel_and_join(SlotName::Query);
        self.drain_events();

        self.sink.show_loading();
        self.transition(QueryPhase::Loading);

        let buffer: SharedBuffer = Arc::new(Mutex::new(StreamBuffer::new(self.cfg.flush_interval)));
        let streaming = self.cfg.stream_responses;
        let job = Job::new(
            ops::query_operation(self.collab.query.clone(), streaming),
            JobInput::Text(prompt.clone()),
        )
        .with_buffer(buffer.clone());
        let job_id = job.id.clone();
        let prompt_chars = prompt.chars().count();

        trace::event(
            &self.data_dir,
            Some(&job_id),
            "Dispatch",
            "DISPATCH.query_trigger",
            "ok",
            Some(json!({
                "chars": prompt_chars,
                "truncated": truncated,
                "streaming": streaming,
                "previous": outcome.as_str(),
            })),
        );
        if let Some(info) = debug_log::write_payload_best_effort(
            &self.data_dir,
            &job_id,
            "query_prompt.txt",
            prompt.into_bytes(),
        ) {
            debug_log::emit_debug_event_best_effort(
                &self.data_dir,
                "debug_query_prompt",
                &job_id,
                &info,
                None,
            );
        }

        self.current_query = Some(ActiveQuery {
            job_id,
            buffer,
            started: Instant::now(),
            first_fragment: None,
            prompt_chars,
            truncated,
            streaming,
        });
        self.runner.submit(SlotName::Query, job);
    }

    /// Stops OCR and the running query. The query still finalizes, with a
    /// cancelled annotation.
    pub fn on_user_cancel(&mut self) {
        if self.refuse_if_closed("DISPATCH.user_cancel") {
            return;
        }
        let ocr = self.runner.cancel_and_join(SlotName::Ocr);
        let query = self.runner.cancel_and_join(SlotName::Query);
        trace::event(
            &self.data_dir,
            self.current_query_job(),
            "Dispatch",
            "DISPATCH.user_cancel",
            "ok",
            Some(json!({"ocr": ocr.as_str(), "query": query.as_str()})),
        );
        self.drain_events();
        // Recognized text drained just now must not turn into a query either.
        self.deferred.clear();
    }

    /// Stops every job within the bounded join timeout and refuses further
    /// intents. Pending terminals are rendered before it returns.
    pub fn shutdown(&mut self) -> Vec<(SlotName, JoinOutcome)> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;
        self.deferred.clear();
        let outcomes = self.runner.shutdown();
        self.drain_events();
        trace::event(
            &self.data_dir,
            None,
            "Dispatch",
            "DISPATCH.shutdown",
            "ok",
            Some(json!({"live_contexts": self.runner.live_contexts()})),
        );
        outcomes
    }

    /// One UI-thread turn: handle queued events, flush the current buffer if
    /// its period elapsed, and start queries for finished OCR jobs.
    pub fn pump(&mut self) {
        self.drain_events();
        self.flush_current();
        while let Some(recognized) = self.deferred.pop_front() {
            if self.closed {
                break;
            }
            self.on_query_trigger(&recognized);
            self.drain_events();
        }
    }

    /// Pumps until nothing is in flight or `timeout` passes. Returns whether
    /// the dispatcher went idle.
    pub fn run_until_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.pump();
            if self.is_idle() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let wait = (deadline - now).min(self.cfg.flush_interval);
            match self.events.recv_timeout(wait) {
                Ok(ev) => self.handle_event(ev),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return self.is_idle(),
            }
        }
    }

    fn drain_events(&mut self) {
        while let Ok(ev) = self.events.try_recv() {
            self.handle_event(ev);
        }
    }

    fn flush_current(&mut self) {
        let Some(q) = self.current_query.as_ref() else {
            return;
        };
        let update = q.buffer.lock().unwrap_or_else(|e| e.into_inner()).tick();
        if let Some(committed) = update {
            self.sink.append_partial(&committed);
        }
    }

    fn transition(&mut self, to: QueryPhase) {
        if self.phase == to {
            return;
        }
        trace::event(
            &self.data_dir,
            self.current_query_job(),
            "Dispatch",
            "DISPATCH.phase",
            "ok",
            Some(json!({"from": self.phase.as_str(), "to": to.as_str()})),
        );
        self.phase = to;
    }

    fn is_current_query(&self, job_id: &str) -> bool {
        self.current_query
            .as_ref()
            .map(|q| q.job_id == job_id)
            .unwrap_or(false)
    }

    fn handle_event(&mut self, ev: JobEvent) {
        match ev {
            JobEvent::FirstFragment { job_id } => {
                if !self.is_current_query(&job_id) {
                    return;
                }
                if let Some(q) = self.current_query.as_mut() {
                    q.first_fragment = Some(q.started.elapsed());
                }
                if self.phase == QueryPhase::Loading {
                    self.transition(QueryPhase::Streaming);
                }
            }
            JobEvent::ErrorLatched { job_id } => {
                if self.is_current_query(&job_id) {
                    self.flush_current();
                }
            }
            JobEvent::Terminal {
                job_id,
                slot,
                event,
            } => {
                match slot {
                    SlotName::Query => self.on_query_terminal(&job_id, &event),
                    SlotName::Ocr => self.on_ocr_terminal(&job_id, &event),
                }
                metrics::append_jsonl_best_effort(
                    &self.data_dir,
                    "job_event",
                    &json!({
                        "type": "job_event",
                        "ts_ms": now_ms(),
                        "job_id": job_id,
                        "slot": slot.as_str(),
                        "status": event.status(),
                        "elapsed_ms": event.elapsed().map(|d| d.as_millis()),
                        "error_code": event.error_code(),
                    }),
                );
                self.sink.terminal(&job_id, slot, &event);
                self.last_terminal = Some((slot, event));
            }
        }
    }

    fn on_query_terminal(&mut self, job_id: &str, event: &TerminalEvent) {
        if !self.is_current_query(job_id) {
            trace::event(
                &self.data_dir,
                Some(job_id),
                "Dispatch",
                "DISPATCH.stale_terminal",
                "skipped",
                Some(json!({"slot": "query", "status": event.status()})),
            );
            return;
        }
        let Some(q) = self.current_query.take() else {
            return;
        };

        let finalized = {
            let mut buf = q.buffer.lock().unwrap_or_else(|e| e.into_inner());
            // Panics and internal failures never went through the error latch.
            if let TerminalEvent::Failed { error, .. } = event {
                if !buf.is_error_latched() {
                    buf.on_error_fragment(&error_fragment(&error.message));
                }
            }
            buf.finalize(event)
        };

        let mut answer_chars = 0;
        if let Some(fin) = finalized {
            answer_chars = fin.text.chars().count();
            if !fin.diagnostic_tail.is_empty() {
                trace::event(
                    &self.data_dir,
                    Some(job_id),
                    "Dispatch",
                    "DISPATCH.diagnostic_tail",
                    "ok",
                    Some(json!({
                        "chars": fin.diagnostic_tail.chars().count(),
                        "tail": fin.diagnostic_tail,
                    })),
                );
            }
            self.sink.show_final(&fin.text, &fin.annotation);
            if let Some(info) = debug_log::write_payload_best_effort(
                &self.data_dir,
                job_id,
                "query_answer.txt",
                fin.text.into_bytes(),
            ) {
                debug_log::emit_debug_event_best_effort(
                    &self.data_dir,
                    "debug_query_answer",
                    job_id,
                    &info,
                    Some(event.status().to_string()),
                );
            }
        }

        metrics::append_jsonl_best_effort(
            &self.data_dir,
            "job_perf",
            &json!({
                "type": "job_perf",
                "ts_ms": now_ms(),
                "job_id": job_id,
                "status": event.status(),
                "streaming": q.streaming,
                "prompt_chars": q.prompt_chars,
                "prompt_truncated": q.truncated,
                "answer_chars": answer_chars,
                "first_fragment_ms": q.first_fragment.map(|d| d.as_millis()),
                "total_ms": q.started.elapsed().as_millis(),
            }),
        );

        self.transition(QueryPhase::terminal(event));
        self.transition(QueryPhase::Idle);
    }

    fn on_ocr_terminal(&mut self, job_id: &str, event: &TerminalEvent) {
        if self.current_ocr.as_deref() != Some(job_id) {
            return;
        }
        self.current_ocr = None;
        match event {
            TerminalEvent::Completed { text: recognized, .. } => {
                if text::is_blank(recognized) {
                    trace::event(
                        &self.data_dir,
                        Some(job_id),
                        "Dispatch",
                        "DISPATCH.ocr_result",
                        "skipped",
                        Some(json!({"reason": "no_text"})),
                    );
                } else {
                    self.deferred.push_back(recognized.clone());
                }
            }
            TerminalEvent::Failed { error, .. } => {
                trace::error_event(
                    &self.data_dir,
                    Some(job_id),
                    "Dispatch",
                    "DISPATCH.ocr_result",
                    "ocr",
                    &error.code,
                    &error.message,
                    None,
                );
                self.sink.show_error(OCR_FAILED_MESSAGE);
            }
            TerminalEvent::Cancelled => {}
        }
    }
}
