use std::{
    any::Any,
    collections::HashMap,
    panic::AssertUnwindSafe,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc, Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use futures_util::{FutureExt, StreamExt};
use serde_json::json;
use taskseeker_observability::{
    safe_eprintln,
    trace::{self, Span},
};
use taskseeker_platform::process;
use tokio_util::sync::CancellationToken;

use crate::{
    config::EngineConfig,
    job::{
        Job, JobContext, JobError, JobEvent, JobInput, JobLease, Operation, SharedBuffer, SlotName,
        TerminalEvent,
    },
    stream_buffer::error_fragment,
};

/// How a slot was vacated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Nothing was running.
    Idle,
    /// The context stopped within the join timeout.
    Joined,
    /// The kill token (and pid kill) stopped it within the grace period.
    Forced,
    /// It never stopped. Its terminal was synthesized and the thread detached.
    Fenced,
}

impl JoinOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            JoinOutcome::Idle => "idle",
            JoinOutcome::Joined => "joined",
            JoinOutcome::Forced => "forced",
            JoinOutcome::Fenced => "fenced",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Timeouts {
    join: Duration,
    grace: Duration,
}

struct ActiveJob {
    job_id: String,
    cancel: CancellationToken,
    kill: CancellationToken,
    pid: process::PidSlot,
    claimed: Arc<AtomicBool>,
    done_rx: mpsc::Receiver<()>,
    thread: Option<thread::JoinHandle<()>>,
}

/// Runs at most one job per slot, each on its own OS thread with a
/// current-thread tokio runtime. Results flow back over `JobEvent`s.
pub struct JobRunner {
    slots: Mutex<HashMap<SlotName, ActiveJob>>,
    submit_lock: Mutex<()>,
    events: mpsc::Sender<JobEvent>,
    timeouts: Mutex<Timeouts>,
    live: Arc<AtomicUsize>,
    closed: AtomicBool,
    data_dir: PathBuf,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "panic with non-string payload".to_string()
}

fn wait_done(rx: &mpsc::Receiver<()>, timeout: Duration) -> bool {
    match rx.recv_timeout(timeout) {
        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => true,
        Err(mpsc::RecvTimeoutError::Timeout) => false,
    }
}

fn claim_and_send(
    claimed: &AtomicBool,
    events: &mpsc::Sender<JobEvent>,
    job_id: &str,
    slot: SlotName,
    event: TerminalEvent,
) -> bool {
    if claimed.swap(true, Ordering::SeqCst) {
        return false;
    }
    // The receiver may already be gone during teardown.
    let _ = events.send(JobEvent::Terminal {
        job_id: job_id.to_string(),
        slot,
        event,
    });
    true
}

impl JobRunner {
    pub fn new(data_dir: &Path, cfg: &EngineConfig, events: mpsc::Sender<JobEvent>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            submit_lock: Mutex::new(()),
            events,
            timeouts: Mutex::new(Timeouts {
                join: cfg.join_timeout,
                grace: cfg.forced_grace,
            }),
            live: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
            data_dir: data_dir.to_path_buf(),
        }
    }

    pub fn reconfigure(&self, cfg: &EngineConfig) {
        let mut t = self.timeouts.lock().unwrap_or_else(|e| e.into_inner());
        t.join = cfg.join_timeout;
        t.grace = cfg.forced_grace;
    }

    /// Jobs still holding their lease: worker threads that have not exited and
    /// blocking work they left behind. Fenced jobs count until they return.
    pub fn live_contexts(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Id of the job still running in `slot`.
    pub fn active_job(&self, slot: SlotName) -> Option<String> {
        let g = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        g.get(&slot)
            .filter(|a| a.thread.as_ref().map(|t| !t.is_finished()).unwrap_or(false))
            .map(|a| a.job_id.clone())
    }

    /// Vacates `slot` (see `cancel_and_join`) and starts `job` there. Never
    /// blocks on the new job; its terminal event arrives over the channel.
    pub fn submit(&self, slot: SlotName, job: Job) {
        let _g = self.submit_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.cancel_and_join(slot);

        let Job {
            id: job_id,
            operation,
            input,
            buffer,
        } = job;
        let claimed = Arc::new(AtomicBool::new(false));

        if self.closed.load(Ordering::SeqCst) {
            trace::event(
                &self.data_dir,
                Some(&job_id),
                "Runner",
                "RUNNER.submit",
                "skipped",
                Some(json!({"slot": slot.as_str(), "reason": "shut_down"})),
            );
            claim_and_send(&claimed, &self.events, &job_id, slot, TerminalEvent::Cancelled);
            return;
        }

        let span = Span::start(
            &self.data_dir,
            Some(&job_id),
            "Runner",
            "RUNNER.submit",
            Some(json!({
                "slot": slot.as_str(),
                "op": operation.kind(),
                "input": input.kind(),
                "buffered": buffer.is_some(),
            })),
        );

        let cancel = CancellationToken::new();
        let kill = CancellationToken::new();
        let pid = process::new_pid_slot();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let worker = Worker {
            ctx: JobContext {
                job_id: job_id.clone(),
                slot,
                token: cancel.clone(),
                pid: pid.clone(),
                data_dir: self.data_dir.clone(),
                lease: JobLease::new(self.live.clone(), done_tx),
            },
            operation,
            buffer,
            kill: kill.clone(),
            claimed: claimed.clone(),
            events: self.events.clone(),
        };

        let spawned = thread::Builder::new()
            .name(format!("taskseeker-{slot}"))
            .spawn(move || worker.run(input));

        match spawned {
            Ok(handle) => {
                let mut g = self.slots.lock().unwrap_or_else(|e| e.into_inner());
                g.insert(
                    slot,
                    ActiveJob {
                        job_id,
                        cancel,
                        kill,
                        pid,
                        claimed,
                        done_rx,
                        thread: Some(handle),
                    },
                );
                span.ok(None);
            }
            Err(e) => {
                // The unspawned closure, and with it the lease, is already dropped.
                safe_eprintln!("runner: failed to spawn worker for job {job_id}: {e}");
                let msg = format!("thread_spawn_failed:{e}");
                span.err("runner", "E_INTERNAL", &msg, None);
                claim_and_send(
                    &claimed,
                    &self.events,
                    &job_id,
                    slot,
                    TerminalEvent::Failed {
                        error: JobError::new("E_INTERNAL", msg),
                        elapsed: Duration::ZERO,
                    },
                );
            }
        }
    }

    /// Signals the job in `slot` and waits for it to stop, escalating to the
    /// kill token after the join timeout. Always vacates the slot; no-op when idle.
    pub fn cancel_and_join(&self, slot: SlotName) -> JoinOutcome {
        let active = {
            let mut g = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            g.remove(&slot)
        };
        let Some(active) = active else {
            return JoinOutcome::Idle;
        };
        active.cancel.cancel();
        let join = self.timeouts().join;
        self.finish_join(slot, active, Instant::now() + join)
    }

    /// Cancels every slot concurrently, then joins them against one deadline.
    /// Later submissions are refused.
    pub fn shutdown(&self) -> Vec<(SlotName, JoinOutcome)> {
        let _g = self.submit_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.closed.store(true, Ordering::SeqCst);
        let actives: Vec<(SlotName, ActiveJob)> = {
            let mut g = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            SlotName::ALL
                .iter()
                .filter_map(|s| g.remove(s).map(|a| (*s, a)))
                .collect()
        };
        for (_, a) in &actives {
            a.cancel.cancel();
        }
        let deadline = Instant::now() + self.timeouts().join;
        let mut out: Vec<(SlotName, JoinOutcome)> = actives
            .into_iter()
            .map(|(slot, a)| (slot, self.finish_join(slot, a, deadline)))
            .collect();
        for s in SlotName::ALL {
            if !out.iter().any(|(x, _)| *x == s) {
                out.push((s, JoinOutcome::Idle));
            }
        }
        trace::event(
            &self.data_dir,
            None,
            "Runner",
            "RUNNER.shutdown",
            "ok",
            Some(json!({
                "outcomes": out.iter().map(|(s, o)| json!({"slot": s.as_str(), "outcome": o.as_str()})).collect::<Vec<_>>(),
                "live_contexts": self.live_contexts(),
            })),
        );
        out
    }

    fn timeouts(&self) -> Timeouts {
        *self.timeouts.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn finish_join(&self, slot: SlotName, mut active: ActiveJob, deadline: Instant) -> JoinOutcome {
        let span = Span::start(
            &self.data_dir,
            Some(&active.job_id),
            "Runner",
            "RUNNER.cancel_and_join",
            Some(json!({"slot": slot.as_str()})),
        );
        let grace = self.timeouts().grace;
        let wait = deadline.saturating_duration_since(Instant::now());

        let outcome = if wait_done(&active.done_rx, wait) {
            JoinOutcome::Joined
        } else {
            safe_eprintln!(
                "runner: job {} in slot {slot} did not stop in time; forcing termination",
                active.job_id
            );
            active.kill.cancel();
            let killed_pid = process::take_pid(&active.pid);
            if let Some(pid) = killed_pid {
                if let Err(e) = process::kill_pid(pid) {
                    safe_eprintln!("runner: kill pid {pid} failed: {e:#}");
                }
            }
            trace::error_event(
                &self.data_dir,
                Some(&active.job_id),
                "Runner",
                "RUNNER.forced_termination",
                "runner",
                "E_JOIN_TIMEOUT",
                "job ignored cancellation within the join timeout",
                Some(json!({"slot": slot.as_str(), "pid": killed_pid})),
            );
            if wait_done(&active.done_rx, grace) {
                JoinOutcome::Forced
            } else {
                claim_and_send(
                    &active.claimed,
                    &self.events,
                    &active.job_id,
                    slot,
                    TerminalEvent::Cancelled,
                );
                safe_eprintln!(
                    "runner: job {} in slot {slot} is wedged; fencing and detaching its thread",
                    active.job_id
                );
                trace::error_event(
                    &self.data_dir,
                    Some(&active.job_id),
                    "Runner",
                    "RUNNER.forced_termination",
                    "runner",
                    "E_FENCED",
                    "job still running after forced termination; detached",
                    Some(json!({"slot": slot.as_str()})),
                );
                JoinOutcome::Fenced
            }
        };

        let handle = active.thread.take();
        if outcome != JoinOutcome::Fenced {
            if let Some(h) = handle {
                let _ = h.join();
            }
        }
        span.ok(Some(json!({"outcome": outcome.as_str()})));
        outcome
    }
}

impl Drop for JobRunner {
    fn drop(&mut self) {
        // Best effort: never block in drop, but don't leave workers running unsignalled.
        let g = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        for a in g.values() {
            a.cancel.cancel();
            a.kill.cancel();
        }
    }
}

enum Outcome {
    Completed(String),
    Failed(JobError),
    Cancelled,
}

struct Worker {
    ctx: JobContext,
    operation: Operation,
    buffer: Option<SharedBuffer>,
    kill: CancellationToken,
    claimed: Arc<AtomicBool>,
    events: mpsc::Sender<JobEvent>,
}

impl Worker {
    fn run(self, input: JobInput) {
        let started = Instant::now();
        let span = Span::start(
            &self.ctx.data_dir,
            Some(&self.ctx.job_id),
            "Runner",
            "RUNNER.execute",
            Some(json!({"slot": self.ctx.slot.as_str(), "op": self.operation.kind()})),
        );

        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                safe_eprintln!(
                    "failed to create tokio runtime for job {}: {e}",
                    self.ctx.job_id
                );
                let msg = format!("tokio_runtime_create_failed:{e}");
                span.err("runner", "E_INTERNAL", &msg, None);
                self.finish(TerminalEvent::Failed {
                    error: JobError::new("E_INTERNAL", msg),
                    elapsed: started.elapsed(),
                });
                return;
            }
        };

        let outcome = rt.block_on(async {
            tokio::select! {
                biased;
                _ = self.kill.cancelled() => Outcome::Cancelled,
                r = AssertUnwindSafe(self.execute(input)).catch_unwind() => match r {
                    Ok(o) => o,
                    Err(payload) => Outcome::Failed(JobError::new("E_PANIC", panic_message(payload))),
                },
            }
        });
        // Blocking tasks that ignored the token still hold the lease, so the
        // job keeps counting as live until they return.
        rt.shutdown_background();

        let elapsed = started.elapsed();
        let event = match outcome {
            Outcome::Completed(text) => {
                span.ok(Some(json!({"chars": text.chars().count()})));
                TerminalEvent::Completed { text, elapsed }
            }
            Outcome::Failed(error) => {
                span.err("runner", &error.code, &error.message, None);
                TerminalEvent::Failed { error, elapsed }
            }
            Outcome::Cancelled => {
                span.skipped("cancelled", None);
                TerminalEvent::Cancelled
            }
        };
        self.finish(event);
    }

    fn finish(&self, event: TerminalEvent) {
        let sent = claim_and_send(
            &self.claimed,
            &self.events,
            &self.ctx.job_id,
            self.ctx.slot,
            event,
        );
        if !sent {
            trace::event(
                &self.ctx.data_dir,
                Some(&self.ctx.job_id),
                "Runner",
                "RUNNER.late_terminal",
                "skipped",
                Some(json!({"slot": self.ctx.slot.as_str()})),
            );
        }
    }

    fn send(&self, ev: JobEvent) {
        let _ = self.events.send(ev);
    }

    /// Announces the first non-empty fragment that reaches the buffer.
    fn accept_fragment(&self, frag: &str, first_sent: &mut bool) {
        let Some(buf) = &self.buffer else {
            return;
        };
        let accepted = buf
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .on_fragment(frag);
        if accepted && !*first_sent {
            *first_sent = true;
            self.send(JobEvent::FirstFragment {
                job_id: self.ctx.job_id.clone(),
            });
        }
    }

    fn fail(&self, e: JobError) -> Outcome {
        if e.is_cancelled() || self.ctx.token.is_cancelled() {
            return Outcome::Cancelled;
        }
        if let Some(buf) = &self.buffer {
            let latched = buf
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .on_error_fragment(&error_fragment(&e.message));
            if latched.is_some() {
                self.send(JobEvent::ErrorLatched {
                    job_id: self.ctx.job_id.clone(),
                });
            }
        }
        Outcome::Failed(e)
    }

    async fn execute(&self, input: JobInput) -> Outcome {
        let token = self.ctx.token.clone();
        let mut first_sent = false;
        match &self.operation {
            Operation::SingleShot(f) => {
                // Not raced against the token: the operation observes it, and
                // only the kill token may drop a future that owns blocking work.
                match f(input, self.ctx.clone()).await {
                    Ok(_) if token.is_cancelled() => Outcome::Cancelled,
                    Ok(text) => {
                        self.accept_fragment(&text, &mut first_sent);
                        Outcome::Completed(text)
                    }
                    Err(e) => self.fail(e),
                }
            }
            Operation::Streaming(f) => {
                let mut stream = f(input, self.ctx.clone());
                let mut text = String::new();
                loop {
                    let item = tokio::select! {
                        _ = token.cancelled() => return Outcome::Cancelled,
                        item = stream.next() => item,
                    };
                    match item {
                        None => break,
                        Some(Ok(_)) if token.is_cancelled() => return Outcome::Cancelled,
                        Some(Ok(frag)) => {
                            self.accept_fragment(&frag, &mut first_sent);
                            text.push_str(&frag);
                        }
                        Some(Err(e)) => return self.fail(e),
                    }
                }
                if token.is_cancelled() {
                    Outcome::Cancelled
                } else {
                    Outcome::Completed(text)
                }
            }
        }
    }
}
