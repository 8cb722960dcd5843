use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::Utc;
use fwjob_data::{JobAction, JobRecord, JobState};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};
use tracing::warn;

use crate::buffer::{LogBuffer, Replay};

pub const CANCELED_SUMMARY: &str = "Canceled";
/// events a listener may fall behind by before it is dropped
pub const LISTENER_BACKLOG: usize = 1024;

/// message delivered to a listener
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobEvent {
    Log { seq: u64, line: String },
    /// always the last event a listener receives
    Done(JobRecord),
}

/// who produced a published line
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineOrigin {
    /// captured from the toolchain process
    Output,
    /// written by the engine itself, e.g. the command announcement
    Engine,
}

pub enum CancelOutcome {
    /// job was already finished, nothing changed
    Unchanged(JobRecord),
    /// job was still queued and is now canceled
    Canceled(JobRecord),
    /// job is running, its process (if any) has to be asked to stop
    Requested { record: JobRecord, pid: Option<u32> },
}

/// returned by an atomic check-or-subscribe
pub enum Watch {
    Ready(Replay, JobRecord),
    Pending(Subscription),
}

struct JobInner {
    record: JobRecord,
    cancel_requested: bool,
    pid: Option<u32>,
    last_line: String,
    buffer: LogBuffer,
    listeners: HashMap<u64, Sender<JobEvent>>,
    next_listener_id: u64,
    done_sent: bool,
}

impl JobInner {
    fn register(&mut self) -> (u64, Receiver<JobEvent>) {
        let (tx, rx) = mpsc::channel(LISTENER_BACKLOG);
        let id = self.next_listener_id;
        self.next_listener_id += 1;
        self.listeners.insert(id, tx);
        (id, rx)
    }
}

/// One job: its lifecycle record, in-memory log history and live listeners.
/// All mutable state sits behind a single lock.
pub struct Job {
    id: String,
    action: JobAction,
    log_path: PathBuf,
    inner: Mutex<JobInner>,
}

impl Job {
    pub fn new(record: JobRecord, log_path: PathBuf, log_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            id: record.id.clone(),
            action: record.action,
            log_path,
            inner: Mutex::new(JobInner {
                record,
                cancel_requested: false,
                pid: None,
                last_line: String::new(),
                buffer: LogBuffer::new(log_capacity),
                listeners: HashMap::new(),
                next_listener_id: 0,
                done_sent: false,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn action(&self) -> JobAction {
        self.action
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn record(&self) -> JobRecord {
        self.inner.lock().record.clone()
    }

    pub fn state(&self) -> JobState {
        self.inner.lock().record.state
    }

    pub fn cancel_requested(&self) -> bool {
        self.inner.lock().cancel_requested
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.lock().pid
    }

    pub fn set_pid(&self, pid: Option<u32>) {
        self.inner.lock().pid = pid;
    }

    pub fn set_error_summary(&self, summary: &str) {
        self.inner.lock().record.error_summary = summary.to_string();
    }

    pub fn last_line(&self) -> String {
        self.inner.lock().last_line.clone()
    }

    pub fn last_seq(&self) -> u64 {
        self.inner.lock().buffer.last_seq()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    /// number, buffer and fan out a line in one critical section
    /// callers append the line to the log file first
    pub fn publish(&self, line: &str, origin: LineOrigin) -> u64 {
        let mut inner = self.inner.lock();
        if origin == LineOrigin::Output && !line.is_empty() {
            inner.last_line = line.to_string();
        }
        let seq = inner.buffer.push(line.to_string());
        // a listener that stopped reading is cut off, it can resume from the history
        inner.listeners.retain(|_, listener| {
            match listener.try_send(JobEvent::Log {
                seq,
                line: line.to_string(),
            }) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!("dropping a listener that fell {} events behind", LISTENER_BACKLOG);
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
        seq
    }

    /// queued -> running, None if the job must not run
    pub fn begin(&self) -> Option<JobRecord> {
        let mut inner = self.inner.lock();
        if inner.record.state != JobState::Queued || inner.cancel_requested {
            return None;
        }
        inner.record.state = JobState::Running;
        inner.record.started_at = Some(Utc::now());
        Some(inner.record.clone())
    }

    /// running -> terminal, from the pipeline's exit code
    pub fn finish(&self, exit_code: i32) -> JobRecord {
        let mut inner = self.inner.lock();
        if inner.record.state.is_terminal() {
            return inner.record.clone();
        }
        if inner.cancel_requested {
            inner.record.state = JobState::Canceled;
            inner.record.exit_code = Some(-1);
            inner.record.error_summary = CANCELED_SUMMARY.to_string();
        } else if exit_code == 0 {
            inner.record.state = JobState::Success;
            inner.record.exit_code = Some(0);
            inner.record.error_summary.clear();
        } else {
            inner.record.state = JobState::Failed;
            inner.record.exit_code = Some(exit_code);
            if inner.record.error_summary.is_empty() {
                inner.record.error_summary = inner.last_line.clone();
            }
        }
        inner.record.ended_at = Some(Utc::now());
        inner.record.clone()
    }

    /// mark a job that was running when the previous server process stopped
    pub fn interrupt(&self, summary: &str) -> Option<JobRecord> {
        let mut inner = self.inner.lock();
        if inner.record.state != JobState::Running {
            return None;
        }
        inner.record.state = JobState::Failed;
        inner.record.ended_at = Some(Utc::now());
        inner.record.exit_code = Some(1);
        inner.record.error_summary = summary.to_string();
        Some(inner.record.clone())
    }

    pub fn request_cancel(&self) -> CancelOutcome {
        let mut inner = self.inner.lock();
        if inner.record.state.is_terminal() {
            return CancelOutcome::Unchanged(inner.record.clone());
        }
        inner.cancel_requested = true;
        if inner.record.state == JobState::Queued {
            inner.record.state = JobState::Canceled;
            inner.record.ended_at = Some(Utc::now());
            inner.record.exit_code = Some(-1);
            inner.record.error_summary = CANCELED_SUMMARY.to_string();
            CancelOutcome::Canceled(inner.record.clone())
        } else {
            CancelOutcome::Requested {
                record: inner.record.clone(),
                pid: inner.pid,
            }
        }
    }

    /// send the terminal record to every listener, at most once per job
    pub fn notify_done(&self) {
        let mut inner = self.inner.lock();
        if inner.done_sent || !inner.record.state.is_terminal() {
            return;
        }
        inner.done_sent = true;
        let record = inner.record.clone();
        for (_, listener) in inner.listeners.drain() {
            let _ = listener.try_send(JobEvent::Done(record.clone()));
        }
    }

    pub fn replay(&self, since: u64, limit: usize) -> (Replay, JobRecord) {
        let inner = self.inner.lock();
        (inner.buffer.since(since, limit), inner.record.clone())
    }

    /// Lines after `since` if there are any, otherwise a subscription that
    /// wakes on the next line or on completion. Checking and registering
    /// under one lock means no line can slip in between.
    pub fn replay_or_subscribe(self: &Arc<Self>, since: u64, limit: usize) -> Watch {
        let mut inner = self.inner.lock();
        let replay = inner.buffer.since(since, limit);
        let waiting = matches!(replay, Replay::UpToDate | Replay::Empty);
        if !waiting || inner.record.state.is_terminal() {
            return Watch::Ready(replay, inner.record.clone());
        }
        let (id, rx) = inner.register();
        Watch::Pending(Subscription {
            job: Arc::clone(self),
            id,
            rx,
        })
    }

    /// Snapshot of the recent history and, unless the job is finished, a
    /// subscription that continues exactly after that snapshot.
    pub fn attach(self: &Arc<Self>) -> (Vec<String>, JobRecord, Option<Subscription>) {
        let mut inner = self.inner.lock();
        let history = inner.buffer.recent();
        let record = inner.record.clone();
        if record.state.is_terminal() {
            return (history, record, None);
        }
        let (id, rx) = inner.register();
        let subscription = Subscription {
            job: Arc::clone(self),
            id,
            rx,
        };
        (history, record, Some(subscription))
    }
}

/// A registered listener. Dropping it unregisters from the job.
pub struct Subscription {
    job: Arc<Job>,
    id: u64,
    rx: Receiver<JobEvent>,
}

impl Subscription {
    /// next event, None once the terminal event has been consumed
    pub async fn recv(&mut self) -> Option<JobEvent> {
        self.rx.recv().await
    }

    pub fn job(&self) -> &Arc<Job> {
        &self.job
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.job.inner.lock().listeners.remove(&self.id);
    }
}
