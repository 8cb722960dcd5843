//! Read side of a job: offset based tail, long-poll tail and push attach.
//!
//! Every reader works from the job's in-memory history first and falls back
//! to the persisted log file when the history cannot answer (offset evicted,
//! or a job restored from disk with nothing buffered).

use std::{sync::Arc, time::Duration};

use fwjob_data::JobRecord;
use tokio::time::timeout;
use tracing::debug;

use crate::{
    buffer::Replay,
    job::{Job, JobEvent, Subscription, Watch},
    util::read_log_tail,
};

pub const TAIL_DEFAULT_LIMIT: usize = 2000;
pub const TAIL_MAX_LIMIT: usize = 5000;
pub const WAIT_DEFAULT_LIMIT: usize = 200;
pub const WAIT_MAX_LIMIT: usize = 1000;
pub const WAIT_DEFAULT_TIMEOUT: f64 = 10.0;
pub const WAIT_MIN_TIMEOUT: f64 = 1.0;
pub const WAIT_MAX_TIMEOUT: f64 = 20.0;

pub fn tail_limit(limit: Option<i64>) -> usize {
    clamp_limit(limit, TAIL_DEFAULT_LIMIT, TAIL_MAX_LIMIT)
}

pub fn wait_limit(limit: Option<i64>) -> usize {
    clamp_limit(limit, WAIT_DEFAULT_LIMIT, WAIT_MAX_LIMIT)
}

fn clamp_limit(limit: Option<i64>, default: usize, max: usize) -> usize {
    match limit {
        Some(limit) => limit.clamp(1, max as i64) as usize,
        None => default,
    }
}

/// negative offsets read from the start
pub fn clamp_since(since: Option<i64>) -> u64 {
    since.unwrap_or(0).max(0) as u64
}

pub fn wait_timeout(seconds: Option<f64>) -> Duration {
    let seconds = seconds
        .filter(|seconds| seconds.is_finite())
        .unwrap_or(WAIT_DEFAULT_TIMEOUT)
        .clamp(WAIT_MIN_TIMEOUT, WAIT_MAX_TIMEOUT);
    Duration::from_secs_f64(seconds)
}

/// answer of a tail request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TailResult {
    pub record: JobRecord,
    pub lines: Vec<String>,
    /// offset to pass as `since` on the next request
    pub next_seq: u64,
}

/// lines after `since`, at most `limit`
pub async fn tail(job: &Arc<Job>, since: u64, limit: usize) -> TailResult {
    let (replay, record) = job.replay(since, limit);
    resolve(job, replay, record, since, limit).await
}

/// Like [`tail`], but when nothing newer than `since` exists yet, wait up to
/// `wait` for the next line or for the job to finish.
pub async fn tail_wait(job: &Arc<Job>, since: u64, limit: usize, wait: Duration) -> TailResult {
    let mut subscription = match job.replay_or_subscribe(since, limit) {
        Watch::Ready(replay, record) => return resolve(job, replay, record, since, limit).await,
        Watch::Pending(subscription) => subscription,
    };
    let finished = match timeout(wait, subscription.recv()).await {
        Ok(Some(JobEvent::Done(record))) => Some(record),
        Ok(Some(JobEvent::Log { .. })) | Ok(None) => None,
        Err(_) => {
            debug!(job_id = %job.id(), "long poll timed out");
            None
        }
    };
    drop(subscription);

    let (replay, record) = job.replay(since, limit);
    resolve(job, replay, finished.unwrap_or(record), since, limit).await
}

async fn resolve(
    job: &Arc<Job>,
    replay: Replay,
    record: JobRecord,
    since: u64,
    limit: usize,
) -> TailResult {
    match replay {
        Replay::Lines(entries) => {
            let next_seq = entries.last().map_or(since, |(seq, _)| *seq);
            let lines = entries.into_iter().map(|(_, line)| line).collect();
            TailResult {
                record,
                lines,
                next_seq,
            }
        }
        Replay::Evicted { last_seq } => TailResult {
            record,
            lines: read_log_tail(job.log_path(), limit).await,
            next_seq: last_seq,
        },
        // restored from disk, the file is all there is
        Replay::Empty if record.state.is_terminal() => TailResult {
            record,
            lines: read_log_tail(job.log_path(), limit).await,
            next_seq: since,
        },
        Replay::Empty | Replay::UpToDate => TailResult {
            record,
            lines: Vec::new(),
            next_seq: since,
        },
    }
}

/// what a push observer starts from
pub struct Attachment {
    /// already captured lines, oldest first
    pub history: Vec<String>,
    pub record: JobRecord,
    /// continues right after `history`, None if the job already finished
    pub subscription: Option<Subscription>,
}

pub async fn attach(job: &Arc<Job>) -> Attachment {
    let (mut history, record, subscription) = job.attach();
    if history.is_empty() && subscription.is_none() {
        history = read_log_tail(job.log_path(), TAIL_DEFAULT_LIMIT).await;
    }
    Attachment {
        history,
        record,
        subscription,
    }
}
