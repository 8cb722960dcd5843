use std::{collections::HashMap, sync::Arc};

use fwjob_data::{JobRecord, JobRequest, JobState};
use tokio::{
    fs,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        Mutex,
    },
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    config::EngineConfig,
    error::{EngineError, EngineResult},
    job::{CancelOutcome, Job},
    pipeline::Pipeline,
    store::JobStore,
    validate::validate_request,
};

pub const INTERRUPTED_SUMMARY: &str = "Interrupted by server restart";

/// Owns every job, the FIFO queue and the single worker executing jobs one
/// at a time.
///
/// Construct with [`JobManager::open`], which restores persisted jobs, then
/// call [`JobManager::start`] from inside a tokio runtime.
pub struct JobManager {
    config: Arc<EngineConfig>,
    store: JobStore,
    jobs: Arc<Mutex<HashMap<String, Arc<Job>>>>,
    queue_tx: UnboundedSender<Arc<Job>>,
    queue_rx: parking_lot::Mutex<Option<UnboundedReceiver<Arc<Job>>>>,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl JobManager {
    /// Load the job directory. Jobs that were running when the previous
    /// process stopped are marked failed; queued jobs are queued again in
    /// submission order.
    #[instrument(skip_all, fields(job_dir = %config.job_dir.display()))]
    pub async fn open(config: EngineConfig) -> EngineResult<Self> {
        let store = JobStore::open(&config.job_dir).await?;
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let mut records = store.load_all().await?;
        records.sort_by_key(|record| record.created_at);

        let mut jobs = HashMap::new();
        for record in records {
            let log_path = store.log_path(&record.id);
            let job = Job::new(record, log_path, config.log_capacity);
            match job.state() {
                JobState::Running => {
                    if let Some(record) = job.interrupt(INTERRUPTED_SUMMARY) {
                        warn!(job_id = %job.id(), "job was interrupted by a restart, marking failed");
                        persist(&store, &record).await;
                    }
                }
                JobState::Queued => {
                    debug!(job_id = %job.id(), "re-queueing job");
                    let _ = queue_tx.send(Arc::clone(&job));
                }
                _ => {}
            }
            jobs.insert(job.id().to_string(), job);
        }
        info!("restored {} jobs", jobs.len());

        Ok(Self {
            config: Arc::new(config),
            store,
            jobs: Arc::new(Mutex::new(jobs)),
            queue_tx,
            queue_rx: parking_lot::Mutex::new(Some(queue_rx)),
            worker: parking_lot::Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// spawn the worker task
    pub fn start(&self) -> EngineResult<()> {
        let queue_rx = self
            .queue_rx
            .lock()
            .take()
            .ok_or(EngineError::AlreadyStarted)?;
        let pipeline = Arc::new(Pipeline::new(Arc::clone(&self.config)));
        let handle = tokio::spawn(run_worker(
            pipeline,
            self.store.clone(),
            queue_rx,
            self.shutdown.clone(),
        ));
        *self.worker.lock() = Some(handle);
        info!("job worker started");
        Ok(())
    }

    /// Stop the worker. A running job is canceled and finishes as such;
    /// jobs still queued stay queued on disk and run after the next start.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let running: Vec<String> = {
            let jobs = self.jobs.lock().await;
            jobs.values()
                .filter(|job| job.state() == JobState::Running)
                .map(|job| job.id().to_string())
                .collect()
        };
        for id in running {
            if let Err(err) = self.cancel(&id).await {
                warn!("failed to cancel job {} on shutdown: {}", id, err);
            }
        }
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(join_error) = handle.await {
                error!("job worker ended abnormally: {}", join_error);
            }
        }
        info!("job worker stopped");
    }

    /// validate, persist and enqueue a new job
    #[instrument(skip_all, fields(yaml = %request.yaml, action = %request.action))]
    pub async fn submit(&self, request: &JobRequest) -> EngineResult<JobRecord> {
        let request = validate_request(request)?;
        let document = self.config.document_path(&request.yaml);
        let is_file = fs::metadata(&document)
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false);
        if !is_file {
            return Err(EngineError::DocumentNotFound(request.yaml));
        }

        let id = Uuid::new_v4().simple().to_string();
        let record = JobRecord::new(
            &id,
            &request.yaml,
            request.action,
            &request.device,
            request.clean,
        );
        self.store.create_log(&id).await?;
        self.store.save(&record).await?;
        let job = Job::new(
            record.clone(),
            self.store.log_path(&id),
            self.config.log_capacity,
        );
        self.jobs.lock().await.insert(id.clone(), Arc::clone(&job));
        if self.queue_tx.send(job).is_err() {
            warn!(job_id = %id, "worker is gone, job stays queued until the next start");
        }
        info!(job_id = %id, "job queued");
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Job>> {
        self.jobs.lock().await.get(id).cloned()
    }

    /// all job records, newest first
    pub async fn list(&self) -> Vec<JobRecord> {
        let jobs = self.jobs.lock().await;
        let mut records: Vec<JobRecord> = jobs.values().map(|job| job.record()).collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    /// Cancel a job. Queued jobs are canceled on the spot; running jobs are
    /// flagged, the runner terminates the process within one poll interval and
    /// the job finishes as canceled once the pipeline returns. Finished jobs
    /// are returned unchanged.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: &str) -> EngineResult<JobRecord> {
        let job = self
            .get(id)
            .await
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        match job.request_cancel() {
            CancelOutcome::Unchanged(record) => {
                debug!("job already finished");
                Ok(record)
            }
            CancelOutcome::Canceled(record) => {
                info!("canceled queued job");
                persist(&self.store, &record).await;
                job.notify_done();
                Ok(record)
            }
            // the runner sees the flag and terminates its own child
            CancelOutcome::Requested { record, pid } => {
                info!("cancellation requested for running job, pid: {:?}", pid);
                Ok(record)
            }
        }
    }
}

async fn persist(store: &JobStore, record: &JobRecord) {
    if let Err(err) = store.save(record).await {
        error!(job_id = %record.id, "failed to persist job record: {}", err);
    }
}

async fn run_worker(
    pipeline: Arc<Pipeline>,
    store: JobStore,
    mut queue_rx: UnboundedReceiver<Arc<Job>>,
    shutdown: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            job = queue_rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        run_job(&pipeline, &store, job).await;
    }
}

/// run one job to its terminal state, never fails
async fn run_job(pipeline: &Arc<Pipeline>, store: &JobStore, job: Arc<Job>) {
    let record = match job.begin() {
        Some(record) => record,
        None => {
            debug!(job_id = %job.id(), "skipping job canceled while queued");
            return;
        }
    };
    info!(job_id = %job.id(), action = %record.action, "job started");
    persist(store, &record).await;

    // a panic inside the pipeline fails this job only
    let task = {
        let pipeline = Arc::clone(pipeline);
        let job = Arc::clone(&job);
        tokio::spawn(async move { pipeline.run(&job).await })
    };
    let exit_code = match task.await {
        Ok(exit_code) => exit_code,
        Err(join_error) => {
            error!(job_id = %job.id(), "pipeline task failed: {}", join_error);
            job.set_pid(None);
            job.set_error_summary(&format!("Internal error: {}", join_error));
            1
        }
    };

    let record = job.finish(exit_code);
    persist(store, &record).await;
    job.notify_done();
    info!(
        job_id = %job.id(),
        state = ?record.state,
        exit_code = ?record.exit_code,
        "job finished"
    );
}
