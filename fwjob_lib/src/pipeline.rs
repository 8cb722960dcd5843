use std::sync::Arc;

use fwjob_data::{JobAction, JobRecord};
use tracing::{info, instrument};

use crate::{config::EngineConfig, job::Job, runner::ProcessRunner};

/// toolchain arguments for each step of an action, run in order
pub fn steps(record: &JobRecord, document: &str) -> Vec<Vec<String>> {
    let document = document.to_string();
    let mut build = vec!["compile".to_string(), document.clone()];
    if record.clean {
        build.push("--clean".to_string());
    }
    match record.action {
        JobAction::Compile => vec![vec!["config".to_string(), document], build],
        JobAction::Ota => {
            let mut upload = vec![
                "upload".to_string(),
                document.clone(),
                "--device".to_string(),
                record.device.clone(),
            ];
            if record.clean {
                upload.push("--clean".to_string());
            }
            vec![vec!["config".to_string(), document], build, upload]
        }
        JobAction::Logs => vec![vec![
            "logs".to_string(),
            document,
            "--device".to_string(),
            record.device.clone(),
        ]],
    }
}

/// Drives the steps of a job through the process runner, stopping at the
/// first failing step or once cancellation was requested.
pub struct Pipeline {
    config: Arc<EngineConfig>,
    runner: ProcessRunner,
}

impl Pipeline {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        let runner = ProcessRunner::new(&config);
        Self { config, runner }
    }

    #[instrument(skip_all, fields(job_id = %job.id()))]
    pub async fn run(&self, job: &Arc<Job>) -> i32 {
        let prefix = match self.config.toolchain_argv() {
            Ok(prefix) => prefix,
            Err(message) => {
                self.runner.report_failure(job, &message).await;
                return 1;
            }
        };
        let record = job.record();
        let document = self.config.document_path(&record.yaml);
        let mut exit_code = 0;
        for (index, step) in steps(&record, &document.to_string_lossy()).into_iter().enumerate() {
            if job.cancel_requested() {
                info!("cancellation requested, skipping remaining steps");
                break;
            }
            let argv: Vec<String> = prefix.iter().cloned().chain(step).collect();
            exit_code = self
                .runner
                .run(job, &argv, &self.config.extra_env)
                .await;
            if exit_code != 0 {
                info!("step {} failed with exit code {}", index + 1, exit_code);
                break;
            }
        }
        exit_code
    }
}
