use std::{
    collections::BTreeMap,
    io,
    os::unix::process::ExitStatusExt,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::Duration,
};

use fwjob_data::JobAction;
use nix::pty::openpty;
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
    process::{Child, Command},
    sync::mpsc::{self, UnboundedReceiver},
    time::{sleep, timeout, Instant},
};
use tracing::{debug, info, instrument, warn};

use crate::{
    config::EngineConfig,
    job::{Job, LineOrigin},
    normalize::normalize_line,
    util::{read_lines, terminate_pid},
};

/// how long the runner waits for output before re-checking cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(200);
/// output still accepted after the process exited
const DRAIN_GRACE: Duration = Duration::from_millis(500);
/// time between SIGTERM and SIGKILL on cancellation
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

const CHILD_ENV_DEFAULTS: [(&str, &str); 2] =
    [("PYTHONUNBUFFERED", "1"), ("PYTHONIOENCODING", "utf-8")];

/// Runs one toolchain command for a job and streams its combined output
/// into the job log file and the job's listeners.
pub struct ProcessRunner {
    work_dir: PathBuf,
    use_pty: bool,
}

impl ProcessRunner {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            work_dir: config.work_dir.clone(),
            use_pty: config.use_pty,
        }
    }

    /// run `argv` to completion (or cancellation) and return its exit code
    /// spawn problems are reported on the job and yield exit code 1
    #[instrument(skip_all, fields(job_id = %job.id()))]
    pub async fn run(
        &self,
        job: &Arc<Job>,
        argv: &[String],
        extra_env: &BTreeMap<String, String>,
    ) -> i32 {
        let mut log = JobLog::open(job).await;
        log.emit(&format!("INFO CMD: {}", argv.join(" ")), LineOrigin::Engine)
            .await;
        if job.cancel_requested() {
            return 1;
        }
        let (program, args) = match argv.split_first() {
            Some(split) => split,
            None => {
                log.fail("Invalid toolchain command: empty command").await;
                return 1;
            }
        };
        let (mut child, lines_rx) = match self.spawn(program, args, extra_env) {
            Ok(spawned) => spawned,
            Err(err) => {
                log.fail(&format!("Failed to start: {}", err)).await;
                return 1;
            }
        };
        job.set_pid(child.id());
        info!("process spawned, pid: {:?}", child.id());
        let exit_code = self.supervise(job, &mut child, lines_rx, &mut log).await;
        job.set_pid(None);
        info!("process finished with exit code {}", exit_code);
        exit_code
    }

    /// Report an engine-side failure on the job as if the toolchain printed it.
    pub async fn report_failure(&self, job: &Arc<Job>, message: &str) {
        JobLog::open(job).await.fail(message).await;
    }

    fn command(
        &self,
        program: &str,
        args: &[String],
        extra_env: &BTreeMap<String, String>,
    ) -> Command {
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        for (key, value) in CHILD_ENV_DEFAULTS {
            if std::env::var_os(key).is_none() {
                command.env(key, value);
            }
        }
        command.envs(extra_env);
        command
    }

    /// spawn with stdout+stderr on a pseudo-terminal, or on pipes if none is available
    /// the command is dropped before returning so the parent holds no slave fd
    fn spawn(
        &self,
        program: &str,
        args: &[String],
        extra_env: &BTreeMap<String, String>,
    ) -> io::Result<(Child, UnboundedReceiver<String>)> {
        let (lines_tx, lines_rx) = mpsc::unbounded_channel::<String>();
        if self.use_pty {
            match openpty(None, None) {
                Ok(pty) => {
                    let child = {
                        let mut command = self.command(program, args, extra_env);
                        command
                            .stdout(Stdio::from(pty.slave.try_clone()?))
                            .stderr(Stdio::from(pty.slave));
                        command.spawn()?
                    };
                    let master = File::from_std(std::fs::File::from(pty.master));
                    tokio::spawn(read_lines(master, lines_tx));
                    return Ok((child, lines_rx));
                }
                Err(errno) => {
                    warn!("pseudo-terminal unavailable, capturing through pipes: {}", errno)
                }
            }
        }
        let mut command = self.command(program, args, extra_env);
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = command.spawn()?;
        // both streams feed one channel, lines stay whole
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_lines(stdout, lines_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(read_lines(stderr, lines_tx));
        }
        Ok((child, lines_rx))
    }

    async fn supervise(
        &self,
        job: &Arc<Job>,
        child: &mut Child,
        mut lines_rx: UnboundedReceiver<String>,
        log: &mut JobLog,
    ) -> i32 {
        let mut status: Option<io::Result<ExitStatus>> = None;
        let mut stream_open = true;
        let mut drain_deadline: Option<Instant> = None;
        loop {
            if job.cancel_requested() {
                info!("cancellation requested, terminating process");
                terminate(child).await;
                return 1;
            }
            if !stream_open && status.is_some() {
                break;
            }
            if drain_deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                // something else still holds the terminal open
                debug!("process exited, stop waiting for remaining output");
                break;
            }
            tokio::select! {
                line = lines_rx.recv(), if stream_open => match line {
                    Some(line) => log.output(&line).await,
                    None => stream_open = false,
                },
                result = child.wait(), if status.is_none() => {
                    status = Some(result);
                    drain_deadline = Some(Instant::now() + DRAIN_GRACE);
                }
                _ = sleep(POLL_INTERVAL) => {}
            }
        }
        match status {
            Some(Ok(status)) => exit_code(status),
            Some(Err(err)) => {
                warn!("failed to wait for process: {}", err);
                1
            }
            None => 1,
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| -signal))
        .unwrap_or(1)
}

async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        if let Err(errno) = terminate_pid(pid) {
            debug!("SIGTERM to pid {} failed: {}", pid, errno);
        }
    }
    if timeout(TERMINATE_GRACE, child.wait()).await.is_err() {
        warn!("process ignored SIGTERM, killing it");
        if let Err(err) = child.kill().await {
            warn!("unexpected error when killing process: {}", err);
        }
    }
}

/// Append side of a job's log. Every line goes to the file (flushed) before
/// it is published, so the file always holds at least what observers saw.
struct JobLog {
    job: Arc<Job>,
    action: JobAction,
    file: Option<File>,
}

impl JobLog {
    async fn open(job: &Arc<Job>) -> Self {
        let file = match OpenOptions::new()
            .create(true)
            .append(true)
            .open(job.log_path())
            .await
        {
            Ok(file) => Some(file),
            Err(err) => {
                warn!("cannot open job log {}: {}", job.log_path().display(), err);
                None
            }
        };
        Self {
            job: Arc::clone(job),
            action: job.action(),
            file,
        }
    }

    /// raw process output
    async fn output(&mut self, raw: &str) {
        if let Some(line) = normalize_line(self.action, raw) {
            self.emit(&line, LineOrigin::Output).await;
        }
    }

    async fn fail(&mut self, message: &str) {
        self.emit(message, LineOrigin::Output).await;
        self.job.set_error_summary(message);
    }

    async fn emit(&mut self, line: &str, origin: LineOrigin) {
        if let Some(file) = self.file.as_mut() {
            let written = async {
                file.write_all(line.as_bytes()).await?;
                file.write_all(b"\n").await?;
                file.flush().await
            }
            .await;
            if let Err(err) = written {
                warn!("failed to append to job log: {}", err);
            }
        }
        self.job.publish(line, origin);
    }
}
