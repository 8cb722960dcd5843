use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

pub const DEFAULT_LOG_CAPACITY: usize = 2000;
pub const DEFAULT_TOOLCHAIN: &str = "esphome";

/// Engine settings: where jobs are persisted, where configuration
/// documents live and how the toolchain is invoked.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub job_dir: PathBuf,
    pub work_dir: PathBuf,
    /// toolchain command line, split with shell quoting rules when a job runs
    pub toolchain: String,
    /// lines of history kept in memory per job
    pub log_capacity: usize,
    /// capture output through a pseudo-terminal, falls back to pipes when unavailable
    pub use_pty: bool,
    /// environment overrides applied to every toolchain process
    pub extra_env: BTreeMap<String, String>,
}

impl EngineConfig {
    pub fn new(job_dir: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            job_dir: job_dir.into(),
            work_dir: work_dir.into(),
            toolchain: DEFAULT_TOOLCHAIN.to_string(),
            log_capacity: DEFAULT_LOG_CAPACITY,
            use_pty: true,
            extra_env: BTreeMap::new(),
        }
    }

    pub fn toolchain(mut self, toolchain: &str) -> Self {
        self.toolchain = toolchain.trim().to_string();
        self
    }

    pub fn log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity.max(1);
        self
    }

    pub fn use_pty(mut self, use_pty: bool) -> Self {
        self.use_pty = use_pty;
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.extra_env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn document_path(&self, name: &str) -> PathBuf {
        self.work_dir.join(Path::new(name))
    }

    /// toolchain command split into argv
    /// the error is the message recorded on the job
    pub fn toolchain_argv(&self) -> Result<Vec<String>, String> {
        match shlex::split(&self.toolchain) {
            None => Err("Invalid toolchain command: unbalanced quotes".to_string()),
            Some(argv) if argv.is_empty() => {
                Err("Invalid toolchain command: empty command".to_string())
            }
            Some(argv) => Ok(argv),
        }
    }
}
