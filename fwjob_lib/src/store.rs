use std::path::{Path, PathBuf};

use fwjob_data::JobRecord;
use tokio::fs;
use tracing::{debug, warn};

use crate::error::EngineResult;

/// Job directory layout: `<id>.json` holds the record, `<id>.log` the
/// captured output.
#[derive(Clone, Debug)]
pub struct JobStore {
    dir: PathBuf,
}

impl JobStore {
    pub async fn open(dir: &Path) -> EngineResult<Self> {
        fs::create_dir_all(dir).await?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    pub fn log_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.log", id))
    }

    /// create (or truncate) the log file of a new job
    pub async fn create_log(&self, id: &str) -> EngineResult<()> {
        fs::File::create(self.log_path(id)).await?;
        Ok(())
    }

    /// write the record through a temporary file so readers never see half a record
    pub async fn save(&self, record: &JobRecord) -> EngineResult<()> {
        let mut data = serde_json::to_vec_pretty(record)?;
        data.push(b'\n');
        let tmp_path = self.dir.join(format!("{}.json.tmp", record.id));
        fs::write(&tmp_path, data).await?;
        fs::rename(&tmp_path, self.record_path(&record.id)).await?;
        debug!(job_id = %record.id, state = ?record.state, "job record saved");
        Ok(())
    }

    /// every readable record in the directory, unreadable ones are skipped
    pub async fn load_all(&self) -> EngineResult<Vec<JobRecord>> {
        let mut records = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match load_record(&path).await {
                Ok(record) if !record.id.is_empty() => records.push(record),
                Ok(_) => warn!("skipping job record without id: {}", path.display()),
                Err(err) => warn!("skipping unreadable job record {}: {}", path.display(), err),
            }
        }
        Ok(records)
    }
}

async fn load_record(path: &Path) -> EngineResult<JobRecord> {
    let data = fs::read(path).await?;
    Ok(serde_json::from_slice(&data)?)
}
