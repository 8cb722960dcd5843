use std::{
    path::{Path, PathBuf},
    sync::{Arc, Once},
    time::Duration,
};

use fwjob_data::JobRecord;
use lazy_static::lazy_static;
use tokio::runtime::Runtime;

use crate::{config::EngineConfig, job::Job};

lazy_static! {
    pub static ref RUNTIME: Runtime = Runtime::new().unwrap();
}

static INIT: Once = Once::new();

pub fn setup() {
    INIT.call_once(|| {
        tracing_subscriber::fmt::init();
    });
}

/// Stand-in for the firmware toolchain. Behaviour is steered by markers in
/// the document: `fail: <step>`, `lines: <n>` and `slow: true`.
const FAKE_TOOLCHAIN: &str = r#"cmd="$1"
doc="$2"
echo "fake $*"
case "$cmd" in
  config)
    if grep -q 'fail: config' "$doc"; then echo "config invalid"; exit 2; fi
    ;;
  compile)
    if grep -q 'fail: compile' "$doc"; then echo "compile error"; exit 3; fi
    n=$(sed -n 's/^lines: //p' "$doc")
    i=1
    while [ "$i" -le "${n:-0}" ]; do echo "line $i"; i=$((i+1)); done
    if grep -q 'slow: true' "$doc"; then exec sleep 30; fi
    ;;
  upload)
    if grep -q 'fail: upload' "$doc"; then echo "upload failed"; exit 4; fi
    ;;
  logs)
    while true; do echo "[I][app]: tick"; sleep 0.1; done
    ;;
esac
echo "$cmd ok"
"#;

/// write the fake toolchain and return a config using it, pipes only
pub fn fake_config(root: &Path) -> EngineConfig {
    let job_dir = root.join("jobs");
    let work_dir = root.join("config");
    std::fs::create_dir_all(&work_dir).unwrap();
    let script = root.join("toolchain.sh");
    std::fs::write(&script, FAKE_TOOLCHAIN).unwrap();
    EngineConfig::new(&job_dir, &work_dir)
        .toolchain(&format!("sh {}", script.display()))
        .use_pty(false)
}

pub fn write_document(config: &EngineConfig, name: &str, body: &str) -> PathBuf {
    let path = config.document_path(name);
    std::fs::write(&path, body).unwrap();
    path
}

/// poll until the job reached a terminal state
pub async fn wait_for_terminal(job: &Arc<Job>, limit: Duration) -> JobRecord {
    tokio::time::timeout(limit, async {
        loop {
            let record = job.record();
            if record.state.is_terminal() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("job did not finish in time")
}
