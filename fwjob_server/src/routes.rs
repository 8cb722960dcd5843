use std::{sync::Arc, time::Duration};

use chrono::Utc;
use fwjob_data::{
    HealthResponse, JobListResponse, JobRequest, JobResponse, SubmitResponse, TailResponse,
};
use fwjob_lib::{observe, EngineError, Job, JobEvent, JobManager, TailResult};
use rocket::{
    response::stream::{Event, EventStream},
    serde::json::Json,
    Route, State,
};
use tracing::info;

use crate::error::ApiResult;

/// whitespace comment that pushes proxies into flushing the stream
const STREAM_PADDING: usize = 2048;
const STREAM_HEARTBEAT: Duration = Duration::from_secs(1);

type Manager = State<Arc<JobManager>>;

pub fn routes() -> Vec<Route> {
    routes![
        health,
        submit,
        install,
        list_jobs,
        get_job,
        tail,
        tail_wait,
        stream,
        cancel
    ]
}

async fn find(manager: &JobManager, id: &str) -> ApiResult<Arc<Job>> {
    manager
        .get(id)
        .await
        .ok_or_else(|| EngineError::NotFound(id.to_string()).into())
}

fn tail_response(result: TailResult) -> Json<TailResponse> {
    Json(TailResponse {
        job: result.record,
        lines: result.lines,
        next_seq: result.next_seq,
    })
}

#[get("/health")]
fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        ts: Utc::now(),
    })
}

async fn create_job(manager: &JobManager, request: &JobRequest) -> ApiResult<Json<SubmitResponse>> {
    let job = manager.submit(request).await?;
    info!(job_id = %job.id, action = %job.action, yaml = %job.yaml, "job submitted");
    Ok(Json(SubmitResponse {
        job_id: job.id.clone(),
        job,
    }))
}

#[post("/jobs", format = "json", data = "<request>")]
async fn submit(manager: &Manager, request: Json<JobRequest>) -> ApiResult<Json<SubmitResponse>> {
    create_job(manager, &request).await
}

#[post("/install", format = "json", data = "<request>")]
async fn install(manager: &Manager, request: Json<JobRequest>) -> ApiResult<Json<SubmitResponse>> {
    create_job(manager, &request).await
}

#[get("/jobs")]
async fn list_jobs(manager: &Manager) -> Json<JobListResponse> {
    Json(JobListResponse {
        jobs: manager.list().await,
    })
}

#[get("/jobs/<id>")]
async fn get_job(manager: &Manager, id: &str) -> ApiResult<Json<JobResponse>> {
    let job = find(manager, id).await?;
    Ok(Json(JobResponse { job: job.record() }))
}

#[get("/jobs/<id>/tail?<since>&<limit>")]
async fn tail(
    manager: &Manager,
    id: &str,
    since: Option<i64>,
    limit: Option<i64>,
) -> ApiResult<Json<TailResponse>> {
    let job = find(manager, id).await?;
    let result = observe::tail(&job, observe::clamp_since(since), observe::tail_limit(limit)).await;
    Ok(tail_response(result))
}

#[get("/jobs/<id>/tail-wait?<since>&<limit>&<timeout>")]
async fn tail_wait(
    manager: &Manager,
    id: &str,
    since: Option<i64>,
    limit: Option<i64>,
    timeout: Option<f64>,
) -> ApiResult<Json<TailResponse>> {
    let job = find(manager, id).await?;
    let result = observe::tail_wait(
        &job,
        observe::clamp_since(since),
        observe::wait_limit(limit),
        observe::wait_timeout(timeout),
    )
    .await;
    Ok(tail_response(result))
}

/// Server-sent events: the captured history as `log` events, then live
/// `log` events and a single `done` event carrying the final record.
#[get("/jobs/<id>/stream")]
async fn stream(manager: &Manager, id: &str) -> ApiResult<EventStream![]> {
    let job = find(manager, id).await?;
    let attachment = observe::attach(&job).await;
    Ok(EventStream! {
        yield Event::comment(" ".repeat(STREAM_PADDING));
        for line in attachment.history {
            yield Event::data(line).event("log");
        }
        match attachment.subscription {
            None => {
                yield Event::json(&attachment.record).event("done");
            }
            Some(mut subscription) => {
                while let Some(event) = subscription.recv().await {
                    match event {
                        JobEvent::Log { line, .. } => {
                            yield Event::data(line).event("log");
                        }
                        JobEvent::Done(record) => {
                            yield Event::json(&record).event("done");
                            break;
                        }
                    }
                }
            }
        }
    }
    .heartbeat(STREAM_HEARTBEAT))
}

#[post("/jobs/<id>/cancel")]
async fn cancel(manager: &Manager, id: &str) -> ApiResult<Json<JobResponse>> {
    let job = manager.cancel(id).await?;
    Ok(Json(JobResponse { job }))
}

#[cfg(test)]
mod test {
    use std::{path::Path, sync::Arc, time::Duration};

    use fwjob_data::{
        ErrorResponse, JobAction, JobListResponse, JobRequest, JobResponse, JobState,
        SubmitResponse, TailResponse,
    };
    use fwjob_lib::{EngineConfig, JobManager};
    use lazy_static::lazy_static;
    use rocket::{
        http::{ContentType, Status},
        local::asynchronous::Client,
    };
    use tempfile::{tempdir, TempDir};
    use tokio::runtime::Runtime;

    use crate::build_rocket;

    lazy_static! {
        static ref RUNTIME: Runtime = Runtime::new().unwrap();
    }

    const TOOLCHAIN: &str = r#"echo "run $1"
if grep -q 'slow: true' "$2"; then sleep 0.5; fi
if grep -q 'fail: true' "$2"; then echo "broken config"; exit 2; fi
echo "$1 ok"
"#;

    fn engine_config(root: &Path) -> EngineConfig {
        let work_dir = root.join("config");
        std::fs::create_dir_all(&work_dir).unwrap();
        std::fs::write(work_dir.join("node.yaml"), "\n").unwrap();
        std::fs::write(work_dir.join("slow.yaml"), "slow: true\n").unwrap();
        std::fs::write(work_dir.join("bad.yaml"), "fail: true\n").unwrap();
        let script = root.join("toolchain.sh");
        std::fs::write(&script, TOOLCHAIN).unwrap();
        EngineConfig::new(root.join("jobs"), work_dir)
            .toolchain(&format!("sh {}", script.display()))
            .use_pty(false)
    }

    async fn client(dir: &TempDir) -> (Client, Arc<JobManager>) {
        let manager = Arc::new(JobManager::open(engine_config(dir.path())).await.unwrap());
        manager.start().unwrap();
        let figment = rocket::Config::figment().merge(("log_level", "off"));
        let client = Client::tracked(build_rocket(Arc::clone(&manager), figment))
            .await
            .unwrap();
        (client, manager)
    }

    async fn submit(client: &Client, request: &JobRequest) -> SubmitResponse {
        let response = client
            .post("/api/jobs")
            .header(ContentType::JSON)
            .body(serde_json::to_string(request).unwrap())
            .dispatch()
            .await;
        assert_eq!(Status::Ok, response.status());
        response.into_json().await.unwrap()
    }

    async fn wait_done(client: &Client, id: &str) -> TailResponse {
        let mut since = 0;
        let mut lines = Vec::new();
        for _ in 0..50 {
            let response: TailResponse = client
                .get(format!("/api/jobs/{}/tail-wait?since={}&timeout=1", id, since))
                .dispatch()
                .await
                .into_json()
                .await
                .unwrap();
            lines.extend(response.lines.iter().cloned());
            since = response.next_seq;
            if response.job.state.is_terminal() {
                return TailResponse { lines, ..response };
            }
        }
        panic!("job {} did not finish", id);
    }

    /// (event, data) pairs of a server-sent event body, comments skipped
    fn sse_events(body: &str) -> Vec<(String, String)> {
        body.split("\n\n")
            .filter_map(|block| {
                let mut event = None;
                let mut data = Vec::new();
                for line in block.lines() {
                    if let Some(value) = line.strip_prefix("event:") {
                        event = Some(value.trim_start().to_string());
                    } else if let Some(value) = line.strip_prefix("data:") {
                        data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
                    }
                }
                event.map(|event| (event, data.join("\n")))
            })
            .collect()
    }

    #[test]
    fn test_health() {
        let dir = tempdir().unwrap();
        RUNTIME.block_on(async {
            let (client, manager) = client(&dir).await;
            let response = client.get("/api/health").dispatch().await;
            assert_eq!(Status::Ok, response.status());
            let body: serde_json::Value = response.into_json().await.unwrap();
            assert_eq!("ok", body["status"]);
            manager.stop().await;
        });
    }

    #[test]
    fn test_submit_and_poll() {
        let dir = tempdir().unwrap();
        RUNTIME.block_on(async {
            let (client, manager) = client(&dir).await;
            let submitted = submit(
                &client,
                &JobRequest::new("node.yaml", JobAction::Compile, "", false),
            )
            .await;
            assert_eq!(submitted.job_id, submitted.job.id);
            assert_eq!(JobState::Queued, submitted.job.state);

            let done = wait_done(&client, &submitted.job_id).await;
            assert_eq!(JobState::Success, done.job.state);
            assert_eq!(Some(0), done.job.exit_code);
            assert!(done.lines[0].starts_with("INFO CMD: sh "));
            assert!(done.lines.contains(&"compile ok".to_string()));

            let tail: TailResponse = client
                .get(format!("/api/jobs/{}/tail", submitted.job_id))
                .dispatch()
                .await
                .into_json()
                .await
                .unwrap();
            assert_eq!(done.lines, tail.lines);
            assert_eq!(tail.lines.len() as u64, tail.next_seq);

            // beyond the end: nothing, offset unchanged
            let beyond: TailResponse = client
                .get(format!("/api/jobs/{}/tail?since=500&limit=-3", submitted.job_id))
                .dispatch()
                .await
                .into_json()
                .await
                .unwrap();
            assert!(beyond.lines.is_empty());
            assert_eq!(500, beyond.next_seq);

            let job: JobResponse = client
                .get(format!("/api/jobs/{}", submitted.job_id))
                .dispatch()
                .await
                .into_json()
                .await
                .unwrap();
            assert_eq!(done.job, job.job);

            let list: JobListResponse = client.get("/api/jobs").dispatch().await.into_json().await.unwrap();
            assert_eq!(vec![done.job], list.jobs);
            manager.stop().await;
        });
    }

    #[test]
    fn test_failed_job_summary() {
        let dir = tempdir().unwrap();
        RUNTIME.block_on(async {
            let (client, manager) = client(&dir).await;
            let request = JobRequest::new("bad.yaml", JobAction::Ota, "node.local", false);
            let response = client
                .post("/api/install")
                .header(ContentType::JSON)
                .body(serde_json::to_string(&request).unwrap())
                .dispatch()
                .await;
            assert_eq!(Status::Ok, response.status());
            let submitted: SubmitResponse = response.into_json().await.unwrap();
            let done = wait_done(&client, &submitted.job_id).await;
            assert_eq!(JobState::Failed, done.job.state);
            assert_eq!(Some(2), done.job.exit_code);
            assert_eq!("broken config", done.job.error_summary);
            manager.stop().await;
        });
    }

    #[test]
    fn test_errors() {
        let dir = tempdir().unwrap();
        RUNTIME.block_on(async {
            let (client, manager) = client(&dir).await;

            let response = client.get("/api/jobs/unknown").dispatch().await;
            assert_eq!(Status::NotFound, response.status());
            let body: ErrorResponse = response.into_json().await.unwrap();
            assert_eq!("NOT_FOUND", body.code);

            let response = client.post("/api/jobs/unknown/cancel").dispatch().await;
            assert_eq!(Status::NotFound, response.status());

            let response = client.get("/api/jobs/unknown/stream").dispatch().await;
            assert_eq!(Status::NotFound, response.status());

            let response = client
                .post("/api/jobs")
                .header(ContentType::JSON)
                .body(r#"{"yaml": "node.yaml", "action": "flash"}"#)
                .dispatch()
                .await;
            assert_eq!(Status::BadRequest, response.status());
            let body: ErrorResponse = response.into_json().await.unwrap();
            assert_eq!("INVALID_REQUEST", body.code);

            let response = client
                .post("/api/jobs")
                .header(ContentType::JSON)
                .body(r#"{"yaml": "other.yaml", "action": "compile"}"#)
                .dispatch()
                .await;
            assert_eq!(Status::NotFound, response.status());
            let body: ErrorResponse = response.into_json().await.unwrap();
            assert_eq!("DOCUMENT_NOT_FOUND", body.code);

            let response = client
                .post("/api/jobs")
                .header(ContentType::JSON)
                .body("{not json")
                .dispatch()
                .await;
            assert!(response.status().code >= 400 && response.status().code < 500);
            let body: ErrorResponse = response.into_json().await.unwrap();
            assert_eq!("BAD_REQUEST", body.code);

            assert!(manager.list().await.is_empty());
            manager.stop().await;
        });
    }

    #[test]
    fn test_cancel_queued() {
        let dir = tempdir().unwrap();
        RUNTIME.block_on(async {
            let (client, manager) = client(&dir).await;
            let slow = submit(&client, &JobRequest::new("slow.yaml", JobAction::Compile, "", false)).await;
            let queued = submit(&client, &JobRequest::new("node.yaml", JobAction::Compile, "", false)).await;

            let response = client
                .post(format!("/api/jobs/{}/cancel", queued.job_id))
                .dispatch()
                .await;
            assert_eq!(Status::Ok, response.status());
            let canceled: JobResponse = response.into_json().await.unwrap();
            assert_eq!(JobState::Canceled, canceled.job.state);
            assert_eq!(Some(-1), canceled.job.exit_code);

            // cancelling again returns the same record
            let again: JobResponse = client
                .post(format!("/api/jobs/{}/cancel", queued.job_id))
                .dispatch()
                .await
                .into_json()
                .await
                .unwrap();
            assert_eq!(canceled.job, again.job);

            assert_eq!(JobState::Success, wait_done(&client, &slow.job_id).await.job.state);
            manager.stop().await;
        });
    }

    // testing that a live stream and a stream opened after completion carry
    // the same lines and one done event each
    #[test]
    fn test_stream() {
        let dir = tempdir().unwrap();
        RUNTIME.block_on(async {
            let (client, manager) = client(&dir).await;
            let submitted = submit(&client, &JobRequest::new("slow.yaml", JobAction::Compile, "", false)).await;

            let live = tokio::time::timeout(Duration::from_secs(10), async {
                let response = client
                    .get(format!("/api/jobs/{}/stream", submitted.job_id))
                    .dispatch()
                    .await;
                assert_eq!(Status::Ok, response.status());
                assert_eq!(Some(ContentType::EventStream), response.content_type());
                response.into_string().await.unwrap()
            })
            .await
            .expect("stream must end after the done event");
            assert!(live.starts_with(':'));

            let late = client
                .get(format!("/api/jobs/{}/stream", submitted.job_id))
                .dispatch()
                .await
                .into_string()
                .await
                .unwrap();

            for body in [&live, &late] {
                let events = sse_events(body);
                let (last_event, last_data) = events.last().unwrap();
                assert_eq!("done", last_event);
                let record: fwjob_data::JobRecord = serde_json::from_str(last_data).unwrap();
                assert_eq!(JobState::Success, record.state);
                assert_eq!(1, events.iter().filter(|(event, _)| event == "done").count());
            }
            let lines = |body: &str| -> Vec<String> {
                sse_events(body)
                    .into_iter()
                    .filter(|(event, _)| event == "log")
                    .map(|(_, data)| data)
                    .collect()
            };
            assert_eq!(lines(live.as_str()), lines(late.as_str()));
            assert!(lines(late.as_str()).contains(&"compile ok".to_string()));
            manager.stop().await;
        });
    }
}
