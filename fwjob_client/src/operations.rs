use std::{thread::sleep, time::Duration};

use fwjob_data::{
    ErrorResponse, JobListResponse, JobRecord, JobRequest, JobResponse, SubmitResponse,
    TailResponse,
};
use reqwest::blocking::{Client, Response};
use serde::de::DeserializeOwned;

/// how long the server may hold a follow request open, seconds
const FOLLOW_WAIT: u64 = 15;

pub fn submit(
    http_client: &Client,
    url: &str,
    request: &JobRequest,
) -> Result<SubmitResponse, String> {
    let response = http_client
        .post(format!("{}/api/jobs", url))
        .json(request)
        .send();
    parse::<SubmitResponse>(response)
}

pub fn describe_submitted(submitted: &SubmitResponse) -> String {
    format!("queued job {}", submitted.job_id)
}

pub fn status(http_client: &Client, url: &str, job_id: &str) -> String {
    let response = http_client
        .get(format!("{}/api/jobs/{}", url, job_id))
        .send();
    match parse::<JobResponse>(response) {
        Ok(response) => describe(&response.job),
        Err(message) => message,
    }
}

pub fn list(http_client: &Client, url: &str) -> String {
    let response = http_client.get(format!("{}/api/jobs", url)).send();
    match parse::<JobListResponse>(response) {
        Ok(response) if response.jobs.is_empty() => "no jobs".to_string(),
        Ok(response) => response
            .jobs
            .iter()
            .map(describe)
            .collect::<Vec<_>>()
            .join("\n"),
        Err(message) => message,
    }
}

pub fn tail(http_client: &Client, url: &str, job_id: &str, since: u64, limit: u64) -> String {
    let response = http_client
        .get(format!("{}/api/jobs/{}/tail", url, job_id))
        .query(&[("since", since), ("limit", limit)])
        .send();
    match parse::<TailResponse>(response) {
        Ok(response) => {
            let mut out = response.lines.join("\n");
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&format!("-- next_seq {} --", response.next_seq));
            out
        }
        Err(message) => message,
    }
}

/// Print the job's output as it arrives until the job finished, then
/// return its final description.
pub fn follow(http_client: &Client, url: &str, job_id: &str) -> String {
    let mut since = 0;
    let mut failures = 0;
    loop {
        let response = http_client
            .get(format!("{}/api/jobs/{}/tail-wait", url, job_id))
            .query(&[("since", since), ("timeout", FOLLOW_WAIT)])
            .timeout(Duration::from_secs(FOLLOW_WAIT + 10))
            .send();
        match parse::<TailResponse>(response) {
            Ok(response) => {
                failures = 0;
                for line in &response.lines {
                    println!("{}", line);
                }
                since = response.next_seq;
                if response.job.state.is_terminal() {
                    return describe(&response.job);
                }
            }
            Err(message) if failures < 3 => {
                failures += 1;
                eprintln!("{}, retrying", message);
                sleep(Duration::from_secs(1));
            }
            Err(message) => return message,
        }
    }
}

pub fn cancel(http_client: &Client, url: &str, job_id: &str) -> String {
    let response = http_client
        .post(format!("{}/api/jobs/{}/cancel", url, job_id))
        .send();
    match parse::<JobResponse>(response) {
        Ok(response) => describe(&response.job),
        Err(message) => message,
    }
}

fn describe(job: &JobRecord) -> String {
    let mut text = format!("{} {:?} {} {}", job.id, job.state, job.action, job.yaml);
    if !job.device.is_empty() {
        text.push_str(&format!(" -> {}", job.device));
    }
    if let Some(exit_code) = job.exit_code {
        text.push_str(&format!(" (exit {})", exit_code));
    }
    if !job.error_summary.is_empty() {
        text.push_str(&format!(": {}", job.error_summary));
    }
    text
}

fn parse<T: DeserializeOwned>(response: reqwest::Result<Response>) -> Result<T, String> {
    match response {
        Ok(response) if response.status().is_success() => response
            .json()
            .map_err(|e| format!("unexpected response body: {}", e)),
        Ok(response) => {
            let status = response.status();
            match response.json::<ErrorResponse>() {
                Ok(body) => Err(format!("{} ({})", body.error, body.code)),
                Err(_) => Err(format!("unexpected response: {}", status)),
            }
        }
        Err(e) => Err(format!("error executing request: {}", e)),
    }
}
