use std::process;

use fwjob_data::{JobAction, JobRequest};
use reqwest::blocking::Client;
use structopt::StructOpt;

mod operations;

/// Command line client for the firmware job server
#[derive(StructOpt, Debug)]
#[structopt(name = "fwjob-client")]
struct Opt {
    /// server base url
    #[structopt(
        short,
        long,
        env = "FWJOB_URL",
        default_value = "http://127.0.0.1:8099"
    )]
    url: String,

    #[structopt(subcommand)]
    operation: Operation,
}

#[derive(Debug, StructOpt)]
enum Operation {
    /// queue a compile, ota or logs job
    Submit(SubmitOperation),
    /// show one job
    Status(JobOperation),
    /// show all jobs, newest first
    List,
    /// print captured output after an offset
    Tail(TailOperation),
    /// print output as it arrives until the job finished
    Follow(JobOperation),
    /// cancel a queued or running job
    Cancel(JobOperation),
}

#[derive(Debug, StructOpt)]
struct SubmitOperation {
    #[structopt(name = "YAML")]
    yaml: String,
    /// compile, ota or logs
    #[structopt(name = "ACTION", default_value = "compile")]
    action: JobAction,
    /// target device, required for ota and logs
    #[structopt(short, long, default_value = "")]
    device: String,
    /// clean build
    #[structopt(long)]
    clean: bool,
    /// keep printing the job output after submitting
    #[structopt(short, long)]
    follow: bool,
}

#[derive(Debug, StructOpt)]
struct JobOperation {
    #[structopt(name = "JOB_ID")]
    job_id: String,
}

#[derive(Debug, StructOpt)]
struct TailOperation {
    #[structopt(name = "JOB_ID")]
    job_id: String,
    #[structopt(long, default_value = "0")]
    since: u64,
    #[structopt(long, default_value = "2000")]
    limit: u64,
}

fn main() {
    let opt = Opt::from_args();
    let url = opt.url.trim_end_matches('/');
    let client = match Client::builder().build() {
        Ok(client) => client,
        Err(e) => {
            eprintln!("could not build http client: {}", e);
            process::exit(1);
        }
    };

    let output = match opt.operation {
        Operation::Submit(submit) => {
            let request = JobRequest::new(&submit.yaml, submit.action, &submit.device, submit.clean);
            match operations::submit(&client, url, &request) {
                Ok(submitted) if submit.follow => {
                    println!("{}", operations::describe_submitted(&submitted));
                    operations::follow(&client, url, &submitted.job_id)
                }
                Ok(submitted) => operations::describe_submitted(&submitted),
                Err(message) => message,
            }
        }
        Operation::Status(job) => operations::status(&client, url, &job.job_id),
        Operation::List => operations::list(&client, url),
        Operation::Tail(tail) => operations::tail(&client, url, &tail.job_id, tail.since, tail.limit),
        Operation::Follow(job) => operations::follow(&client, url, &job.job_id),
        Operation::Cancel(job) => operations::cancel(&client, url, &job.job_id),
    };
    println!("{}", output);
}
