use std::sync::Arc;

use fwjob_lib::{EngineError, JobManager};
use rocket::{figment::Figment, Build, Rocket};
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{ConfigError, ServerConfig};

#[macro_use]
extern crate rocket;

mod config;
mod error;
mod routes;

#[derive(Debug, Error)]
enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("job engine failed: {0}")]
    Engine(#[from] EngineError),

    #[error("http server failed: {0}")]
    Server(#[from] rocket::Error),
}

pub fn build_rocket(manager: Arc<JobManager>, figment: Figment) -> Rocket<Build> {
    rocket::custom(figment)
        .manage(manager)
        .mount("/api", routes::routes())
        .register(
            "/",
            catchers![
                error::bad_request,
                error::not_found,
                error::unprocessable,
                error::internal_error
            ],
        )
}

async fn run() -> Result<(), StartupError> {
    let config = ServerConfig::from_env()?;
    info!(
        host = %config.host,
        port = config.port,
        job_dir = %config.job_dir.display(),
        target_dir = %config.target_dir.display(),
        "loaded server configuration"
    );

    let manager = Arc::new(JobManager::open(config.engine()).await?);
    manager.start()?;
    let launched = build_rocket(Arc::clone(&manager), config.figment())
        .launch()
        .await;
    info!("http server stopped, shutting down job worker");
    manager.stop().await;
    launched?;
    Ok(())
}

#[rocket::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fwjob_server=info,fwjob_lib=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(err) = run().await {
        error!("{}", err);
        std::process::exit(1);
    }
}
