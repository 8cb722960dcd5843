use std::{net::IpAddr, path::PathBuf, str::FromStr};

use fwjob_lib::{
    config::{DEFAULT_LOG_CAPACITY, DEFAULT_TOOLCHAIN},
    EngineConfig,
};
use rocket::figment::Figment;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got {value:?}")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Server configuration loaded from environment variables.
///
/// | Env Var            | Default            |
/// |--------------------|--------------------|
/// | `HOST`             | `0.0.0.0`          |
/// | `PORT`             | `8099`             |
/// | `JOB_DIR`          | `/data/jobs`       |
/// | `TARGET_DIR`       | `/config/esphome`  |
/// | `ESPHOME_BIN`      | `esphome`          |
/// | `JOB_LOG_CAPACITY` | `2000`             |
/// | `JOB_USE_PTY`      | `true`             |
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    /// job records and logs
    pub job_dir: PathBuf,
    /// configuration documents, also the toolchain's working directory
    pub target_dir: PathBuf,
    pub toolchain: String,
    pub log_capacity: usize,
    pub use_pty: bool,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |name: &str, default: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let host = parse("HOST", "an IP address", value("HOST", "0.0.0.0"))?;
        let port = parse("PORT", "a valid port", value("PORT", "8099"))?;
        let log_capacity: usize = parse(
            "JOB_LOG_CAPACITY",
            "a positive number",
            value("JOB_LOG_CAPACITY", &DEFAULT_LOG_CAPACITY.to_string()),
        )?;
        if log_capacity == 0 {
            return Err(ConfigError::Invalid {
                name: "JOB_LOG_CAPACITY",
                expected: "a positive number",
                value: "0".to_string(),
            });
        }
        let use_pty = parse_bool("JOB_USE_PTY", value("JOB_USE_PTY", "true"))?;

        Ok(Self {
            host,
            port,
            job_dir: PathBuf::from(value("JOB_DIR", "/data/jobs")),
            target_dir: PathBuf::from(value("TARGET_DIR", "/config/esphome")),
            toolchain: value("ESPHOME_BIN", DEFAULT_TOOLCHAIN),
            log_capacity,
            use_pty,
        })
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig::new(&self.job_dir, &self.target_dir)
            .toolchain(&self.toolchain)
            .log_capacity(self.log_capacity)
            .use_pty(self.use_pty)
    }

    /// rocket settings, our tracing output replaces rocket's own logger
    pub fn figment(&self) -> Figment {
        rocket::Config::figment()
            .merge(("address", self.host))
            .merge(("port", self.port))
            .merge(("log_level", "off"))
    }
}

fn parse<T: FromStr>(name: &'static str, expected: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Invalid {
            name,
            expected,
            value,
        })
}

fn parse_bool(name: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            expected: "a boolean",
            value,
        }),
    }
}
