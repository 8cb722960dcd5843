use std::sync::OnceLock;

use fwjob_data::{JobAction, JobRequest};
use regex::Regex;

use crate::error::{EngineError, EngineResult};

static DOCUMENT_NAME: OnceLock<Regex> = OnceLock::new();
static DEVICE_NAME: OnceLock<Regex> = OnceLock::new();

/// a submit request that passed validation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidRequest {
    pub yaml: String,
    pub action: JobAction,
    pub device: String,
    pub clean: bool,
}

/// bare `*.yaml` file name, no directories
pub fn normalize_document_name(value: &str) -> Option<String> {
    let name = value.trim();
    let pattern = DOCUMENT_NAME
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_.-]+\.yaml$").expect("valid name pattern"));
    pattern.is_match(name).then(|| name.to_string())
}

/// host name, address or serial port name as understood by the toolchain
pub fn normalize_device(value: &str) -> Option<String> {
    let name = value.trim();
    let pattern = DEVICE_NAME
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("valid device pattern"));
    pattern.is_match(name).then(|| name.to_string())
}

pub fn validate_request(request: &JobRequest) -> EngineResult<ValidRequest> {
    let yaml = normalize_document_name(&request.yaml)
        .ok_or_else(|| EngineError::invalid("yaml", "expected a <name>.yaml file name"))?;
    let action: JobAction = request
        .action
        .parse()
        .map_err(|_| EngineError::invalid("action", "expected compile, ota or logs"))?;
    let device = if action.needs_device() {
        normalize_device(&request.device).ok_or_else(|| {
            EngineError::invalid("device", "expected a host name, address or port")
        })?
    } else {
        String::new()
    };
    Ok(ValidRequest {
        yaml,
        action,
        device,
        clean: request.clean,
    })
}
