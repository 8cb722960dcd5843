use fwjob_data::ErrorResponse;
use fwjob_lib::EngineError;
use rocket::{
    http::Status,
    request::Request,
    response::{self, status, Responder},
    serde::json::Json,
};
use thiserror::Error;
use tracing::error;

/// Error returned by route handlers, rendered as `{"error": .., "code": ..}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    fn classify(&self) -> (Status, &'static str, String) {
        match self {
            ApiError::Engine(engine) => match engine {
                EngineError::NotFound(_) => (Status::NotFound, "NOT_FOUND", "Job not found".into()),
                EngineError::DocumentNotFound(_) => {
                    (Status::NotFound, "DOCUMENT_NOT_FOUND", engine.to_string())
                }
                EngineError::InvalidRequest { .. } => {
                    (Status::BadRequest, "INVALID_REQUEST", engine.to_string())
                }
                EngineError::AlreadyStarted | EngineError::Io(_) | EngineError::Json(_) => {
                    error!(error = %engine, "internal engine error");
                    (
                        Status::InternalServerError,
                        "INTERNAL_ERROR",
                        "An internal error occurred".into(),
                    )
                }
            },
        }
    }
}

pub fn error_body(code: &str, message: &str) -> Json<ErrorResponse> {
    Json(ErrorResponse {
        error: message.to_string(),
        code: code.to_string(),
    })
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, request: &'r Request<'_>) -> response::Result<'static> {
        let (status, code, message) = self.classify();
        status::Custom(status, error_body(code, &message)).respond_to(request)
    }
}

#[catch(400)]
pub fn bad_request() -> Json<ErrorResponse> {
    error_body("BAD_REQUEST", "Malformed request")
}

#[catch(404)]
pub fn not_found() -> Json<ErrorResponse> {
    error_body("NOT_FOUND", "Not found")
}

#[catch(422)]
pub fn unprocessable() -> Json<ErrorResponse> {
    error_body("BAD_REQUEST", "Invalid request body")
}

#[catch(500)]
pub fn internal_error() -> Json<ErrorResponse> {
    error_body("INTERNAL_ERROR", "An internal error occurred")
}
