use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unsafe path: {0}")]
    UnsafePath(String),
    #[error("path escapes repository root")]
    PathEscape,
    #[error("{0} not found")]
    NotFound(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("server misconfigured: {0}")]
    Config(String),
    #[error("per-user session limit reached")]
    PerUserLimit,
    #[error("server session capacity reached")]
    GlobalLimit,
    #[error("branch '{0}' does not exist")]
    BranchMissing(String),
    #[error("branch '{0}' already exists")]
    BranchExists(String),
    #[error("invalid branch name: {0}")]
    InvalidBranchName(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("file exceeds the configured size limit")]
    FileTooLarge,
    #[error("not a git repository")]
    NotAGitRepo,
    #[error("git operation failed")]
    Git(#[from] git2::Error),
    #[error("io error")]
    Io(#[from] std::io::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::UnsafePath(_)
            | GatewayError::PathEscape
            | GatewayError::InvalidBranchName(_)
            | GatewayError::InvalidRequest(_)
            | GatewayError::FileTooLarge
            | GatewayError::NotAGitRepo
            | GatewayError::BranchMissing(_) => StatusCode::BAD_REQUEST,
            GatewayError::BranchExists(_) => StatusCode::CONFLICT,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden => StatusCode::FORBIDDEN,
            GatewayError::PerUserLimit => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::GlobalLimit => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Config(_)
            | GatewayError::Git(_)
            | GatewayError::Io(_)
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::UnsafePath(_) => "UNSAFE_PATH",
            GatewayError::PathEscape => "PATH_ESCAPE",
            GatewayError::NotFound(_) => "NOT_FOUND",
            GatewayError::Unauthorized => "UNAUTHORIZED",
            GatewayError::Forbidden => "FORBIDDEN",
            GatewayError::Config(_) => "CONFIG_ERROR",
            GatewayError::PerUserLimit => "MAX_SESSIONS_PER_USER",
            GatewayError::GlobalLimit => "SERVER_MAX_CAPACITY",
            GatewayError::BranchMissing(_) => "BRANCH_MISSING",
            GatewayError::BranchExists(_) => "BRANCH_EXISTS",
            GatewayError::InvalidBranchName(_) => "INVALID_BRANCH_NAME",
            GatewayError::InvalidRequest(_) => "BAD_REQUEST",
            GatewayError::FileTooLarge => "FILE_TOO_LARGE",
            GatewayError::NotAGitRepo => "NOT_A_GIT_REPO",
            GatewayError::Git(_) => "GIT_ERROR",
            GatewayError::Io(_) => "IO_ERROR",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Message safe to hand back to the HTTP caller. Internal details stay in
    /// the log.
    fn public_message(&self) -> String {
        match self {
            GatewayError::Git(e) => {
                tracing::warn!("git error surfaced to caller: {e}");
                "git operation failed".to_string()
            }
            GatewayError::Io(e) => {
                tracing::warn!("io error surfaced to caller: {e}");
                "filesystem operation failed".to_string()
            }
            GatewayError::Internal(e) => {
                tracing::error!("internal error surfaced to caller: {e}");
                "internal error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            code: self.code().to_string(),
            message: self.public_message(),
        };
        (status, Json(body)).into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
