// All public facing errors are ErrorResponse
// All internal API errors map to PlatformError
// PlatformError maps to ErrorResponse

use actix_web::{
    http::StatusCode,
    web::{JsonConfig, QueryConfig},
    HttpResponse, ResponseError,
};
use google_cloud_storage::http::Error as GcsError;
use serde::ser::SerializeMap;
use serde::Serialize;
use thiserror::Error;

use crate::types::{MalformedTaskId, UnknownDatabase};

/// Failures talking to a queue, scheduler, blob store or secret store.
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("HTTP error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Received error status code ({code}): {message}")]
    FailureResponseCode { code: u16, message: String },

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Google Cloud Storage error: {0}")]
    GcsError(#[from] GcsError),

    #[error("Failed to sign url: {0}")]
    SignedUrl(String),

    #[error("Failed to obtain access token: {0}")]
    Token(String),

    #[error("Serde error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("Decode error: {0}")]
    DecodeError(#[from] base64::DecodeError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl AdapterError {
    pub fn is_not_found(&self) -> bool {
        match self {
            AdapterError::NotFound(_) => true,
            AdapterError::FailureResponseCode { code, .. } => *code == 404,
            AdapterError::GcsError(GcsError::Response(e)) => e.code == 404,
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("{0}")]
    NotAuthorized(String),
}

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("{0}")]
    AuthError(#[from] AuthError),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("NotFoundError: {0}")]
    NotFoundError(String),
    #[error("Failed to publish backup trigger: {0}")]
    PublishError(#[source] AdapterError),
    #[error("Failed to schedule backup task: {0}")]
    SchedulingError(#[source] AdapterError),
    #[error("Blob storage error: {0}")]
    StorageError(#[source] AdapterError),
    #[error("Serde error: {0}")]
    SerdeError(#[from] serde_json::Error),
}

impl From<UnknownDatabase> for PlatformError {
    fn from(e: UnknownDatabase) -> Self {
        PlatformError::InvalidArgument(e.to_string())
    }
}

impl From<MalformedTaskId> for PlatformError {
    fn from(e: MalformedTaskId) -> Self {
        PlatformError::InvalidArgument(e.to_string())
    }
}

// PUBLIC FACING ERROR RESPONSES
#[derive(Error, Debug)]
pub enum ErrorResponse {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    NotAuthorized(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    InternalServerError(String),
}

impl Serialize for ErrorResponse {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let variant_str = format!("{}", self);
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("success", &false)?;
        map.serialize_entry("message", &variant_str)?;
        map.serialize_entry("error", &variant_str)?;
        map.end()
    }
}

impl ResponseError for PlatformError {
    fn error_response(&self) -> HttpResponse {
        let resp = match self {
            PlatformError::AuthError(_) => ErrorResponse::NotAuthorized(self.to_string()),
            PlatformError::NotFoundError(_) => ErrorResponse::NotFound(self.to_string()),
            PlatformError::InvalidArgument(_) => ErrorResponse::BadRequest(self.to_string()),
            PlatformError::PublishError(_) => ErrorResponse::InternalServerError(
                "Failed to publish backup trigger. Please retry later".to_string(),
            ),
            PlatformError::SchedulingError(_) => ErrorResponse::InternalServerError(
                "Failed to schedule backup task. Please retry later".to_string(),
            ),
            _ => ErrorResponse::InternalServerError(
                "Internal Server Error. Please contact support".to_string(),
            ),
        };
        HttpResponse::build(self.status_code()).json(resp)
    }

    fn status_code(&self) -> StatusCode {
        match *self {
            PlatformError::AuthError(_) => StatusCode::UNAUTHORIZED,
            PlatformError::NotFoundError(_) => StatusCode::NOT_FOUND,
            PlatformError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            _ => {
                log::error!("Internal Server Error: {:?}", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

pub fn make_json_config() -> JsonConfig {
    use actix_web::error::InternalError;

    JsonConfig::default().error_handler(|error, _request| {
        let response =
            HttpResponse::BadRequest().json(ErrorResponse::BadRequest(error.to_string()));
        InternalError::from_response(error, response).into()
    })
}

pub fn make_query_config() -> QueryConfig {
    use actix_web::error::InternalError;

    QueryConfig::default().error_handler(|error, _request| {
        let response =
            HttpResponse::BadRequest().json(ErrorResponse::BadRequest(error.to_string()));
        InternalError::from_response(error, response).into()
    })
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(String),
    #[error("invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

pub type SshResult<T> = Result<T, RemoteError>;

/// Failures of a remote shell session.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Failed to create ssh session with {address}: {error}")]
    SessionError { address: String, error: ssh2::Error },

    #[error("Failed to connect to instance {address}: {error}")]
    ConnectionError {
        address: String,
        error: std::io::Error,
    },

    #[error("Remote execution on {address} returned exit code ({code}): {message}")]
    NonZeroExitCode {
        address: String,
        code: i32,
        message: String,
    },

    #[error("Remote command on {address} still running after {after:?}")]
    CommandTimeout {
        address: String,
        after: std::time::Duration,
    },

    #[error("Remote session task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Fatal failures of one worker invocation.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to fetch remote host credentials: {0}")]
    CredentialError(#[source] AdapterError),

    #[error("failed to open remote session: {0}")]
    ConnectionError(#[source] RemoteError),

    #[error("remote command failed: {0}")]
    RemoteCommandError(#[source] RemoteError),

    #[error("snapshot {snapshot} not ready after {attempts} attempts")]
    SnapshotTimeoutError { snapshot: String, attempts: u32 },

    #[error("failed to upload {key}: {error}")]
    UploadError {
        key: String,
        #[source]
        error: AdapterError,
    },

    #[error("unexpected response from {0}")]
    UnexpectedResponse(String),

    #[error("worker for {expected} received a message for {received}")]
    WrongDatabase {
        expected: crate::types::DatabaseKind,
        received: crate::types::DatabaseKind,
    },
}
