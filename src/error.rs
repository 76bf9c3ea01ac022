//! Gate errors and the plain-text diagnostic responses built from them

use crate::output::render_failure;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::time::Duration;
use thiserror::Error;

/// Header carrying the machine-readable error code on gate failures
pub const X_DEVGATE_ERROR: &str = "x-devgate-error";

/// Everything that can end a gated request without a backend response
#[derive(Debug, Error)]
pub enum GateError {
    /// The staleness check could not be run at all. Treated as "stale".
    #[error("staleness check could not be run: {0}")]
    StaleCheck(#[source] std::io::Error),

    /// The build command ran and exited unsuccessfully
    #[error("build command failed ({status})")]
    Build {
        status: String,
        /// Combined stdout/stderr of the build
        output: Vec<u8>,
    },

    /// The build command could not be launched
    #[error("build command could not be launched: {0}")]
    BuildLaunch(#[source] std::io::Error),

    /// The run command could not be launched
    #[error("backend could not be started: {0}")]
    Start(#[source] std::io::Error),

    /// Start was called while a backend was still live
    #[error("can't start backend, already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    /// The backend terminated before it ever answered a probe
    #[error("backend exited before answering a health probe ({0})")]
    ProcessExitedEarly(String),

    /// The probe budget ran out without an answer or an observed exit
    #[error("backend did not answer after {attempts} probes ({}ms)", waited.as_millis())]
    HealthTimeout { attempts: u32, waited: Duration },

    /// The reload task panicked or was cancelled by runtime shutdown
    #[error("reload did not complete: {0}")]
    ReloadAborted(String),

    /// The relay failed after the backend had been reported healthy
    #[error("relay to backend failed: {0}")]
    Relay(String),
}

impl GateError {
    pub fn code(&self) -> GateErrorCode {
        match self {
            GateError::StaleCheck(_) => GateErrorCode::StaleCheckFailed,
            GateError::Build { .. } | GateError::BuildLaunch(_) => GateErrorCode::BuildFailed,
            GateError::Start(_) => GateErrorCode::StartFailed,
            GateError::AlreadyRunning { .. } => GateErrorCode::AlreadyRunning,
            GateError::ProcessExitedEarly(_) => GateErrorCode::ProcessExited,
            GateError::HealthTimeout { .. } => GateErrorCode::HealthTimeout,
            GateError::ReloadAborted(_) => GateErrorCode::ReloadAborted,
            GateError::Relay(_) => GateErrorCode::RelayFailed,
        }
    }
}

/// Error codes reported in the `X-Devgate-Error` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateErrorCode {
    StaleCheckFailed,
    BuildFailed,
    StartFailed,
    AlreadyRunning,
    ProcessExited,
    HealthTimeout,
    ReloadAborted,
    RelayFailed,
}

impl GateErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GateErrorCode::RelayFailed => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_header_value(&self) -> &'static str {
        match self {
            GateErrorCode::StaleCheckFailed => "STALE_CHECK_FAILED",
            GateErrorCode::BuildFailed => "BUILD_FAILED",
            GateErrorCode::StartFailed => "START_FAILED",
            GateErrorCode::AlreadyRunning => "ALREADY_RUNNING",
            GateErrorCode::ProcessExited => "PROCESS_EXITED",
            GateErrorCode::HealthTimeout => "HEALTH_TIMEOUT",
            GateErrorCode::ReloadAborted => "RELOAD_ABORTED",
            GateErrorCode::RelayFailed => "RELAY_FAILED",
        }
    }
}

/// Create a text/plain failure response carrying the captured backend output
pub fn diagnostic_response(
    code: GateErrorCode,
    message: &str,
    diagnostics: &[u8],
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = render_failure(message, diagnostics);

    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(X_DEVGATE_ERROR, code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            GateErrorCode::BuildFailed.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GateErrorCode::HealthTimeout.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GateErrorCode::RelayFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GateError::ReloadAborted("task panicked".to_string()).code().as_header_value(),
            "RELOAD_ABORTED"
        );
    }

    #[test]
    fn test_build_error_message_excludes_output() {
        let err = GateError::Build {
            status: "exit status: 1".to_string(),
            output: b"syntax error".to_vec(),
        };
        assert_eq!(err.to_string(), "build command failed (exit status: 1)");
        assert_eq!(err.code(), GateErrorCode::BuildFailed);
    }

    #[test]
    fn test_health_timeout_message() {
        let err = GateError::HealthTimeout {
            attempts: 5,
            waited: Duration::from_millis(52),
        };
        assert_eq!(err.to_string(), "backend did not answer after 5 probes (52ms)");
    }

    #[tokio::test]
    async fn test_diagnostic_response() {
        let response = diagnostic_response(
            GateErrorCode::ProcessExited,
            "backend exited",
            b"panic: boom\n",
        );

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get(X_DEVGATE_ERROR).unwrap(),
            "PROCESS_EXITED"
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(
            &body[..],
            b"backend exited\n\nBEGIN backend output:\npanic: boom\n\nEND"
        );
    }
}
