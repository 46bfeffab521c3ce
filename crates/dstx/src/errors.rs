//! 💀 Errors: every way a payload can fail on its way to a partner API.
//!
//! The library speaks `thiserror` enums so callers can match on what went wrong.
//! Config loading and the CLI sit on `anyhow` and only ever print these.
//!
//! Status conventions:
//! - mapping shape and payload validation failures are 400 and never retried
//! - `InvalidAuthentication` is 401, the one status the destination may recover from
//! - anything without a status of its own reports 500
//!
//! 💀 Every variant here is a small obituary. Read them carefully, they usually say exactly
//! which field died and where.

use std::fmt;

use thiserror::Error;

use crate::request_client::{RequestOptions, RequestSnapshot, Response};

pub const INVALID_AUTHENTICATION: &str = "INVALID_AUTHENTICATION";
pub const PAYLOAD_VALIDATION_FAILED: &str = "PAYLOAD_VALIDATION_FAILED";
pub const RETRYABLE_ERROR: &str = "RETRYABLE_ERROR";
pub const UNKNOWN_ERROR: &str = "UNKNOWN_ERROR";
pub const NOT_IMPLEMENTED: &str = "NotImplemented";

/// 📍 One problem, pinned to where it happened.
///
/// `path` is the stack of keys and indices from the root, so `["products", "0", "price"]`
/// renders as `/products/0/price`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub path: Vec<String>,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(path: &[String], message: impl Into<String>) -> Self {
        Self {
            path: path.to_vec(),
            message: message.into(),
        }
    }

    /// JSON-pointer-ish rendering of `path`. The root is `/`.
    pub fn pointer(&self) -> String {
        format!("/{}", self.path.join("/"))
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}.", self.pointer(), self.message)
    }
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

/// 🧱 A mapping that is shaped wrong before any payload ever touches it.
///
/// Sibling errors are collected, not short-circuited, so one bad mapping reports all of its
/// problems at once.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", join_issues(.issues))]
pub struct MappingValidationError {
    pub issues: Vec<ValidationIssue>,
}

/// 🔄 Failures while resolving a mapping against a payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error(transparent)]
    Invalid(#[from] MappingValidationError),
    #[error("payload must be an object but it is {0}")]
    PayloadNotObject(&'static str),
    #[error("{0} is not a valid directive")]
    UnknownDirective(String),
    #[error("{directive}: {message}")]
    Directive {
        directive: &'static str,
        message: String,
    },
}

/// 📐 Aggregate of every JSON Schema violation found in one payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct SchemaValidationError {
    pub message: String,
    pub issues: Vec<ValidationIssue>,
}

impl SchemaValidationError {
    pub fn from_issues(issues: Vec<ValidationIssue>) -> Self {
        let message = issues
            .iter()
            .map(|issue| issue.message.clone())
            .collect::<Vec<_>>()
            .join(" ");
        Self { message, issues }
    }
}

/// 📡 Failures raised by the request client.
///
/// `Http` and `Timeout` carry the request and options that produced them so whoever catches
/// the error can log exactly what was sent.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("{}", .response.status_text)]
    Http {
        response: Box<Response>,
        request: Box<RequestSnapshot>,
        options: Box<RequestOptions>,
    },
    #[error("Request timed out")]
    Timeout {
        request: Box<RequestSnapshot>,
        options: Box<RequestOptions>,
    },
    #[error("Request was aborted")]
    Aborted { request: Box<RequestSnapshot> },
    #[error("💀 invalid request: {0}")]
    InvalidRequest(String),
    #[error("💀 the request never made it out: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("💀 request hook failed: {0}")]
    Hook(String),
}

impl RequestError {
    pub fn response(&self) -> Option<&Response> {
        match self {
            RequestError::Http { response, .. } => Some(response),
            _ => None,
        }
    }
}

/// 🎯 Everything an action or destination call can fail with.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    SchemaValidation(#[from] SchemaValidationError),
    #[error("{message}")]
    Integration {
        message: String,
        code: String,
        status: u16,
    },
    #[error("{message}")]
    InvalidAuthentication { message: String, code: String },
    #[error("{message}")]
    Retryable { message: String, status: u16 },
    #[error(transparent)]
    Request(#[from] RequestError),
}

impl From<MappingValidationError> for ActionError {
    fn from(err: MappingValidationError) -> Self {
        ActionError::Mapping(MappingError::Invalid(err))
    }
}

impl ActionError {
    pub fn integration(message: impl Into<String>, code: impl Into<String>, status: u16) -> Self {
        ActionError::Integration {
            message: message.into(),
            code: code.into(),
            status,
        }
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::integration(message, NOT_IMPLEMENTED, 501)
    }

    pub fn invalid_authentication(message: impl Into<String>) -> Self {
        ActionError::InvalidAuthentication {
            message: message.into(),
            code: INVALID_AUTHENTICATION.to_string(),
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        ActionError::Retryable {
            message: message.into(),
            status: 500,
        }
    }

    /// Own status first, then the response status, then 500.
    pub fn status(&self) -> u16 {
        match self {
            ActionError::Mapping(_) | ActionError::SchemaValidation(_) => 400,
            ActionError::Integration { status, .. } | ActionError::Retryable { status, .. } => {
                *status
            }
            ActionError::InvalidAuthentication { .. } => 401,
            ActionError::Request(err) => err.response().map(|r| r.status).unwrap_or(500),
        }
    }

    pub fn code(&self) -> String {
        match self {
            ActionError::Mapping(_) => error_code_for_status(400).to_string(),
            ActionError::SchemaValidation(_) => PAYLOAD_VALIDATION_FAILED.to_string(),
            ActionError::Integration { code, .. } | ActionError::InvalidAuthentication { code, .. } => {
                code.clone()
            }
            ActionError::Retryable { .. } => RETRYABLE_ERROR.to_string(),
            ActionError::Request(RequestError::Aborted { .. }) => "CANCELLED".to_string(),
            ActionError::Request(err) => match err.response() {
                Some(response) => error_code_for_status(response.status).to_string(),
                None => UNKNOWN_ERROR.to_string(),
            },
        }
    }
}

/// 🗺️ Standard error code for an HTTP status. Unmapped statuses are `UNKNOWN_ERROR`.
pub fn error_code_for_status(status: u16) -> &'static str {
    match status {
        100 => "CONTINUE",
        101 => "SWITCHING_PROTOCOLS",
        102 => "PROCESSING",
        103 => "EARLY_HINTS",
        200 => "OK",
        201 => "CREATED",
        202 => "ACCEPTED",
        203 => "NON_AUTHORITATIVE_INFORMATION",
        204 => "NO_CONTENT",
        205 => "RESET_CONTENT",
        206 => "PARTIAL_CONTENT",
        207 => "MULTI_STATUS",
        208 => "ALREADY_REPORTED",
        226 => "IM_USED",
        300 => "MULTIPLE_CHOICES",
        301 => "MOVED_PERMENANTLY",
        302 => "FOUND",
        303 => "SEE_OTHER",
        304 => "NOT_MODIFIED",
        305 => "USE_PROXY",
        306 => "SWITCH_PROXY",
        307 => "TEMPORARY_REDIRECT",
        308 => "PERMANENT_REDIRECT",
        400 => "BAD_REQUEST",
        401 => "UNAUTHORIZED",
        402 => "PAYMENT_REQUIRED",
        403 => "FORBIDDEN",
        404 => "NOT_FOUND",
        405 => "METHOD_NOT_ALLOWED",
        406 => "NOT_ACCEPTABLE",
        407 => "PROXY_AUTHENTICATION_REQUIRED",
        408 => "REQUEST_TIMEOUT",
        409 => "CONFLICT",
        410 => "GONE",
        411 => "LENGTH_REQUIRED",
        412 => "PRECONDITION_FAILED",
        413 => "PAYLOAD_TOO_LARGE",
        414 => "URI_TOO_LONG",
        415 => "UNSUPPORTED_MEDIA_TYPE",
        416 => "RANGE_NOT_SATISFIABLE",
        417 => "EXPECTATION_FAILED",
        418 => "IM_A_TEAPOT",
        421 => "MISDIRECTED_REQUEST",
        422 => "UNPROCESSABLE_ENTITY",
        423 => "LOCKED",
        424 => "FAILED_DEPENDENCY",
        425 => "TOO_EARLY",
        426 => "UPGRADE_REQUIRED",
        428 => "PRECONDITION_REQUIRED",
        429 => "TOO_MANY_REQUESTS",
        431 => "REQUEST_HEADER_FIELDS_TOO_LARGE",
        451 => "UNAVAILABLE_FOR_LEGAL_REASONS",
        499 => "CANCELLED",
        500 => "INTERNAL_SERVER_ERROR",
        501 => "NOT_IMPLEMENTED",
        502 => "BAD_GATEWAY",
        503 => "SERVICE_UNAVAILABLE",
        504 => "GATEWAY_TIMEOUT",
        505 => "HTTP_VERSION_NOT_SUPPORTED",
        506 => "VARIANT_ALSO_NEGOTIATES",
        507 => "INSUFFICIENT_STORAGE",
        508 => "LOOP_DETECTED",
        509 => "BANDWIDTH_LIMIT_EXCEEDED",
        510 => "NOT_EXTENDED",
        511 => "NETWORK_AUTHENTICATION_REQUIRED",
        529 => "SITE_IS_OVERLOADED",
        _ => UNKNOWN_ERROR,
    }
}
