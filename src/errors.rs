use std::time::Duration;
use thiserror::Error;

/// Failure reported by one of the provider services.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("{operation} throttled by provider: {message}")]
    Throttled { operation: String, message: String },
    #[error("{operation} failed, provider unavailable: {message}")]
    Unavailable { operation: String, message: String },
    #[error("{operation}: {resource} not found")]
    NotFound { operation: String, resource: String },
    #[error("{operation}: {resource} already exists")]
    AlreadyExists { operation: String, resource: String },
    #[error("{operation} rejected: {message}")]
    Rejected { operation: String, message: String },
    #[error("{operation} not allowed in current state: {message}")]
    InvalidState { operation: String, message: String },
}

impl ProviderError {
    pub fn throttled(operation: &str, message: impl Into<String>) -> Self {
        ProviderError::Throttled {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    pub fn unavailable(operation: &str, message: impl Into<String>) -> Self {
        ProviderError::Unavailable {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    pub fn not_found(operation: &str, resource: impl Into<String>) -> Self {
        ProviderError::NotFound {
            operation: operation.to_string(),
            resource: resource.into(),
        }
    }

    pub fn already_exists(operation: &str, resource: impl Into<String>) -> Self {
        ProviderError::AlreadyExists {
            operation: operation.to_string(),
            resource: resource.into(),
        }
    }

    pub fn rejected(operation: &str, message: impl Into<String>) -> Self {
        ProviderError::Rejected {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    pub fn invalid_state(operation: &str, message: impl Into<String>) -> Self {
        ProviderError::InvalidState {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    /// Rate limiting and service blips are retried inside the harnesses.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Throttled { .. } | ProviderError::Unavailable { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound { .. })
    }
}

/// Errors that decide a run's verdict.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("stack {stack_name} failed to provision: {reported_status}{}", fmt_reason(.reason))]
    StackProvisioning {
        stack_name: String,
        reported_status: String,
        reason: Option<String>,
    },
    #[error("document {document_name} registration failed with status {reported_status}")]
    DocumentCreation {
        document_name: String,
        reported_status: String,
    },
    #[error("{operation} did not finish within {timeout:?} (last status: {last_status})")]
    ExecutionTimeout {
        operation: String,
        timeout: Duration,
        last_status: String,
    },
    #[error("{context}: expected {expected}, observed {observed}{}", fmt_reason(.detail))]
    UnexpectedStatus {
        context: String,
        expected: String,
        observed: String,
        detail: Option<String>,
    },
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("stack {stack_name} has no output named {key}")]
    MissingOutput { stack_name: String, key: String },
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("workflow body panicked: {0}")]
    Panicked(String),
}

fn fmt_reason(reason: &Option<String>) -> String {
    match reason {
        Some(r) => format!(" ({r})"),
        None => String::new(),
    }
}

/// Non-fatal cleanup failure. Logged and collected, never the verdict.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("teardown of {resource} failed: {source}")]
pub struct TeardownError {
    pub resource: String,
    #[source]
    pub source: ProviderError,
}

impl TeardownError {
    pub fn new(resource: impl Into<String>, source: ProviderError) -> Self {
        Self {
            resource: resource.into(),
            source,
        }
    }
}

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;
