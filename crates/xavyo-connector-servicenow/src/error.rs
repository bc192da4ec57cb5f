//! Error types for the ServiceNow connector.

use thiserror::Error;

use crate::resource::ResourceType;

/// Result type alias using `ServiceNowError`.
pub type ServiceNowResult<T> = Result<T, ServiceNowError>;

/// Errors that can occur when talking to ServiceNow.
#[derive(Debug, Error)]
pub enum ServiceNowError {
    /// Configuration validation error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Non-2xx response from the instance.
    #[error("ServiceNow API error: {status} - {message}")]
    Status { status: u16, message: String },

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parsing error.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// Response body did not have the expected shape.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Page token could not be decoded.
    #[error("Invalid page token: {0}")]
    InvalidCursor(String),

    /// Page token was issued for another resource.
    #[error("Page token belongs to {found}, expected {expected}")]
    CursorMismatch { expected: String, found: String },

    /// Principal type cannot hold the requested entitlement.
    #[error("{principal_type} principals cannot be granted {operation}")]
    InvalidPrincipal {
        principal_type: ResourceType,
        operation: &'static str,
    },

    /// A required identifier was empty.
    #[error("Missing required id: {0}")]
    MissingId(&'static str),

    /// Entitlement id is not of the form `<type>:<id>:<slug>`.
    #[error("Invalid entitlement id: {0}")]
    InvalidEntitlement(String),

    /// Revocation stopped after some records were already deleted.
    #[error("Revoke failed after removing {removed} record(s), {remaining} left: {source}")]
    PartialRevoke {
        removed: usize,
        remaining: usize,
        #[source]
        source: Box<ServiceNowError>,
    },

    /// Account profile is missing a required attribute.
    #[error("Invalid account profile: {0}")]
    InvalidProfile(String),

    /// Ticket request does not satisfy its schema.
    #[error("Invalid ticket: {0}")]
    InvalidTicket(String),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// The configured account lacks a capability the connector needs.
    #[error("current user is not able to {capability}: {source}")]
    Capability {
        capability: &'static str,
        #[source]
        source: Box<ServiceNowError>,
    },
}

impl ServiceNowError {
    /// Creates a status error from a response status and body.
    pub fn status(status: reqwest::StatusCode, message: impl Into<String>) -> Self {
        ServiceNowError::Status {
            status: status.as_u16(),
            message: message.into(),
        }
    }

    /// Returns the HTTP status carried by this error, if any.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            ServiceNowError::Status { status, .. } => Some(*status),
            ServiceNowError::Http(e) => e.status().map(|s| s.as_u16()),
            ServiceNowError::PartialRevoke { source, .. }
            | ServiceNowError::Capability { source, .. } => source.http_status(),
            _ => None,
        }
    }

    /// Returns true for a 404 response.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ServiceNowError::NotFound(_)) || self.http_status() == Some(404)
    }

    /// Check if this error is transient and the caller may retry.
    ///
    /// Rate limiting, server-side failures and transport errors are
    /// transient. The connector never retries on its own.
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceNowError::Status { status, .. } => *status == 429 || *status >= 500,
            ServiceNowError::Http(e) => {
                e.is_timeout() || e.is_connect() || e.status().is_some_and(|s| s.is_server_error())
            }
            ServiceNowError::PartialRevoke { source, .. }
            | ServiceNowError::Capability { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Returns true when the error was raised before any request was sent.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            ServiceNowError::InvalidPrincipal { .. }
                | ServiceNowError::MissingId(_)
                | ServiceNowError::InvalidEntitlement(_)
                | ServiceNowError::InvalidCursor(_)
                | ServiceNowError::CursorMismatch { .. }
                | ServiceNowError::InvalidProfile(_)
                | ServiceNowError::InvalidTicket(_)
        )
    }

    /// Get an error code for classification.
    pub fn error_code(&self) -> &'static str {
        match self {
            ServiceNowError::Config(_) => "INVALID_CONFIG",
            ServiceNowError::Status { .. } => "API_STATUS",
            ServiceNowError::Http(_) => "NETWORK_ERROR",
            ServiceNowError::Json(_) | ServiceNowError::Decode(_) => "DECODE_ERROR",
            ServiceNowError::Url(_) => "INVALID_URL",
            ServiceNowError::InvalidCursor(_) => "INVALID_PAGE_TOKEN",
            ServiceNowError::CursorMismatch { .. } => "PAGE_TOKEN_MISMATCH",
            ServiceNowError::InvalidPrincipal { .. } => "INVALID_PRINCIPAL",
            ServiceNowError::MissingId(_) => "MISSING_ID",
            ServiceNowError::InvalidEntitlement(_) => "INVALID_ENTITLEMENT",
            ServiceNowError::PartialRevoke { .. } => "PARTIAL_REVOKE",
            ServiceNowError::InvalidProfile(_) => "INVALID_PROFILE",
            ServiceNowError::InvalidTicket(_) => "INVALID_TICKET",
            ServiceNowError::NotFound(_) => "NOT_FOUND",
            ServiceNowError::Capability { .. } => "CAPABILITY_MISSING",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_statuses() {
        let rate_limited = ServiceNowError::Status {
            status: 429,
            message: "Too Many Requests".into(),
        };
        let unavailable = ServiceNowError::Status {
            status: 503,
            message: "Service Unavailable".into(),
        };
        let forbidden = ServiceNowError::Status {
            status: 403,
            message: "Forbidden".into(),
        };

        assert!(rate_limited.is_transient());
        assert!(unavailable.is_transient());
        assert!(!forbidden.is_transient());
        assert_eq!(forbidden.http_status(), Some(403));
    }

    #[test]
    fn test_partial_revoke_keeps_source_status() {
        let err = ServiceNowError::PartialRevoke {
            removed: 1,
            remaining: 1,
            source: Box::new(ServiceNowError::Status {
                status: 502,
                message: "Bad Gateway".into(),
            }),
        };

        assert_eq!(err.http_status(), Some(502));
        assert!(err.is_transient());
        assert_eq!(err.error_code(), "PARTIAL_REVOKE");
        assert!(err.to_string().contains("removing 1 record(s), 1 left"));
    }

    #[test]
    fn test_precondition_errors() {
        let err = ServiceNowError::InvalidPrincipal {
            principal_type: ResourceType::Role,
            operation: "role membership",
        };
        assert!(err.is_precondition());
        assert_eq!(
            err.to_string(),
            "role principals cannot be granted role membership"
        );
        assert!(ServiceNowError::MissingId("principal").is_precondition());
        assert!(!ServiceNowError::Decode("x".into()).is_precondition());
    }

    #[test]
    fn test_not_found() {
        let err = ServiceNowError::Status {
            status: 404,
            message: "No Record found".into(),
        };
        assert!(err.is_not_found());
        assert!(ServiceNowError::NotFound("user".into()).is_not_found());
    }
}
