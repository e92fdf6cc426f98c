//! Error types for the DRP provider.

use thiserror::Error;

/// Errors raised while serving the provider or talking to DRP.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The requested object was not found on the DRP server.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// The configuration or state failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An internal provider error occurred.
    #[error("SDK error: {0}")]
    Sdk(String),

    /// The provider is not configured, or its configuration is unusable.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The requested resource type is unknown.
    #[error("Unknown resource type: {0}")]
    UnknownResource(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A gRPC transport error occurred.
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// The HTTP request to DRP could not be completed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// DRP answered with an error status not covered by a dedicated variant.
    #[error("DRP API error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Messages from the DRP error body.
        message: String,
    },

    /// Sealing a secure value failed.
    #[error("Encryption error: {0}")]
    Crypto(String),

    /// Object already exists (create conflict).
    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    /// Authentication or authorization failure.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Rate limit exceeded.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// DRP is temporarily unavailable.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Waiting for a remote state change timed out.
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// The remote object is in a state the operation cannot handle.
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    /// Operation not implemented.
    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    /// Malformed request from the host.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ProviderError {
    /// Map a non-success HTTP status from DRP onto an error variant.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => Self::PermissionDenied(message),
            404 => Self::NotFound(message),
            409 => Self::AlreadyExists(message),
            429 => Self::ResourceExhausted(message),
            502..=504 => Self::Unavailable(message),
            _ => Self::Api { status, message },
        }
    }

    /// Whether this error means the remote object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Get the error message as a string.
    pub fn message(&self) -> &str {
        match self {
            Self::NotFound(msg)
            | Self::Validation(msg)
            | Self::Sdk(msg)
            | Self::Configuration(msg)
            | Self::UnknownResource(msg)
            | Self::Crypto(msg)
            | Self::AlreadyExists(msg)
            | Self::PermissionDenied(msg)
            | Self::ResourceExhausted(msg)
            | Self::Unavailable(msg)
            | Self::DeadlineExceeded(msg)
            | Self::FailedPrecondition(msg)
            | Self::Unimplemented(msg)
            | Self::InvalidRequest(msg) => msg,
            Self::Api { message, .. } => message,
            Self::Serialization(_err) => "serialization error (see Debug output)",
            Self::Transport(_err) => "transport error (see Debug output)",
            Self::Http(_err) => "http error (see Debug output)",
        }
    }
}

impl From<ProviderError> for tonic::Status {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NotFound(msg) => tonic::Status::not_found(msg),
            ProviderError::Validation(msg) => tonic::Status::invalid_argument(msg),
            ProviderError::Configuration(msg) => tonic::Status::failed_precondition(msg),
            ProviderError::UnknownResource(msg) => tonic::Status::not_found(msg),
            ProviderError::Sdk(msg) => tonic::Status::internal(msg),
            ProviderError::Crypto(msg) => tonic::Status::internal(msg),
            ProviderError::Serialization(err) => {
                tonic::Status::invalid_argument(format!("Serialization error: {}", err))
            },
            ProviderError::Transport(err) => {
                tonic::Status::unavailable(format!("Transport error: {}", err))
            },
            ProviderError::Http(err) => tonic::Status::unavailable(format!("HTTP error: {}", err)),
            ProviderError::Api { status, message } => {
                tonic::Status::unknown(format!("DRP API error ({}): {}", status, message))
            },
            ProviderError::AlreadyExists(msg) => tonic::Status::already_exists(msg),
            ProviderError::PermissionDenied(msg) => tonic::Status::permission_denied(msg),
            ProviderError::ResourceExhausted(msg) => tonic::Status::resource_exhausted(msg),
            ProviderError::Unavailable(msg) => tonic::Status::unavailable(msg),
            ProviderError::DeadlineExceeded(msg) => tonic::Status::deadline_exceeded(msg),
            ProviderError::FailedPrecondition(msg) => tonic::Status::failed_precondition(msg),
            ProviderError::Unimplemented(msg) => tonic::Status::unimplemented(msg),
            ProviderError::InvalidRequest(msg) => tonic::Status::invalid_argument(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProviderError::NotFound("pools/edge".to_string());
        assert_eq!(format!("{}", err), "Resource not found: pools/edge");

        let err = ProviderError::Api {
            status: 422,
            message: "Invalid Workflow".to_string(),
        };
        assert_eq!(format!("{}", err), "DRP API error (422): Invalid Workflow");

        let err = ProviderError::UnknownResource("drp_stage".to_string());
        assert_eq!(format!("{}", err), "Unknown resource type: drp_stage");
    }

    #[test]
    fn test_from_status() {
        assert!(ProviderError::from_status(404, "gone").is_not_found());
        assert!(matches!(
            ProviderError::from_status(401, "nope"),
            ProviderError::PermissionDenied(_)
        ));
        assert!(matches!(
            ProviderError::from_status(403, "nope"),
            ProviderError::PermissionDenied(_)
        ));
        assert!(matches!(
            ProviderError::from_status(409, "dup"),
            ProviderError::AlreadyExists(_)
        ));
        assert!(matches!(
            ProviderError::from_status(503, "busy"),
            ProviderError::Unavailable(_)
        ));
        assert!(matches!(
            ProviderError::from_status(500, "boom"),
            ProviderError::Api { status: 500, .. }
        ));
    }

    #[test]
    fn test_error_to_status() {
        let status: tonic::Status = ProviderError::NotFound("test".to_string()).into();
        assert_eq!(status.code(), tonic::Code::NotFound);

        let status: tonic::Status = ProviderError::Validation("test".to_string()).into();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status: tonic::Status = ProviderError::Configuration("test".to_string()).into();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);

        let status: tonic::Status = ProviderError::DeadlineExceeded("test".to_string()).into();
        assert_eq!(status.code(), tonic::Code::DeadlineExceeded);

        let status: tonic::Status = ProviderError::Crypto("test".to_string()).into();
        assert_eq!(status.code(), tonic::Code::Internal);

        let status: tonic::Status = ProviderError::Api {
            status: 500,
            message: "test".to_string(),
        }
        .into();
        assert_eq!(status.code(), tonic::Code::Unknown);
    }

    #[test]
    fn test_message_method() {
        let err = ProviderError::FailedPrecondition("machine is Broken".to_string());
        assert_eq!(err.message(), "machine is Broken");

        let err = ProviderError::Api {
            status: 400,
            message: "bad body".to_string(),
        };
        assert_eq!(err.message(), "bad body");
    }
}
