//! Error classification
//!
//! A pure mapping from [`DispatchError`] to the taxonomy the dispatcher uses to
//! pick a queue disposition. Labels only: retry-versus-dead-letter is decided
//! by the caller with the delivery count in hand.

use crate::error::{DispatchError, DownstreamError};

pub const MALFORMED_MESSAGE_REASON: &str = "malformed message";
pub const DESERIALIZATION_ERROR_REASON: &str = "deserialization error";
pub const APPLICATION_ERROR_REASON: &str = "application processing error";
pub const GENERIC_ERROR_REASON: &str = "generic error";
/// Stand-in when an error renders to an empty string
pub const NO_ERROR_MESSAGE: &str = "no error message";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MalformedMessage,
    JsonDecodeError,
    ApplicationError,
    ResourceNotFound,
    GenericError,
}

impl ErrorKind {
    /// Whether redelivery can change the outcome
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorKind::MalformedMessage | ErrorKind::JsonDecodeError)
    }

    pub fn dead_letter_reason(&self) -> &'static str {
        match self {
            ErrorKind::MalformedMessage => MALFORMED_MESSAGE_REASON,
            ErrorKind::JsonDecodeError => DESERIALIZATION_ERROR_REASON,
            ErrorKind::ApplicationError | ErrorKind::ResourceNotFound => APPLICATION_ERROR_REASON,
            ErrorKind::GenericError => GENERIC_ERROR_REASON,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MalformedMessage => "malformed_message",
            ErrorKind::JsonDecodeError => "json_decode_error",
            ErrorKind::ApplicationError => "application_error",
            ErrorKind::ResourceNotFound => "resource_not_found",
            ErrorKind::GenericError => "generic_error",
        }
    }
}

pub fn classify(error: &DispatchError) -> ErrorKind {
    match error {
        DispatchError::MissingProperty(_) | DispatchError::InvalidProperty { .. } => {
            ErrorKind::MalformedMessage
        }
        DispatchError::Payload(_) => ErrorKind::JsonDecodeError,
        DispatchError::Downstream(downstream) => classify_downstream(downstream),
        DispatchError::Store(_) => ErrorKind::GenericError,
    }
}

fn classify_downstream(error: &DownstreamError) -> ErrorKind {
    match error {
        DownstreamError::NotFound { .. } => ErrorKind::ResourceNotFound,
        DownstreamError::Rejected { .. }
        | DownstreamError::AuthenticationFailed { .. }
        | DownstreamError::Timeout(_)
        | DownstreamError::Connection(_) => ErrorKind::ApplicationError,
        DownstreamError::InvalidResponse(_) | DownstreamError::Client(_) => ErrorKind::GenericError,
    }
}

/// Operator-facing dead-letter description
pub fn dead_letter_description(body: &str, error_text: &str) -> String {
    let error_text = if error_text.trim().is_empty() {
        NO_ERROR_MESSAGE
    } else {
        error_text
    };
    format!("Error processing message {body}, exception was {error_text}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use hs_store::StoreError;
    use std::time::Duration;

    fn downstream(error: DownstreamError) -> DispatchError {
        DispatchError::Downstream(error)
    }

    #[test]
    fn test_header_problems_are_malformed() {
        assert_eq!(
            classify(&DispatchError::MissingProperty("hearing_id")),
            ErrorKind::MalformedMessage
        );
        assert_eq!(
            classify(&DispatchError::InvalidProperty {
                name: "message_type",
                value: "CANCEL_HEARING".to_string(),
            }),
            ErrorKind::MalformedMessage
        );
    }

    #[test]
    fn test_payload_errors_are_json_decode() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        assert_eq!(classify(&DispatchError::Payload(err)), ErrorKind::JsonDecodeError);
    }

    #[test]
    fn test_downstream_classification() {
        let rejected = DownstreamError::Rejected {
            status: 400,
            error_code: Some(1000),
            description: Some("Invalid venue".to_string()),
        };
        let server_error = DownstreamError::Rejected {
            status: 503,
            error_code: None,
            description: None,
        };
        let auth = DownstreamError::AuthenticationFailed {
            status: 401,
            description: None,
        };
        let not_found = DownstreamError::NotFound {
            error_code: None,
            description: None,
        };

        assert_eq!(classify(&downstream(rejected)), ErrorKind::ApplicationError);
        assert_eq!(classify(&downstream(server_error)), ErrorKind::ApplicationError);
        assert_eq!(classify(&downstream(auth)), ErrorKind::ApplicationError);
        assert_eq!(
            classify(&downstream(DownstreamError::Timeout(Duration::from_secs(30)))),
            ErrorKind::ApplicationError
        );
        assert_eq!(
            classify(&downstream(DownstreamError::Connection("refused".to_string()))),
            ErrorKind::ApplicationError
        );
        assert_eq!(classify(&downstream(not_found)), ErrorKind::ResourceNotFound);
        assert_eq!(
            classify(&downstream(DownstreamError::InvalidResponse("truncated".to_string()))),
            ErrorKind::GenericError
        );
    }

    #[test]
    fn test_store_errors_are_generic() {
        let err = DispatchError::Store(StoreError::CorruptRow {
            id: 1,
            reason: "bad status".to_string(),
        });
        assert_eq!(classify(&err), ErrorKind::GenericError);
    }

    #[test]
    fn test_retryability_and_reasons() {
        assert!(!ErrorKind::MalformedMessage.is_retryable());
        assert!(!ErrorKind::JsonDecodeError.is_retryable());
        assert!(ErrorKind::ApplicationError.is_retryable());
        assert!(ErrorKind::ResourceNotFound.is_retryable());
        assert!(ErrorKind::GenericError.is_retryable());

        assert_eq!(ErrorKind::ResourceNotFound.dead_letter_reason(), "application processing error");
        assert_eq!(ErrorKind::JsonDecodeError.dead_letter_reason(), "deserialization error");
    }

    #[test]
    fn test_dead_letter_description_format() {
        let error = DispatchError::MissingProperty("hearing_id");
        let description = dead_letter_description(r#"{"a":1}"#, &error.to_string());
        assert_eq!(
            description,
            r#"Error processing message {"a":1}, exception was Missing hearing_id application property"#
        );
    }

    #[test]
    fn test_dead_letter_description_placeholder() {
        assert_eq!(
            dead_letter_description("{}", "  "),
            "Error processing message {}, exception was no error message"
        );
    }
}
