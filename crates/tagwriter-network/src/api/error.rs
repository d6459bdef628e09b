use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tagwriter_storage::StorageError;
use thiserror::Error;
use tracing::error;

/// Error returned by HTTP handlers.
///
/// Rendered as `{"error": message}` with the matching status code.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    /// The backend has no hardware attached.
    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "Request failed");
        }

        let body = Json(serde_json::json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { .. } => Self::NotFound(err.to_string()),
            StorageError::InvalidTransition { .. } => Self::Conflict(err.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<tagwriter_core::Error> for ApiError {
    fn from(err: tagwriter_core::Error) -> Self {
        use tagwriter_core::Error;

        match err {
            Error::InvalidPayload(_) | Error::InvalidCommandId(_) | Error::InvalidCommandStatus(_) => {
                Self::BadRequest(err.to_string())
            }
            Error::Unauthorized(_) => Self::Unauthorized(err.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tagwriter_core::{CommandId, CommandStatus};

    #[rstest]
    #[case(ApiError::BadRequest("x".into()), StatusCode::BAD_REQUEST)]
    #[case(ApiError::Unauthorized("x".into()), StatusCode::UNAUTHORIZED)]
    #[case(ApiError::Forbidden("x".into()), StatusCode::FORBIDDEN)]
    #[case(ApiError::NotFound("x".into()), StatusCode::NOT_FOUND)]
    #[case(ApiError::Conflict("x".into()), StatusCode::CONFLICT)]
    #[case(ApiError::Unavailable("x".into()), StatusCode::SERVICE_UNAVAILABLE)]
    #[case(ApiError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR)]
    fn test_status_codes(#[case] error: ApiError, #[case] expected: StatusCode) {
        assert_eq!(error.into_response().status(), expected);
    }

    #[test]
    fn test_storage_errors_map_to_client_errors() {
        let id = CommandId::new();
        assert!(matches!(
            ApiError::from(StorageError::command_not_found(id)),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            ApiError::from(StorageError::InvalidTransition {
                id,
                from: CommandStatus::Done,
                to: CommandStatus::Failed,
            }),
            ApiError::Conflict(_)
        ));
        assert!(matches!(
            ApiError::from(StorageError::InvalidRecord("bad".into())),
            ApiError::Internal(_)
        ));
    }

    #[test]
    fn test_invalid_payload_is_bad_request() {
        let err = tagwriter_core::TagPayload::new("").unwrap_err();
        assert!(matches!(ApiError::from(err), ApiError::BadRequest(_)));
    }
}
