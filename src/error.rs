//! Errors surfaced before a response head is committed.
//!
//! Failures after that point (source read errors, short sources, client
//! disconnects) travel through the body stream as [`std::io::Error`] and end
//! the connection instead.

use std::io;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::plan::RangeNotSatisfiable;

pub type Result<T, E = StreamError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum StreamError {
    /// The identifier is not a bare file name.
    #[error("invalid media identifier {id:?}")]
    InvalidIdentifier { id: String },

    #[error("media file not found: {id}")]
    NotFound { id: String },

    /// The file exists but could not be inspected or opened.
    #[error("media source unavailable: {0}")]
    SourceUnavailable(#[from] io::Error),

    #[error(transparent)]
    RangeNotSatisfiable(#[from] RangeNotSatisfiable),
}

impl StreamError {
    pub fn status(&self) -> StatusCode {
        match self {
            // invalid identifiers look like any other missing file
            StreamError::InvalidIdentifier { .. } | StreamError::NotFound { .. } => StatusCode::NOT_FOUND,
            StreamError::SourceUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            StreamError::RangeNotSatisfiable(_) => StatusCode::RANGE_NOT_SATISFIABLE,
        }
    }
}

impl IntoResponse for StreamError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            StreamError::RangeNotSatisfiable(err) => err.into_response(),
            StreamError::InvalidIdentifier { .. } | StreamError::NotFound { .. } => {
                (status, Json(json!({ "message": "Audio file not found" }))).into_response()
            }
            StreamError::SourceUnavailable(err) => {
                tracing::error!(error = %err, "failed to open media source");
                (status, Json(json!({ "message": "Error streaming audio" }))).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (StreamError::InvalidIdentifier { id: "../x".into() }, StatusCode::NOT_FOUND),
            (StreamError::NotFound { id: "x.mp3".into() }, StatusCode::NOT_FOUND),
            (StreamError::from(io::Error::from(io::ErrorKind::PermissionDenied)), StatusCode::INTERNAL_SERVER_ERROR),
            (StreamError::from(RangeNotSatisfiable { total_length: 3 }), StatusCode::RANGE_NOT_SATISFIABLE),
        ];

        for (err, status) in cases {
            assert_eq!(status, err.status(), "{err}");
            assert_eq!(status, err.into_response().status());
        }
    }

    #[test]
    fn test_unsatisfiable_keeps_content_range() {
        let response = StreamError::from(RangeNotSatisfiable { total_length: 1000 }).into_response();
        assert_eq!(
            Some(HeaderValue::from_static("bytes */1000")).as_ref(),
            response.headers().get("Content-Range")
        );
    }
}
