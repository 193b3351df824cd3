use gotcha::axum::http::StatusCode;
use gotcha::axum::response::{IntoResponse, Response};
use gotcha::oas;
use gotcha::{Json, Schematic};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::error;

#[derive(Debug, Serialize, Schematic)]
pub struct ErrorResponse {
    pub error: String,
}

pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "Unauthorized".to_string(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { error: self.message })).into_response()
    }
}

impl From<crate::TrackerError> for ApiError {
    fn from(e: crate::TrackerError) -> Self {
        let status = e.to_status_code();
        if status.is_server_error() {
            // Storage details stay in the log
            error!(error = %e, "request failed");
            return Self {
                status,
                message: "Internal server error".to_string(),
            };
        }

        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl gotcha::Responsible for ApiError {
    fn response() -> oas::Responses {
        let mut response = oas::Responses {
            default: None,
            data: BTreeMap::default(),
        };
        response.data.insert(
            "4XX".to_string(),
            oas::Referenceable::Data(oas::Response {
                description: "Error response".to_string(),
                headers: None,
                content: Some(BTreeMap::from([(
                    "application/json".to_string(),
                    oas::MediaType {
                        schema: Some(oas::Referenceable::Data(
                            ErrorResponse::generate_schema().schema,
                        )),
                        example: None,
                        examples: None,
                        encoding: None,
                    },
                )])),
                links: None,
            }),
        );
        response
    }
}
