pub mod events;
pub mod health;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;
use utoipa::ToSchema;

/// Response envelope shared by the API and the event hook:
/// `{"result": {"status": true, "value": ...}}` or
/// `{"result": {"status": false, "error": {"message": ...}}}`.
#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub result: ApiResult,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ApiResult {
    pub status: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub message: String,
}

impl ApiResponse {
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            result: ApiResult {
                status: false,
                value: None,
                error: Some(ApiError {
                    message: message.into(),
                }),
            },
        }
    }
}

/// 200 with `value` wrapped in the envelope.
pub fn ok(value: impl Serialize) -> Response {
    match serde_json::to_value(value) {
        Ok(value) => Json(ApiResponse {
            result: ApiResult {
                status: true,
                value: Some(value),
                error: None,
            },
        })
        .into_response(),
        Err(err) => {
            error!("Failed to serialize response: {err}");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "failed to serialize response")
        }
    }
}

pub fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ApiResponse::error(message))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_envelope_shape() -> Result<(), serde_json::Error> {
        let body = serde_json::to_value(ApiResponse::error("boom"))?;
        assert_eq!(
            body,
            json!({"result": {"status": false, "error": {"message": "boom"}}})
        );
        Ok(())
    }

    #[tokio::test]
    async fn ok_envelope_shape() -> Result<(), Box<dyn std::error::Error>> {
        let response = ok(vec![1, 2]);
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        let body: Value = serde_json::from_slice(&bytes)?;
        assert_eq!(body, json!({"result": {"status": true, "value": [1, 2]}}));
        Ok(())
    }
}
