use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::auth::AuthError;
use crate::core::entities::ValidationError;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("{provider}: unsupported model '{model}'")]
    UnsupportedModel { provider: &'static str, model: String },
    #[error("{provider}: unsupported capability '{capability}'")]
    UnsupportedCapability {
        provider: &'static str,
        capability: &'static str,
    },
    #[error("{provider}: malformed upstream response: {message}")]
    UpstreamProtocol {
        provider: &'static str,
        message: String,
        body: Option<String>,
    },
    #[error("{provider}: upstream error: {message}")]
    Upstream {
        provider: &'static str,
        message: String,
        body: Option<String>,
    },
    #[error("request cancelled")]
    Cancelled,
}

impl GatewayError {
    pub fn upstream(provider: &'static str, e: impl std::fmt::Display) -> Self {
        GatewayError::Upstream {
            provider,
            message: e.to_string(),
            body: None,
        }
    }

    pub fn protocol(
        provider: &'static str,
        message: impl Into<String>,
        body: Option<String>,
    ) -> Self {
        GatewayError::UpstreamProtocol {
            provider,
            message: message.into(),
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_)
            | GatewayError::UnsupportedModel { .. }
            | GatewayError::UnsupportedCapability { .. } => StatusCode::BAD_REQUEST,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Configuration(_)
            | GatewayError::UpstreamProtocol { .. }
            | GatewayError::Upstream { .. }
            | GatewayError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "validation",
            GatewayError::Forbidden(_) => "forbidden",
            GatewayError::Auth(_) => "auth",
            GatewayError::Configuration(_) => "configuration",
            GatewayError::UnsupportedModel { .. } => "unsupported_model",
            GatewayError::UnsupportedCapability { .. } => "unsupported_capability",
            GatewayError::UpstreamProtocol { .. } => "upstream_protocol",
            GatewayError::Upstream { .. } => "upstream",
            GatewayError::Cancelled => "cancelled",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "error": true, "msg": self.to_string() })
    }
}

impl From<ValidationError> for GatewayError {
    fn from(e: ValidationError) -> Self {
        GatewayError::Validation(e.0)
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if let GatewayError::Auth(e) = self {
            return e.into_response();
        }
        if let GatewayError::UpstreamProtocol { body: Some(body), .. }
        | GatewayError::Upstream { body: Some(body), .. } = &self
        {
            tracing::warn!(error = %self, body = %body, "upstream failure");
        }
        (self.status(), Json(self.to_json())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classes() {
        assert_eq!(GatewayError::Validation("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(GatewayError::Forbidden("x".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(
            GatewayError::UnsupportedModel { provider: "bedrock", model: "gpt-4".into() }.status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::Configuration("disabled".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GatewayError::protocol("bedrock", "empty content", None).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn json_body_shape() {
        let body = GatewayError::Forbidden("unknown path 'x'".into()).to_json();
        assert_eq!(body["error"], true);
        assert_eq!(body["msg"], "forbidden: unknown path 'x'");
    }
}
