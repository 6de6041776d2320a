use axum::http::StatusCode;
use axum::{
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use subtle::ConstantTimeEq;

use crate::config::AuthConfig;
use crate::metrics::AUTH_ERRORS;

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("missing access code")]
    Missing,
    #[error("invalid access code")]
    Invalid,
}

impl AuthError {
    fn label(&self) -> &'static str {
        match self {
            AuthError::Missing => "missing",
            AuthError::Invalid => "invalid",
        }
    }
}

pub fn extract_access_code(headers: &HeaderMap) -> Option<String> {
    if let Some(bearer) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(s) = bearer.to_str() {
            if let Some(code) = s.strip_prefix("Bearer ") {
                let code = code.trim();
                if !code.is_empty() {
                    return Some(code.into());
                }
            }
        }
    }
    if let Some(key) = headers.get("x-api-key") {
        if let Ok(s) = key.to_str() {
            if !s.trim().is_empty() {
                return Some(s.trim().into());
            }
        }
    }
    None
}

/// Passes every caller when no access codes are configured.
pub fn authorize(cfg: &AuthConfig, headers: &HeaderMap) -> Result<(), AuthError> {
    if cfg.access_codes.is_empty() {
        return Ok(());
    }
    let result = match extract_access_code(headers) {
        None => Err(AuthError::Missing),
        Some(code) => {
            let matched = cfg
                .access_codes
                .iter()
                .fold(false, |acc, c| acc | bool::from(c.as_bytes().ct_eq(code.as_bytes())));
            if matched {
                Ok(())
            } else {
                Err(AuthError::Invalid)
            }
        }
    };
    if let Err(e) = &result {
        AUTH_ERRORS.with_label_values(&[e.label()]).inc();
    }
    result
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": true, "msg": self.to_string() });
        (StatusCode::UNAUTHORIZED, Json(body)).into_response()
    }
}
