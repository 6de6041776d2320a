use std::sync::Arc;

use axum::http::HeaderMap;

use crate::auth;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::providers::{self, Operation, Provider, ProviderKind};

#[derive(Clone)]
pub struct AppState {
    config: Arc<GatewayConfig>,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Resolves `/{provider}/{sub_path}` to an operation and a freshly built
    /// adapter. Checks run in order: allow-list, caller authorization,
    /// backend configuration. None of them touches the network.
    pub fn dispatch(
        &self,
        provider: &str,
        sub_path: &str,
        headers: &HeaderMap,
    ) -> Result<(Operation, Box<dyn Provider>), GatewayError> {
        let kind = ProviderKind::from_segment(provider)
            .ok_or_else(|| GatewayError::Forbidden(format!("unknown provider '{provider}'")))?;
        let operation = kind.operation_for(sub_path).ok_or_else(|| {
            GatewayError::Forbidden(format!(
                "path '{}' is not allowed for {}",
                sub_path.trim_matches('/'),
                kind.name()
            ))
        })?;
        auth::authorize(&self.config.auth, headers)?;
        let adapter = providers::build(kind, &self.config.providers)?;
        Ok((operation, adapter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthError;
    use crate::config::{AuthConfig, OpenAiConfig, ProvidersConfig};

    fn state(codes: &[&str], openai_enabled: bool) -> AppState {
        AppState::new(GatewayConfig {
            auth: AuthConfig {
                access_codes: codes.iter().map(|c| c.to_string()).collect(),
            },
            providers: ProvidersConfig {
                openai: OpenAiConfig {
                    enabled: openai_enabled,
                    api_key: Some("sk-test".into()),
                    ..Default::default()
                },
                ..Default::default()
            },
        })
    }

    fn bearer(code: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("authorization", format!("Bearer {code}").parse().unwrap());
        h
    }

    #[test]
    fn forbidden_path_wins_over_auth() {
        let s = state(&["secret"], true);
        let err = s.dispatch("openai", "v1/files", &HeaderMap::new()).err().unwrap();
        assert!(matches!(err, GatewayError::Forbidden(_)));
        let err = s.dispatch("gemini", "chat", &HeaderMap::new()).err().unwrap();
        assert!(matches!(err, GatewayError::Forbidden(_)));
    }

    #[test]
    fn auth_failures_surface_unmodified() {
        let s = state(&["secret"], true);
        let err = s.dispatch("openai", "v1/models", &HeaderMap::new()).err().unwrap();
        assert!(matches!(err, GatewayError::Auth(AuthError::Missing)));
        let err = s.dispatch("openai", "v1/models", &bearer("nope")).err().unwrap();
        assert!(matches!(err, GatewayError::Auth(AuthError::Invalid)));
    }

    #[test]
    fn disabled_backend_is_a_configuration_error() {
        let s = state(&[], false);
        let err = s.dispatch("openai", "v1/chat/completions", &HeaderMap::new()).err().unwrap();
        assert!(matches!(err, GatewayError::Configuration(_)));
    }

    #[test]
    fn resolves_operation_and_adapter() {
        let s = state(&["secret"], true);
        let (op, adapter) = s.dispatch("openai", "/v1/audio/speech", &bearer("secret")).unwrap();
        assert_eq!(op, Operation::Speech);
        assert_eq!(adapter.kind(), ProviderKind::OpenAi);
    }
}
