use serde::Deserialize;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct AuthConfig {
    /// Empty means the gateway is open.
    #[serde(default)]
    pub access_codes: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub bedrock: BedrockConfig,
    #[serde(default)]
    pub openai: OpenAiConfig,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct BedrockConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default)]
    pub model_pattern: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct OpenAiConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model_pattern: Option<String>,
}

impl GatewayConfig {
    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Overlays values from the environment; `lookup` returns `None` for
    /// unset variables.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |k: &str| lookup(k).filter(|v| !v.trim().is_empty());

        if let Some(codes) = get("GATEWAY_ACCESS_CODES") {
            self.auth.access_codes = codes
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect();
        }

        let b = &mut self.providers.bedrock;
        if let Some(v) = get("BEDROCK_ENABLED") {
            b.enabled = parse_flag(&v);
        }
        override_opt(&mut b.region, get("BEDROCK_REGION"));
        override_opt(&mut b.base_url, get("BEDROCK_BASE_URL"));
        override_opt(&mut b.api_key, get("BEDROCK_API_KEY"));
        override_opt(&mut b.access_key_id, get("BEDROCK_ACCESS_KEY_ID"));
        override_opt(&mut b.secret_access_key, get("BEDROCK_SECRET_ACCESS_KEY"));
        override_opt(&mut b.session_token, get("BEDROCK_SESSION_TOKEN"));

        let o = &mut self.providers.openai;
        if let Some(v) = get("OPENAI_ENABLED") {
            o.enabled = parse_flag(&v);
        }
        override_opt(&mut o.base_url, get("OPENAI_BASE_URL"));
        override_opt(&mut o.api_key, get("OPENAI_API_KEY"));
    }
}

fn override_opt(slot: &mut Option<String>, value: Option<String>) {
    if value.is_some() {
        *slot = value;
    }
}

fn parse_flag(v: &str) -> bool {
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Reads the TOML file at `path` (defaults when it does not exist), then
/// applies environment overrides.
pub async fn load(path: &str) -> anyhow::Result<GatewayConfig> {
    let mut cfg = match tokio::fs::read_to_string(path).await {
        Ok(text) => GatewayConfig::from_toml(&text)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("config file {path} not found, using defaults");
            GatewayConfig::default()
        }
        Err(e) => return Err(e.into()),
    };
    cfg.apply_env(|k| std::env::var(k).ok());
    Ok(cfg)
}
