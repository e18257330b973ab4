// src/config/ai.rs
use serde::{Deserialize, Serialize};

fn default_provider() -> String {
    "anthropic".to_string()
}
fn default_model() -> String {
    "claude-3-5-haiku-latest".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub enabled: bool,
    /// "anthropic" | "openai" (case-insensitive)
    pub provider: String,
    pub model: String,
    /// "ENV" means: read from ANTHROPIC_API_KEY / OPENAI_API_KEY (by provider)
    pub api_key: String,
    /// Override for the provider endpoint (proxies, tests).
    pub api_base: Option<String>,
    pub max_output_tokens: u32,
    /// Digest language passed to the prompt.
    pub language: String,
    pub timeout_secs: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: default_provider(),
            model: default_model(),
            api_key: "ENV".to_string(),
            api_base: None,
            max_output_tokens: 600,
            language: "English".to_string(),
            timeout_secs: 30,
        }
    }
}

impl AiConfig {
    pub fn api_key_env_var(&self) -> Option<&'static str> {
        match self.provider.as_str() {
            "anthropic" | "claude" => Some("ANTHROPIC_API_KEY"),
            "openai" => Some("OPENAI_API_KEY"),
            _ => None,
        }
    }

    /// Normalize provider and resolve `"ENV"` keys. Only enabled configs need a key.
    pub fn resolve(&mut self) -> anyhow::Result<()> {
        self.provider = self.provider.trim().to_lowercase();
        if !self.enabled {
            return Ok(());
        }
        let Some(var) = self.api_key_env_var() else {
            anyhow::bail!("Unsupported provider in config: {}", self.provider);
        };
        if self.api_key.trim().eq_ignore_ascii_case("env") {
            self.api_key =
                std::env::var(var).map_err(|_| anyhow::anyhow!("Missing {var} env var"))?;
        }
        if self.max_output_tokens == 0 {
            self.max_output_tokens = AiConfig::default().max_output_tokens;
        }
        Ok(())
    }
}
