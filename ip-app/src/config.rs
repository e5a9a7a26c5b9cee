//! issuepilot configuration loader.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IssuePilotConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
    /// Upper bound on the buffered request body.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    300
}

fn default_http_max_in_flight() -> usize {
    64
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionConfig {
    #[serde(default = "default_completion_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_completion_timeout_seconds")]
    pub request_timeout_seconds: u64,
    /// Prepended as a system message to every conversation.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

fn default_completion_base_url() -> String {
    "https://api.githubcopilot.com".to_string()
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_completion_timeout_seconds() -> u64 {
    60
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            base_url: default_completion_base_url(),
            model: default_model(),
            request_timeout_seconds: default_completion_timeout_seconds(),
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubConfig {
    #[serde(default = "default_github_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_github_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

fn default_github_api_base_url() -> String {
    "https://api.github.com".to_string()
}

fn default_user_agent() -> String {
    "issuepilot".to_string()
}

fn default_github_timeout_seconds() -> u64 {
    30
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_github_api_base_url(),
            user_agent: default_user_agent(),
            request_timeout_seconds: default_github_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    /// When false the agent endpoint accepts unsigned requests.
    #[serde(default = "default_verify_signatures")]
    pub verify_signatures: bool,
    #[serde(default = "default_public_keys_url")]
    pub public_keys_url: String,
    /// Unknown key ids refetch the key document at most this often.
    #[serde(default = "default_key_refresh_min_interval_seconds")]
    pub key_refresh_min_interval_seconds: u64,
}

fn default_verify_signatures() -> bool {
    true
}

fn default_public_keys_url() -> String {
    "https://api.github.com/meta/public_keys/copilot_api".to_string()
}

fn default_key_refresh_min_interval_seconds() -> u64 {
    60
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            verify_signatures: default_verify_signatures(),
            public_keys_url: default_public_keys_url(),
            key_refresh_min_interval_seconds: default_key_refresh_min_interval_seconds(),
        }
    }
}

impl IssuePilotConfig {
    /// Explicit paths must exist; the default path is optional and falls back
    /// to built-in defaults.
    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, Option<PathBuf>)> {
        let (mut cfg, used_path) = match path {
            Some(path) => (Self::read(&path).await?, Some(path)),
            None => {
                let path = default_config_path();
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    (Self::read(&path).await?, Some(path))
                } else {
                    (Self::default(), None)
                }
            }
        };

        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok((cfg, used_path))
    }

    async fn read(path: &Path) -> anyhow::Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;
        Self::parse(&contents).map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Some(v) = non_empty_env("ISSUEPILOT_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(v) = non_empty_env("ISSUEPILOT_MODEL") {
            self.completion.model = v;
        }
        if let Some(v) = non_empty_env("ISSUEPILOT_COMPLETION_BASE_URL") {
            self.completion.base_url = v;
        }
        if let Some(v) = non_empty_env("ISSUEPILOT_GITHUB_API_BASE_URL") {
            self.github.api_base_url = v;
        }
        if let Some(v) = non_empty_env("ISSUEPILOT_VERIFY_SIGNATURES") {
            self.security.verify_signatures = parse_bool("ISSUEPILOT_VERIFY_SIGNATURES", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.bind_addr()?;
        if self.completion.model.trim().is_empty() {
            return Err(anyhow::anyhow!("completion.model is required"));
        }
        validate_http_url("completion.base_url", &self.completion.base_url)?;
        validate_http_url("github.api_base_url", &self.github.api_base_url)?;
        if self.security.verify_signatures {
            validate_http_url("security.public_keys_url", &self.security.public_keys_url)?;
            if self.security.key_refresh_min_interval_seconds == 0 {
                return Err(anyhow::anyhow!(
                    "security.key_refresh_min_interval_seconds must be > 0"
                ));
            }
        }
        if self.server.http_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("server.http_timeout_seconds must be > 0"));
        }
        if self.server.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("server.http_max_in_flight must be > 0"));
        }
        if self.server.max_body_bytes == 0 {
            return Err(anyhow::anyhow!("server.max_body_bytes must be > 0"));
        }
        if self.completion.request_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("completion.request_timeout_seconds must be > 0"));
        }
        if self.github.request_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("github.request_timeout_seconds must be > 0"));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server
            .bind_addr
            .trim()
            .parse()
            .map_err(|e| {
                anyhow::anyhow!("server.bind_addr {:?} is invalid: {e}", self.server.bind_addr)
            })
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(key: &str, raw: &str) -> anyhow::Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow::anyhow!(
            "{key}={other:?} is not a boolean; expected true or false"
        )),
    }
}

fn validate_http_url(key: &str, value: &str) -> anyhow::Result<()> {
    let url = reqwest::Url::parse(value.trim())
        .map_err(|e| anyhow::anyhow!("{key} {value:?} is not a valid url: {e}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(anyhow::anyhow!("{key} must use http or https, got {value:?}"));
    }
    Ok(())
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".issuepilot").join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = IssuePilotConfig::parse("").expect("parse empty config");
        cfg.validate().expect("defaults are valid");
        assert_eq!(cfg.completion.model, "gpt-4o");
        assert!(cfg.security.verify_signatures);
        assert_eq!(
            cfg.bind_addr().expect("bind addr").to_string(),
            "127.0.0.1:8080"
        );
    }

    #[test]
    fn sections_override_defaults() {
        let cfg = IssuePilotConfig::parse(
            r#"
            [server]
            bind_addr = "0.0.0.0:9000"

            [completion]
            model = "gpt-4o-mini"
            system_prompt = "Talk like a pirate."

            [security]
            verify_signatures = false
            "#,
        )
        .expect("parse config");
        cfg.validate().expect("valid config");
        assert_eq!(cfg.server.bind_addr, "0.0.0.0:9000");
        assert_eq!(cfg.server.http_max_in_flight, 64);
        assert_eq!(cfg.completion.model, "gpt-4o-mini");
        assert_eq!(
            cfg.completion.system_prompt.as_deref(),
            Some("Talk like a pirate.")
        );
        assert!(!cfg.security.verify_signatures);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = IssuePilotConfig::default();
        cfg.completion.model = "  ".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = IssuePilotConfig::default();
        cfg.github.api_base_url = "ftp://example.test".to_string();
        let err = cfg.validate().expect_err("non-http url");
        assert!(err.to_string().contains("github.api_base_url"));

        let mut cfg = IssuePilotConfig::default();
        cfg.server.bind_addr = "not an addr".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = IssuePilotConfig::default();
        cfg.server.max_body_bytes = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = IssuePilotConfig::default();
        cfg.security.key_refresh_min_interval_seconds = 0;
        let err = cfg.validate().expect_err("zero refresh interval");
        assert!(err.to_string().contains("key_refresh_min_interval_seconds"));
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert!(parse_bool("K", "TRUE").expect("bool"));
        assert!(!parse_bool("K", "0").expect("bool"));
        assert!(parse_bool("K", "maybe").is_err());
    }
}
