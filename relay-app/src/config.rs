//! relayd configuration loader.

use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub pages: Vec<PageConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Address the webhook server binds to, e.g. "127.0.0.1:8080".
    pub bind_addr: String,
    /// Token echoed back during the platform's webhook verification handshake.
    pub verify_token: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysConfig {
    pub openai_api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    /// Path to the conversations database. Default: `~/.relayd/data/conversations.db`
    #[serde(default)]
    pub path: Option<String>,
}

/// One messaging-platform page (business account) served by this relay.
#[derive(Debug, Clone, Deserialize)]
pub struct PageConfig {
    pub channel_id: String,
    pub access_token: String,
    pub assistant_id: String,
    /// Channel-sent text whose presence in recent history marks a
    /// conversation as automation-eligible. Empty: answer everyone.
    #[serde(default)]
    pub marker_text: String,
    /// Greeting seeded into a brand-new conversation's context.
    #[serde(default)]
    pub greeting: String,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub end_message: Option<String>,
}

impl RelayConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;

        let mut cfg: RelayConfig = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RELAYD_BIND_ADDR") {
            if !v.trim().is_empty() {
                self.general.bind_addr = v;
            }
        }
        if let Ok(v) = std::env::var("RELAYD_VERIFY_TOKEN") {
            if !v.trim().is_empty() {
                self.general.verify_token = v;
            }
        }
        if let Ok(v) = std::env::var("OPENAI_API_KEY") {
            if !v.trim().is_empty() {
                self.keys.openai_api_key = Some(v);
            }
        }
        if let Ok(v) = std::env::var("RELAYD_STORE_PATH") {
            if !v.trim().is_empty() {
                self.store.path = Some(v);
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.general.bind_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(anyhow::anyhow!(
                "general.bind_addr is not a valid socket address: {}",
                self.general.bind_addr
            ));
        }
        if self.general.verify_token.trim().is_empty() {
            return Err(anyhow::anyhow!("general.verify_token is required"));
        }
        if self
            .keys
            .openai_api_key
            .as_deref()
            .unwrap_or_default()
            .trim()
            .is_empty()
        {
            return Err(anyhow::anyhow!(
                "keys.openai_api_key is required (config or OPENAI_API_KEY)"
            ));
        }
        if self.pages.is_empty() {
            return Err(anyhow::anyhow!("at least one [[pages]] entry is required"));
        }
        for page in &self.pages {
            if page.channel_id.trim().is_empty() {
                return Err(anyhow::anyhow!("pages entry has an empty channel_id"));
            }
            if page.access_token.trim().is_empty() {
                return Err(anyhow::anyhow!(
                    "page {} has an empty access_token",
                    page.channel_id
                ));
            }
            if page.assistant_id.trim().is_empty() {
                return Err(anyhow::anyhow!(
                    "page {} has an empty assistant_id",
                    page.channel_id
                ));
            }
        }
        Ok(())
    }

    pub fn store_path(&self) -> PathBuf {
        self.store
            .path
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(default_store_path)
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".relayd").join("config.toml")
}

pub fn default_store_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home)
        .join(".relayd")
        .join("data")
        .join("conversations.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(toml_str: &str) -> RelayConfig {
        toml::from_str(toml_str).expect("parse config")
    }

    #[test]
    fn minimal_config_validates() {
        let cfg = parsed(
            r#"
[general]
bind_addr = "127.0.0.1:8080"
verify_token = "hub-secret"

[keys]
openai_api_key = "sk-test"

[[pages]]
channel_id = "1234"
access_token = "EAAB..."
assistant_id = "asst_1"
"#,
        );
        cfg.validate().expect("valid config");
        assert_eq!(cfg.pages.len(), 1);
        assert_eq!(cfg.pages[0].marker_text, "");
        assert!(cfg.pages[0].max_turns.is_none());
    }

    #[test]
    fn missing_api_key_is_rejected() {
        let cfg = parsed(
            r#"
[general]
bind_addr = "127.0.0.1:8080"
verify_token = "hub-secret"

[[pages]]
channel_id = "1234"
access_token = "EAAB..."
assistant_id = "asst_1"
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_bind_addr_is_rejected() {
        let cfg = parsed(
            r#"
[general]
bind_addr = "not-an-addr"
verify_token = "hub-secret"

[keys]
openai_api_key = "sk-test"

[[pages]]
channel_id = "1234"
access_token = "EAAB..."
assistant_id = "asst_1"
"#,
        );
        assert!(cfg.validate().is_err());
    }
}
