use std::{collections::HashMap, fs};

use anyhow::anyhow;
use url::Url;

/// Client settings. Values come from `client.toml` in the working directory,
/// overridden by environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// REST base, e.g. `https://api.example.com/chat/`.
    pub api_base: String,
    /// Realtime endpoint. When absent it is derived from `api_base`.
    pub realtime_url: Option<String>,
    /// Where the credential pair is persisted between runs.
    pub credentials_path: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base: "http://127.0.0.1:8000/chat/".into(),
            realtime_url: None,
            credentials_path: "./data/credentials.json".into(),
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("client.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("api_base") {
                settings.api_base = v.clone();
            }
            if let Some(v) = file_cfg.get("realtime_url") {
                settings.realtime_url = Some(v.clone());
            }
            if let Some(v) = file_cfg.get("credentials_path") {
                settings.credentials_path = v.clone();
            }
        }
    }

    if let Ok(v) = std::env::var("CHAT_API_BASE") {
        settings.api_base = v;
    }
    if let Ok(v) = std::env::var("APP__API_BASE") {
        settings.api_base = v;
    }

    if let Ok(v) = std::env::var("CHAT_REALTIME_URL") {
        settings.realtime_url = Some(v);
    }
    if let Ok(v) = std::env::var("APP__REALTIME_URL") {
        settings.realtime_url = Some(v);
    }

    if let Ok(v) = std::env::var("CHAT_CREDENTIALS_PATH") {
        settings.credentials_path = v;
    }

    settings
}

impl Settings {
    pub fn api_base_url(&self) -> anyhow::Result<Url> {
        let mut base = self.api_base.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        Url::parse(&base).map_err(|err| anyhow!("invalid api_base '{base}': {err}"))
    }

    /// The realtime endpoint, derived from `api_base` when not configured
    /// explicitly: the scheme flips to ws(s) and the path becomes
    /// `/ws/chat/`.
    pub fn realtime_endpoint(&self) -> anyhow::Result<Url> {
        if let Some(explicit) = &self.realtime_url {
            return Url::parse(explicit)
                .map_err(|err| anyhow!("invalid realtime_url '{explicit}': {err}"));
        }

        let api_base = self.api_base.trim();
        let ws_base = if let Some(rest) = api_base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = api_base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(anyhow!("api_base must start with http:// or https://"));
        };

        let mut url = Url::parse(&ws_base)?;
        url.set_path("/ws/chat/");
        url.set_query(None);
        Ok(url)
    }
}
