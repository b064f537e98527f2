use std::{
    env, fmt,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const AGENTLESS_DEFAULT_SITE: &str = "datadoghq.com";
pub const DEFAULT_AGENT_URL: &str = "http://localhost:8126";
pub const EVP_PROXY_AGENT_BASE_PATH: &str = "/evp_proxy/v2";
pub const GIT_API_BASE_PATH: &str = "/api/v2/git";

/// Expand tilde (~) in path to user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Some(s) = path.to_str() {
        if let Some(stripped) = s.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(stripped);
            }
        } else if s == "~" {
            if let Some(home) = dirs::home_dir() {
                return home;
            }
        }
    }
    path.to_path_buf()
}

/// How requests reach the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RequestMode {
    /// Directly to the public API, authenticated with API/application keys
    AgentlessEvents,
    /// Through the local trace agent's EVP proxy, which holds the credentials
    #[default]
    EvpProxyEvents,
}

/// API key and application key pair
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub app_key: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, app_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            app_key: app_key.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("app_key", &"<redacted>")
            .finish()
    }
}

/// Configuration for the git upload client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub app_key: String,
    #[serde(default)]
    pub mode: RequestMode,
    /// Site for agentless mode, e.g. `datadoghq.eu`
    #[serde(default = "defaults::site")]
    pub site: String,
    /// Trace agent URL for EVP proxy mode
    #[serde(default = "defaults::agent_url")]
    pub agent_url: String,
    /// Repository URL from CI tags; derived from the local remote when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_url: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            app_key: String::new(),
            mode: RequestMode::default(),
            site: defaults::site(),
            agent_url: defaults::agent_url(),
            repository_url: None,
        }
    }
}

impl Settings {
    /// Load configuration from the optional config file, then environment
    pub fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;
        tracing::debug!("loading civis-git-upload config from {:?}", config_path);
        let mut settings = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        settings.apply_env(|key| env::var(key).ok())?;
        Ok(settings)
    }

    /// Load configuration from a YAML file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let settings: Settings = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        Ok(settings)
    }

    /// Config file path: `CIVIS_GIT_UPLOAD_CONFIG` or the per-user default
    pub fn config_file_path() -> Result<PathBuf> {
        if let Ok(path) = env::var("CIVIS_GIT_UPLOAD_CONFIG") {
            return Ok(expand_tilde(&PathBuf::from(path)));
        }
        dirs::home_dir()
            .map(|home| home.join(".config/civis-git-upload/config.yaml"))
            .context("Could not determine home directory for config file")
    }

    /// Apply `DD_*` overrides read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("DD_API_KEY") {
            self.api_key = key;
        }

        if let Some(key) = lookup("DD_APP_KEY").or_else(|| lookup("DD_APPLICATION_KEY")) {
            self.app_key = key;
        }

        if let Some(site) = lookup("DD_SITE") {
            self.site = site;
        }

        if let Some(url) = lookup("DD_TRACE_AGENT_URL") {
            self.agent_url = url;
        } else if lookup("DD_AGENT_HOST").is_some() || lookup("DD_TRACE_AGENT_PORT").is_some() {
            let host = lookup("DD_AGENT_HOST").unwrap_or_else(|| "localhost".to_string());
            let port: u16 = match lookup("DD_TRACE_AGENT_PORT") {
                Some(port) => port
                    .parse()
                    .context("Failed to parse DD_TRACE_AGENT_PORT as u16")?,
                None => 8126,
            };
            self.agent_url = format!("http://{}:{}", host, port);
        }

        if let Some(url) = lookup("DD_GIT_REPOSITORY_URL") {
            if !url.is_empty() {
                self.repository_url = Some(url);
            }
        }

        if let Some(flag) = lookup("DD_CIVISIBILITY_AGENTLESS_ENABLED") {
            self.mode = if is_truthy(&flag) {
                RequestMode::AgentlessEvents
            } else {
                RequestMode::EvpProxyEvents
            };
        }

        Ok(())
    }

    /// Agentless mode cannot authenticate without an API key
    pub fn validate(&self) -> Result<()> {
        if self.mode == RequestMode::AgentlessEvents && self.api_key.is_empty() {
            anyhow::bail!("agentless mode requires DD_API_KEY to be set");
        }
        Ok(())
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.api_key.clone(), self.app_key.clone())
    }

    /// Base URL of the git metadata API for the configured mode
    pub fn base_url(&self) -> String {
        match self.mode {
            RequestMode::AgentlessEvents => {
                format!("https://api.{}{}", self.site, GIT_API_BASE_PATH)
            }
            RequestMode::EvpProxyEvents => format!(
                "{}{}{}",
                self.agent_url.trim_end_matches('/'),
                EVP_PROXY_AGENT_BASE_PATH,
                GIT_API_BASE_PATH
            ),
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

mod defaults {
    pub(crate) fn site() -> String {
        super::AGENTLESS_DEFAULT_SITE.to_string()
    }

    pub(crate) fn agent_url() -> String {
        super::DEFAULT_AGENT_URL.to_string()
    }
}
