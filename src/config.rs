use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How the responder presents the conversation to the completion endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReplyWindow {
    /// Last four messages as a "role: content" transcript inside the instruction prompt.
    #[default]
    Recent,
    /// Whole message list with provider-native roles after a system instruction.
    Full,
}

impl ReplyWindow {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "recent" => Some(ReplyWindow::Recent),
            "full" | "native" => Some(ReplyWindow::Full),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    // Completion endpoint (OpenAI-compatible: OpenRouter, Ollama, vLLM, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,

    // Storage
    #[serde(default = "default_config_dir")]
    pub config_dir: String,
    #[serde(default = "default_userdata_dir")]
    pub userdata_dir: String,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    // Timeouts for the three completion calls
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout_secs: u64,
    #[serde(default = "default_summary_timeout")]
    pub summary_timeout_secs: u64,
    #[serde(default = "default_refine_timeout")]
    pub refine_timeout_secs: u64,

    // Autosave
    #[serde(default = "default_autosave_interval")]
    pub autosave_interval_secs: u64,
    #[serde(default = "default_true")]
    pub autosave_default: bool,

    #[serde(default)]
    pub reply_window: ReplyWindow,
}

fn default_llm_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_llm_model() -> String {
    "anthropic/claude-3-haiku".to_string()
}

fn default_config_dir() -> String {
    "config".to_string()
}

fn default_userdata_dir() -> String {
    "userdata".to_string()
}

fn default_bind_addr() -> String {
    "127.0.0.1:8501".to_string()
}

fn default_reply_timeout() -> u64 {
    20
}

fn default_summary_timeout() -> u64 {
    10
}

fn default_refine_timeout() -> u64 {
    10
}

fn default_autosave_interval() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            config_dir: default_config_dir(),
            userdata_dir: default_userdata_dir(),
            bind_addr: default_bind_addr(),
            reply_timeout_secs: default_reply_timeout(),
            summary_timeout_secs: default_summary_timeout(),
            refine_timeout_secs: default_refine_timeout(),
            autosave_interval_secs: default_autosave_interval(),
            autosave_default: true,
            reply_window: ReplyWindow::default(),
        }
    }
}

impl AppConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Path to the config file: `MINDLY_CONFIG`, or `mindly_config.toml` next to the executable.
    pub fn config_path() -> PathBuf {
        match env::var("MINDLY_CONFIG") {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => Self::get_base_dir().join("mindly_config.toml"),
        }
    }

    /// Load config from the TOML file, then apply environment overrides.
    pub fn load() -> Self {
        Self::load_file(&Self::config_path()).with_env_overrides(|key| env::var(key).ok())
    }

    /// Read one TOML file. A missing or malformed file yields the defaults.
    pub fn load_file(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<AppConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    config
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::warn!("No config file found, using defaults + env vars");
                Self::default()
            }
        }
    }

    /// Save config to the config file path
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Apply overrides from a variable lookup (the process environment in production).
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("MINDLY_LLM_API_URL") {
            self.llm_api_url = url;
        }

        if let Some(model) = lookup("MINDLY_LLM_MODEL") {
            self.llm_model = model;
        }

        if let Some(key) = lookup("OPENROUTER_API_KEY").or_else(|| lookup("MINDLY_LLM_API_KEY")) {
            if !key.trim().is_empty() {
                self.llm_api_key = Some(key.trim().to_string());
            }
        }

        if let Some(dir) = lookup("MINDLY_CONFIG_DIR") {
            if !dir.trim().is_empty() {
                self.config_dir = dir;
            }
        }

        if let Some(dir) = lookup("MINDLY_USERDATA_DIR") {
            if !dir.trim().is_empty() {
                self.userdata_dir = dir;
            }
        }

        if let Some(addr) = lookup("MINDLY_BIND") {
            if !addr.trim().is_empty() {
                self.bind_addr = addr;
            }
        }

        if let Some(interval) = lookup("MINDLY_AUTOSAVE_INTERVAL_SECS") {
            if let Ok(seconds) = interval.parse() {
                self.autosave_interval_secs = seconds;
            }
        }

        if let Some(enabled) = lookup("MINDLY_AUTOSAVE") {
            self.autosave_default = enabled.eq_ignore_ascii_case("1")
                || enabled.eq_ignore_ascii_case("true")
                || enabled.eq_ignore_ascii_case("yes");
        }

        if let Some(window) = lookup("MINDLY_REPLY_WINDOW") {
            match ReplyWindow::parse(&window) {
                Some(parsed) => self.reply_window = parsed,
                None => tracing::warn!("Ignoring unknown MINDLY_REPLY_WINDOW '{}'", window),
            }
        }

        self
    }

    pub fn credentials_path(&self) -> PathBuf {
        PathBuf::from(&self.config_dir).join("users.yaml")
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }

    pub fn summary_timeout(&self) -> Duration {
        Duration::from_secs(self.summary_timeout_secs)
    }

    pub fn refine_timeout(&self) -> Duration {
        Duration::from_secs(self.refine_timeout_secs)
    }

    pub fn autosave_interval(&self) -> Duration {
        Duration::from_secs(self.autosave_interval_secs)
    }

    /// Create the credential and user-data directories if they are missing.
    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.config_dir)
            .with_context(|| format!("Failed to create config dir {:?}", self.config_dir))?;
        fs::create_dir_all(&self.userdata_dir)
            .with_context(|| format!("Failed to create userdata dir {:?}", self.userdata_dir))?;
        Ok(())
    }
}
