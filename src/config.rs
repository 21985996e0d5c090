use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_top_k() -> usize {
    5
}

fn default_max_attempts() -> usize {
    2
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_summary_threshold_chars() -> usize {
    2400
}

fn default_max_research_tasks() -> usize {
    5
}

fn default_max_sections() -> usize {
    6
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub run: RunConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OllamaConfig {
    pub host: String,
    pub model: String,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        OllamaConfig {
            host: "http://localhost:11434".to_string(),
            model: "llama3.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SearchConfig {
    /// JSON search endpoint, SearxNG-style: GET {endpoint}?q=...&format=json
    pub endpoint: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            endpoint: "http://localhost:8888/search".to_string(),
            top_k: default_top_k(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_summary_threshold_chars")]
    pub summary_threshold_chars: usize,
    #[serde(default = "default_max_research_tasks")]
    pub max_research_tasks: usize,
    #[serde(default = "default_max_sections")]
    pub max_sections: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            summary_threshold_chars: default_summary_threshold_chars(),
            max_research_tasks: default_max_research_tasks(),
            max_sections: default_max_sections(),
        }
    }
}

impl RunConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Config {
    pub fn load() -> Self {
        let config_path = Self::get_config_path();

        if config_path.exists() {
            match fs::read_to_string(&config_path) {
                Ok(contents) => return Self::parse(&contents, &config_path),
                Err(e) => {
                    tracing::warn!("error reading {}: {}. Using defaults.", config_path.display(), e)
                }
            }
        } else if let Some(parent) = config_path.parent() {
            let _ = fs::create_dir_all(parent);
        }

        Config::default()
    }

    fn parse(contents: &str, path: &Path) -> Self {
        match toml::from_str(contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("error parsing {}: {}. Using defaults.", path.display(), e);
                Config::default()
            }
        }
    }

    pub fn get_config_path() -> PathBuf {
        Self::get_config_dir().join("config.toml")
    }

    pub fn get_config_dir() -> PathBuf {
        if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home).join(".config/deepscribe")
        } else {
            PathBuf::from(".")
        }
    }
}
