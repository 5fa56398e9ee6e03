use serde::Deserialize;
use std::{fs, path::Path, time::Duration};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

fn default_db_path() -> String {
    "store/picotinho.db".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            log_filter: default_log_filter(),
            llm: LlmSection::default(),
            pipeline: PipelineConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmBackend {
    Ollama,
    Remote,
    /// No AI service: extraction is unavailable and normalization runs on rules only.
    Disabled,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_backend")]
    pub backend: LlmBackend,
    #[serde(default = "default_ollama")]
    pub ollama: EndpointConfig,
    #[serde(default = "default_remote")]
    pub remote: EndpointConfig,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_backend() -> LlmBackend {
    LlmBackend::Ollama
}

fn default_ollama() -> EndpointConfig {
    EndpointConfig {
        base_url: "http://localhost:11434/v1".to_string(),
        model: "qwen3:8b".to_string(),
    }
}

fn default_remote() -> EndpointConfig {
    EndpointConfig {
        base_url: "https://api.openai.com/v1".to_string(),
        model: "gpt-4o-mini".to_string(),
    }
}

fn default_timeout_secs() -> u64 {
    60
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            ollama: default_ollama(),
            remote: default_remote(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub base_url: String,
    pub model: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Extractions whose confidence falls below this wait for user confirmation.
    #[serde(default = "default_ambiguity_threshold")]
    pub ambiguity_threshold: f64,
    /// Classifier answers below this confidence are treated as degraded.
    #[serde(default = "default_classifier_min_confidence")]
    pub classifier_min_confidence: f64,
    #[serde(default = "default_stuck_after_secs")]
    pub stuck_after_secs: u64,
    #[serde(default = "default_max_extraction_attempts")]
    pub max_extraction_attempts: u32,
}

fn default_ambiguity_threshold() -> f64 {
    0.6
}

fn default_classifier_min_confidence() -> f64 {
    0.5
}

fn default_stuck_after_secs() -> u64 {
    15 * 60
}

fn default_max_extraction_attempts() -> u32 {
    3
}

impl PipelineConfig {
    pub fn stuck_after(&self) -> Duration {
        Duration::from_secs(self.stuck_after_secs)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ambiguity_threshold: default_ambiguity_threshold(),
            classifier_min_confidence: default_classifier_min_confidence(),
            stuck_after_secs: default_stuck_after_secs(),
            max_extraction_attempts: default_max_extraction_attempts(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MaintenanceConfig {
    /// Delete rows left at zero quantity when consolidating duplicates.
    #[serde(default)]
    pub purge_empty_entries: bool,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error>> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}
