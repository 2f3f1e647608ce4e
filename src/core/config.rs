//! Loads engine, logging and LLM provider settings.

use crate::api::error::FlowError;
use llm::builder::{LLMBackend, LLMBuilder};
use llm::LLMProvider;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Environment variable pointing at an alternative config file.
pub const CONFIG_ENV: &str = "PROMPT_FLOW_CONFIG";

#[derive(Deserialize, Debug, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    #[serde(default = "default_filter")]
    pub filter: String,
    #[serde(default = "default_ansi")]
    pub ansi: bool,
}

fn default_filter() -> String {
    "info".to_string()
}

fn default_ansi() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            ansi: default_ansi(),
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct EngineConfig {
    /// Upper bound on concurrently running branches of one `Parallel`.
    pub max_parallel_workers: Option<usize>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ProviderConfig {
    pub backend: String,
    pub model: String,
    pub api_key_env: Option<String>,
    pub base_url: Option<String>,
    pub temperature: Option<f32>,
    pub system: Option<String>,
}

impl Config {
    /// Loads `$PROMPT_FLOW_CONFIG`, falling back to `~/.prompt-flow/config.toml`.
    /// A missing file yields the defaults.
    pub fn load_default() -> Result<Self, FlowError> {
        let path = match env::var(CONFIG_ENV) {
            Ok(path) => PathBuf::from(path),
            Err(_) => {
                let home = env::var("HOME").map_err(|_| {
                    FlowError::Configuration("Unable to determine HOME directory".to_string())
                })?;
                PathBuf::from(home).join(".prompt-flow").join("config.toml")
            }
        };

        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    pub fn load(path: &Path) -> Result<Self, FlowError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, FlowError> {
        Ok(toml::from_str(content)?)
    }

    /// Builds the LLM provider registered under `name`.
    pub fn build_provider(&self, name: &str) -> Result<Box<dyn LLMProvider>, FlowError> {
        let provider_conf = self.providers.get(name).ok_or_else(|| {
            FlowError::Configuration(format!("Provider '{}' not found in config", name))
        })?;

        let backend = LLMBackend::from_str(&provider_conf.backend).map_err(|_| {
            FlowError::Configuration(format!(
                "Invalid backend '{}' for provider '{}'",
                provider_conf.backend, name
            ))
        })?;

        let api_key_env_var = provider_conf
            .api_key_env
            .clone()
            .unwrap_or_else(|| match backend {
                LLMBackend::OpenAI => "OPENAI_API_KEY".to_string(),
                LLMBackend::Anthropic => "ANTHROPIC_API_KEY".to_string(),
                _ => String::new(),
            });

        // Some backends like Ollama don't require a key
        let api_key = if api_key_env_var.is_empty() {
            String::new()
        } else {
            env::var(&api_key_env_var).map_err(|_| {
                FlowError::Configuration(format!(
                    "Environment variable '{}' not set for provider '{}'",
                    api_key_env_var, name
                ))
            })?
        };

        let mut builder = LLMBuilder::new().backend(backend).model(&provider_conf.model);
        if !api_key.is_empty() {
            builder = builder.api_key(api_key);
        }
        if let Some(base_url) = &provider_conf.base_url {
            builder = builder.base_url(base_url);
        }
        if let Some(temperature) = provider_conf.temperature {
            builder = builder.temperature(temperature);
        }
        if let Some(system) = &provider_conf.system {
            builder = builder.system(system);
        }

        Ok(builder.build()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.logging.filter, "info");
        assert!(config.logging.ansi);
        assert!(config.engine.max_parallel_workers.is_none());
        assert!(config.providers.is_empty());
    }

    #[test]
    fn parses_all_sections() {
        let config = Config::from_toml_str(
            r#"
            [logging]
            filter = "prompt_flow=debug"
            ansi = false

            [engine]
            max_parallel_workers = 4

            [providers.local]
            backend = "ollama"
            model = "llama3"
            base_url = "http://localhost:11434"
            temperature = 0.2
            "#,
        )
        .unwrap();
        assert_eq!(config.logging.filter, "prompt_flow=debug");
        assert!(!config.logging.ansi);
        assert_eq!(config.engine.max_parallel_workers, Some(4));
        let local = &config.providers["local"];
        assert_eq!(local.backend, "ollama");
        assert_eq!(local.model, "llama3");
        assert_eq!(local.temperature, Some(0.2));
        assert!(local.api_key_env.is_none());
    }

    #[test]
    fn malformed_toml_is_reported() {
        let err = Config::from_toml_str("[engine\nmax = ").unwrap_err();
        assert!(matches!(err, FlowError::Toml(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine]\nmax_parallel_workers = 2").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.engine.max_parallel_workers, Some(2));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, FlowError::Io(_)));
    }

    #[test]
    fn unknown_provider_is_a_configuration_error() {
        let err = Config::default().build_provider("nope").err().unwrap();
        assert!(matches!(err, FlowError::Configuration(msg) if msg.contains("nope")));
    }

    #[test]
    fn invalid_backend_is_a_configuration_error() {
        let config = Config::from_toml_str(
            r#"
            [providers.bad]
            backend = "not-a-backend"
            model = "m"
            "#,
        )
        .unwrap();
        let err = config.build_provider("bad").err().unwrap();
        assert!(matches!(err, FlowError::Configuration(msg) if msg.contains("Invalid backend")));
    }
}
