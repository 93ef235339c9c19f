//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AgentFlowError, Result};

/// Top-level AgentFlow configuration, read from a JSON5 file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    #[serde(default)]
    pub defaults: DefaultsConfig,

    #[serde(default)]
    pub pool: PoolSettings,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub skills: SkillsConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Wire protocol family a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Ollama,
    Groq,
    Together,
    OpenaiCompatible,
}

impl ProviderKind {
    /// Infer the kind from a provider id. Unknown ids are OpenAI-compatible.
    pub fn infer(id: &str) -> Self {
        match id.to_ascii_lowercase().as_str() {
            "ollama" => ProviderKind::Ollama,
            "groq" => ProviderKind::Groq,
            "together" => ProviderKind::Together,
            _ => ProviderKind::OpenaiCompatible,
        }
    }
}

/// Configuration for a single LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ProviderKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
}

impl ProviderConfig {
    pub fn kind(&self) -> ProviderKind {
        self.kind.unwrap_or_else(|| ProviderKind::infer(&self.id))
    }

    /// Resolve the API key: check `api_key` field first, then `api_key_env` environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Default `provider/model` specs per role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_model_spec")]
    pub main: String,
    #[serde(default = "default_model_spec")]
    pub subagent: String,
    #[serde(default = "default_model_spec")]
    pub reviewer: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            main: default_model_spec(),
            subagent: default_model_spec(),
            reviewer: default_model_spec(),
        }
    }
}

fn default_model_spec() -> String {
    "ollama/llama3.3:latest".into()
}

/// Subagent pool settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Maximum concurrently running subagents (default: 5).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,

    /// System prompt for spawned agents. Defaults to a per-task prompt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

/// Sampling settings applied to every request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillsConfig {
    /// Directories or single `.md` files to load skills from.
    #[serde(default)]
    pub paths: Vec<String>,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            paths: vec!["skills".into(), ".agentflow/skills".into()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "agentflow_providers=debug").
    #[serde(default)]
    pub filters: Vec<String>,
}

fn default_log_format() -> String {
    "plain".into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            providers: vec![ProviderConfig {
                id: "ollama".into(),
                kind: Some(ProviderKind::Ollama),
                base_url: Some("http://localhost:11434".into()),
                api_key: None,
                api_key_env: None,
                models: vec!["llama3.3:latest".into(), "codellama:latest".into()],
            }],
            defaults: DefaultsConfig::default(),
            pool: PoolSettings::default(),
            generation: GenerationConfig::default(),
            skills: SkillsConfig::default(),
            logging: None,
        }
    }
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| AgentFlowError::Config(e.to_string()))?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned())
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    /// A missing file yields the default config.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    /// Parse config text (JSON5) after env substitution.
    pub fn parse(raw: &str) -> Result<Self> {
        let substituted = substitute_env_vars(raw)?;
        json5::from_str(&substituted).map_err(|e| AgentFlowError::Config(e.to_string()))
    }

    /// Default config file path: `~/.agentflow/config.json`.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    /// Find a provider config by id.
    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.id == id)
    }

    pub fn max_concurrent(&self) -> usize {
        self.pool.max_concurrent.filter(|n| *n > 0).unwrap_or(5)
    }

    pub fn temperature(&self) -> f64 {
        self.generation.temperature.unwrap_or(0.0)
    }

    pub fn max_tokens(&self) -> u32 {
        self.generation.max_tokens.unwrap_or(0)
    }

    /// Skill paths with `~` expanded.
    pub fn skill_paths(&self) -> Vec<PathBuf> {
        self.skills
            .paths
            .iter()
            .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
            .collect()
    }

    /// Validate config, returning warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        for p in &self.providers {
            if p.kind() != ProviderKind::Ollama && p.resolve_api_key().is_none() {
                warnings.push(format!("Provider '{}' has no API key configured", p.id));
            }
        }

        for (role, spec) in [
            ("main", &self.defaults.main),
            ("subagent", &self.defaults.subagent),
            ("reviewer", &self.defaults.reviewer),
        ] {
            match spec.split_once('/') {
                None => warnings.push(format!(
                    "Default {role} model '{spec}' is not in provider/model form"
                )),
                Some((provider, _)) if self.provider(provider).is_none() => {
                    warnings.push(format!(
                        "Default {role} model '{spec}' names unconfigured provider '{provider}'"
                    ))
                }
                Some(_) => {}
            }
        }

        warnings
    }

    /// Save config to a file as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Base directory for AgentFlow data: `~/.agentflow/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".agentflow")
}
