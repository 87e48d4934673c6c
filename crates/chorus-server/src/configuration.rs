use crate::error::{to_env_var, ConfigError};
use chorus::capability::{CapabilityProvider, McpServerConfig, McpStdioClient};
use chorus::orchestrator::BackendSpec;
use chorus::providers::{
    configs::{
        AnthropicProviderConfig, OllamaProviderConfig, OpenAiProviderConfig, ProviderConfig,
        ANTHROPIC_HOST, ANTHROPIC_MODEL, OLLAMA_HOST, OLLAMA_MODEL, OPENAI_HOST, OPENAI_MODEL,
    },
    factory::BackendKind,
};
use config::{Config, Environment};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant with access to advanced tools. Use them when appropriate to provide more accurate and helpful information.";

#[derive(Debug, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerSettings {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let address = format!("{}:{}", self.host, self.port);
        address
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(address))
    }
}

#[derive(Debug, Deserialize)]
pub struct CapabilitySettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_capability_command")]
    pub command: String,
    #[serde(default = "default_capability_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub brave_api_key: Option<String>,
}

impl Default for CapabilitySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            command: default_capability_command(),
            args: default_capability_args(),
            brave_api_key: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AnthropicSettings {
    /// Unset: run when an api key is present. `true` makes the key required.
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_anthropic_host")]
    pub host: String,
    #[serde(default = "default_anthropic_model")]
    pub model: String,
    #[serde(default)]
    pub max_tokens: Option<i32>,
    #[serde(default = "default_anthropic_label")]
    pub label: String,
}

impl Default for AnthropicSettings {
    fn default() -> Self {
        Self {
            enabled: None,
            api_key: None,
            host: default_anthropic_host(),
            model: default_anthropic_model(),
            max_tokens: None,
            label: default_anthropic_label(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct OpenAiSettings {
    /// Unset: run when an api key is present. `true` makes the key required.
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_openai_host")]
    pub host: String,
    #[serde(default = "default_openai_model")]
    pub model: String,
    #[serde(default = "default_openai_label")]
    pub label: String,
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            enabled: None,
            api_key: None,
            host: default_openai_host(),
            model: default_openai_model(),
            label: default_openai_label(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct OllamaSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Backend id clients select in `windows`
    #[serde(default = "default_ollama_id")]
    pub id: String,
    #[serde(default = "default_ollama_host")]
    pub host: String,
    #[serde(default = "default_ollama_model")]
    pub model: String,
    #[serde(default = "default_ollama_label")]
    pub label: String,
    #[serde(default = "default_hold_threshold")]
    pub hold_threshold: usize,
    #[serde(default = "default_release_chunk")]
    pub release_chunk: usize,
    #[serde(default)]
    pub tool_prompt: Option<PathBuf>,
}

impl Default for OllamaSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            id: default_ollama_id(),
            host: default_ollama_host(),
            model: default_ollama_model(),
            label: default_ollama_label(),
            hold_threshold: default_hold_threshold(),
            release_chunk: default_release_chunk(),
            tool_prompt: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct BackendSettings {
    #[serde(default)]
    pub ollama: OllamaSettings,
    #[serde(default)]
    pub anthropic: AnthropicSettings,
    #[serde(default)]
    pub openai: OpenAiSettings,
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default)]
    pub capability: CapabilitySettings,
    #[serde(default)]
    pub backends: BackendSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::load_and_validate()
    }

    fn load_and_validate() -> Result<Self, ConfigError> {
        // Start with default configuration
        let config = Config::builder()
            // Server defaults
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port())?
            // Layer on the environment variables
            .add_source(
                Environment::with_prefix("CHORUS")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(" ")
                    .with_list_parse_key("capability.args")
                    .try_parsing(true),
            )
            .build()?;

        // Try to deserialize the configuration
        let result: Result<Self, config::ConfigError> = config.try_deserialize();

        // Handle missing field errors specially
        match result {
            Ok(settings) => Ok(settings),
            Err(err) => {
                tracing::debug!("Configuration error: {:?}", &err);

                let error_str = err.to_string();
                if error_str.starts_with("missing field") {
                    // Extract field name from error message "missing field `type`"
                    let field = error_str
                        .trim_start_matches("missing field `")
                        .trim_end_matches('`');
                    Err(ConfigError::MissingEnvVar {
                        env_var: to_env_var(field),
                    })
                } else if let config::ConfigError::NotFound(field) = &err {
                    Err(ConfigError::MissingEnvVar {
                        env_var: to_env_var(field),
                    })
                } else {
                    Err(ConfigError::Other(err))
                }
            }
        }
    }

    /// Backends to run, in the order their answers are labelled.
    ///
    /// Cloud backends without an api key are skipped unless explicitly enabled,
    /// in which case the missing key is an error.
    pub fn backend_specs(&self) -> Result<Vec<BackendSpec>, ConfigError> {
        let mut specs = Vec::new();
        let backends = &self.backends;

        if backends.ollama.enabled {
            let ollama = &backends.ollama;
            specs.push(BackendSpec {
                id: ollama.id.clone(),
                label: ollama.label.clone(),
                config: ProviderConfig::Ollama(OllamaProviderConfig {
                    host: ollama.host.clone(),
                    model: ollama.model.clone(),
                    hold_threshold: ollama.hold_threshold,
                    release_chunk: ollama.release_chunk,
                    tool_prompt: ollama.tool_prompt.clone(),
                }),
            });
        }

        let anthropic = &backends.anthropic;
        if let Some(api_key) = cloud_api_key(BackendKind::Anthropic, anthropic.enabled, &anthropic.api_key)? {
            specs.push(BackendSpec {
                id: BackendKind::Anthropic.to_string(),
                label: anthropic.label.clone(),
                config: ProviderConfig::Anthropic(AnthropicProviderConfig {
                    host: anthropic.host.clone(),
                    api_key,
                    model: anthropic.model.clone(),
                    max_tokens: anthropic.max_tokens,
                    temperature: None,
                }),
            });
        }

        let openai = &backends.openai;
        if let Some(api_key) = cloud_api_key(BackendKind::OpenAi, openai.enabled, &openai.api_key)? {
            specs.push(BackendSpec {
                id: BackendKind::OpenAi.to_string(),
                label: openai.label.clone(),
                config: ProviderConfig::OpenAi(OpenAiProviderConfig {
                    host: openai.host.clone(),
                    api_key,
                    model: openai.model.clone(),
                    temperature: None,
                }),
            });
        }

        Ok(specs)
    }

    /// The shared tool server, if enabled
    pub fn capability_provider(&self) -> Option<Arc<dyn CapabilityProvider>> {
        let capability = &self.capability;
        if !capability.enabled {
            return None;
        }

        let mut env = HashMap::new();
        match &capability.brave_api_key {
            Some(key) => {
                env.insert("BRAVE_API_KEY".to_string(), key.clone());
            }
            None => warn!(
                "{} is not set, the search tool server may refuse to start",
                to_env_var("capability.brave_api_key")
            ),
        }

        Some(Arc::new(McpStdioClient::new(McpServerConfig {
            command: capability.command.clone(),
            args: capability.args.clone(),
            env,
        })))
    }
}

fn cloud_api_key(
    kind: BackendKind,
    enabled: Option<bool>,
    api_key: &Option<String>,
) -> Result<Option<String>, ConfigError> {
    let api_key = api_key.as_ref().filter(|key| !key.trim().is_empty()).cloned();
    match (enabled, api_key) {
        (Some(false), _) => Ok(None),
        (_, Some(key)) => Ok(Some(key)),
        (Some(true), None) => Err(ConfigError::MissingEnvVar {
            env_var: to_env_var(&format!("backends.{}.api_key", kind)),
        }),
        (None, None) => {
            warn!("No api key configured for {}, skipping it", kind);
            Ok(None)
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_capability_command() -> String {
    McpServerConfig::brave_search("").command
}

fn default_capability_args() -> Vec<String> {
    McpServerConfig::brave_search("").args
}

fn default_anthropic_host() -> String {
    ANTHROPIC_HOST.to_string()
}

fn default_anthropic_model() -> String {
    ANTHROPIC_MODEL.to_string()
}

fn default_anthropic_label() -> String {
    "response2".to_string()
}

fn default_openai_host() -> String {
    OPENAI_HOST.to_string()
}

fn default_openai_model() -> String {
    OPENAI_MODEL.to_string()
}

fn default_openai_label() -> String {
    "response3".to_string()
}

fn default_ollama_id() -> String {
    "llama".to_string()
}

fn default_ollama_host() -> String {
    OLLAMA_HOST.to_string()
}

fn default_ollama_model() -> String {
    OLLAMA_MODEL.to_string()
}

fn default_ollama_label() -> String {
    "response1".to_string()
}

fn default_hold_threshold() -> usize {
    OllamaProviderConfig::default().hold_threshold
}

fn default_release_chunk() -> usize {
    OllamaProviderConfig::default().release_chunk
}
