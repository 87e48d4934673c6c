use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use super::{
    anthropic::AnthropicAdapter, base::ProviderAdapter, configs::ProviderConfig,
    ollama::OllamaAdapter, openai::OpenAiAdapter,
};
use crate::capability::CapabilityProvider;

#[derive(EnumIter, Display, EnumString, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BackendKind {
    Anthropic,
    OpenAi,
    Ollama,
}

pub fn get_adapter(
    config: ProviderConfig,
    system_prompt: &str,
    capability: Option<Arc<dyn CapabilityProvider>>,
) -> Result<Arc<dyn ProviderAdapter>> {
    match config {
        ProviderConfig::Anthropic(anthropic_config) => Ok(Arc::new(AnthropicAdapter::new(
            anthropic_config,
            system_prompt,
            capability,
        )?)),
        ProviderConfig::OpenAi(openai_config) => Ok(Arc::new(OpenAiAdapter::new(
            openai_config,
            system_prompt,
            capability,
        )?)),
        ProviderConfig::Ollama(ollama_config) => Ok(Arc::new(OllamaAdapter::new(
            ollama_config,
            system_prompt,
            capability,
        )?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::configs::{OllamaProviderConfig, OpenAiProviderConfig};
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_backend_kind_names() {
        let names: Vec<String> = BackendKind::iter().map(|k| k.to_string()).collect();
        assert_eq!(names, vec!["anthropic", "openai", "ollama"]);
        assert_eq!(BackendKind::from_str("openai").unwrap(), BackendKind::OpenAi);
    }

    #[test]
    fn test_get_adapter() -> Result<()> {
        let adapter = get_adapter(
            ProviderConfig::OpenAi(OpenAiProviderConfig::new("key")),
            "system",
            None,
        )?;
        assert_eq!(adapter.kind(), BackendKind::OpenAi);

        let adapter = get_adapter(ProviderConfig::Ollama(OllamaProviderConfig::default()), "system", None)?;
        assert_eq!(adapter.kind(), BackendKind::Ollama);
        assert_eq!(adapter.conversation().system_prompt(), "system");
        Ok(())
    }
}
