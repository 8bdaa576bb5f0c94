//! Provider selection: builds the configured engine adapter.

use std::sync::Arc;

use parley_config::EngineConfig;
use parley_core::error::ProviderError;
use parley_core::provider::Provider;
use tracing::debug;

use crate::openai_compat::OpenAiCompatProvider;

/// Build the engine named in `config.provider`.
///
/// Every known name maps onto the OpenAI-compatible adapter with that
/// service's base URL; `base_url` in the config wins when it was changed
/// from the default. Hosted services need an API key.
pub fn build_from_config(config: &EngineConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    let name = config.provider.as_str();
    let Some(default_url) = default_base_url(name) else {
        return Err(ProviderError::NotConfigured(format!(
            "unknown provider '{name}' (known: openai, openrouter, ollama, vllm, llamacpp, custom)"
        )));
    };

    let base_url = if config.base_url.is_empty()
        || (name != "openai" && config.base_url == OPENAI_URL)
    {
        default_url.to_string()
    } else {
        config.base_url.clone()
    };

    if config.api_key.is_none() && !is_local(&base_url) {
        return Err(ProviderError::NotConfigured(format!(
            "provider '{name}' at {base_url} needs an API key (set PARLEY_API_KEY)"
        )));
    }

    debug!(provider = name, base_url = %base_url, "Building provider");
    Ok(Arc::new(OpenAiCompatProvider::new(
        name,
        base_url,
        config.api_key.clone(),
    )?))
}

const OPENAI_URL: &str = "https://api.openai.com/v1";

/// Base URLs of well-known OpenAI-compatible services.
fn default_base_url(provider_name: &str) -> Option<&'static str> {
    Some(match provider_name {
        "openai" | "custom" => OPENAI_URL,
        "openrouter" => "https://openrouter.ai/api/v1",
        "ollama" => "http://localhost:11434/v1",
        "vllm" => "http://localhost:8000/v1",
        "llamacpp" | "llama.cpp" => "http://localhost:8080/v1",
        _ => return None,
    })
}

fn is_local(base_url: &str) -> bool {
    let host = base_url
        .split("://")
        .nth(1)
        .unwrap_or(base_url)
        .split(['/', ':'])
        .next()
        .unwrap_or_default();
    matches!(host, "localhost" | "127.0.0.1" | "0.0.0.0" | "[")
}
