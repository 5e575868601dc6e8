use std::{env, sync::Arc};

use types::{
    AgentConfig, ModelCatalog, ModelDescriptor, ModelId, OPENAI_PROVIDER_ID, Provider,
    ProviderCaps, ProviderError, ProviderId,
};

mod openai;
mod retry;
mod stream_decoder;
mod wire;

pub use openai::OpenAIProvider;
pub use retry::{ReliableProvider, RetryPolicy};

pub(crate) const DEFAULT_STREAM_BUFFER_SIZE: usize = 64;

const BUILTIN_OPENAI_MODELS: &[(&str, &str, u32, u32)] = &[
    ("gpt-4o", "GPT-4o", 128_000, 16_384),
    ("gpt-4o-mini", "GPT-4o mini", 128_000, 16_384),
    ("gpt-4.1", "GPT-4.1", 1_047_576, 32_768),
    ("gpt-4.1-mini", "GPT-4.1 mini", 1_047_576, 32_768),
    ("o3-mini", "o3-mini", 200_000, 100_000),
];

/// Catalog of the OpenAI models the gateway knows context windows for.
///
/// Models configured under `budget.context_windows` are appended so a
/// compatible endpoint serving other model ids passes catalog validation.
pub fn builtin_catalog(config: &AgentConfig) -> ModelCatalog {
    let provider = ProviderId::from(OPENAI_PROVIDER_ID);
    let mut models = BUILTIN_OPENAI_MODELS
        .iter()
        .map(|(model, display_name, context, output)| ModelDescriptor {
            provider: provider.clone(),
            model: ModelId::from(*model),
            display_name: Some((*display_name).to_owned()),
            caps: ProviderCaps {
                supports_streaming: true,
                supports_tools: true,
                max_context_tokens: Some(*context),
                max_output_tokens: Some(*output),
            },
        })
        .collect::<Vec<_>>();

    for (model, window) in &config.budget.context_windows {
        let model_id = ModelId::from(model.as_str());
        if let Some(existing) = models.iter_mut().find(|entry| entry.model == model_id) {
            existing.caps.max_context_tokens = Some(*window);
            continue;
        }
        models.push(ModelDescriptor {
            provider: provider.clone(),
            model: model_id,
            display_name: None,
            caps: ProviderCaps {
                supports_streaming: true,
                supports_tools: true,
                max_context_tokens: Some(*window),
                max_output_tokens: None,
            },
        });
    }

    let selected = &config.selection.model;
    if !models.iter().any(|entry| entry.model == *selected) {
        models.push(ModelDescriptor {
            provider,
            model: selected.clone(),
            display_name: None,
            caps: ProviderCaps {
                supports_streaming: true,
                supports_tools: true,
                max_context_tokens: None,
                max_output_tokens: None,
            },
        });
    }

    ModelCatalog::new(models)
}

/// API key resolution order: explicit config value, `OPENAI_API_KEY`, then
/// the generic `API_KEY`. Blank values are skipped.
pub fn resolve_api_key(config: &AgentConfig) -> Option<String> {
    first_present([
        config.providers.openai.api_key.clone(),
        env::var("OPENAI_API_KEY").ok(),
        env::var("API_KEY").ok(),
    ])
}

/// Builds the configured provider wrapped in the retry layer.
pub fn build_provider(config: &AgentConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    let provider_id = config.selection.provider.clone();
    if provider_id.0 != OPENAI_PROVIDER_ID {
        return Err(ProviderError::RequestFailed {
            provider: provider_id,
            message: "only the openai provider is supported".to_owned(),
        });
    }
    let api_key = resolve_api_key(config).ok_or_else(|| ProviderError::MissingApiKey {
        provider: provider_id.clone(),
    })?;
    let inner = OpenAIProvider::new(
        provider_id,
        api_key,
        &config.providers.openai.base_url,
        builtin_catalog(config),
    );
    Ok(Arc::new(ReliableProvider::new(
        Box::new(inner),
        RetryPolicy::from(&config.reliability),
    )))
}

fn first_present(candidates: impl IntoIterator<Item = Option<String>>) -> Option<String> {
    candidates
        .into_iter()
        .flatten()
        .map(|candidate| candidate.trim().to_owned())
        .find(|candidate| !candidate.is_empty())
}
