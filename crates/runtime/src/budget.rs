use std::collections::BTreeMap;

use types::{BudgetConfig, Message, ModelCatalog, ModelId};

pub const CLAMPED_MODEL_LIMIT: &str = "clamped_model_limit";
pub const CLAMPED_INVALID_REQUEST: &str = "clamped_invalid_request";

/// Tokens charged per message for role and framing overhead.
const MESSAGE_OVERHEAD_TOKENS: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBudget {
    pub max_tokens: u32,
    pub reasons: Vec<&'static str>,
}

/// Largest completion that fits next to `prompt_tokens` in the model window.
///
/// `requested_max` of `None` or `0` asks for everything available; `0` is
/// additionally reported as an invalid request. Never fails and never
/// returns less than one token.
pub fn compute_max_completion_tokens(
    prompt_tokens: u32,
    model_context_limit: u32,
    requested_max: Option<u32>,
) -> TokenBudget {
    let available = model_context_limit.saturating_sub(prompt_tokens).max(1);
    let mut reasons = Vec::new();

    let max_tokens = match requested_max {
        None => available,
        Some(0) => {
            reasons.push(CLAMPED_INVALID_REQUEST);
            available
        }
        Some(requested) if requested > available => {
            reasons.push(CLAMPED_MODEL_LIMIT);
            available
        }
        Some(requested) => requested,
    };

    TokenBudget {
        max_tokens,
        reasons,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenEstimate {
    pub tokens: u32,
    pub approximate: bool,
}

impl TokenEstimate {
    fn add(self, other: Self) -> Self {
        Self {
            tokens: self.tokens.saturating_add(other.tokens),
            approximate: self.approximate || other.approximate,
        }
    }
}

pub trait TokenCounter: Send + Sync {
    fn count(&self, model: &ModelId, text: &str) -> TokenEstimate;

    fn count_messages(&self, model: &ModelId, messages: &[Message]) -> TokenEstimate {
        messages.iter().fold(
            TokenEstimate {
                tokens: 0,
                approximate: false,
            },
            |total, message| {
                let mut estimate = TokenEstimate {
                    tokens: MESSAGE_OVERHEAD_TOKENS,
                    approximate: false,
                };
                if let Some(content) = &message.content {
                    estimate = estimate.add(self.count(model, content));
                }
                for call in &message.tool_calls {
                    estimate = estimate.add(self.count(model, &call.name));
                    estimate = estimate.add(self.count(model, &call.arguments.to_string()));
                }
                total.add(estimate)
            },
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    OpenAi,
    Anthropic,
    Gemini,
    Other,
}

impl ModelFamily {
    pub fn of(model: &ModelId) -> Self {
        let name = model.0.to_ascii_lowercase();
        if name.starts_with("gpt") || name.starts_with("o1") || name.starts_with("o3") {
            Self::OpenAi
        } else if name.starts_with("claude") {
            Self::Anthropic
        } else if name.starts_with("gemini") {
            Self::Gemini
        } else {
            Self::Other
        }
    }

    pub fn chars_per_token(self) -> f64 {
        match self {
            Self::OpenAi => 3.7,
            Self::Anthropic | Self::Gemini => 3.5,
            Self::Other => 3.3,
        }
    }
}

/// Character-ratio estimator; every estimate is flagged approximate.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicTokenCounter;

impl TokenCounter for HeuristicTokenCounter {
    fn count(&self, model: &ModelId, text: &str) -> TokenEstimate {
        let chars = text.chars().count() as f64;
        let tokens = (chars / ModelFamily::of(model).chars_per_token()).ceil();
        TokenEstimate {
            tokens: if tokens >= f64::from(u32::MAX) {
                u32::MAX
            } else {
                tokens as u32
            },
            approximate: true,
        }
    }
}

/// Context windows by model id with a conservative fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelLimits {
    windows: BTreeMap<String, u32>,
    fallback_context_tokens: u32,
}

impl ModelLimits {
    pub fn new(fallback_context_tokens: u32) -> Self {
        Self {
            windows: BTreeMap::new(),
            fallback_context_tokens: fallback_context_tokens.max(1),
        }
    }

    /// Catalog windows first, then explicit overrides from config.
    pub fn from_catalog(catalog: &ModelCatalog, config: &BudgetConfig) -> Self {
        let mut limits = Self::new(config.fallback_context_tokens);
        for descriptor in &catalog.models {
            if let Some(window) = descriptor.caps.max_context_tokens {
                limits.windows.insert(descriptor.model.0.clone(), window);
            }
        }
        for (model, window) in &config.context_windows {
            limits.windows.insert(model.clone(), *window);
        }
        limits
    }

    pub fn with_window(mut self, model: impl Into<String>, window: u32) -> Self {
        self.windows.insert(model.into(), window);
        self
    }

    pub fn context_limit(&self, model: &ModelId) -> u32 {
        self.windows
            .get(&model.0)
            .copied()
            .unwrap_or(self.fallback_context_tokens)
    }
}
