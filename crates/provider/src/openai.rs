use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::mpsc;
use types::{
    Context, ModelCatalog, Provider, ProviderError, ProviderId, ProviderStream, Response,
    StreamItem,
};

use crate::{
    DEFAULT_STREAM_BUFFER_SIZE,
    stream_decoder::StreamDecoder,
    wire::{ChatCompletion, ChatRequest, error_message},
};

const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

type ItemSender = mpsc::Sender<Result<StreamItem, ProviderError>>;

/// Model client for OpenAI and any endpoint speaking its chat-completions
/// protocol.
#[derive(Debug, Clone)]
pub struct OpenAIProvider {
    http: Client,
    id: ProviderId,
    catalog: ModelCatalog,
    endpoint: String,
    api_key: String,
}

impl OpenAIProvider {
    /// An empty `base_url` falls back to the public OpenAI API.
    pub fn new(id: ProviderId, api_key: String, base_url: &str, catalog: ModelCatalog) -> Self {
        let base_url = match base_url.trim().trim_end_matches('/') {
            "" => types::OPENAI_DEFAULT_BASE_URL.trim_end_matches('/'),
            trimmed => trimmed,
        };
        Self {
            http: Client::new(),
            id,
            catalog,
            endpoint: format!("{base_url}{CHAT_COMPLETIONS_PATH}"),
            api_key,
        }
    }

    fn check_target(&self, context: &Context) -> Result<(), ProviderError> {
        if context.provider != self.id {
            return Err(ProviderError::RequestFailed {
                provider: self.id.clone(),
                message: format!(
                    "context targets provider `{}`, not `{}`",
                    context.provider, self.id
                ),
            });
        }
        self.catalog.validate(&self.id, &context.model)?;
        Ok(())
    }

    /// Sends one request. Non-2xx statuses become `HttpStatus` carrying the
    /// endpoint's own error message.
    async fn post(&self, request: &ChatRequest<'_>) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|error| ProviderError::Transport {
                provider: self.id.clone(),
                message: error.to_string(),
            })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|error| format!("error body unreadable: {error}"));
        tracing::debug!(provider = %self.id, status = status.as_u16(), "chat completion rejected");
        Err(ProviderError::HttpStatus {
            provider: self.id.clone(),
            status: status.as_u16(),
            message: error_message(&body),
        })
    }
}

#[async_trait]
impl Provider for OpenAIProvider {
    fn provider_id(&self) -> &ProviderId {
        &self.id
    }

    fn model_catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    async fn complete(&self, context: &Context) -> Result<Response, ProviderError> {
        self.check_target(context)?;
        tracing::debug!(provider = %self.id, model = %context.model, "requesting chat completion");
        let response = self.post(&ChatRequest::new(context, false)).await?;
        let completion = response.json::<ChatCompletion>().await.map_err(|error| {
            ProviderError::ResponseParse {
                provider: self.id.clone(),
                message: error.to_string(),
            }
        })?;
        completion.into_response(&self.id)
    }

    async fn stream(
        &self,
        context: &Context,
        buffer_size: usize,
    ) -> Result<ProviderStream, ProviderError> {
        self.check_target(context)?;
        tracing::debug!(
            provider = %self.id,
            model = %context.model,
            max_tokens = ?context.max_tokens,
            "opening chat completion stream"
        );
        let response = self.post(&ChatRequest::new(context, true)).await?;
        let (sender, receiver) = mpsc::channel(match buffer_size {
            0 => DEFAULT_STREAM_BUFFER_SIZE,
            size => size,
        });
        tokio::spawn(relay_stream(response, sender, self.id.clone()));
        Ok(receiver)
    }
}

/// Decodes the response body into the channel until `[DONE]`, a decode
/// failure, or the receiver hanging up. A body that ends or breaks before
/// `[DONE]` finishes with `ConnectionLost` so the retry layer can decide
/// whether the attempt is repeatable.
async fn relay_stream(mut body: reqwest::Response, sender: ItemSender, provider: ProviderId) {
    let mut decoder = StreamDecoder::default();
    let mut ended = false;
    while !ended && !decoder.is_done() {
        let decoded = match body.chunk().await {
            Ok(Some(bytes)) => decoder.feed(&bytes),
            Ok(None) => {
                ended = true;
                decoder.finish()
            }
            Err(error) => {
                tracing::warn!(%provider, %error, "chat completion stream dropped");
                let lost = StreamItem::ConnectionLost(format!("stream transport dropped: {error}"));
                let _ = sender.send(Ok(lost)).await;
                return;
            }
        };
        if !forward(&sender, &provider, decoded).await {
            return;
        }
    }
    if !decoder.is_done() {
        let lost = StreamItem::ConnectionLost("stream ended before [DONE] sentinel".to_owned());
        let _ = sender.send(Ok(lost)).await;
    }
}

/// Returns `false` when relaying should stop.
async fn forward(
    sender: &ItemSender,
    provider: &ProviderId,
    decoded: Result<Vec<StreamItem>, String>,
) -> bool {
    match decoded {
        Ok(items) => {
            for item in items {
                if sender.send(Ok(item)).await.is_err() {
                    return false;
                }
            }
            true
        }
        Err(message) => {
            let error = ProviderError::ResponseParse {
                provider: provider.clone(),
                message,
            };
            let _ = sender.send(Err(error)).await;
            false
        }
    }
}
