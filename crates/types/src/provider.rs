use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    Context, ModelCatalog, ModelId, ProviderCaps, ProviderError, ProviderId, Response, StreamItem,
    ToolCallDelta,
};

pub type ProviderStream = mpsc::Receiver<Result<StreamItem, ProviderError>>;

#[async_trait]
pub trait Provider: Send + Sync {
    fn provider_id(&self) -> &ProviderId;

    fn model_catalog(&self) -> &ModelCatalog;

    fn capabilities(&self, model: &ModelId) -> Result<ProviderCaps, ProviderError> {
        let descriptor = self.model_catalog().validate(self.provider_id(), model)?;
        Ok(descriptor.caps.clone())
    }

    async fn complete(&self, context: &Context) -> Result<Response, ProviderError>;

    /// Streams a completion.
    ///
    /// Providers without native streaming inherit this adapter, which runs
    /// `complete` and replays the response as stream items.
    async fn stream(
        &self,
        context: &Context,
        buffer_size: usize,
    ) -> Result<ProviderStream, ProviderError> {
        let response = self.complete(context).await?;
        let items = response_to_stream_items(response);
        let (sender, receiver) = mpsc::channel(buffer_size.max(items.len()).max(1));
        for item in items {
            if sender.send(Ok(item)).await.is_err() {
                break;
            }
        }
        Ok(receiver)
    }
}

pub fn response_to_stream_items(response: Response) -> Vec<StreamItem> {
    let mut items = Vec::new();
    if let Some(content) = response.message.content.filter(|text| !text.is_empty()) {
        items.push(StreamItem::Text(content));
    }
    let tool_calls = if response.tool_calls.is_empty() {
        response.message.tool_calls
    } else {
        response.tool_calls
    };
    for (index, call) in tool_calls.into_iter().enumerate() {
        items.push(StreamItem::ToolCallDelta(ToolCallDelta {
            index,
            id: Some(call.id),
            name: Some(call.name),
            arguments: Some(call.arguments.to_string()),
        }));
    }
    if let Some(usage) = response.usage {
        items.push(StreamItem::UsageUpdate(usage));
    }
    items.push(StreamItem::FinishReason(
        response.finish_reason.unwrap_or_else(|| "stop".to_owned()),
    ));
    items
}
