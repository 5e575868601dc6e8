use std::collections::BTreeMap;

use serde_json::Value;
use tokio::sync::mpsc;
use types::{
    Context, Message, MessageRole, Provider, ProviderError, ProviderId, Response, StreamItem,
    StreamPayload, ToolCall, ToolCallDelta, UsageUpdate,
};

/// Runs one model call, forwarding text as `text-delta` events while it
/// arrives. `emitted` flips to `true` once anything reached the caller, which
/// makes the call unsafe to repeat.
pub(crate) async fn collect_response(
    provider: &dyn Provider,
    context: &Context,
    buffer_size: usize,
    events: &mpsc::Sender<StreamPayload>,
    emitted: &mut bool,
) -> Result<Response, ProviderError> {
    let caps = provider.capabilities(&context.model)?;
    if !caps.supports_streaming {
        let response = provider.complete(context).await?;
        if let Some(text) = response.message.content.as_ref().filter(|text| !text.is_empty()) {
            *emitted = true;
            let _ = events
                .send(StreamPayload::TextDelta {
                    delta: text.clone(),
                })
                .await;
        }
        return Ok(response);
    }

    let mut stream = provider.stream(context, buffer_size).await?;
    let mut text_buffer = String::new();
    let mut tool_calls = ToolCallAccumulator::default();
    let mut finish_reason = None;
    let mut usage: Option<UsageUpdate> = None;

    while let Some(item) = stream.recv().await {
        match item? {
            StreamItem::Text(text) => {
                if text.is_empty() {
                    continue;
                }
                text_buffer.push_str(&text);
                *emitted = true;
                let _ = events.send(StreamPayload::TextDelta { delta: text }).await;
            }
            StreamItem::ToolCallDelta(delta) => tool_calls.merge(delta),
            StreamItem::FinishReason(reason) => finish_reason = Some(reason),
            StreamItem::UsageUpdate(update) => usage.get_or_insert_default().merge(&update),
            StreamItem::ConnectionLost(message) => {
                return Err(ProviderError::StreamInterrupted {
                    provider: context.provider.clone(),
                    message,
                });
            }
        }
    }

    let tool_calls = tool_calls.build(&context.provider)?;
    let message = Message {
        role: MessageRole::Assistant,
        content: (!text_buffer.is_empty()).then_some(text_buffer),
        tool_calls: tool_calls.clone(),
        tool_call_id: None,
    };
    Ok(Response {
        message,
        tool_calls,
        finish_reason,
        usage,
    })
}

/// Reassembles streamed tool-call fragments by index.
#[derive(Debug, Default)]
pub(crate) struct ToolCallAccumulator {
    by_index: BTreeMap<usize, ToolCallAccumulatorEntry>,
}

#[derive(Debug, Default)]
struct ToolCallAccumulatorEntry {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

impl ToolCallAccumulator {
    pub(crate) fn merge(&mut self, delta: ToolCallDelta) {
        let entry = self.by_index.entry(delta.index).or_default();
        if let Some(id) = delta.id {
            entry.id = Some(id);
        }
        if let Some(name) = delta.name {
            entry.name = Some(name);
        }
        if let Some(arguments) = delta.arguments {
            entry.arguments.push_str(&arguments);
        }
    }

    /// Arguments that are not valid JSON are kept verbatim as a string so
    /// schema validation rejects them and the model sees why.
    pub(crate) fn build(self, provider: &ProviderId) -> Result<Vec<ToolCall>, ProviderError> {
        let mut tool_calls = Vec::with_capacity(self.by_index.len());
        for (index, entry) in self.by_index {
            let id = entry.id.ok_or_else(|| ProviderError::ResponseParse {
                provider: provider.clone(),
                message: format!("streamed tool-call at index {index} is missing id"),
            })?;
            let name = entry.name.ok_or_else(|| ProviderError::ResponseParse {
                provider: provider.clone(),
                message: format!("streamed tool-call at index {index} is missing function name"),
            })?;
            let raw = entry.arguments.trim();
            let arguments = if raw.is_empty() {
                Value::Object(serde_json::Map::new())
            } else {
                serde_json::from_str(raw).unwrap_or_else(|error| {
                    tracing::debug!(tool = %name, %error, "tool call arguments are not valid JSON");
                    Value::String(raw.to_owned())
                })
            };
            tool_calls.push(ToolCall {
                id,
                name,
                arguments,
            });
        }
        Ok(tool_calls)
    }
}
