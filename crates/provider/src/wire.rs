//! Request and response bodies of the `/v1/chat/completions` endpoint.
//!
//! Requests borrow from the [`Context`] they are built from; responses are
//! owned and converted into the crate-neutral [`Response`].

use serde::{Deserialize, Serialize};
use types::{
    Context, FunctionDecl, Message, MessageRole, ProviderError, ProviderId, Response, ToolCall,
    UsageUpdate,
};

const FUNCTION_KIND: &str = "function";
const MAX_ERROR_MESSAGE_CHARS: usize = 512;

#[derive(Debug, Serialize)]
pub(crate) struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

impl<'a> ChatRequest<'a> {
    /// Tools are offered with `tool_choice: auto`; streamed requests ask for
    /// a trailing usage chunk.
    pub(crate) fn new(context: &'a Context, stream: bool) -> Self {
        let tools = context.tools.iter().map(WireTool::from).collect::<Vec<_>>();
        Self {
            model: &context.model.0,
            messages: context.messages.iter().map(WireMessage::from).collect(),
            tool_choice: (!tools.is_empty()).then_some("auto"),
            tools,
            max_tokens: context.max_tokens,
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
}

impl<'a> From<&'a Message> for WireMessage<'a> {
    fn from(message: &'a Message) -> Self {
        Self {
            role: message.role.as_str(),
            content: message.content.as_deref(),
            tool_calls: message
                .tool_calls
                .iter()
                .map(|call| WireToolCall {
                    id: &call.id,
                    kind: FUNCTION_KIND,
                    function: WireInvocation {
                        name: &call.name,
                        arguments: call.arguments.to_string(),
                    },
                })
                .collect(),
            tool_call_id: message.tool_call_id.as_deref(),
        }
    }
}

#[derive(Debug, Serialize)]
struct WireToolCall<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireInvocation<'a>,
}

/// Arguments travel as a JSON-encoded string.
#[derive(Debug, Serialize)]
struct WireInvocation<'a> {
    name: &'a str,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: &'a FunctionDecl,
}

impl<'a> From<&'a FunctionDecl> for WireTool<'a> {
    fn from(function: &'a FunctionDecl) -> Self {
        Self {
            kind: FUNCTION_KIND,
            function,
        }
    }
}

/// Body of a non-streamed completion.
#[derive(Debug, Deserialize)]
pub(crate) struct ChatCompletion {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<CompletionToolCall>,
}

#[derive(Debug, Deserialize)]
struct CompletionToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: CompletedInvocation,
}

#[derive(Debug, Deserialize)]
struct CompletedInvocation {
    name: String,
    #[serde(default)]
    arguments: String,
}

impl ChatCompletion {
    /// Keeps the first choice. Empty argument strings decode as `{}`.
    pub(crate) fn into_response(self, provider: &ProviderId) -> Result<Response, ProviderError> {
        let malformed = |message: String| ProviderError::ResponseParse {
            provider: provider.clone(),
            message,
        };
        let Some(choice) = self.choices.into_iter().next() else {
            return Err(malformed("completion carried no choices".to_owned()));
        };
        let CompletionMessage {
            role,
            content,
            tool_calls,
        } = choice.message;
        let role = MessageRole::parse(&role)
            .ok_or_else(|| malformed(format!("completion used unknown role `{role}`")))?;

        let mut calls = Vec::with_capacity(tool_calls.len());
        for call in tool_calls {
            if call.kind != FUNCTION_KIND {
                return Err(malformed(format!(
                    "tool call `{}` has unsupported type `{}`",
                    call.id, call.kind
                )));
            }
            let raw = match call.function.arguments.trim() {
                "" => "{}",
                raw => raw,
            };
            let arguments = serde_json::from_str(raw).map_err(|error| {
                malformed(format!("tool call `{}` arguments are not JSON: {error}", call.id))
            })?;
            calls.push(ToolCall {
                id: call.id,
                name: call.function.name,
                arguments,
            });
        }

        Ok(Response {
            message: Message {
                role,
                content,
                tool_calls: calls.clone(),
                tool_call_id: None,
            },
            tool_calls: calls,
            finish_reason: choice.finish_reason,
            usage: self.usage.map(UsageUpdate::from),
        })
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
    #[serde(default)]
    total_tokens: Option<u64>,
}

impl From<WireUsage> for UsageUpdate {
    fn from(usage: WireUsage) -> Self {
        Self {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

/// Human-readable message for a failed request: `error.message` when the
/// body is an error envelope, otherwise the raw body, capped in length.
pub(crate) fn error_message(body: &str) -> String {
    let message = serde_json::from_str::<ErrorEnvelope>(body)
        .map(|envelope| envelope.error.message)
        .unwrap_or_default();
    let message = match message.trim() {
        "" => body.trim(),
        extracted => extracted,
    };
    if message.is_empty() {
        return "provider returned an empty error body".to_owned();
    }
    if message.chars().count() <= MAX_ERROR_MESSAGE_CHARS {
        return message.to_owned();
    }
    let mut capped = message
        .chars()
        .take(MAX_ERROR_MESSAGE_CHARS)
        .collect::<String>();
    capped.push_str("...");
    capped
}
