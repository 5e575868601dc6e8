use std::collections::BTreeMap;

use serde::Deserialize;
use types::{StreamItem, ToolCallDelta, UsageUpdate};

use crate::wire::WireUsage;

const DONE_SENTINEL: &str = "[DONE]";

/// Turns the raw bytes of a chat-completions event stream into
/// [`StreamItem`]s.
///
/// Bytes may be split anywhere, including inside a line. Fragments of one
/// tool call share an `index`; every emitted delta repeats the id and name
/// seen so far for that index so consumers can start rendering early.
#[derive(Debug, Default)]
pub(crate) struct StreamDecoder {
    unframed: Vec<u8>,
    event_data: Option<String>,
    calls: BTreeMap<usize, CallIdentity>,
    done: bool,
}

#[derive(Debug, Default)]
struct CallIdentity {
    id: Option<String>,
    name: Option<String>,
}

impl StreamDecoder {
    /// True once the `[DONE]` event was decoded. Bytes after it are ignored.
    pub(crate) fn is_done(&self) -> bool {
        self.done
    }

    pub(crate) fn feed(&mut self, bytes: &[u8]) -> Result<Vec<StreamItem>, String> {
        self.unframed.extend_from_slice(bytes);
        let mut items = Vec::new();
        while !self.done {
            let Some(end) = self.unframed.iter().position(|byte| *byte == b'\n') else {
                break;
            };
            let line = self.unframed.drain(..=end).collect::<Vec<_>>();
            self.read_line(&line[..end], &mut items)?;
        }
        Ok(items)
    }

    /// Flushes a trailing line and event left open when the body ended.
    pub(crate) fn finish(&mut self) -> Result<Vec<StreamItem>, String> {
        let mut items = Vec::new();
        if self.done {
            return Ok(items);
        }
        let rest = std::mem::take(&mut self.unframed);
        if !rest.is_empty() {
            self.read_line(&rest, &mut items)?;
        }
        self.dispatch(&mut items)?;
        Ok(items)
    }

    fn read_line(&mut self, line: &[u8], items: &mut Vec<StreamItem>) -> Result<(), String> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            return self.dispatch(items);
        }
        // comments, `event:`, `id:` and `retry:` fields carry nothing we use
        let Some(value) = line.strip_prefix(b"data:") else {
            return Ok(());
        };
        let value = value.strip_prefix(b" ").unwrap_or(value);
        let value = std::str::from_utf8(value)
            .map_err(|error| format!("event stream data is not UTF-8: {error}"))?;
        match &mut self.event_data {
            Some(data) => {
                data.push('\n');
                data.push_str(value);
            }
            None => self.event_data = Some(value.to_owned()),
        }
        Ok(())
    }

    fn dispatch(&mut self, items: &mut Vec<StreamItem>) -> Result<(), String> {
        let Some(data) = self.event_data.take() else {
            return Ok(());
        };
        let payload = data.trim();
        if payload.is_empty() {
            return Ok(());
        }
        if payload == DONE_SENTINEL {
            self.done = true;
            return Ok(());
        }
        let chunk = serde_json::from_str::<Chunk>(payload)
            .map_err(|error| format!("malformed stream chunk: {error}"))?;
        self.absorb(chunk, items);
        Ok(())
    }

    fn absorb(&mut self, chunk: Chunk, items: &mut Vec<StreamItem>) {
        if let Some(usage) = chunk.usage {
            items.push(StreamItem::UsageUpdate(UsageUpdate::from(usage)));
        }
        for choice in chunk.choices {
            if let Some(text) = choice.delta.content.filter(|text| !text.is_empty()) {
                items.push(StreamItem::Text(text));
            }
            for fragment in choice.delta.tool_calls.into_iter().flatten() {
                let function = fragment.function.unwrap_or_default();
                if fragment.id.is_none() && function.name.is_none() && function.arguments.is_none()
                {
                    continue;
                }
                let identity = self.calls.entry(fragment.index).or_default();
                if fragment.id.is_some() {
                    identity.id = fragment.id;
                }
                if function.name.is_some() {
                    identity.name = function.name;
                }
                items.push(StreamItem::ToolCallDelta(ToolCallDelta {
                    index: fragment.index,
                    id: identity.id.clone(),
                    name: identity.name.clone(),
                    arguments: function.arguments,
                }));
            }
            if let Some(reason) = choice.finish_reason.filter(|reason| !reason.is_empty()) {
                items.push(StreamItem::FinishReason(reason));
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct Chunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallFragment>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallFragment {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionFragment>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionFragment {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}
