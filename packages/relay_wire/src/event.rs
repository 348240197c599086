//! Events and their `data:` frame encoding.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;

use crate::error::WireError;

/// Reserved `content` value of the terminator event.
pub const TERMINATOR_CONTENT: &str = "[DONE]";

/// One incremental text delta of a streamed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub content: String,
}

/// The unit written to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Fragment(Fragment),
    Terminator,
}

#[derive(Deserialize)]
struct Payload<'a> {
    #[serde(borrow)]
    content: Cow<'a, str>,
}

impl Event {
    pub fn fragment(content: impl Into<String>) -> Self {
        Event::Fragment(Fragment {
            content: content.into(),
        })
    }

    /// Events for one producer fragment.
    ///
    /// Content equal to the reserved terminator value is split in two so the
    /// consumer never mistakes it for the end of the stream. Concatenation
    /// is unchanged.
    pub fn fragments(content: impl Into<String>) -> Vec<Event> {
        let content = content.into();
        if content == TERMINATOR_CONTENT {
            let (head, tail) = content.split_at(content.len() - 1);
            return vec![Event::fragment(head), Event::fragment(tail)];
        }
        vec![Event::fragment(content)]
    }

    /// The `content` value carried on the wire.
    pub fn payload(&self) -> &str {
        match self {
            Event::Fragment(fragment) => &fragment.content,
            Event::Terminator => TERMINATOR_CONTENT,
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(self, Event::Terminator)
    }

    /// Serialize to a complete `data: {...}\n\n` frame.
    pub fn encode(&self) -> String {
        let json = serde_json::json!({ "content": self.payload() });
        format!("data: {json}\n\n")
    }

    /// Parse the JSON carried by one `data:` frame.
    pub fn from_payload(data: &str) -> Result<Self, WireError> {
        let payload: Payload<'_> = serde_json::from_str(data)
            .map_err(|e| WireError::MalformedPayload(e.to_string()))?;
        if payload.content == TERMINATOR_CONTENT {
            Ok(Event::Terminator)
        } else {
            Ok(Event::fragment(payload.content.into_owned()))
        }
    }
}
