use serde::Deserialize;

use crate::ids::ConversationId;

/// Decoded inbound text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Server declares which conversation this connection streams for.
    Handshake { conversation: ConversationId },
    /// Anything else is an agent reply, verbatim.
    RawText(String),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum StructuredFrame {
    Init {
        #[serde(rename = "convId")]
        conv_id: ConversationId,
    },
}

impl InboundFrame {
    /// Tries the structured decode first and falls back to `RawText`.
    ///
    /// Only payloads that look like a JSON object are offered to the structured decoder,
    /// and any object that is not a well-formed `init` stays plain text.
    pub fn decode(payload: &str) -> Self {
        if !payload.trim_start().starts_with('{') {
            return Self::RawText(payload.to_string());
        }

        match serde_json::from_str::<StructuredFrame>(payload) {
            Ok(StructuredFrame::Init { conv_id }) => Self::Handshake {
                conversation: conv_id,
            },
            Err(_) => Self::RawText(payload.to_string()),
        }
    }

    pub fn is_handshake(&self) -> bool {
        matches!(self, Self::Handshake { .. })
    }
}
