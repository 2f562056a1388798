use crate::capability::PersistedLiveBuffer;
use crate::connection::ConnectionState;
use crate::error::SyncError;
use crate::ids::ConversationId;
use crate::message::{Message, Sender};

/// Messages exchanged since the current binding was established.
///
/// Append-only for the lifetime of one binding. Switching the viewed conversation never
/// clears it; only a handshake that binds a different conversation starts a new lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveBuffer {
    owner: Option<ConversationId>,
    messages: Vec<Message>,
    // Index of the first message exchanged on the current physical connection.
    connection_mark: usize,
}

impl LiveBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restore(persisted: PersistedLiveBuffer) -> Self {
        let connection_mark = persisted.messages.len();
        Self {
            owner: persisted.owner,
            messages: persisted.messages,
            connection_mark,
        }
    }

    pub fn to_persisted(&self) -> PersistedLiveBuffer {
        PersistedLiveBuffer {
            owner: self.owner,
            messages: self.messages.clone(),
        }
    }

    pub fn owner(&self) -> Option<ConversationId> {
        self.owner
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Marks where a new physical connection starts contributing messages.
    pub fn begin_connection(&mut self) {
        self.connection_mark = self.messages.len();
    }

    /// Applies a handshake binding.
    ///
    /// Binding the same conversation keeps everything. Binding a different one drops the
    /// previous binding's messages but keeps whatever this connection exchanged before
    /// its handshake arrived. Returns true when the owner changed.
    pub fn bind(&mut self, conversation: ConversationId) -> bool {
        if self.owner == Some(conversation) {
            return false;
        }

        if self.owner.is_some() {
            let dropped = self.connection_mark.min(self.messages.len());
            self.messages.drain(..dropped);
            tracing::debug!(
                previous = ?self.owner,
                conversation = %conversation,
                dropped,
                "live buffer rebound to a new conversation"
            );
        }

        self.owner = Some(conversation);
        self.connection_mark = 0;
        true
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }
}

/// Builds `history ++ (live if visible)`.
pub fn compose_displayed(history: &[Message], live: &LiveBuffer, live_visible: bool) -> Vec<Message> {
    let live_messages: &[Message] = if live_visible { live.messages() } else { &[] };
    history.iter().chain(live_messages).cloned().collect()
}

/// Immutable projection handed to whoever renders the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ViewSnapshot {
    pub active_conversation: Option<ConversationId>,
    pub bound_conversation: Option<ConversationId>,
    pub connection_state: ConnectionState,
    pub reconnect_attempts: u32,
    pub displayed: Vec<Message>,
    pub awaiting_reply: bool,
    pub has_more: bool,
    pub loading_history: bool,
    pub history_loaded: bool,
    pub error: Option<SyncError>,
}

impl ViewSnapshot {
    pub fn is_live_visible(&self) -> bool {
        self.active_conversation.is_some() && self.active_conversation == self.bound_conversation
    }

    pub fn is_empty_conversation(&self) -> bool {
        self.history_loaded && self.displayed.is_empty()
    }

    /// Text of the last agent message on screen, if any.
    pub fn last_agent_text(&self) -> Option<&str> {
        self.displayed
            .iter()
            .rev()
            .find(|message| message.from == Sender::Agent)
            .map(|message| message.text.as_str())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn at(second: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, second).unwrap()
    }

    #[test]
    fn rebinding_to_another_conversation_keeps_only_this_connections_messages() {
        let mut live = LiveBuffer::new();
        live.bind(ConversationId::new(7));
        live.push(Message::user("old", at(0)));
        live.begin_connection();
        live.push(Message::agent("early", at(1)));

        assert!(live.bind(ConversationId::new(8)));

        assert_eq!(live.messages(), &[Message::agent("early", at(1))]);
        assert_eq!(live.owner(), Some(ConversationId::new(8)));
    }

    #[test]
    fn rebinding_to_the_same_conversation_keeps_the_buffer() {
        let mut live = LiveBuffer::new();
        live.bind(ConversationId::new(7));
        live.push(Message::user("hi", at(0)));
        live.begin_connection();

        assert!(!live.bind(ConversationId::new(7)));
        assert_eq!(live.len(), 1);
    }

    #[test]
    fn hidden_live_buffer_is_not_displayed() {
        let history = vec![Message::agent("from history", at(0))];
        let mut live = LiveBuffer::new();
        live.push(Message::agent("live", at(1)));

        assert_eq!(compose_displayed(&history, &live, false), history);
        assert_eq!(compose_displayed(&history, &live, true).len(), 2);
    }
}
