use crate::frame::InboundFrame;
use crate::ids::{ConnectionId, ConversationId};

/// Result of routing one inbound frame through the binder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinderOutcome {
    /// Frame came from a handle the binder is not tracking.
    Stale,
    Bound { conversation: ConversationId },
    /// Connection is already bound; a second handshake does not rebind it.
    HandshakeIgnored {
        bound: ConversationId,
        attempted: ConversationId,
    },
    AgentText {
        text: String,
        /// True for the first text frame on a connection that never sent a handshake.
        handshake_missing: bool,
    },
}

/// Tracks which conversation the current connection streams for.
///
/// The binding exists only after the server handshake; until then the connection is
/// "connected but unbound" and live traffic stays hidden.
#[derive(Debug, Default)]
pub struct ConversationBinder {
    connection: Option<ConnectionId>,
    ws_conv_id: Option<ConversationId>,
    handshake_missing_reported: bool,
}

impl ConversationBinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    pub fn ws_conv_id(&self) -> Option<ConversationId> {
        self.ws_conv_id
    }

    /// Starts tracking a freshly opened connection, which is unbound until its handshake.
    pub fn track(&mut self, connection: ConnectionId) {
        self.connection = Some(connection);
        self.ws_conv_id = None;
        self.handshake_missing_reported = false;
    }

    /// The single visibility predicate for live traffic.
    pub fn is_live_visible(&self, active: Option<ConversationId>) -> bool {
        matches!((active, self.ws_conv_id), (Some(active), Some(bound)) if active == bound)
    }

    pub fn accept(&mut self, connection: ConnectionId, frame: InboundFrame) -> BinderOutcome {
        if self.connection != Some(connection) {
            return BinderOutcome::Stale;
        }

        match frame {
            InboundFrame::Handshake { conversation } => match self.ws_conv_id {
                Some(bound) => {
                    tracing::warn!(
                        connection = %connection,
                        bound = %bound,
                        attempted = %conversation,
                        "ignoring repeated handshake on a bound connection"
                    );
                    BinderOutcome::HandshakeIgnored {
                        bound,
                        attempted: conversation,
                    }
                }
                None => {
                    self.ws_conv_id = Some(conversation);
                    tracing::info!(connection = %connection, conversation = %conversation, "connection bound");
                    BinderOutcome::Bound { conversation }
                }
            },
            InboundFrame::RawText(text) => {
                let handshake_missing =
                    self.ws_conv_id.is_none() && !self.handshake_missing_reported;
                if handshake_missing {
                    self.handshake_missing_reported = true;
                    tracing::warn!(connection = %connection, "agent text arrived before handshake");
                }
                BinderOutcome::AgentText {
                    text,
                    handshake_missing,
                }
            }
        }
    }
}
