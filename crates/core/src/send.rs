use chrono::{DateTime, Utc};

use crate::connection::{ConnectionSession, ConnectionState};
use crate::error::{SyncError, SyncResult};
use crate::ids::ConnectionId;
use crate::message::Message;
use crate::view::LiveBuffer;

pub const CONNECTION_LOST_TEXT: &str =
    "Connection lost. Please wait for reconnection or refresh the page.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Empty or whitespace-only input.
    Ignored,
    Sent,
    /// Not delivered; a system notice was appended instead.
    Offline {
        cause: SyncError,
        /// `None` when an attempt was already in progress.
        reconnect: Option<SyncResult<ConnectionId>>,
    },
}

/// Turns a compose action into a local append plus a network send.
#[derive(Debug, Default)]
pub struct SendCoordinator {
    awaiting_reply: bool,
}

impl SendCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_awaiting_reply(&self) -> bool {
        self.awaiting_reply
    }

    pub fn send(
        &mut self,
        text: &str,
        now: DateTime<Utc>,
        session: &mut ConnectionSession,
        live: &mut LiveBuffer,
    ) -> SendOutcome {
        if text.trim().is_empty() {
            return SendOutcome::Ignored;
        }

        let cause = if session.state() == ConnectionState::Connected {
            match session.send(text) {
                Ok(()) => {
                    live.push(Message::user(text, now));
                    self.awaiting_reply = true;
                    tracing::debug!(chars = text.chars().count(), "message sent");
                    return SendOutcome::Sent;
                }
                Err(error) => error,
            }
        } else {
            SyncError::SendWhileDisconnected {
                stage: "send-coordinator",
                state: session.state(),
            }
        };

        tracing::warn!(state = %session.state(), error = %cause, "send while offline");
        live.push(Message::system(CONNECTION_LOST_TEXT, now));
        // No reply is coming on a connection that is being replaced.
        self.awaiting_reply = false;

        let reconnect = if session.state() == ConnectionState::Connecting {
            None
        } else {
            Some(session.reopen())
        };

        SendOutcome::Offline { cause, reconnect }
    }

    /// Called for each agent message appended for the bound conversation.
    pub fn on_agent_message(&mut self) {
        self.awaiting_reply = false;
    }

    pub fn clear(&mut self) {
        self.awaiting_reply = false;
    }
}
