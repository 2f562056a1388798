use crate::connection::CloseCode;
use crate::ids::{ConnectionId, ConversationId, PageTicket, TimerToken};
use crate::message::HistoryResponse;
use crate::visibility::Visibility;

/// Progress reported by a [`Transport`](crate::capability::Transport), tagged by handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened(ConnectionId),
    Frame {
        connection: ConnectionId,
        text: String,
    },
    Error {
        connection: ConnectionId,
        details: String,
    },
    Closed {
        connection: ConnectionId,
        code: CloseCode,
        reason: String,
    },
}

impl TransportEvent {
    pub fn connection(&self) -> ConnectionId {
        match self {
            Self::Opened(connection)
            | Self::Frame { connection, .. }
            | Self::Error { connection, .. }
            | Self::Closed { connection, .. } => *connection,
        }
    }
}

/// User-initiated actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    SwitchConversation(ConversationId),
    Send(String),
    LoadOlder,
    ReloadHistory,
    DismissError,
    Connect,
    Shutdown,
    Logout,
}

/// Every discrete input the engine reacts to, delivered on one logical context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Transport(TransportEvent),
    TimerFired(TimerToken),
    HistoryLoaded {
        ticket: PageTicket,
        result: Result<HistoryResponse, String>,
    },
    Visibility(Visibility),
    Command(UserCommand),
}

impl From<TransportEvent> for SyncEvent {
    fn from(event: TransportEvent) -> Self {
        Self::Transport(event)
    }
}

impl From<UserCommand> for SyncEvent {
    fn from(command: UserCommand) -> Self {
        Self::Command(command)
    }
}
