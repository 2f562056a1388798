//! Capabilities injected into the engine.
//!
//! Every effect the engine has on the outside world goes through one of these traits,
//! and every result comes back as a [`SyncEvent`](crate::event::SyncEvent). That keeps the
//! engine single-threaded and lets tests simulate time and the network deterministically.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncResult;
use crate::ids::{ConnectionId, ConversationId, PageTicket, TimerToken};
use crate::message::Message;

/// Parameters for one physical connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    pub connection: ConnectionId,
    /// Conversation the client would like; the server handshake stays authoritative.
    pub requested_conversation: Option<ConversationId>,
}

/// Duplex text connection to the chat backend.
///
/// `open` starts an attempt and returns immediately; progress is reported back as
/// transport events tagged with the same [`ConnectionId`].
pub trait Transport: Send + Sync {
    fn open(&self, request: ConnectRequest) -> SyncResult<()>;
    fn send(&self, connection: ConnectionId, text: &str) -> SyncResult<()>;
    fn close(&self, connection: ConnectionId, code: u16, reason: &str);
}

/// Timer capability. A due timer is delivered as `SyncEvent::TimerFired(token)`.
pub trait Scheduler: Send + Sync {
    fn after(&self, delay: Duration) -> TimerToken;
    fn cancel(&self, token: TimerToken);
}

/// One page fetch, identified by a ticket so late results can be matched or discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub ticket: PageTicket,
    pub conversation: ConversationId,
    pub offset: usize,
    pub limit: usize,
}

/// Paginated history endpoint. Results arrive as `SyncEvent::HistoryLoaded`.
pub trait HistorySource: Send + Sync {
    fn fetch(&self, request: PageRequest);
}

/// Live buffer contents as persisted between runs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PersistedLiveBuffer {
    #[serde(default)]
    pub owner: Option<ConversationId>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// Everything the engine keeps across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PersistedSession {
    #[serde(default)]
    pub active_conversation: Option<ConversationId>,
    #[serde(default)]
    pub live_buffer: PersistedLiveBuffer,
}

/// Session continuity storage. The engine does not assume any particular medium.
pub trait SessionStore: Send + Sync {
    fn load(&self) -> SyncResult<Option<PersistedSession>>;
    fn save(&self, session: &PersistedSession) -> SyncResult<()>;
    /// Forgets everything persisted, as on logout.
    fn clear(&self) -> SyncResult<()>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
