#![deny(unsafe_code)]

//! Realtime connection and message synchronization for the agentick chat client.
//!
//! The engine owns one duplex connection at a time, keeps it alive with exponential
//! backoff, binds it to the conversation named by the server handshake, and merges
//! live traffic with paginated history without leaking messages across conversations.

pub mod backoff;
pub mod binder;
/// Traits for every side effect the engine performs.
pub mod capability;
pub mod connection;
pub mod engine;
pub mod error;
pub mod event;
pub mod frame;
pub mod history;
pub mod ids;
pub mod message;
pub mod send;
/// Deterministic fakes for tests and simulations.
pub mod sim;
pub mod view;
pub mod visibility;

pub use backoff::ReconnectPolicy;
pub use binder::{BinderOutcome, ConversationBinder};
pub use capability::{
    Clock, ConnectRequest, HistorySource, PageRequest, PersistedLiveBuffer, PersistedSession,
    Scheduler, SessionStore, SystemClock, Transport,
};
pub use connection::{CloseCode, ConnectionSession, ConnectionState};
pub use engine::{Capabilities, EngineConfig, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use event::{SyncEvent, TransportEvent, UserCommand};
pub use frame::InboundFrame;
pub use history::{DEFAULT_PAGE_SIZE, HistorySynchronizer, LoadOutcome};
pub use ids::{ConnectionId, ConversationId, PageTicket, TimerToken};
pub use message::{HistoryPage, HistoryResponse, Message, MessageId, Sender};
pub use send::{CONNECTION_LOST_TEXT, SendCoordinator, SendOutcome};
pub use view::{LiveBuffer, ViewSnapshot};
pub use visibility::{Visibility, VisibilityReconnector};
