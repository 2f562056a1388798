#![deny(unsafe_code)]

//! Production adapters for the agentick synchronization engine.

/// Event loop owning the engine.
pub mod driver;
pub mod history;
/// Atomic JSON documents on disk.
pub mod json_file;
pub mod scheduler;
/// JSON file persistence for session continuity.
pub mod session_file;
pub mod settings;
pub mod transport;

pub use driver::{ClientHandle, DriverError, DriverResult};
pub use history::{HistoryFetchError, HttpHistorySource};
pub use scheduler::TokioScheduler;
pub use json_file::JsonFileError;
pub use session_file::{BackgroundSessionStore, JsonSessionStore};
pub use settings::{ClientSettings, SettingsError, SettingsResult, SettingsStore};
pub use transport::{TransportError, WsTransport, connection_url};
