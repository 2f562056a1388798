use std::num::ParseIntError;

use snafu::Snafu;

use crate::connection::ConnectionState;
use crate::ids::{ConnectionId, ConversationId};

/// Failure taxonomy for the synchronization engine.
///
/// None of these are fatal: each one degrades to a visible status plus a recovery path,
/// which is why the enum is cloneable and carried inside view snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SyncError {
    #[snafu(display("network unavailable on `{stage}`: {details}"))]
    NetworkUnavailable {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("connection {connection} is streaming without a handshake"))]
    HandshakeMissing {
        stage: &'static str,
        connection: ConnectionId,
    },
    #[snafu(display(
        "failed to load history for conversation {conversation} at offset {offset}: {details}"
    ))]
    HistoryFetchFailed {
        stage: &'static str,
        conversation: ConversationId,
        offset: usize,
        details: String,
    },
    #[snafu(display("cannot send while the connection is {state}"))]
    SendWhileDisconnected {
        stage: &'static str,
        state: ConnectionState,
    },
    #[snafu(display("id '{raw}' is invalid for {id_type}: {details}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        details: String,
    },
    #[snafu(display("session store failed on `{stage}`: {details}"))]
    Storage {
        stage: &'static str,
        details: String,
    },
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// Builds an `InvalidId` error from an integer parse failure.
    pub(crate) fn invalid_id(id_type: &'static str, raw: &str, source: &ParseIntError) -> Self {
        Self::InvalidId {
            stage: "parse-id",
            id_type,
            raw: raw.to_string(),
            details: source.to_string(),
        }
    }

    /// Returns true when the error describes connectivity rather than data.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::NetworkUnavailable { .. }
                | Self::HandshakeMissing { .. }
                | Self::SendWhileDisconnected { .. }
        )
    }
}
