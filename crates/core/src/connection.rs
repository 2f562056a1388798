use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::ReconnectPolicy;
use crate::capability::{ConnectRequest, Scheduler, Transport};
use crate::error::{SendWhileDisconnectedSnafu, SyncError, SyncResult};
use crate::ids::{ConnectionId, ConversationId, TimerToken};

/// WebSocket close code as seen by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseCode(pub u16);

impl CloseCode {
    pub const NORMAL: Self = Self(1000);
    pub const GOING_AWAY: Self = Self(1001);
    pub const ABNORMAL: Self = Self(1006);

    /// 1000 and 1001 are expected closures; everything else warrants a reconnect.
    pub const fn is_clean(self) -> bool {
        matches!(self.0, 1000 | 1001)
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Connection lifecycle. Exactly one is current per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        formatter.write_str(label)
    }
}

/// State transition input for the connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionTransition {
    Open,
    Opened,
    Fail,
    Close,
}

/// Rejection reason for illegal connection transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionTransitionRejection {
    NotConnecting { state: ConnectionState },
    NotLive { state: ConnectionState },
}

pub type ConnectionTransitionResult = Result<ConnectionState, ConnectionTransitionRejection>;

impl ConnectionState {
    /// Applies one transition deterministically.
    ///
    /// `Open` is legal from any state because opening always tears down the previous handle.
    /// `Close` always lands on `Disconnected`.
    pub fn apply(self, transition: ConnectionTransition) -> ConnectionTransitionResult {
        match transition {
            ConnectionTransition::Open => Ok(Self::Connecting),
            ConnectionTransition::Opened => match self {
                Self::Connecting => Ok(Self::Connected),
                Self::Disconnected | Self::Connected | Self::Error => {
                    Err(ConnectionTransitionRejection::NotConnecting { state: self })
                }
            },
            ConnectionTransition::Fail => match self {
                Self::Connecting | Self::Connected | Self::Error => Ok(Self::Error),
                Self::Disconnected => Err(ConnectionTransitionRejection::NotLive { state: self }),
            },
            ConnectionTransition::Close => Ok(Self::Disconnected),
        }
    }

    pub fn is_healthy(self) -> bool {
        matches!(self, Self::Connected | Self::Connecting)
    }
}

/// What the session did with a close event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Event belonged to a handle that is no longer current.
    Stale,
    Clean,
    /// Unclean, but the session was torn down explicitly.
    Suppressed,
    ReconnectScheduled { attempt: u32, delay: Duration },
}

/// What the session did with a fired timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerOutcome {
    Stale,
    Suppressed,
    /// App is backgrounded; the reconnect waits for foreground.
    Deferred,
    Reopened(ConnectionId),
    OpenFailed(SyncError),
}

/// Sole owner of the physical connection handle.
pub struct ConnectionSession {
    state: ConnectionState,
    current: Option<ConnectionId>,
    next_connection_id: u64,
    attempts: u32,
    pending_reconnect: Option<TimerToken>,
    deferred_reconnect: bool,
    torn_down: bool,
    has_context: bool,
    requested_conversation: Option<ConversationId>,
    policy: ReconnectPolicy,
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
}

impl ConnectionSession {
    pub fn new(
        policy: ReconnectPolicy,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            current: None,
            next_connection_id: 1,
            attempts: 0,
            pending_reconnect: None,
            deferred_reconnect: false,
            torn_down: false,
            has_context: false,
            requested_conversation: None,
            policy: policy.normalized(),
            transport,
            scheduler,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn current(&self) -> Option<ConnectionId> {
        self.current
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn pending_reconnect(&self) -> Option<TimerToken> {
        self.pending_reconnect
    }

    pub fn is_reconnect_deferred(&self) -> bool {
        self.deferred_reconnect
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// True once `open` has been called with a conversation context.
    pub fn has_context(&self) -> bool {
        self.has_context
    }

    pub fn requested_conversation(&self) -> Option<ConversationId> {
        self.requested_conversation
    }

    /// Updates the conversation used by the next open without touching the live handle.
    pub fn set_requested_conversation(&mut self, conversation: Option<ConversationId>) {
        self.requested_conversation = conversation;
    }

    pub fn is_current(&self, connection: ConnectionId) -> bool {
        self.current == Some(connection)
    }

    /// Opens a fresh physical connection, tearing down any existing handle first.
    ///
    /// A synchronous transport failure is treated like an unclean close: the session
    /// schedules a retry and the error is returned for the caller to surface.
    pub fn open(&mut self, requested: Option<ConversationId>) -> SyncResult<ConnectionId> {
        self.cancel_pending_reconnect();
        if let Some(previous) = self.current.take() {
            tracing::debug!(connection = %previous, "superseding connection handle");
            self.transport
                .close(previous, CloseCode::NORMAL.0, "superseded by a new connection");
        }

        self.torn_down = false;
        self.deferred_reconnect = false;
        self.has_context = true;
        self.requested_conversation = requested;

        let connection = ConnectionId::new(self.next_connection_id);
        self.next_connection_id = self.next_connection_id.saturating_add(1);
        self.current = Some(connection);
        self.transition(ConnectionTransition::Open);

        tracing::info!(
            connection = %connection,
            requested_conversation = ?requested,
            attempt = self.attempts,
            "opening connection"
        );

        let request = ConnectRequest {
            connection,
            requested_conversation: requested,
        };
        if let Err(error) = self.transport.open(request) {
            tracing::warn!(connection = %connection, error = %error, "transport refused to open");
            self.on_closed(connection, CloseCode::ABNORMAL);
            return Err(error);
        }

        Ok(connection)
    }

    /// Re-opens with the last conversation context.
    pub fn reopen(&mut self) -> SyncResult<ConnectionId> {
        self.open(self.requested_conversation)
    }

    /// Returns false when the event came from a stale handle.
    pub fn on_opened(&mut self, connection: ConnectionId) -> bool {
        if !self.is_current(connection) {
            tracing::debug!(connection = %connection, "ignoring open from stale connection");
            return false;
        }

        if !self.transition(ConnectionTransition::Opened) {
            return false;
        }

        self.attempts = 0;
        self.deferred_reconnect = false;
        tracing::info!(connection = %connection, "connection established");
        true
    }

    pub fn on_error(&mut self, connection: ConnectionId) -> bool {
        if !self.is_current(connection) {
            tracing::debug!(connection = %connection, "ignoring error from stale connection");
            return false;
        }

        self.transition(ConnectionTransition::Fail)
    }

    pub fn on_closed(&mut self, connection: ConnectionId, code: CloseCode) -> CloseOutcome {
        if !self.is_current(connection) {
            tracing::debug!(connection = %connection, code = %code, "ignoring close from stale connection");
            return CloseOutcome::Stale;
        }

        self.current = None;
        self.transition(ConnectionTransition::Close);

        if code.is_clean() {
            tracing::info!(connection = %connection, code = %code, "connection closed cleanly");
            return CloseOutcome::Clean;
        }

        if self.torn_down {
            return CloseOutcome::Suppressed;
        }

        self.attempts = self.attempts.saturating_add(1);
        let delay = self.policy.delay_for_attempt(self.attempts);
        self.cancel_pending_reconnect();
        self.pending_reconnect = Some(self.scheduler.after(delay));

        tracing::warn!(
            connection = %connection,
            code = %code,
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            "connection lost; reconnect scheduled"
        );

        CloseOutcome::ReconnectScheduled {
            attempt: self.attempts,
            delay,
        }
    }

    /// Handles a due reconnect timer. Backgrounded apps defer the reconnect to foreground.
    pub fn on_timer(&mut self, token: TimerToken, backgrounded: bool) -> TimerOutcome {
        if self.pending_reconnect != Some(token) {
            tracing::debug!(token = %token, "ignoring stale reconnect timer");
            return TimerOutcome::Stale;
        }

        self.pending_reconnect = None;

        if self.torn_down {
            return TimerOutcome::Suppressed;
        }

        if backgrounded {
            tracing::info!(attempt = self.attempts, "app backgrounded; deferring reconnect");
            self.deferred_reconnect = true;
            return TimerOutcome::Deferred;
        }

        match self.reopen() {
            Ok(connection) => TimerOutcome::Reopened(connection),
            Err(error) => TimerOutcome::OpenFailed(error),
        }
    }

    /// Forwards text verbatim. Only valid while `Connected`; callers check first.
    pub fn send(&self, text: &str) -> SyncResult<()> {
        let connection = match (self.state, self.current) {
            (ConnectionState::Connected, Some(connection)) => connection,
            _ => {
                return SendWhileDisconnectedSnafu {
                    stage: "session-send",
                    state: self.state,
                }
                .fail();
            }
        };

        self.transport.send(connection, text)
    }

    /// Explicit teardown: cancels timers and suppresses auto-reconnect.
    pub fn close(&mut self, code: CloseCode, reason: &str) {
        self.torn_down = true;
        self.deferred_reconnect = false;
        self.cancel_pending_reconnect();

        if let Some(connection) = self.current.take() {
            tracing::info!(connection = %connection, code = %code, reason, "closing connection");
            self.transport.close(connection, code.0, reason);
        }

        self.transition(ConnectionTransition::Close);
    }

    fn cancel_pending_reconnect(&mut self) {
        if let Some(token) = self.pending_reconnect.take() {
            self.scheduler.cancel(token);
        }
    }

    fn transition(&mut self, transition: ConnectionTransition) -> bool {
        match self.state.apply(transition) {
            Ok(next) => {
                self.state = next;
                true
            }
            Err(rejection) => {
                tracing::debug!(?transition, ?rejection, "rejected connection transition");
                false
            }
        }
    }
}
