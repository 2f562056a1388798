use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backoff::ReconnectPolicy;
use crate::binder::{BinderOutcome, ConversationBinder};
use crate::capability::{Clock, HistorySource, PersistedSession, Scheduler, SessionStore, Transport};
use crate::connection::{CloseCode, CloseOutcome, ConnectionSession, ConnectionState, TimerOutcome};
use crate::error::{SyncError, SyncResult};
use crate::event::{SyncEvent, TransportEvent, UserCommand};
use crate::frame::InboundFrame;
use crate::history::{ApplyOutcome, DEFAULT_PAGE_SIZE, HistorySynchronizer, LoadOutcome};
use crate::ids::{ConnectionId, ConversationId, PageTicket, TimerToken};
use crate::message::{HistoryResponse, Message};
use crate::send::{SendCoordinator, SendOutcome};
use crate::view::{LiveBuffer, ViewSnapshot, compose_displayed};
use crate::visibility::{Visibility, VisibilityOutcome, VisibilityReconnector};

/// Everything the engine needs from the outside world.
#[derive(Clone)]
pub struct Capabilities {
    pub transport: Arc<dyn Transport>,
    pub scheduler: Arc<dyn Scheduler>,
    pub history: Arc<dyn HistorySource>,
    pub store: Arc<dyn SessionStore>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Connection and message synchronization for one client instance.
///
/// The engine is single-threaded: callers feed it [`SyncEvent`]s one at a time and read
/// [`ViewSnapshot`]s back. All effects go out through [`Capabilities`].
pub struct SyncEngine {
    session: ConnectionSession,
    binder: ConversationBinder,
    history: HistorySynchronizer,
    visibility: VisibilityReconnector,
    sender: SendCoordinator,
    live: LiveBuffer,
    active: Option<ConversationId>,
    error: Option<SyncError>,
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
}

impl SyncEngine {
    pub fn new(config: EngineConfig, capabilities: Capabilities) -> Self {
        let Capabilities {
            transport,
            scheduler,
            history,
            store,
            clock,
        } = capabilities;

        Self {
            session: ConnectionSession::new(config.reconnect, transport, scheduler),
            binder: ConversationBinder::new(),
            history: HistorySynchronizer::new(config.page_size, history),
            visibility: VisibilityReconnector::new(),
            sender: SendCoordinator::new(),
            live: LiveBuffer::new(),
            active: None,
            error: None,
            store,
            clock,
        }
    }

    /// Restores the persisted live buffer and re-activates the persisted conversation.
    ///
    /// Returns the conversation that was re-activated, if any.
    pub fn restore(&mut self) -> SyncResult<Option<ConversationId>> {
        let Some(persisted) = self.store.load()? else {
            tracing::debug!("no persisted session");
            return Ok(None);
        };

        self.live = LiveBuffer::restore(persisted.live_buffer);
        tracing::info!(
            active = ?persisted.active_conversation,
            owner = ?self.live.owner(),
            live_messages = self.live.len(),
            "restored persisted session"
        );

        if let Some(conversation) = persisted.active_conversation {
            self.switch_conversation(conversation);
        }
        Ok(persisted.active_conversation)
    }

    pub fn handle(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::Transport(event) => self.on_transport(event),
            SyncEvent::TimerFired(token) => self.on_timer(token),
            SyncEvent::HistoryLoaded { ticket, result } => self.on_history(ticket, result),
            SyncEvent::Visibility(visibility) => self.set_visibility(visibility),
            SyncEvent::Command(command) => self.on_command(command),
        }
        self.reconcile();
    }

    /// Makes `conversation` the one being viewed.
    ///
    /// History restarts from page 0; the live buffer and the connection are left alone.
    /// The very first switch also opens the connection.
    pub fn switch_conversation(&mut self, conversation: ConversationId) {
        tracing::info!(
            previous = ?self.active,
            conversation = %conversation,
            bound = ?self.binder.ws_conv_id(),
            "switching conversation"
        );

        self.active = Some(conversation);
        self.sender.clear();
        self.clear_error_if(|error| matches!(error, SyncError::HistoryFetchFailed { .. }));
        self.history.switch_conversation(conversation);

        if self.session.has_context() {
            self.session.set_requested_conversation(Some(conversation));
        } else if let Err(error) = self.session.open(Some(conversation)) {
            self.error = Some(error);
        }

        self.reconcile();
        self.persist();
    }

    pub fn send(&mut self, text: &str) -> SendOutcome {
        let now = self.clock.now();
        let outcome = self
            .sender
            .send(text, now, &mut self.session, &mut self.live);

        if let SendOutcome::Offline {
            reconnect: Some(Err(error)),
            ..
        } = &outcome
        {
            self.error = Some(error.clone());
        }

        if outcome != SendOutcome::Ignored {
            self.reconcile();
            self.persist();
        }
        outcome
    }

    pub fn load_older(&mut self) -> LoadOutcome {
        self.history.load_older()
    }

    /// Re-fetches page 0, replacing the current history.
    pub fn reload_history(&mut self) -> LoadOutcome {
        self.history.reload()
    }

    pub fn dismiss_error(&mut self) {
        if let Some(error) = self.error.take() {
            tracing::debug!(error = %error, "error dismissed");
        }
    }

    /// Opens a fresh connection immediately, also reviving a session that was shut down.
    pub fn connect(&mut self) -> SyncResult<ConnectionId> {
        let result = self.session.open(self.active);
        if let Err(error) = &result {
            self.error = Some(error.clone());
        }
        self.reconcile();
        result
    }

    /// Explicit teardown. Nothing reconnects until [`connect`](Self::connect).
    pub fn shutdown(&mut self) {
        self.session.close(CloseCode::NORMAL, "client shutdown");
        self.persist();
    }

    /// Like [`shutdown`](Self::shutdown), but also forgets the conversation, the live
    /// buffer and everything persisted.
    pub fn logout(&mut self) {
        self.session.close(CloseCode::NORMAL, "logout");
        self.active = None;
        self.live = LiveBuffer::new();
        self.history.clear();
        self.sender.clear();
        self.error = None;

        match self.store.clear() {
            Ok(()) => tracing::info!("logged out; persisted session cleared"),
            Err(error) => tracing::warn!(error = %error, "failed to clear persisted session"),
        }
    }

    pub fn set_visibility(&mut self, visibility: Visibility) {
        match self.visibility.on_change(visibility, &mut self.session) {
            VisibilityOutcome::ReopenFailed(error) => self.error = Some(error),
            VisibilityOutcome::Reopened(connection) => {
                tracing::debug!(connection = %connection, "reopened on foreground");
            }
            VisibilityOutcome::Unchanged
            | VisibilityOutcome::Backgrounded
            | VisibilityOutcome::Foregrounded => {}
        }
        self.reconcile();
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn active_conversation(&self) -> Option<ConversationId> {
        self.active
    }

    pub fn bound_conversation(&self) -> Option<ConversationId> {
        self.binder.ws_conv_id()
    }

    pub fn is_live_visible(&self) -> bool {
        self.binder.is_live_visible(self.active)
    }

    pub fn is_awaiting_reply(&self) -> bool {
        self.sender.is_awaiting_reply()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.session.attempts()
    }

    pub fn pending_reconnect(&self) -> Option<TimerToken> {
        self.session.pending_reconnect()
    }

    pub fn current_connection(&self) -> Option<ConnectionId> {
        self.session.current()
    }

    pub fn error(&self) -> Option<&SyncError> {
        self.error.as_ref()
    }

    pub fn history(&self) -> &[Message] {
        self.history.history()
    }

    pub fn live_buffer(&self) -> &LiveBuffer {
        &self.live
    }

    pub fn displayed(&self) -> Vec<Message> {
        compose_displayed(self.history.history(), &self.live, self.is_live_visible())
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        ViewSnapshot {
            active_conversation: self.active,
            bound_conversation: self.binder.ws_conv_id(),
            connection_state: self.session.state(),
            reconnect_attempts: self.session.attempts(),
            displayed: self.displayed(),
            awaiting_reply: self.sender.is_awaiting_reply(),
            has_more: self.history.has_more(),
            loading_history: self.history.is_loading(),
            history_loaded: self.history.is_loaded(),
            error: self.error.clone(),
        }
    }

    fn on_command(&mut self, command: UserCommand) {
        match command {
            UserCommand::SwitchConversation(conversation) => self.switch_conversation(conversation),
            UserCommand::Send(text) => {
                self.send(&text);
            }
            UserCommand::LoadOlder => {
                self.load_older();
            }
            UserCommand::ReloadHistory => {
                self.reload_history();
            }
            UserCommand::DismissError => self.dismiss_error(),
            UserCommand::Connect => {
                // Failures are already recorded on the engine.
                let _ = self.connect();
            }
            UserCommand::Shutdown => self.shutdown(),
            UserCommand::Logout => self.logout(),
        }
    }

    fn on_transport(&mut self, event: TransportEvent) {
        let connection = event.connection();
        if !self.session.is_current(connection) {
            tracing::debug!(connection = %connection, "dropping event from stale connection");
            return;
        }

        match event {
            TransportEvent::Opened(connection) => {
                if self.session.on_opened(connection) {
                    self.clear_error_if(SyncError::is_connectivity);
                }
            }
            TransportEvent::Frame { connection, text } => self.on_frame(connection, &text),
            TransportEvent::Error {
                connection,
                details,
            } => {
                if self.session.on_error(connection) {
                    tracing::warn!(connection = %connection, error = %details, "transport error");
                    self.error = Some(SyncError::NetworkUnavailable {
                        stage: "transport-error",
                        details,
                    });
                }
            }
            TransportEvent::Closed {
                connection,
                code,
                reason,
            } => {
                if let CloseOutcome::ReconnectScheduled { .. } =
                    self.session.on_closed(connection, code)
                    && self.error.is_none()
                {
                    self.error = Some(SyncError::NetworkUnavailable {
                        stage: "transport-closed",
                        details: format!("closed with code {code}: {reason}"),
                    });
                }
            }
        }
    }

    fn on_frame(&mut self, connection: ConnectionId, text: &str) {
        match self.binder.accept(connection, InboundFrame::decode(text)) {
            BinderOutcome::Stale | BinderOutcome::HandshakeIgnored { .. } => {}
            BinderOutcome::Bound { conversation } => {
                self.live.bind(conversation);
                self.clear_error_if(|error| matches!(error, SyncError::HandshakeMissing { .. }));
                self.persist();
            }
            BinderOutcome::AgentText {
                text,
                handshake_missing,
            } => {
                self.live.push(Message::agent(text, self.clock.now()));
                self.sender.on_agent_message();
                if handshake_missing {
                    self.error = Some(SyncError::HandshakeMissing {
                        stage: "bind-connection",
                        connection,
                    });
                }
                self.persist();
            }
        }
    }

    fn on_timer(&mut self, token: TimerToken) {
        match self
            .session
            .on_timer(token, self.visibility.is_backgrounded())
        {
            TimerOutcome::OpenFailed(error) => self.error = Some(error),
            TimerOutcome::Reopened(_)
            | TimerOutcome::Deferred
            | TimerOutcome::Suppressed
            | TimerOutcome::Stale => {}
        }
    }

    fn on_history(&mut self, ticket: PageTicket, result: Result<HistoryResponse, String>) {
        match self.history.apply(ticket, result) {
            ApplyOutcome::Failed(error) => self.error = Some(error),
            ApplyOutcome::Applied { .. } => {
                self.clear_error_if(|error| matches!(error, SyncError::HistoryFetchFailed { .. }));
            }
            ApplyOutcome::Stale => {}
        }
    }

    // A new physical connection starts unbound.
    fn reconcile(&mut self) {
        let Some(current) = self.session.current() else {
            return;
        };

        if self.binder.connection() != Some(current) {
            self.binder.track(current);
            self.live.begin_connection();
        }
    }

    fn clear_error_if(&mut self, predicate: impl Fn(&SyncError) -> bool) {
        if self.error.as_ref().is_some_and(predicate) {
            self.error = None;
        }
    }

    fn persist(&self) {
        let session = PersistedSession {
            active_conversation: self.active,
            live_buffer: self.live.to_persisted(),
        };
        if let Err(error) = self.store.save(&session) {
            tracing::warn!(error = %error, "failed to persist session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::PersistedLiveBuffer;
    use crate::message::Sender;
    use crate::sim::{
        ManualScheduler, MemorySessionStore, RecordingHistorySource, RecordingTransport,
        SteppingClock,
    };

    struct Harness {
        engine: SyncEngine,
        transport: Arc<RecordingTransport>,
        history: Arc<RecordingHistorySource>,
        store: Arc<MemorySessionStore>,
    }

    fn harness_with(store: MemorySessionStore) -> Harness {
        let transport = Arc::new(RecordingTransport::default());
        let history = Arc::new(RecordingHistorySource::default());
        let store = Arc::new(store);
        let engine = SyncEngine::new(
            EngineConfig::default(),
            Capabilities {
                transport: transport.clone(),
                scheduler: Arc::new(ManualScheduler::default()),
                history: history.clone(),
                store: store.clone(),
                clock: Arc::new(SteppingClock::default()),
            },
        );
        Harness {
            engine,
            transport,
            history,
            store,
        }
    }

    fn harness() -> Harness {
        harness_with(MemorySessionStore::default())
    }

    fn connect_bound(harness: &mut Harness, conversation: u64) -> ConnectionId {
        let connection = harness.engine.current_connection().unwrap();
        harness
            .engine
            .handle(TransportEvent::Opened(connection).into());
        harness.engine.handle(
            TransportEvent::Frame {
                connection,
                text: format!(r#"{{"type":"init","convId":{conversation}}}"#),
            }
            .into(),
        );
        connection
    }

    #[test]
    fn first_switch_opens_with_the_requested_conversation() {
        let mut harness = harness();
        harness.engine.switch_conversation(ConversationId::new(7));

        let open = harness.transport.last_open().unwrap();
        assert_eq!(open.requested_conversation, Some(ConversationId::new(7)));
        assert_eq!(harness.history.last_request().unwrap().offset, 0);

        harness.engine.switch_conversation(ConversationId::new(9));
        assert_eq!(harness.transport.open_count(), 1);
    }

    #[test]
    fn handshake_missing_is_surfaced_and_text_stays_hidden() {
        let mut harness = harness();
        harness.engine.switch_conversation(ConversationId::new(7));
        let connection = harness.engine.current_connection().unwrap();
        harness
            .engine
            .handle(TransportEvent::Opened(connection).into());

        harness.engine.handle(
            TransportEvent::Frame {
                connection,
                text: "hello".into(),
            }
            .into(),
        );

        assert!(matches!(
            harness.engine.error(),
            Some(SyncError::HandshakeMissing { .. })
        ));
        assert_eq!(harness.engine.live_buffer().len(), 1);
        assert!(harness.engine.displayed().is_empty());
    }

    #[test]
    fn binding_persists_the_live_buffer_owner() {
        let mut harness = harness();
        harness.engine.switch_conversation(ConversationId::new(7));
        connect_bound(&mut harness, 7);

        let saved = harness.store.saved().unwrap();
        assert_eq!(saved.active_conversation, Some(ConversationId::new(7)));
        assert_eq!(saved.live_buffer.owner, Some(ConversationId::new(7)));
    }

    #[test]
    fn restore_reactivates_and_shows_the_persisted_buffer() {
        let timestamp = chrono::DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        let store = MemorySessionStore::with_session(PersistedSession {
            active_conversation: Some(ConversationId::new(7)),
            live_buffer: PersistedLiveBuffer {
                owner: Some(ConversationId::new(7)),
                messages: vec![Message::user("earlier", timestamp)],
            },
        });
        let mut harness = harness_with(store);

        let restored = harness.engine.restore().unwrap();
        assert_eq!(restored, Some(ConversationId::new(7)));
        assert!(harness.engine.displayed().is_empty());

        connect_bound(&mut harness, 7);
        let displayed = harness.engine.displayed();
        assert_eq!(displayed.len(), 1);
        assert_eq!(displayed[0].from, Sender::User);
    }

    #[test]
    fn shutdown_is_terminal_until_connect() {
        let mut harness = harness();
        harness.engine.switch_conversation(ConversationId::new(7));
        let connection = connect_bound(&mut harness, 7);

        harness.engine.shutdown();
        harness.engine.handle(
            TransportEvent::Closed {
                connection,
                code: CloseCode::ABNORMAL,
                reason: String::new(),
            }
            .into(),
        );
        harness.engine.set_visibility(Visibility::Background);
        harness.engine.set_visibility(Visibility::Foreground);

        assert_eq!(harness.engine.connection_state(), ConnectionState::Disconnected);
        assert!(harness.engine.pending_reconnect().is_none());
        assert_eq!(harness.transport.open_count(), 1);

        harness.engine.connect().unwrap();
        assert_eq!(harness.transport.open_count(), 2);
        assert_eq!(harness.engine.bound_conversation(), None);
    }

    #[test]
    fn logout_forgets_state_that_shutdown_keeps() {
        let mut harness = harness();
        harness.engine.switch_conversation(ConversationId::new(7));
        connect_bound(&mut harness, 7);
        harness.engine.send("hi");

        harness.engine.shutdown();
        assert_eq!(
            harness.store.saved().unwrap().active_conversation,
            Some(ConversationId::new(7))
        );

        harness.engine.connect().unwrap();
        let connection = connect_bound(&mut harness, 7);
        let pending_page = harness.history.last_request().unwrap().ticket;
        harness.engine.handle(UserCommand::Logout.into());

        assert_eq!(harness.store.saved(), None);
        assert_eq!(harness.engine.active_conversation(), None);
        assert!(harness.engine.live_buffer().is_empty());
        assert!(harness.engine.history().is_empty());
        assert_eq!(harness.engine.connection_state(), ConnectionState::Disconnected);

        harness.engine.handle(SyncEvent::HistoryLoaded {
            ticket: pending_page,
            result: Ok(HistoryResponse::new(Vec::new(), true)),
        });
        harness.engine.handle(
            TransportEvent::Closed {
                connection,
                code: CloseCode::ABNORMAL,
                reason: String::new(),
            }
            .into(),
        );
        assert!(harness.engine.pending_reconnect().is_none());
        assert!(harness.engine.snapshot().displayed.is_empty());
        assert!(!harness.engine.snapshot().has_more);
    }

    #[test]
    fn save_failures_do_not_break_the_engine() {
        let mut harness = harness();
        harness.store.fail_saves(true);

        harness.engine.switch_conversation(ConversationId::new(7));
        connect_bound(&mut harness, 7);

        assert_eq!(harness.engine.send("hi"), SendOutcome::Sent);
        assert!(harness.engine.error().is_none());
        assert_eq!(harness.store.save_count(), 0);
    }

    #[test]
    fn history_failure_is_dismissible_and_retryable() {
        let mut harness = harness();
        harness.engine.switch_conversation(ConversationId::new(7));
        let ticket = harness.history.last_request().unwrap().ticket;

        harness.engine.handle(SyncEvent::HistoryLoaded {
            ticket,
            result: Err("timed out".into()),
        });
        assert!(matches!(
            harness.engine.error(),
            Some(SyncError::HistoryFetchFailed { .. })
        ));

        harness.engine.handle(UserCommand::DismissError.into());
        assert!(harness.engine.error().is_none());

        assert!(matches!(
            harness.engine.reload_history(),
            LoadOutcome::Requested(_)
        ));
    }
}
