use std::sync::Arc;
use std::time::Duration;

use agentick_core::sim::{
    ManualScheduler, MemorySessionStore, RecordingHistorySource, RecordingTransport,
    SteppingClock,
};
use agentick_core::{
    Capabilities, CloseCode, ConnectionId, ConnectionState, ConversationId, EngineConfig,
    HistoryResponse, Message, Sender, SyncEngine, SyncError, SyncEvent, TransportEvent,
    Visibility,
};
use chrono::{TimeZone, Utc};

struct Scenario {
    engine: SyncEngine,
    transport: Arc<RecordingTransport>,
    scheduler: Arc<ManualScheduler>,
    history: Arc<RecordingHistorySource>,
}

impl Scenario {
    fn new() -> Self {
        let transport = Arc::new(RecordingTransport::default());
        let scheduler = Arc::new(ManualScheduler::default());
        let history = Arc::new(RecordingHistorySource::default());
        let engine = SyncEngine::new(
            EngineConfig::default(),
            Capabilities {
                transport: transport.clone(),
                scheduler: scheduler.clone(),
                history: history.clone(),
                store: Arc::new(MemorySessionStore::default()),
                clock: Arc::new(SteppingClock::default()),
            },
        );
        Self {
            engine,
            transport,
            scheduler,
            history,
        }
    }

    fn connection(&self) -> ConnectionId {
        self.engine
            .current_connection()
            .expect("a connection should be open")
    }

    fn opened(&mut self) -> ConnectionId {
        let connection = self.connection();
        self.engine
            .handle(TransportEvent::Opened(connection).into());
        connection
    }

    fn frame(&mut self, connection: ConnectionId, text: &str) {
        self.engine.handle(
            TransportEvent::Frame {
                connection,
                text: text.to_string(),
            }
            .into(),
        );
    }

    fn closed(&mut self, connection: ConnectionId, code: u16) {
        self.engine.handle(
            TransportEvent::Closed {
                connection,
                code: CloseCode(code),
                reason: String::new(),
            }
            .into(),
        );
    }

    fn fire_reconnect(&mut self) {
        let token = self
            .engine
            .pending_reconnect()
            .expect("a reconnect should be pending");
        self.engine.handle(SyncEvent::TimerFired(token));
    }

    fn answer_history(&mut self, messages: Vec<Message>, has_more: bool) {
        let ticket = self
            .history
            .last_request()
            .expect("a page should be requested")
            .ticket;
        self.engine.handle(SyncEvent::HistoryLoaded {
            ticket,
            result: Ok(HistoryResponse::new(messages, has_more)),
        });
    }

    fn displayed_texts(&self) -> Vec<(Sender, String)> {
        self.engine
            .displayed()
            .into_iter()
            .map(|message| (message.from, message.text))
            .collect()
    }
}

fn at(second: u32) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, second).unwrap()
}

#[test]
fn bound_conversation_round_trip() {
    let mut scenario = Scenario::new();
    scenario
        .engine
        .switch_conversation(ConversationId::new(7));
    scenario.answer_history(Vec::new(), false);
    let connection = scenario.opened();
    scenario.frame(connection, r#"{"type":"init","convId":7}"#);

    scenario.engine.send("hi");
    assert!(scenario.engine.is_awaiting_reply());
    scenario.frame(connection, "hello");

    assert_eq!(
        scenario.displayed_texts(),
        vec![
            (Sender::User, "hi".to_string()),
            (Sender::Agent, "hello".to_string())
        ]
    );
    assert!(!scenario.engine.is_awaiting_reply());
    assert_eq!(scenario.transport.sent_texts(), vec!["hi".to_string()]);
}

#[test]
fn switching_away_hides_the_bound_live_buffer() {
    let mut scenario = Scenario::new();
    scenario
        .engine
        .switch_conversation(ConversationId::new(7));
    let connection = scenario.opened();
    scenario.frame(connection, r#"{"type":"init","convId":7}"#);
    scenario.frame(connection, "for seven");

    scenario
        .engine
        .switch_conversation(ConversationId::new(9));
    scenario.frame(connection, "still for seven");

    assert!(scenario.displayed_texts().is_empty());
    assert_eq!(scenario.engine.live_buffer().len(), 2);

    scenario
        .engine
        .switch_conversation(ConversationId::new(7));
    assert_eq!(scenario.displayed_texts().len(), 2);
}

#[test]
fn unclean_closes_back_off_then_reset_after_open() {
    let mut scenario = Scenario::new();
    scenario
        .engine
        .switch_conversation(ConversationId::new(7));
    let first = scenario.opened();

    scenario.closed(first, 1006);
    scenario.fire_reconnect();
    let second = scenario.connection();
    scenario.closed(second, 1006);

    assert_eq!(
        scenario.scheduler.scheduled_delays(),
        vec![Duration::from_millis(1_500), Duration::from_millis(2_250)]
    );

    scenario.fire_reconnect();
    let third = scenario.opened();
    assert_eq!(scenario.engine.reconnect_attempts(), 0);
    assert!(scenario.engine.error().is_none());

    scenario.closed(third, 1011);
    assert_eq!(
        scenario.scheduler.scheduled_delays().last(),
        Some(&Duration::from_millis(1_500))
    );
}

#[test]
fn transport_error_then_abnormal_close_schedules_a_reconnect() {
    let mut scenario = Scenario::new();
    scenario
        .engine
        .switch_conversation(ConversationId::new(7));
    let connection = scenario.opened();
    scenario.frame(connection, r#"{"type":"init","convId":7}"#);

    scenario.engine.handle(
        TransportEvent::Error {
            connection,
            details: "connection reset by peer".to_string(),
        }
        .into(),
    );
    assert_eq!(scenario.engine.connection_state(), ConnectionState::Error);
    assert!(scenario.engine.pending_reconnect().is_none());

    scenario.closed(connection, 1006);

    assert_eq!(
        scenario.engine.connection_state(),
        ConnectionState::Disconnected
    );
    assert_eq!(
        scenario.scheduler.scheduled_delays(),
        vec![Duration::from_millis(1_500)]
    );
    assert_eq!(
        scenario.scheduler.latest_pending(),
        scenario.engine.pending_reconnect()
    );
    assert_eq!(scenario.engine.reconnect_attempts(), 1);
    assert!(matches!(
        scenario.engine.error(),
        Some(SyncError::NetworkUnavailable {
            stage: "transport-error",
            ..
        })
    ));

    scenario.fire_reconnect();
    scenario.opened();
    assert_eq!(
        scenario.engine.connection_state(),
        ConnectionState::Connected
    );
    assert!(scenario.engine.error().is_none());
}

#[test]
fn clean_close_stays_disconnected() {
    let mut scenario = Scenario::new();
    scenario
        .engine
        .switch_conversation(ConversationId::new(7));
    let connection = scenario.opened();

    scenario.closed(connection, 1000);

    assert_eq!(
        scenario.engine.connection_state(),
        ConnectionState::Disconnected
    );
    assert!(scenario.engine.pending_reconnect().is_none());
}

#[test]
fn late_history_for_a_previous_conversation_is_discarded() {
    let mut scenario = Scenario::new();
    scenario
        .engine
        .switch_conversation(ConversationId::new(1));
    let for_a = scenario.history.last_request().unwrap().ticket;

    scenario
        .engine
        .switch_conversation(ConversationId::new(2));
    scenario.engine.handle(SyncEvent::HistoryLoaded {
        ticket: for_a,
        result: Ok(HistoryResponse::new(
            vec![Message::user("belongs to a", at(0))],
            true,
        )),
    });

    assert!(scenario.engine.history().is_empty());
    assert!(!scenario.engine.snapshot().has_more);

    scenario.answer_history(vec![Message::agent("belongs to b", at(1))], false);
    assert_eq!(scenario.engine.history()[0].text, "belongs to b");
}

#[test]
fn page_zero_twice_replaces_and_older_pages_prepend() {
    let mut scenario = Scenario::new();
    scenario
        .engine
        .switch_conversation(ConversationId::new(3));
    let newest = vec![Message::user("c", at(3)), Message::agent("d", at(4))];
    scenario.answer_history(newest.clone(), true);

    scenario.engine.reload_history();
    scenario.answer_history(newest, true);
    assert_eq!(scenario.engine.history().len(), 2);

    scenario.engine.load_older();
    assert_eq!(scenario.history.last_request().unwrap().offset, 2);
    scenario.answer_history(
        vec![Message::agent("b", at(2)), Message::user("a", at(1))],
        false,
    );

    let texts = scenario
        .engine
        .history()
        .iter()
        .map(|message| message.text.clone())
        .collect::<Vec<_>>();
    assert_eq!(texts, vec!["a", "b", "c", "d"]);
}

#[test]
fn at_most_one_physical_connection_is_open() {
    let mut scenario = Scenario::new();
    scenario
        .engine
        .switch_conversation(ConversationId::new(7));
    let first = scenario.opened();

    scenario.engine.connect().unwrap();
    scenario.closed(first, 1006);
    scenario.engine.set_visibility(Visibility::Background);
    scenario.engine.set_visibility(Visibility::Foreground);
    scenario.engine.connect().unwrap();

    assert_eq!(scenario.transport.open_handles().len(), 1);
    assert_eq!(
        scenario.transport.open_handles(),
        vec![scenario.connection()]
    );
}

#[test]
fn send_while_disconnected_appends_notice_and_reconnects() {
    let mut scenario = Scenario::new();
    scenario
        .engine
        .switch_conversation(ConversationId::new(7));
    let connection = scenario.opened();
    scenario.frame(connection, r#"{"type":"init","convId":7}"#);
    scenario.closed(connection, 1006);

    scenario.engine.send("are you there?");

    let snapshot = scenario.engine.snapshot();
    assert_eq!(snapshot.connection_state, ConnectionState::Connecting);
    assert!(!snapshot.awaiting_reply);
    assert_eq!(scenario.transport.open_count(), 2);
    assert!(scenario.engine.pending_reconnect().is_none());

    // The fresh connection is unbound until its handshake; the notice shows once rebound.
    assert_eq!(
        scenario
            .engine
            .live_buffer()
            .messages()
            .last()
            .map(|message| message.from),
        Some(Sender::System)
    );
    let second = scenario.opened();
    scenario.frame(second, r#"{"type":"init","convId":7}"#);
    assert_eq!(
        scenario.displayed_texts().last().map(|(from, _)| *from),
        Some(Sender::System)
    );
}

#[test]
fn foreground_reconnects_immediately_when_unhealthy() {
    let mut scenario = Scenario::new();
    scenario
        .engine
        .switch_conversation(ConversationId::new(7));
    let connection = scenario.opened();
    scenario.engine.set_visibility(Visibility::Background);
    scenario.closed(connection, 1006);

    scenario.fire_reconnect();
    assert_eq!(scenario.transport.open_count(), 1);

    scenario.engine.set_visibility(Visibility::Foreground);
    assert_eq!(scenario.transport.open_count(), 2);
    assert_eq!(
        scenario.engine.connection_state(),
        ConnectionState::Connecting
    );
}

#[test]
fn reconnect_bound_to_another_conversation_drops_the_old_buffer() {
    let mut scenario = Scenario::new();
    scenario
        .engine
        .switch_conversation(ConversationId::new(7));
    let first = scenario.opened();
    scenario.frame(first, r#"{"type":"init","convId":7}"#);
    scenario.frame(first, "old reply");
    scenario.closed(first, 1006);

    scenario.fire_reconnect();
    let second = scenario.opened();
    scenario.frame(second, r#"{"type":"init","convId":8}"#);

    assert!(scenario.engine.live_buffer().is_empty());
    assert_eq!(
        scenario.engine.bound_conversation(),
        Some(ConversationId::new(8))
    );
    assert!(scenario.displayed_texts().is_empty());
}
