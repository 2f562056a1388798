//! In-memory capabilities for driving the engine without a network or real time.
//!
//! Every fake records what the engine asked of it; tests feed results back as events.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use crate::capability::{
    Clock, ConnectRequest, HistorySource, PageRequest, PersistedSession, Scheduler,
    SessionStore, Transport,
};
use crate::error::{SyncError, SyncResult};
use crate::ids::{ConnectionId, ConversationId, TimerToken};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Open {
        connection: ConnectionId,
        requested_conversation: Option<ConversationId>,
    },
    Send {
        connection: ConnectionId,
        text: String,
    },
    Close {
        connection: ConnectionId,
        code: u16,
    },
}

#[derive(Debug, Default)]
struct TransportLog {
    calls: Vec<TransportCall>,
    open: Vec<ConnectionId>,
    fail_next_open: Option<String>,
    fail_sends: Option<String>,
}

/// Records transport calls and tracks which handles are physically open.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    log: Mutex<TransportLog>,
}

impl RecordingTransport {
    pub fn calls(&self) -> Vec<TransportCall> {
        lock(&self.log).calls.clone()
    }

    pub fn open_handles(&self) -> Vec<ConnectionId> {
        lock(&self.log).open.clone()
    }

    pub fn open_count(&self) -> usize {
        lock(&self.log)
            .calls
            .iter()
            .filter(|call| matches!(call, TransportCall::Open { .. }))
            .count()
    }

    pub fn last_open(&self) -> Option<ConnectRequest> {
        lock(&self.log)
            .calls
            .iter()
            .rev()
            .find_map(|call| match call {
                TransportCall::Open {
                    connection,
                    requested_conversation,
                } => Some(ConnectRequest {
                    connection: *connection,
                    requested_conversation: *requested_conversation,
                }),
                _ => None,
            })
    }

    pub fn sent_texts(&self) -> Vec<String> {
        lock(&self.log)
            .calls
            .iter()
            .filter_map(|call| match call {
                TransportCall::Send { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    /// The next `open` fails synchronously with `details`.
    pub fn fail_next_open(&self, details: &str) {
        lock(&self.log).fail_next_open = Some(details.to_string());
    }

    /// Every `send` fails with `details` until cleared with `None`.
    pub fn fail_sends(&self, details: Option<&str>) {
        lock(&self.log).fail_sends = details.map(str::to_string);
    }
}

impl Transport for RecordingTransport {
    fn open(&self, request: ConnectRequest) -> SyncResult<()> {
        let mut log = lock(&self.log);
        log.calls.push(TransportCall::Open {
            connection: request.connection,
            requested_conversation: request.requested_conversation,
        });

        if let Some(details) = log.fail_next_open.take() {
            return Err(SyncError::NetworkUnavailable {
                stage: "sim-open",
                details,
            });
        }

        log.open.push(request.connection);
        Ok(())
    }

    fn send(&self, connection: ConnectionId, text: &str) -> SyncResult<()> {
        let mut log = lock(&self.log);
        if let Some(details) = log.fail_sends.clone() {
            return Err(SyncError::NetworkUnavailable {
                stage: "sim-send",
                details,
            });
        }

        log.calls.push(TransportCall::Send {
            connection,
            text: text.to_string(),
        });
        Ok(())
    }

    fn close(&self, connection: ConnectionId, code: u16, _reason: &str) {
        let mut log = lock(&self.log);
        log.calls.push(TransportCall::Close { connection, code });
        log.open.retain(|open| *open != connection);
    }
}

#[derive(Debug, Default)]
struct TimerTable {
    next: u64,
    scheduled: Vec<(TimerToken, Duration)>,
    cancelled: HashSet<TimerToken>,
}

/// Hands out timer tokens without ever firing them; tests deliver `TimerFired` themselves.
#[derive(Debug, Default)]
pub struct ManualScheduler {
    timers: Mutex<TimerTable>,
}

impl ManualScheduler {
    pub fn scheduled_delays(&self) -> Vec<Duration> {
        lock(&self.timers)
            .scheduled
            .iter()
            .map(|(_, delay)| *delay)
            .collect()
    }

    pub fn is_cancelled(&self, token: TimerToken) -> bool {
        lock(&self.timers).cancelled.contains(&token)
    }

    /// Most recently scheduled token that has not been cancelled.
    pub fn latest_pending(&self) -> Option<TimerToken> {
        let timers = lock(&self.timers);
        timers
            .scheduled
            .iter()
            .rev()
            .map(|(token, _)| *token)
            .find(|token| !timers.cancelled.contains(token))
    }
}

impl Scheduler for ManualScheduler {
    fn after(&self, delay: Duration) -> TimerToken {
        let mut timers = lock(&self.timers);
        timers.next += 1;
        let token = TimerToken::new(timers.next);
        timers.scheduled.push((token, delay));
        token
    }

    fn cancel(&self, token: TimerToken) {
        lock(&self.timers).cancelled.insert(token);
    }
}

#[derive(Debug, Default)]
pub struct RecordingHistorySource {
    requests: Mutex<Vec<PageRequest>>,
}

impl RecordingHistorySource {
    pub fn requests(&self) -> Vec<PageRequest> {
        lock(&self.requests).clone()
    }

    pub fn last_request(&self) -> Option<PageRequest> {
        lock(&self.requests).last().copied()
    }
}

impl HistorySource for RecordingHistorySource {
    fn fetch(&self, request: PageRequest) {
        lock(&self.requests).push(request);
    }
}

#[derive(Debug, Default)]
struct StoredSession {
    session: Option<PersistedSession>,
    saves: usize,
    fail_saves: bool,
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    state: Mutex<StoredSession>,
}

impl MemorySessionStore {
    pub fn with_session(session: PersistedSession) -> Self {
        Self {
            state: Mutex::new(StoredSession {
                session: Some(session),
                ..StoredSession::default()
            }),
        }
    }

    pub fn saved(&self) -> Option<PersistedSession> {
        lock(&self.state).session.clone()
    }

    pub fn save_count(&self) -> usize {
        lock(&self.state).saves
    }

    pub fn fail_saves(&self, fail: bool) {
        lock(&self.state).fail_saves = fail;
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> SyncResult<Option<PersistedSession>> {
        Ok(lock(&self.state).session.clone())
    }

    fn save(&self, session: &PersistedSession) -> SyncResult<()> {
        let mut state = lock(&self.state);
        if state.fail_saves {
            return Err(SyncError::Storage {
                stage: "sim-save",
                details: "store is read-only".to_string(),
            });
        }

        state.session = Some(session.clone());
        state.saves += 1;
        Ok(())
    }

    fn clear(&self) -> SyncResult<()> {
        lock(&self.state).session = None;
        Ok(())
    }
}

/// Clock that advances by a fixed step on every read, so appends get distinct instants.
#[derive(Debug)]
pub struct SteppingClock {
    next: Mutex<DateTime<Utc>>,
    step: chrono::Duration,
}

impl SteppingClock {
    pub fn new(start: DateTime<Utc>, step: chrono::Duration) -> Self {
        Self {
            next: Mutex::new(start),
            step,
        }
    }
}

impl Default for SteppingClock {
    fn default() -> Self {
        let start = Utc
            .with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_default();
        Self::new(start, chrono::Duration::seconds(1))
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> DateTime<Utc> {
        let mut next = lock(&self.next);
        let now = *next;
        *next = now + self.step;
        now
    }
}
