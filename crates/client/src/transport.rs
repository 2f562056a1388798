use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use agentick_core::{
    CloseCode, ConnectRequest, ConnectionId, ConversationId, SyncError, SyncEvent, SyncResult,
    Transport, TransportEvent,
};
use futures::{SinkExt, StreamExt};
use snafu::{OptionExt, Snafu};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;

use crate::settings::SettingsStore;

/// Code reported when the peer closes without a status.
const NO_STATUS_RECEIVED: u16 = 1005;

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransportError {
    #[snafu(display("invalid websocket endpoint '{url}' on `{stage}`: {details}"))]
    InvalidEndpoint {
        stage: &'static str,
        url: String,
        details: String,
    },
    #[snafu(display("connection {connection} is not open on `{stage}`"))]
    ConnectionMissing {
        stage: &'static str,
        connection: ConnectionId,
    },
    #[snafu(display("connection {connection} writer has stopped on `{stage}`"))]
    WriterStopped {
        stage: &'static str,
        connection: ConnectionId,
    },
}

impl From<TransportError> for SyncError {
    fn from(error: TransportError) -> Self {
        let stage = match &error {
            TransportError::InvalidEndpoint { stage, .. }
            | TransportError::ConnectionMissing { stage, .. }
            | TransportError::WriterStopped { stage, .. } => *stage,
        };
        SyncError::NetworkUnavailable {
            stage,
            details: error.to_string(),
        }
    }
}

/// Builds `{ws_url}?token=..&convId=..`; the conversation parameter is omitted when unknown.
pub fn connection_url(
    ws_url: &str,
    token: &str,
    requested: Option<ConversationId>,
) -> TransportResult<reqwest::Url> {
    let mut url = reqwest::Url::parse(ws_url).map_err(|source| TransportError::InvalidEndpoint {
        stage: "parse-websocket-url",
        url: ws_url.to_string(),
        details: source.to_string(),
    })?;

    {
        let mut query = url.query_pairs_mut();
        query.append_pair("token", token);
        if let Some(conversation) = requested {
            query.append_pair("convId", &conversation.to_string());
        }
    }
    Ok(url)
}

enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

struct LiveConnection {
    outbound: mpsc::UnboundedSender<Outbound>,
    task: AbortHandle,
}

/// WebSocket transport; one task per physical connection.
pub struct WsTransport {
    settings: Arc<SettingsStore>,
    runtime: Handle,
    events: mpsc::UnboundedSender<SyncEvent>,
    connections: Mutex<HashMap<ConnectionId, LiveConnection>>,
}

impl WsTransport {
    pub fn new(
        settings: Arc<SettingsStore>,
        runtime: Handle,
        events: mpsc::UnboundedSender<SyncEvent>,
    ) -> Self {
        Self {
            settings,
            runtime,
            events,
            connections: Mutex::default(),
        }
    }

    pub fn open_connections(&self) -> usize {
        lock(&self.connections).len()
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<ConnectionId, LiveConnection>> {
        lock(&self.connections)
    }
}

impl Transport for WsTransport {
    fn open(&self, request: ConnectRequest) -> SyncResult<()> {
        let settings = self.settings.settings();
        if !settings.has_token() {
            tracing::warn!(connection = %request.connection, "connecting without a credential");
        }
        let url = connection_url(
            &settings.ws_url,
            &settings.token,
            request.requested_conversation,
        )?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let events = self.events.clone();
        let mut connections = self.connections();
        // Tasks that ended on their own dropped their receiver.
        connections.retain(|_, live| !live.outbound.is_closed());
        let task = self.runtime.spawn(run_connection(
            request.connection,
            url,
            outbound_rx,
            events,
        ));
        connections.insert(
            request.connection,
            LiveConnection {
                outbound: outbound_tx,
                task: task.abort_handle(),
            },
        );
        Ok(())
    }

    fn send(&self, connection: ConnectionId, text: &str) -> SyncResult<()> {
        let connections = self.connections();
        let live = connections.get(&connection).context(ConnectionMissingSnafu {
            stage: "send-text",
            connection,
        })?;

        live.outbound
            .send(Outbound::Text(text.to_string()))
            .ok()
            .context(WriterStoppedSnafu {
                stage: "send-text",
                connection,
            })?;
        Ok(())
    }

    fn close(&self, connection: ConnectionId, code: u16, reason: &str) {
        let Some(live) = self.connections().remove(&connection) else {
            return;
        };

        let close = Outbound::Close {
            code,
            reason: reason.to_string(),
        };
        if live.outbound.send(close).is_err() {
            live.task.abort();
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        for (_, live) in self.connections().drain() {
            live.task.abort();
        }
    }
}

async fn run_connection(
    connection: ConnectionId,
    url: reqwest::Url,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<SyncEvent>,
) {
    let emit = |event: TransportEvent| {
        let _ = events.send(SyncEvent::Transport(event));
    };
    let fail = |details: String| {
        emit(TransportEvent::Error {
            connection,
            details: details.clone(),
        });
        emit(TransportEvent::Closed {
            connection,
            code: CloseCode::ABNORMAL,
            reason: details,
        });
    };

    let stream = tokio::select! {
        result = tokio_tungstenite::connect_async(url.as_str()) => match result {
            Ok((stream, _response)) => stream,
            Err(source) => {
                tracing::warn!(connection = %connection, error = %source, "websocket connect failed");
                fail(format!("websocket connect failed: {source}"));
                return;
            }
        },
        // Closed (or dropped) before the handshake finished.
        _ = outbound.recv() => {
            tracing::debug!(connection = %connection, "connection abandoned while connecting");
            return;
        }
    };

    emit(TransportEvent::Opened(connection));
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(Outbound::Text(text)) => {
                    if let Err(source) = write.send(WsMessage::Text(text.into())).await {
                        tracing::warn!(connection = %connection, error = %source, "websocket send failed");
                        fail(format!("websocket send failed: {source}"));
                        return;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: WsCloseCode::from(code),
                        reason: reason.clone().into(),
                    };
                    let _ = write.send(WsMessage::Close(Some(frame))).await;
                    let _ = write.close().await;
                    emit(TransportEvent::Closed {
                        connection,
                        code: CloseCode(code),
                        reason,
                    });
                    return;
                }
                None => {
                    let _ = write.close().await;
                    return;
                }
            },
            frame = read.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => emit(TransportEvent::Frame {
                    connection,
                    text: text.to_string(),
                }),
                Some(Ok(WsMessage::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|frame| (u16::from(frame.code), frame.reason.to_string()))
                        .unwrap_or((NO_STATUS_RECEIVED, String::new()));
                    tracing::info!(connection = %connection, code, reason = %reason, "server closed websocket");
                    emit(TransportEvent::Closed {
                        connection,
                        code: CloseCode(code),
                        reason,
                    });
                    return;
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    tracing::debug!(connection = %connection, bytes = data.len(), "ignoring binary frame");
                }
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {}
                Some(Err(source)) => {
                    tracing::warn!(connection = %connection, error = %source, "websocket read failed");
                    fail(format!("websocket read failed: {source}"));
                    return;
                }
                None => {
                    fail("websocket stream ended".to_string());
                    return;
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
