use std::sync::Arc;

use agentick_core::{
    Capabilities, SyncEngine, SyncEvent, SystemClock, UserCommand, ViewSnapshot, Visibility,
};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::history::{HistoryFetchError, HttpHistorySource};
use crate::scheduler::TokioScheduler;
use crate::session_file::{BackgroundSessionStore, JsonSessionStore};
use crate::settings::SettingsStore;
use crate::transport::WsTransport;

pub type DriverResult<T> = Result<T, DriverError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DriverError {
    #[snafu(display("driver must start inside a tokio runtime on `{stage}`: {source}"))]
    NoRuntime {
        stage: &'static str,
        source: tokio::runtime::TryCurrentError,
    },
    #[snafu(display("failed to prepare history source on `{stage}`: {source}"))]
    HistorySource {
        stage: &'static str,
        source: HistoryFetchError,
    },
    #[snafu(display("driver has stopped on `{stage}`"))]
    Stopped { stage: &'static str },
}

/// Handle to the task that owns the engine.
///
/// Every event reaches the engine through one channel, so state changes are applied in
/// arrival order on a single task. A fresh [`ViewSnapshot`] is published after each one.
pub struct ClientHandle {
    events: mpsc::UnboundedSender<SyncEvent>,
    snapshots: watch::Receiver<ViewSnapshot>,
    cancel_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    session_writer: Option<JoinHandle<()>>,
}

impl ClientHandle {
    /// Builds the production adapters, restores the persisted session, and starts the loop.
    pub fn start(settings: Arc<SettingsStore>) -> DriverResult<Self> {
        let runtime = Handle::try_current().context(NoRuntimeSnafu {
            stage: "start-driver",
        })?;
        let current = settings.settings();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let (store, session_writer) =
            BackgroundSessionStore::spawn(JsonSessionStore::new(current.session_path()), &runtime);
        let history = HttpHistorySource::new(settings.clone(), runtime.clone(), events_tx.clone())
            .context(HistorySourceSnafu {
                stage: "start-driver",
            })?;
        let capabilities = Capabilities {
            transport: Arc::new(WsTransport::new(
                settings.clone(),
                runtime.clone(),
                events_tx.clone(),
            )),
            scheduler: Arc::new(TokioScheduler::new(runtime.clone(), events_tx.clone())),
            history: Arc::new(history),
            store: Arc::new(store),
            clock: Arc::new(SystemClock),
        };

        let mut engine = SyncEngine::new(current.engine_config(), capabilities);
        match engine.restore() {
            Ok(Some(conversation)) => {
                tracing::info!(conversation = %conversation, "resumed previous conversation");
            }
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(error = %error, "could not restore the previous session");
            }
        }

        let (snapshot_tx, snapshot_rx) = watch::channel(engine.snapshot());
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let task = runtime.spawn(run(engine, events_rx, snapshot_tx, cancel_rx));

        Ok(Self {
            events: events_tx,
            snapshots: snapshot_rx,
            cancel_tx: Some(cancel_tx),
            task: Some(task),
            session_writer: Some(session_writer),
        })
    }

    pub fn command(&self, command: UserCommand) -> DriverResult<()> {
        self.dispatch(SyncEvent::Command(command))
    }

    pub fn set_visibility(&self, visibility: Visibility) -> DriverResult<()> {
        self.dispatch(SyncEvent::Visibility(visibility))
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewSnapshot> {
        self.snapshots.clone()
    }

    /// Tears the session down and waits until the loop and its last session write finish.
    pub async fn stop(mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
        if let Some(task) = self.task.take()
            && let Err(error) = task.await
        {
            tracing::warn!(error = %error, "driver task ended abnormally");
        }
        // The engine, and with it the writer's queue, is dropped when the loop ends.
        if let Some(writer) = self.session_writer.take()
            && let Err(error) = writer.await
        {
            tracing::warn!(error = %error, "session writer ended abnormally");
        }
    }

    fn dispatch(&self, event: SyncEvent) -> DriverResult<()> {
        self.events.send(event).ok().context(StoppedSnafu {
            stage: "dispatch-event",
        })
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

async fn run(
    mut engine: SyncEngine,
    mut events: mpsc::UnboundedReceiver<SyncEvent>,
    snapshots: watch::Sender<ViewSnapshot>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!("driver cancelled");
                engine.shutdown();
                snapshots.send_replace(engine.snapshot());
                break;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                tracing::trace!(?event, "driver event");
                engine.handle(event);
                snapshots.send_replace(engine.snapshot());
            }
        }
    }
}
