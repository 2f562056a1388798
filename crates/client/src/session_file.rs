use std::path::{Path, PathBuf};
use std::sync::Arc;

use agentick_core::{PersistedSession, SessionStore, SyncError, SyncResult};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::json_file::{JsonFileError, JsonFileResult, read_json, remove_json, write_json_atomic};

/// Keeps the persisted session as one JSON document, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct JsonSessionStore {
    path: PathBuf,
}

impl JsonSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> JsonFileResult<Option<PersistedSession>> {
        read_json(&self.path)
    }

    pub fn write(&self, session: &PersistedSession) -> JsonFileResult<()> {
        write_json_atomic(&self.path, session)?;
        tracing::debug!(
            path = ?self.path,
            active = ?session.active_conversation,
            live_messages = session.live_buffer.messages.len(),
            "saved session"
        );
        Ok(())
    }

    pub fn remove(&self) -> JsonFileResult<()> {
        remove_json(&self.path)
    }
}

impl SessionStore for JsonSessionStore {
    fn load(&self) -> SyncResult<Option<PersistedSession>> {
        self.read().map_err(SyncError::from)
    }

    fn save(&self, session: &PersistedSession) -> SyncResult<()> {
        self.write(session).map_err(SyncError::from)
    }

    fn clear(&self) -> SyncResult<()> {
        self.remove().map_err(SyncError::from)
    }
}

impl From<JsonFileError> for SyncError {
    fn from(error: JsonFileError) -> Self {
        SyncError::Storage {
            stage: error.stage(),
            details: error.to_string(),
        }
    }
}

#[derive(Debug)]
enum SessionWrite {
    Save(PersistedSession),
    Clear,
}

/// Session store for the driver: saves are queued and written off the event loop.
///
/// Only the latest queued write reaches the disk, so a burst of frames costs one file
/// replacement. The writer task drains the queue and exits once the store is dropped.
pub struct BackgroundSessionStore {
    file: Arc<JsonSessionStore>,
    writes: mpsc::UnboundedSender<SessionWrite>,
}

impl BackgroundSessionStore {
    pub fn spawn(file: JsonSessionStore, runtime: &Handle) -> (Self, JoinHandle<()>) {
        let file = Arc::new(file);
        let (writes_tx, writes_rx) = mpsc::unbounded_channel();
        let writer = runtime.spawn(write_loop(file.clone(), writes_rx));
        (
            Self {
                file,
                writes: writes_tx,
            },
            writer,
        )
    }

    fn enqueue(&self, write: SessionWrite) -> SyncResult<()> {
        self.writes.send(write).map_err(|_| SyncError::Storage {
            stage: "queue-session-write",
            details: "session writer has stopped".to_string(),
        })
    }
}

impl SessionStore for BackgroundSessionStore {
    fn load(&self) -> SyncResult<Option<PersistedSession>> {
        self.file.load()
    }

    fn save(&self, session: &PersistedSession) -> SyncResult<()> {
        self.enqueue(SessionWrite::Save(session.clone()))
    }

    fn clear(&self) -> SyncResult<()> {
        self.enqueue(SessionWrite::Clear)
    }
}

async fn write_loop(
    file: Arc<JsonSessionStore>,
    mut writes: mpsc::UnboundedReceiver<SessionWrite>,
) {
    while let Some(mut write) = writes.recv().await {
        let mut skipped = 0_usize;
        while let Ok(newer) = writes.try_recv() {
            write = newer;
            skipped += 1;
        }
        if skipped > 0 {
            tracing::trace!(skipped, "coalesced session writes");
        }

        let target = file.clone();
        let result = tokio::task::spawn_blocking(move || match write {
            SessionWrite::Save(session) => target.write(&session),
            SessionWrite::Clear => target.remove(),
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::warn!(path = ?file.path(), error = %error, "failed to persist session");
            }
            Err(error) => {
                tracing::warn!(path = ?file.path(), error = %error, "session writer task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use agentick_core::{ConversationId, Message, PersistedLiveBuffer};
    use chrono::{TimeZone, Utc};

    use super::*;

    fn session(conversation: u64, texts: &[&str]) -> PersistedSession {
        let timestamp = Utc.with_ymd_and_hms(2025, 2, 14, 18, 30, 5).unwrap();
        PersistedSession {
            active_conversation: Some(ConversationId::new(conversation)),
            live_buffer: PersistedLiveBuffer {
                owner: Some(ConversationId::new(conversation)),
                messages: texts
                    .iter()
                    .map(|text| Message::user(*text, timestamp))
                    .collect(),
            },
        }
    }

    #[test]
    fn missing_or_empty_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSessionStore::new(dir.path().join("session.json"));
        assert_eq!(store.load().unwrap(), None);

        std::fs::write(store.path(), "  \n").unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn saved_session_loads_back_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSessionStore::new(dir.path().join("state").join("session.json"));
        let saved = session(42, &["hi", "hello"]);

        store.save(&saved).unwrap();
        assert_eq!(store.load().unwrap(), Some(saved));

        store.clear().unwrap();
        assert!(!store.path().exists());
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn corrupt_file_surfaces_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSessionStore::new(dir.path().join("session.json"));
        std::fs::write(store.path(), "{\"active_conversation\": [").unwrap();

        let error = store.load().unwrap_err();

        assert!(matches!(
            error,
            SyncError::Storage {
                stage: "parse-json-file",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn background_store_lands_the_last_write_once_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let file = JsonSessionStore::new(dir.path().join("session.json"));
        let (store, writer) = BackgroundSessionStore::spawn(file.clone(), &Handle::current());

        store.save(&session(1, &["a"])).unwrap();
        store.save(&session(1, &["a", "b"])).unwrap();
        store.save(&session(2, &["c"])).unwrap();
        drop(store);
        writer.await.unwrap();

        assert_eq!(file.read().unwrap(), Some(session(2, &["c"])));
    }

    #[tokio::test]
    async fn queued_clear_after_saves_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = JsonSessionStore::new(dir.path().join("session.json"));
        file.write(&session(1, &["old"])).unwrap();
        let (store, writer) = BackgroundSessionStore::spawn(file.clone(), &Handle::current());

        assert_eq!(store.load().unwrap(), Some(session(1, &["old"])));
        store.save(&session(1, &["old", "new"])).unwrap();
        store.clear().unwrap();
        drop(store);
        writer.await.unwrap();

        assert!(!file.path().exists());
    }
}
