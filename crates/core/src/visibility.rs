use crate::connection::ConnectionSession;
use crate::error::SyncError;
use crate::ids::ConnectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Visibility {
    #[default]
    Foreground,
    Background,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VisibilityOutcome {
    Unchanged,
    /// Backgrounded; the connection keeps running.
    Backgrounded,
    /// Foregrounded with a healthy session, or one that was never opened or was torn down.
    Foregrounded,
    Reopened(ConnectionId),
    ReopenFailed(SyncError),
}

/// Supervises long-lived health across foreground/background transitions.
#[derive(Debug, Default)]
pub struct VisibilityReconnector {
    visibility: Visibility,
}

impl VisibilityReconnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn is_backgrounded(&self) -> bool {
        self.visibility == Visibility::Background
    }

    /// On foreground, an unhealthy session reopens at once, bypassing the backoff timer.
    pub fn on_change(
        &mut self,
        visibility: Visibility,
        session: &mut ConnectionSession,
    ) -> VisibilityOutcome {
        if self.visibility == visibility {
            return VisibilityOutcome::Unchanged;
        }
        self.visibility = visibility;

        if visibility == Visibility::Background {
            tracing::debug!(state = %session.state(), "app backgrounded");
            return VisibilityOutcome::Backgrounded;
        }

        let needs_reopen = session.has_context()
            && !session.is_torn_down()
            && (!session.state().is_healthy() || session.is_reconnect_deferred());
        if !needs_reopen {
            return VisibilityOutcome::Foregrounded;
        }

        tracing::info!(
            state = %session.state(),
            attempt = session.attempts(),
            "app foregrounded with unhealthy connection; reconnecting now"
        );
        match session.reopen() {
            Ok(connection) => VisibilityOutcome::Reopened(connection),
            Err(error) => VisibilityOutcome::ReopenFailed(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backoff::ReconnectPolicy;
    use crate::connection::CloseCode;
    use crate::sim::{ManualScheduler, RecordingTransport};

    fn session() -> (ConnectionSession, Arc<RecordingTransport>, Arc<ManualScheduler>) {
        let transport = Arc::new(RecordingTransport::default());
        let scheduler = Arc::new(ManualScheduler::default());
        let session = ConnectionSession::new(
            ReconnectPolicy::default(),
            transport.clone(),
            scheduler.clone(),
        );
        (session, transport, scheduler)
    }

    #[test]
    fn foreground_after_drop_reopens_and_cancels_backoff() {
        let (mut session, transport, scheduler) = session();
        let mut reconnector = VisibilityReconnector::new();
        let connection = session.open(None).unwrap();
        session.on_opened(connection);

        reconnector.on_change(Visibility::Background, &mut session);
        session.on_closed(connection, CloseCode::ABNORMAL);
        let token = session.pending_reconnect().unwrap();

        let outcome = reconnector.on_change(Visibility::Foreground, &mut session);

        assert!(matches!(outcome, VisibilityOutcome::Reopened(_)));
        assert!(scheduler.is_cancelled(token));
        assert_eq!(transport.open_count(), 2);
    }

    #[test]
    fn deferred_reconnect_runs_on_foreground() {
        let (mut session, transport, _) = session();
        let mut reconnector = VisibilityReconnector::new();
        let connection = session.open(None).unwrap();
        reconnector.on_change(Visibility::Background, &mut session);
        session.on_closed(connection, CloseCode::ABNORMAL);
        let token = session.pending_reconnect().unwrap();
        session.on_timer(token, reconnector.is_backgrounded());
        assert_eq!(transport.open_count(), 1);

        reconnector.on_change(Visibility::Foreground, &mut session);

        assert_eq!(transport.open_count(), 2);
    }

    #[test]
    fn healthy_or_torn_down_sessions_are_left_alone() {
        let (mut session, transport, _) = session();
        let mut reconnector = VisibilityReconnector::new();
        let connection = session.open(None).unwrap();
        session.on_opened(connection);

        reconnector.on_change(Visibility::Background, &mut session);
        assert_eq!(
            reconnector.on_change(Visibility::Foreground, &mut session),
            VisibilityOutcome::Foregrounded
        );

        session.close(CloseCode::NORMAL, "logout");
        reconnector.on_change(Visibility::Background, &mut session);
        reconnector.on_change(Visibility::Foreground, &mut session);
        assert_eq!(transport.open_count(), 1);
    }
}
