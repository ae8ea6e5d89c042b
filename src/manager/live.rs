//! In-memory resources bound to one active record.

use log::{debug, warn};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::protocol::{ProtocolSession, SessionHandle};
use crate::registry::SessionId;

/// Background tasks a live session may own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LiveTask {
    /// Moves session events into the record's command queue.
    EventForwarder,
    /// Fails the attempt if basic configuration never completes.
    HandshakeWatchdog,
    /// Periodic keep-alive timer.
    KeepAlive,
}

/// Snapshot of a record's live resources, for status displays and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSummary {
    pub session_id: SessionId,
    /// Background tasks still attached (event subscription, watchdog, keep-alive timer).
    pub tasks: usize,
    pub keepalive_scheduled: bool,
}

pub(crate) struct LiveSession {
    pub(crate) session_id: SessionId,
    session: ProtocolSession,
    handle: SessionHandle,
    tasks: Vec<(LiveTask, JoinHandle<()>)>,
}

impl LiveSession {
    pub(crate) fn new(session_id: SessionId, session: ProtocolSession) -> Self {
        let handle = session.handle();
        Self {
            session_id,
            session,
            handle,
            tasks: Vec::new(),
        }
    }

    pub(crate) fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub(crate) fn track(&mut self, kind: LiveTask, task: JoinHandle<()>) {
        self.cancel(kind);
        self.tasks.push((kind, task));
    }

    pub(crate) fn cancel(&mut self, kind: LiveTask) {
        self.tasks.retain(|(k, task)| {
            if *k == kind {
                task.abort();
                false
            } else {
                true
            }
        });
    }

    pub(crate) fn summary(&self) -> LiveSummary {
        LiveSummary {
            session_id: self.session_id,
            tasks: self.tasks.len(),
            keepalive_scheduled: self.tasks.iter().any(|(k, _)| *k == LiveTask::KeepAlive),
        }
    }

    /// Cancels every task, then closes the session and its transport within `close_timeout`.
    /// Each step runs regardless of how the previous one went.
    pub(crate) async fn shutdown(mut self, close_timeout: Duration) {
        for (kind, task) in self.tasks.drain(..) {
            task.abort();
            debug!("Cancelled {:?} for session {}", kind, self.session_id);
        }
        if tokio::time::timeout(close_timeout, self.session.close())
            .await
            .is_err()
        {
            warn!(
                "Session {} did not close within {:?}; dropping it",
                self.session_id, close_timeout
            );
        }
    }
}
