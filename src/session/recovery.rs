//! Recovery Monitor
//! Mission: Re-queue sessions abandoned by crashed workers
//!
//! A session stuck in a non-terminal state past the age threshold is
//! presumed orphaned and re-enqueued. Recovery never re-charges credits;
//! the dispatcher skips models that already have outcomes, so a false
//! positive on a slow-but-alive session costs at most a duplicate attempt
//! that the store drops.

use crate::session::dispatcher::DispatchQueue;
use crate::session::store::SessionStore;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Requeued,
    AlreadyTerminal,
    NotFound,
}

pub struct RecoveryMonitor {
    store: Arc<SessionStore>,
    queue: DispatchQueue,
    threshold_secs: i64,
    poll: Duration,
}

impl RecoveryMonitor {
    pub fn new(
        store: Arc<SessionStore>,
        queue: DispatchQueue,
        threshold_secs: i64,
        poll: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            threshold_secs,
            poll,
        }
    }

    /// One scan pass: every non-terminal session older than the threshold
    /// is re-enqueued with reason "stuck". Returns the re-queued ids.
    pub fn detect_and_recover(&self) -> Result<Vec<String>> {
        let stale = self.store.find_stale(self.threshold_secs)?;
        let mut recovered = Vec::with_capacity(stale.len());

        for session_id in stale {
            match self.queue.enqueue(&session_id, "stuck") {
                Ok(()) => {
                    warn!(
                        session_id,
                        threshold_secs = self.threshold_secs,
                        "🩹 Re-queued stuck session"
                    );
                    recovered.push(session_id);
                }
                Err(e) => error!(session_id, "Failed to re-queue stuck session: {e:#}"),
            }
        }

        Ok(recovered)
    }

    /// Operator-triggered recovery for one session with an explicit reason.
    pub fn recover_session(&self, session_id: &str, reason: &str) -> Result<RecoveryOutcome> {
        let Some(session) = self.store.get(session_id)? else {
            return Ok(RecoveryOutcome::NotFound);
        };
        if session.status.is_terminal() {
            return Ok(RecoveryOutcome::AlreadyTerminal);
        }

        self.queue.enqueue(session_id, reason)?;
        info!(session_id, reason, "🩹 Manual recovery requested");
        Ok(RecoveryOutcome::Requeued)
    }

    /// Periodic background scan.
    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            info!(
                threshold_secs = self.threshold_secs,
                poll_secs = self.poll.as_secs(),
                "🩺 Recovery monitor started"
            );
            let mut ticker = interval(self.poll);
            loop {
                ticker.tick().await;
                match self.detect_and_recover() {
                    Ok(ids) if !ids.is_empty() => {
                        info!(count = ids.len(), "Recovery pass re-queued sessions");
                    }
                    Ok(_) => {}
                    Err(e) => error!("Recovery pass failed: {e:#}"),
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PredictionSession, SessionStatus};
    use crate::session::dispatcher::DispatchReceiver;
    use tempfile::NamedTempFile;

    fn test_monitor() -> (RecoveryMonitor, Arc<SessionStore>, DispatchReceiver, NamedTempFile) {
        let temp = NamedTempFile::new().unwrap();
        let store = Arc::new(SessionStore::new(temp.path().to_str().unwrap()).unwrap());
        let (queue, rx) = DispatchQueue::new();
        let monitor = RecoveryMonitor::new(store.clone(), queue, 300, Duration::from_secs(60));
        (monitor, store, rx, temp)
    }

    fn stored_session(store: &SessionStore) -> PredictionSession {
        let session = PredictionSession::new("user-1", "market-x", vec!["m/a".to_string()]);
        store.create(&session).unwrap();
        session
    }

    #[tokio::test]
    async fn stuck_sessions_are_requeued_with_stuck_reason() {
        let (monitor, store, rx, _temp) = test_monitor();
        let stuck = stored_session(&store);
        store.backdate_created_at(&stuck.id, 900);
        let _fresh = stored_session(&store);

        let recovered = monitor.detect_and_recover().unwrap();
        assert_eq!(recovered, vec![stuck.id.clone()]);

        let job = rx.lock().await.try_recv().unwrap();
        assert_eq!(job.session_id, stuck.id);
        assert_eq!(job.reason, "stuck");
        assert!(rx.lock().await.try_recv().is_err());
    }

    #[tokio::test]
    async fn terminal_sessions_are_never_recovered() {
        let (monitor, store, rx, _temp) = test_monitor();
        let done = stored_session(&store);
        store.backdate_created_at(&done.id, 900);
        store
            .transition(&done.id, SessionStatus::Researching, None)
            .unwrap();
        store
            .transition(&done.id, SessionStatus::Generating, None)
            .unwrap();
        store
            .transition(&done.id, SessionStatus::Finished, None)
            .unwrap();

        assert!(monitor.detect_and_recover().unwrap().is_empty());
        assert!(rx.lock().await.try_recv().is_err());

        assert_eq!(
            monitor.recover_session(&done.id, "operator poke").unwrap(),
            RecoveryOutcome::AlreadyTerminal
        );
        assert!(rx.lock().await.try_recv().is_err());
    }

    #[tokio::test]
    async fn manual_recovery_carries_operator_reason() {
        let (monitor, store, rx, _temp) = test_monitor();
        let session = stored_session(&store);

        let outcome = monitor
            .recover_session(&session.id, "worker host rebooted")
            .unwrap();
        assert_eq!(outcome, RecoveryOutcome::Requeued);

        let job = rx.lock().await.try_recv().unwrap();
        assert_eq!(job.reason, "worker host rebooted");
    }

    #[tokio::test]
    async fn unknown_session_reports_not_found() {
        let (monitor, _store, _rx, _temp) = test_monitor();
        assert_eq!(
            monitor.recover_session("nope", "?").unwrap(),
            RecoveryOutcome::NotFound
        );
    }
}
