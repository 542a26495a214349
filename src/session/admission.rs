//! Admission Controller
//! Mission: Validate, charge, and enqueue before any model work begins
//!
//! Order matters: validation has no side effects, the credit reserve is the
//! single atomic charge, and any failure after the charge committed issues a
//! compensating refund so users never pay for work that never started.

use crate::credits::{CreditLedger, ReserveOutcome};
use crate::models::{PredictionSession, SessionStatus, MAX_MODELS_PER_SESSION};
use crate::registry::ModelRegistry;
use crate::session::dispatcher::DispatchQueue;
use crate::session::store::SessionStore;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug)]
pub enum AdmissionError {
    Validation(String),
    InsufficientCredits { available: i64, required: i64 },
    Infrastructure(anyhow::Error),
}

impl fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionError::Validation(msg) => write!(f, "validation failed: {}", msg),
            AdmissionError::InsufficientCredits {
                available,
                required,
            } => write!(
                f,
                "insufficient credits: {} available, {} required",
                available, required
            ),
            AdmissionError::Infrastructure(e) => write!(f, "admission infrastructure: {:#}", e),
        }
    }
}

#[derive(Clone)]
pub struct AdmissionController {
    ledger: Arc<CreditLedger>,
    registry: Arc<ModelRegistry>,
    store: Arc<SessionStore>,
    queue: DispatchQueue,
}

impl AdmissionController {
    pub fn new(
        ledger: Arc<CreditLedger>,
        registry: Arc<ModelRegistry>,
        store: Arc<SessionStore>,
        queue: DispatchQueue,
    ) -> Self {
        Self {
            ledger,
            registry,
            store,
            queue,
        }
    }

    /// Admit one session: validate, charge |models| credits, persist the
    /// record, enqueue the dispatch job, and return the new session id.
    pub fn start_session(
        &self,
        user_id: &str,
        market_id: &str,
        selected_models: Vec<String>,
    ) -> Result<String, AdmissionError> {
        self.validate_request(market_id, &selected_models)?;

        let cost = selected_models.len() as i64;
        let reserve = self
            .ledger
            .reserve(user_id, cost, &format!("prediction session: {}", market_id))
            .map_err(AdmissionError::Infrastructure)?;
        if let ReserveOutcome::Insufficient {
            available,
            required,
        } = reserve
        {
            return Err(AdmissionError::InsufficientCredits {
                available,
                required,
            });
        }

        let session = PredictionSession::new(user_id, market_id, selected_models);
        let session_id = session.id.clone();

        if let Err(e) = self.store.create(&session) {
            self.compensate(user_id, cost, &session_id, "session create failed");
            return Err(AdmissionError::Infrastructure(e));
        }

        if let Err(e) = self.queue.enqueue(&session_id, "user") {
            self.compensate(user_id, cost, &session_id, "dispatch enqueue failed");
            if let Err(mark) = self.store.mark_error(&session_id, "dispatch enqueue failed") {
                error!(session_id, "Failed to mark session errored: {mark:#}");
            }
            return Err(AdmissionError::Infrastructure(e));
        }

        // Best effort: a worker may already have grabbed the job and moved
        // the session past QUEUED, which the state machine allows.
        if let Err(e) =
            self.store
                .transition(&session_id, SessionStatus::Queued, Some("Waiting for a worker"))
        {
            warn!(session_id, "Queued transition failed: {e:#}");
        }

        info!(
            user_id,
            market_id,
            session_id,
            cost,
            "🎫 Session admitted"
        );
        Ok(session_id)
    }

    fn validate_request(
        &self,
        market_id: &str,
        selected_models: &[String],
    ) -> Result<(), AdmissionError> {
        if market_id.trim().is_empty() {
            return Err(AdmissionError::Validation("market_id is required".into()));
        }
        if selected_models.is_empty() {
            return Err(AdmissionError::Validation(
                "at least one model must be selected".into(),
            ));
        }
        if selected_models.len() > MAX_MODELS_PER_SESSION {
            return Err(AdmissionError::Validation(format!(
                "at most {} models per session, got {}",
                MAX_MODELS_PER_SESSION,
                selected_models.len()
            )));
        }

        let mut seen = HashSet::new();
        for model in selected_models {
            if !seen.insert(model.as_str()) {
                return Err(AdmissionError::Validation(format!(
                    "duplicate model id: {}",
                    model
                )));
            }
            if !self.registry.is_valid_model_id(model) {
                return Err(AdmissionError::Validation(format!(
                    "unknown model id: {}",
                    model
                )));
            }
        }
        Ok(())
    }

    fn compensate(&self, user_id: &str, cost: i64, session_id: &str, why: &str) {
        warn!(user_id, session_id, cost, why, "Compensating credit refund");
        if let Err(e) = self.ledger.refund(user_id, cost, why) {
            // Charged credits with no session to show for it; needs operator
            // attention, so log loudly instead of swallowing.
            error!(user_id, session_id, cost, "REFUND FAILED: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::dispatcher::DispatchReceiver;
    use tempfile::NamedTempFile;

    fn test_controller() -> (
        AdmissionController,
        Arc<CreditLedger>,
        Arc<SessionStore>,
        DispatchReceiver,
        (NamedTempFile, NamedTempFile),
    ) {
        let ledger_file = NamedTempFile::new().unwrap();
        let store_file = NamedTempFile::new().unwrap();
        let ledger = Arc::new(CreditLedger::new(ledger_file.path().to_str().unwrap(), 5).unwrap());
        let store = Arc::new(SessionStore::new(store_file.path().to_str().unwrap()).unwrap());
        let registry = Arc::new(ModelRegistry::new(vec![
            "m/a".to_string(),
            "m/b".to_string(),
            "m/c".to_string(),
            "m/d".to_string(),
            "m/e".to_string(),
            "m/f".to_string(),
        ]));
        let (queue, rx) = DispatchQueue::new();
        let controller = AdmissionController::new(ledger.clone(), registry, store.clone(), queue);
        (controller, ledger, store, rx, (ledger_file, store_file))
    }

    fn models(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn admits_valid_session_and_charges_per_model() {
        let (controller, ledger, store, rx, _tmp) = test_controller();

        let session_id = controller
            .start_session("user-a", "market-m", models(&["m/a", "m/b"]))
            .unwrap();

        assert_eq!(ledger.balance("user-a").unwrap().balance, 3);

        let session = store.get(&session_id).unwrap().unwrap();
        assert_eq!(session.selected_models.len(), 2);
        assert_eq!(session.status, SessionStatus::Queued);

        let job = rx.lock().await.try_recv().unwrap();
        assert_eq!(job.session_id, session_id);
        assert_eq!(job.reason, "user");
    }

    #[tokio::test]
    async fn empty_model_list_is_rejected_without_side_effects() {
        let (controller, ledger, store, rx, _tmp) = test_controller();

        let err = controller
            .start_session("user-a", "market-m", models(&[]))
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Validation(_)));

        assert_eq!(ledger.balance("user-a").unwrap().balance, 5);
        assert!(store.list_for_user("user-a", 10).unwrap().is_empty());
        assert!(rx.lock().await.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_model_id_is_rejected_without_charge() {
        let (controller, ledger, _store, _rx, _tmp) = test_controller();

        let err = controller
            .start_session("user-a", "market-m", models(&["m/a", "made-up/model"]))
            .unwrap_err();
        match err {
            AdmissionError::Validation(msg) => assert!(msg.contains("unknown model id")),
            other => panic!("expected validation error, got {other}"),
        }
        assert_eq!(ledger.balance("user-a").unwrap().balance, 5);
    }

    #[tokio::test]
    async fn duplicate_models_are_rejected() {
        let (controller, _ledger, _store, _rx, _tmp) = test_controller();

        let err = controller
            .start_session("user-a", "market-m", models(&["m/a", "m/a"]))
            .unwrap_err();
        match err {
            AdmissionError::Validation(msg) => assert!(msg.contains("duplicate")),
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[tokio::test]
    async fn more_than_five_models_is_rejected() {
        let (controller, _ledger, _store, _rx, _tmp) = test_controller();

        let err = controller
            .start_session(
                "user-a",
                "market-m",
                models(&["m/a", "m/b", "m/c", "m/d", "m/e", "m/f"]),
            )
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Validation(_)));
    }

    #[tokio::test]
    async fn blank_market_id_is_rejected() {
        let (controller, _ledger, _store, _rx, _tmp) = test_controller();

        let err = controller
            .start_session("user-a", "   ", models(&["m/a"]))
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Validation(_)));
    }

    #[tokio::test]
    async fn insufficient_credits_creates_nothing() {
        let (controller, ledger, store, rx, _tmp) = test_controller();

        // Starting balance is 5; burn 4 first.
        controller
            .start_session("user-a", "market-m", models(&["m/a", "m/b", "m/c", "m/d"]))
            .unwrap();
        rx.lock().await.try_recv().unwrap();

        let err = controller
            .start_session("user-a", "market-m", models(&["m/a", "m/b"]))
            .unwrap_err();
        match err {
            AdmissionError::InsufficientCredits {
                available,
                required,
            } => {
                assert_eq!(available, 1);
                assert_eq!(required, 2);
            }
            other => panic!("expected insufficient credits, got {other}"),
        }

        assert_eq!(ledger.balance("user-a").unwrap().balance, 1);
        assert_eq!(store.list_for_user("user-a", 10).unwrap().len(), 1);
        assert!(rx.lock().await.try_recv().is_err());
    }

    #[tokio::test]
    async fn concurrent_admissions_cannot_overdraft() {
        let (controller, ledger, store, _rx, _tmp) = test_controller();

        // Drain to exactly 1 credit.
        controller
            .start_session("user-a", "market-m", models(&["m/a", "m/b", "m/c", "m/d"]))
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..2 {
            let controller = controller.clone();
            handles.push(std::thread::spawn(move || {
                controller.start_session("user-a", "market-m", models(&["m/e"]))
            }));
        }
        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let admitted = outcomes.iter().filter(|r| r.is_ok()).count();
        assert_eq!(admitted, 1, "exactly one admission wins the last credit");
        assert!(outcomes
            .iter()
            .any(|r| matches!(r, Err(AdmissionError::InsufficientCredits { .. }))));

        assert_eq!(ledger.balance("user-a").unwrap().balance, 0);
        assert_eq!(store.list_for_user("user-a", 10).unwrap().len(), 2);
    }
}
