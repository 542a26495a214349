//! Dispatcher
//! Mission: Drive admitted sessions to a terminal state from a worker pool
//!
//! Workers consume the dispatch queue and fan model calls out concurrently
//! under a semaphore cap. One model failing or timing out never aborts its
//! siblings; FINISHED means every selected model was attempted.

use crate::models::{ModelOutcome, PredictionSession, SessionStatus};
use crate::provider::{MarketContext, ModelProvider};
use crate::session::progress::TransitionOutcome;
use crate::session::store::SessionStore;
use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// One request to execute a session, with the reason it was enqueued
/// ("user" at admission, "stuck" or an operator note for recovery).
#[derive(Debug, Clone)]
pub struct DispatchJob {
    pub session_id: String,
    pub reason: String,
}

pub type DispatchReceiver = Arc<Mutex<mpsc::UnboundedReceiver<DispatchJob>>>;

/// Producer half of the dispatch queue, shared by admission and recovery.
#[derive(Clone)]
pub struct DispatchQueue {
    tx: mpsc::UnboundedSender<DispatchJob>,
}

impl DispatchQueue {
    pub fn new() -> (Self, DispatchReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, Arc::new(Mutex::new(rx)))
    }

    pub fn enqueue(&self, session_id: &str, reason: &str) -> Result<()> {
        self.tx
            .send(DispatchJob {
                session_id: session_id.to_string(),
                reason: reason.to_string(),
            })
            .map_err(|_| anyhow!("dispatch queue closed"))
    }
}

pub struct Dispatcher {
    store: Arc<SessionStore>,
    provider: Arc<dyn ModelProvider>,
    concurrency: usize,
    call_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        store: Arc<SessionStore>,
        provider: Arc<dyn ModelProvider>,
        concurrency: usize,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            provider,
            concurrency: concurrency.max(1),
            call_timeout,
        }
    }

    /// Start the worker pool. Workers take turns waiting on the shared
    /// receiver; the lock is released before a job executes, so sessions
    /// run in parallel across workers.
    pub fn spawn_workers(self: &Arc<Self>, workers: usize, rx: DispatchReceiver) {
        for worker_id in 0..workers.max(1) {
            let dispatcher = self.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                info!(worker_id, "🛠️  Dispatch worker started");
                loop {
                    let job = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(job) = job else {
                        info!(worker_id, "Dispatch queue closed, worker exiting");
                        break;
                    };

                    info!(
                        worker_id,
                        session_id = %job.session_id,
                        reason = %job.reason,
                        "⚙️  Dispatching session"
                    );
                    if let Err(e) = dispatcher.execute(&job.session_id).await {
                        error!(session_id = %job.session_id, "Dispatch failed: {e:#}");
                    }
                }
            });
        }
    }

    /// Execute one session to a terminal state. Idempotent: terminal
    /// sessions are skipped and models with recorded outcomes are not
    /// re-invoked, so recovery re-dispatch is always safe.
    pub async fn execute(&self, session_id: &str) -> Result<()> {
        let Some(session) = self.store.get(session_id)? else {
            warn!(session_id, "Dispatch job for unknown session, dropping");
            return Ok(());
        };
        if session.status.is_terminal() {
            debug!(session_id, status = session.status.as_str(), "Session already terminal");
            return Ok(());
        }

        let run = self.run_session(session).await;
        if let Err(e) = &run {
            // Infrastructure failure: park the session in ERROR so viewers
            // stop waiting. Best effort since the store itself may be down.
            let _ = self
                .store
                .mark_error(session_id, &format!("dispatch failed: {e:#}"));
        }
        run
    }

    async fn run_session(&self, session: PredictionSession) -> Result<()> {
        let id = session.id.clone();
        let mut status = session.status;

        if matches!(status, SessionStatus::Initializing | SessionStatus::Queued) {
            match self.store.transition(
                &id,
                SessionStatus::Researching,
                Some("Gathering market context"),
            )? {
                TransitionOutcome::Applied => status = SessionStatus::Researching,
                outcome => {
                    debug!(session_id = %id, ?outcome, "Lost pickup race, dropping job");
                    return Ok(());
                }
            }
        }

        let market = MarketContext::new(session.market_id.clone());

        if status == SessionStatus::Researching {
            match self
                .store
                .transition(&id, SessionStatus::Generating, Some("Querying models"))?
            {
                TransitionOutcome::Applied => {}
                outcome => {
                    debug!(session_id = %id, ?outcome, "Generating transition rejected");
                    return Ok(());
                }
            }
        }

        // Recovery re-dispatch retries only models without an outcome.
        let pending = session.outstanding_models();
        if !pending.is_empty() {
            self.invoke_models(&id, &market, pending).await?;
        }

        // A panicked call task records nothing, so re-read before finishing.
        // FINISHED is terminal and would strand any model still outstanding;
        // leaving the session in GENERATING keeps it visible to recovery.
        let Some(current) = self.store.get(&id)? else {
            warn!(session_id = %id, "Session deleted mid-dispatch");
            return Ok(());
        };
        let outstanding = current.outstanding_models();
        if !outstanding.is_empty() {
            warn!(
                session_id = %id,
                missing = outstanding.len(),
                "Outcomes missing after dispatch, leaving session for recovery"
            );
            return Ok(());
        }

        match self.store.transition(&id, SessionStatus::Finished, None)? {
            TransitionOutcome::Applied => {
                let successes = current.results.values().filter(|o| o.succeeded).count();
                if successes == 0 {
                    // Policy: attempts were made, so credits are not refunded.
                    warn!(session_id = %id, "⚠️  Session finished with zero successful models");
                } else {
                    info!(session_id = %id, successes, "✅ Session finished");
                }
            }
            outcome => debug!(session_id = %id, ?outcome, "Finish transition rejected"),
        }

        Ok(())
    }

    async fn invoke_models(
        &self,
        session_id: &str,
        market: &MarketContext,
        pending: Vec<String>,
    ) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut join_set = JoinSet::new();

        for model in pending {
            let provider = self.provider.clone();
            let market = market.clone();
            let semaphore = semaphore.clone();
            let call_timeout = self.call_timeout;

            join_set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return ModelOutcome::failure(model, "dispatcher shutting down"),
                };

                match tokio::time::timeout(call_timeout, provider.invoke(&model, &market)).await {
                    Ok(Ok(payload)) => ModelOutcome::success(model, payload),
                    Ok(Err(e)) => ModelOutcome::failure(model, format!("{e:#}")),
                    Err(_) => ModelOutcome::failure(
                        model,
                        format!("timed out after {}s", call_timeout.as_secs_f64()),
                    ),
                }
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(outcome) => {
                    if outcome.succeeded {
                        info!(session_id, model = %outcome.model_id, "🔮 Model prediction recorded");
                    } else {
                        warn!(
                            session_id,
                            model = %outcome.model_id,
                            error = outcome.error_message.as_deref().unwrap_or("?"),
                            "Model call failed"
                        );
                    }
                    self.store.append_result(session_id, &outcome)?;
                }
                // The outcome is lost but the model stays outstanding, so a
                // later recovery pass retries it.
                Err(e) => warn!(session_id, "Model task panicked: {e}"),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use serde_json::json;
    use std::collections::HashSet;
    use tempfile::NamedTempFile;

    struct ScriptedProvider {
        failing: HashSet<String>,
        panicking: HashSet<String>,
        delay: Option<Duration>,
        calls: SyncMutex<Vec<String>>,
    }

    impl ScriptedProvider {
        fn new(failing: &[&str]) -> Self {
            Self {
                failing: failing.iter().map(|s| s.to_string()).collect(),
                panicking: HashSet::new(),
                delay: None,
                calls: SyncMutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl ModelProvider for ScriptedProvider {
        async fn invoke(
            &self,
            model_id: &str,
            _market: &MarketContext,
        ) -> Result<serde_json::Value> {
            self.calls.lock().push(model_id.to_string());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.panicking.contains(model_id) {
                panic!("scripted panic for {}", model_id);
            }
            if self.failing.contains(model_id) {
                return Err(anyhow!("provider exploded for {}", model_id));
            }
            Ok(json!({ "model": model_id, "prediction": { "probability": 0.5 } }))
        }
    }

    fn test_setup(
        provider: ScriptedProvider,
        timeout: Duration,
    ) -> (Arc<SessionStore>, Arc<ScriptedProvider>, Dispatcher, NamedTempFile) {
        let temp = NamedTempFile::new().unwrap();
        let store = Arc::new(SessionStore::new(temp.path().to_str().unwrap()).unwrap());
        let provider = Arc::new(provider);
        let dispatcher = Dispatcher::new(store.clone(), provider.clone(), 4, timeout);
        (store, provider, dispatcher, temp)
    }

    fn queued_session(store: &SessionStore, models: &[&str]) -> PredictionSession {
        let session = PredictionSession::new(
            "user-1",
            "market-x",
            models.iter().map(|m| m.to_string()).collect(),
        );
        store.create(&session).unwrap();
        store
            .transition(&session.id, SessionStatus::Queued, None)
            .unwrap();
        session
    }

    #[tokio::test]
    async fn one_failing_model_still_reaches_finished() {
        let (store, _provider, dispatcher, _temp) =
            test_setup(ScriptedProvider::new(&["m/b"]), Duration::from_secs(5));
        let session = queued_session(&store, &["m/a", "m/b", "m/c"]);

        dispatcher.execute(&session.id).await.unwrap();

        let loaded = store.get(&session.id).unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Finished);
        assert!(loaded.completed_at.is_some());
        assert_eq!(loaded.results.len(), 3);

        let successes = loaded.results.values().filter(|o| o.succeeded).count();
        assert_eq!(successes, 2);
        assert!(loaded.results["m/b"]
            .error_message
            .as_deref()
            .unwrap()
            .contains("exploded"));
    }

    #[tokio::test]
    async fn all_models_failing_still_finishes() {
        let (store, _provider, dispatcher, _temp) = test_setup(
            ScriptedProvider::new(&["m/a", "m/b"]),
            Duration::from_secs(5),
        );
        let session = queued_session(&store, &["m/a", "m/b"]);

        dispatcher.execute(&session.id).await.unwrap();

        let loaded = store.get(&session.id).unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Finished);
        assert_eq!(loaded.results.values().filter(|o| o.succeeded).count(), 0);
    }

    #[tokio::test]
    async fn recovery_redispatch_skips_recorded_models() {
        let (store, provider, dispatcher, _temp) =
            test_setup(ScriptedProvider::new(&[]), Duration::from_secs(5));
        let session = queued_session(&store, &["m/a", "m/b"]);
        store
            .append_result(
                &session.id,
                &ModelOutcome::success("m/a", json!({"probability": 0.9})),
            )
            .unwrap();

        dispatcher.execute(&session.id).await.unwrap();

        assert_eq!(provider.calls(), vec!["m/b"]);
        let loaded = store.get(&session.id).unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Finished);
        assert_eq!(loaded.results.len(), 2);
        // The pre-recorded outcome survives untouched.
        assert_eq!(loaded.results["m/a"].payload, Some(json!({"probability": 0.9})));
    }

    #[tokio::test]
    async fn terminal_session_is_a_noop() {
        let (store, provider, dispatcher, _temp) =
            test_setup(ScriptedProvider::new(&[]), Duration::from_secs(5));
        let session = queued_session(&store, &["m/a"]);
        store.mark_error(&session.id, "operator killed it").unwrap();

        dispatcher.execute(&session.id).await.unwrap();

        assert!(provider.calls().is_empty());
        let loaded = store.get(&session.id).unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Error);
    }

    #[tokio::test]
    async fn slow_model_times_out_as_failed_outcome() {
        let mut provider = ScriptedProvider::new(&[]);
        provider.delay = Some(Duration::from_secs(30));
        let (store, _provider, dispatcher, _temp) =
            test_setup(provider, Duration::from_millis(50));
        let session = queued_session(&store, &["m/a"]);

        dispatcher.execute(&session.id).await.unwrap();

        let loaded = store.get(&session.id).unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Finished);
        let outcome = &loaded.results["m/a"];
        assert!(!outcome.succeeded);
        assert!(outcome.error_message.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn panicked_model_call_leaves_session_recoverable() {
        let mut provider = ScriptedProvider::new(&[]);
        provider.panicking.insert("m/a".to_string());
        let (store, _provider, dispatcher, _temp) =
            test_setup(provider, Duration::from_secs(5));
        let session = queued_session(&store, &["m/a", "m/b"]);

        dispatcher.execute(&session.id).await.unwrap();

        // The panicked model has no outcome, so the session must not finish.
        let loaded = store.get(&session.id).unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Generating);
        assert_eq!(loaded.results.len(), 1);
        assert!(loaded.results.contains_key("m/b"));
        assert_eq!(loaded.outstanding_models(), vec!["m/a"]);

        store.backdate_created_at(&session.id, 900);
        assert_eq!(store.find_stale(300).unwrap(), vec![session.id.clone()]);

        // Recovery re-dispatch with a healthy provider completes the session.
        let healthy = Arc::new(ScriptedProvider::new(&[]));
        let retry = Dispatcher::new(store.clone(), healthy.clone(), 4, Duration::from_secs(5));
        retry.execute(&session.id).await.unwrap();

        let loaded = store.get(&session.id).unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Finished);
        assert_eq!(loaded.results.len(), 2);
        assert_eq!(healthy.calls(), vec!["m/a"]);
    }

    #[tokio::test]
    async fn unknown_session_job_is_dropped() {
        let (_store, provider, dispatcher, _temp) =
            test_setup(ScriptedProvider::new(&[]), Duration::from_secs(5));

        dispatcher.execute("no-such-session").await.unwrap();
        assert!(provider.calls().is_empty());
    }
}
