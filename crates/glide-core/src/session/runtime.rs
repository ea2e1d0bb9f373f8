//! Multi-session runtime.
//!
//! Owns one worker task per rental session and the handles to reach it:
//! the signal sender and the status watch. Terminal sessions stay in the
//! map so queries keep working after a ride ends.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::GlideConfig;
use crate::gateway::MeteringGateway;

use super::journal::{CompletionJournal, MemoryJournal};
use super::machine::{RentalRequest, SessionError, SessionMachine};
use super::projection::StatusReader;
use super::signal::Signal;
use super::state::{SessionId, StatusSnapshot};

/// Failures at the runtime surface.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The device already has a session that has not reached a terminal
    /// phase.
    #[error("device {device_id} already has an active session")]
    AlreadyStarted {
        /// Device with the conflicting session.
        device_id: String,
    },

    /// No session with the given id, active or retained.
    #[error("no session {session_id}")]
    SessionNotFound {
        /// The unknown id.
        session_id: String,
    },

    /// The active-session limit is reached.
    #[error("active session limit reached ({limit})")]
    CapacityExceeded {
        /// The configured limit.
        limit: usize,
    },

    /// The session itself failed.
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Debug)]
struct SessionEntry {
    device_id: String,
    tx: mpsc::UnboundedSender<Signal>,
    reader: StatusReader,
    task: Mutex<Option<JoinHandle<Result<StatusSnapshot, SessionError>>>>,
}

/// Spawns and tracks session workers.
#[derive(Debug)]
pub struct SessionRuntime {
    config: GlideConfig,
    gateway: Arc<dyn MeteringGateway>,
    sessions: RwLock<HashMap<SessionId, Arc<SessionEntry>>>,
}

impl SessionRuntime {
    /// Create a runtime over the given gateway.
    #[must_use]
    pub fn new(config: GlideConfig, gateway: Arc<dyn MeteringGateway>) -> Self {
        Self {
            config,
            gateway,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Start a session with an in-memory journal.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::AlreadyStarted`] when the device already
    /// has an active session and [`RuntimeError::CapacityExceeded`] at
    /// the active-session limit.
    pub async fn start_session(&self, request: RentalRequest) -> Result<SessionId, RuntimeError> {
        self.start_session_with_journal(request, Box::new(MemoryJournal::new()))
            .await
    }

    /// Start a session journaling into `journal`.
    ///
    /// The journal must be fresh; recovering a journaled session goes
    /// through [`SessionRuntime::resume_session`].
    ///
    /// # Errors
    ///
    /// Same admission errors as [`SessionRuntime::start_session`].
    pub async fn start_session_with_journal(
        &self,
        request: RentalRequest,
        journal: Box<dyn CompletionJournal>,
    ) -> Result<SessionId, RuntimeError> {
        let device_id = request.device_id.clone();
        let mut sessions = self.sessions.write().await;
        self.check_admission(&sessions, &device_id)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (machine, reader) = SessionMachine::start(
            request,
            &self.config,
            Arc::clone(&self.gateway),
            journal,
            rx,
        );
        let session_id = machine.session_id().clone();
        let task = tokio::spawn(machine.run());

        sessions.insert(
            session_id.clone(),
            Arc::new(SessionEntry {
                device_id: device_id.clone(),
                tx,
                reader,
                task: Mutex::new(Some(task)),
            }),
        );
        info!(session = %session_id, device = %device_id, "session started");
        Ok(session_id)
    }

    /// Resume a session from a journal written by a previous run.
    ///
    /// The session keeps its original id. A journal that already ends in
    /// a terminal phase is admitted without counting against the limit;
    /// its worker republishes the terminal snapshot and finishes.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotResumable`] (wrapped) when the journal has no
    /// start record, plus the usual admission errors.
    pub async fn resume_session(
        &self,
        journal: Box<dyn CompletionJournal>,
    ) -> Result<SessionId, RuntimeError> {
        let mut sessions = self.sessions.write().await;

        let (tx, rx) = mpsc::unbounded_channel();
        let (machine, reader) =
            SessionMachine::resume(&self.config, Arc::clone(&self.gateway), journal, rx)?;
        let snapshot = reader.snapshot();
        if !snapshot.phase.is_terminal() {
            self.check_admission(&sessions, &snapshot.device_id)?;
        }

        let session_id = machine.session_id().clone();
        let task = tokio::spawn(machine.run());

        sessions.insert(
            session_id.clone(),
            Arc::new(SessionEntry {
                device_id: snapshot.device_id,
                tx,
                reader,
                task: Mutex::new(Some(task)),
            }),
        );
        info!(session = %session_id, phase = %snapshot.phase, "session resumed");
        Ok(session_id)
    }

    /// Enqueue one distance increment.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::SessionNotFound`] for an unknown id. Signals to a
    /// finished session are dropped, not errors.
    pub async fn signal_distance(&self, session_id: &SessionId) -> Result<(), RuntimeError> {
        self.send(session_id, Signal::Distance).await
    }

    /// Request the session end after queued work drains.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::SessionNotFound`] for an unknown id.
    pub async fn signal_end(&self, session_id: &SessionId) -> Result<(), RuntimeError> {
        self.send(session_id, Signal::End).await
    }

    /// Approve continued consumption past the threshold.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::SessionNotFound`] for an unknown id.
    pub async fn signal_approve(&self, session_id: &SessionId) -> Result<(), RuntimeError> {
        self.send(session_id, Signal::Approve).await
    }

    /// Current token total, served at any time including after
    /// termination.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::SessionNotFound`] for an unknown id.
    pub async fn query_total_tokens(&self, session_id: &SessionId) -> Result<u64, RuntimeError> {
        Ok(self.entry(session_id).await?.reader.total_tokens())
    }

    /// Full status snapshot, served at any time including after
    /// termination.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::SessionNotFound`] for an unknown id.
    pub async fn query_status(
        &self,
        session_id: &SessionId,
    ) -> Result<StatusSnapshot, RuntimeError> {
        Ok(self.entry(session_id).await?.reader.snapshot())
    }

    /// Wait for the session to reach a terminal phase.
    ///
    /// The first caller joins the worker and gets its error on `FAILED`;
    /// later callers fall back to the retained terminal snapshot.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::SessionNotFound`] for an unknown id, or the
    /// session's own error.
    pub async fn await_completion(
        &self,
        session_id: &SessionId,
    ) -> Result<StatusSnapshot, RuntimeError> {
        let entry = self.entry(session_id).await?;
        let task = entry.task.lock().await.take();
        if let Some(task) = task {
            return match task.await {
                Ok(result) => Ok(result?),
                Err(join_err) => Err(RuntimeError::Session(SessionError::Internal {
                    reason: format!("session worker panicked: {join_err}"),
                })),
            };
        }

        let mut reader = entry.reader.clone();
        reader
            .wait_terminal()
            .await
            .ok_or_else(|| {
                RuntimeError::Session(SessionError::Internal {
                    reason: "session worker vanished before a terminal phase".to_string(),
                })
            })
    }

    /// Sessions not yet in a terminal phase.
    pub async fn active_sessions(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|entry| !entry.reader.phase().is_terminal())
            .count()
    }

    async fn send(&self, session_id: &SessionId, signal: Signal) -> Result<(), RuntimeError> {
        let entry = self.entry(session_id).await?;
        if entry.reader.phase().is_terminal() || entry.tx.send(signal).is_err() {
            debug!(session = %session_id, signal = %signal, "signal dropped: session finished");
        }
        Ok(())
    }

    async fn entry(&self, session_id: &SessionId) -> Result<Arc<SessionEntry>, RuntimeError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| RuntimeError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    fn check_admission(
        &self,
        sessions: &HashMap<SessionId, Arc<SessionEntry>>,
        device_id: &str,
    ) -> Result<(), RuntimeError> {
        let limit = self.config.session.max_active_sessions;
        let mut active = 0usize;
        for entry in sessions.values() {
            if entry.reader.phase().is_terminal() {
                continue;
            }
            if entry.device_id == device_id {
                return Err(RuntimeError::AlreadyStarted {
                    device_id: device_id.to_string(),
                });
            }
            active += 1;
        }
        if active >= limit {
            return Err(RuntimeError::CapacityExceeded { limit });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::gateway::SimulatedGateway;
    use crate::session::Phase;

    use super::*;

    fn runtime_with(customers: &[&str]) -> SessionRuntime {
        let mut gateway = SimulatedGateway::new();
        for (index, email) in customers.iter().enumerate() {
            gateway = gateway.with_customer(*email, format!("cus_{index}"));
        }
        SessionRuntime::new(GlideConfig::default(), Arc::new(gateway))
    }

    fn request(device: &str, email: &str) -> RentalRequest {
        RentalRequest {
            device_id: device.to_string(),
            email: email.to_string(),
            pricing: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_device_rejected_until_terminal() {
        let runtime = runtime_with(&["rider@example.com"]);
        let id = runtime
            .start_session(request("1234", "rider@example.com"))
            .await
            .unwrap();

        let err = runtime
            .start_session(request("1234", "rider@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::AlreadyStarted { .. }));

        runtime.signal_end(&id).await.unwrap();
        let snapshot = runtime.await_completion(&id).await.unwrap();
        assert_eq!(snapshot.phase, Phase::Ended);

        // The device frees up once its session is terminal
        let second = runtime
            .start_session(request("1234", "rider@example.com"))
            .await
            .unwrap();
        assert_ne!(second, id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_session_is_an_error() {
        let runtime = runtime_with(&[]);
        let ghost = SessionId::generate("99");

        assert!(matches!(
            runtime.signal_end(&ghost).await,
            Err(RuntimeError::SessionNotFound { .. })
        ));
        assert!(matches!(
            runtime.query_status(&ghost).await,
            Err(RuntimeError::SessionNotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queries_and_signals_after_termination() {
        let runtime = runtime_with(&["rider@example.com"]);
        let id = runtime
            .start_session(request("1234", "rider@example.com"))
            .await
            .unwrap();
        runtime.signal_end(&id).await.unwrap();
        runtime.await_completion(&id).await.unwrap();

        // Queries keep serving the retained terminal snapshot
        assert_eq!(runtime.query_total_tokens(&id).await.unwrap(), 10);
        let snapshot = runtime.query_status(&id).await.unwrap();
        assert_eq!(snapshot.phase, Phase::Ended);

        // Late signals are dropped, not errors
        runtime.signal_distance(&id).await.unwrap();
        assert_eq!(runtime.query_total_tokens(&id).await.unwrap(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_session_surfaces_error_once_then_snapshot() {
        let runtime = runtime_with(&[]);
        let id = runtime
            .start_session(request("1234", "nobody@example.com"))
            .await
            .unwrap();

        let err = runtime.await_completion(&id).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Session(_)));

        // Second await falls back to the retained snapshot
        let snapshot = runtime.await_completion(&id).await.unwrap();
        assert_eq!(snapshot.phase, Phase::Failed);
        assert!(snapshot.last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_limit() {
        let gateway = SimulatedGateway::new()
            .with_customer("a@example.com", "cus_a")
            .with_customer("b@example.com", "cus_b")
            .with_customer("c@example.com", "cus_c");
        let mut config = GlideConfig::default();
        config.session.max_active_sessions = 2;
        let runtime = SessionRuntime::new(config, Arc::new(gateway));

        runtime
            .start_session(request("1", "a@example.com"))
            .await
            .unwrap();
        runtime
            .start_session(request("2", "b@example.com"))
            .await
            .unwrap();
        assert_eq!(runtime.active_sessions().await, 2);

        let err = runtime
            .start_session(request("3", "c@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::CapacityExceeded { limit: 2 }));
    }
}
