//! Session registry: owns every live supervisor.
//!
//! The registry spawns the primary session at startup, creates sub sessions
//! on demand, and runs the periodic reconcile sweep that re-activates
//! on-disk session directories after a restart. Creation is serialized per
//! session id so a command-driven start and a sweep never race into two
//! supervisors for the same directory.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::credentials::{CredentialBundle, CredentialError, CredentialHealth};
use crate::sync::{KeyedLocks, LockKey};

use super::handle::{SessionHandle, SessionKind, SessionState};
use super::supervisor::{SessionSupervisor, SupervisorContext};

/// Directory name and registry key of the primary session.
pub const PRIMARY_SESSION_ID: &str = "primary";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session '{0}' is already active")]
    AlreadyActive(String),

    #[error("session id '{0}' is reserved for the primary session")]
    ReservedId(String),

    #[error(transparent)]
    Credential(#[from] CredentialError),
}

/// Outcome of one reconcile sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Sessions a supervisor was spawned for.
    pub started: Vec<String>,
    /// Directories deleted (dead credentials or activation bound passed).
    pub purged: Vec<String>,
    /// Directories left alone because a live supervisor already owns them.
    pub skipped: Vec<String>,
    /// Session id paired with the error that kept it from starting.
    pub errors: Vec<(String, String)>,
}

pub struct SessionRegistry {
    ctx: SupervisorContext,
    handles: DashMap<String, SessionHandle>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    creation_locks: KeyedLocks,
    shutdown_tx: watch::Sender<bool>,
}

impl SessionRegistry {
    pub fn new(ctx: SupervisorContext) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            ctx,
            handles: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
            creation_locks: KeyedLocks::new(),
            shutdown_tx,
        })
    }

    /// Spawn the primary session. Idempotent per process: a second call
    /// while the first supervisor is alive returns `AlreadyActive`.
    pub async fn start_primary(&self) -> Result<SessionHandle, RegistryError> {
        let _guard = self
            .creation_locks
            .acquire(LockKey::Session(PRIMARY_SESSION_ID))
            .await;

        if self.is_live(PRIMARY_SESSION_ID) {
            return Err(RegistryError::AlreadyActive(PRIMARY_SESSION_ID.into()));
        }
        Ok(self.spawn_locked(PRIMARY_SESSION_ID, SessionKind::Primary).await)
    }

    /// Spawn a sub session, optionally seeding it with transferred
    /// credentials. Without credentials the session starts unauthenticated
    /// and emits a pairing artifact.
    pub async fn start_sub(
        &self,
        session_id: &str,
        credentials: Option<CredentialBundle>,
    ) -> Result<SessionHandle, RegistryError> {
        if session_id == PRIMARY_SESSION_ID {
            return Err(RegistryError::ReservedId(session_id.into()));
        }

        let _guard = self.creation_locks.acquire(LockKey::Session(session_id)).await;

        if self.is_live(session_id) {
            return Err(RegistryError::AlreadyActive(session_id.into()));
        }

        if let Some(bundle) = credentials {
            self.ctx.credentials.save(session_id, &bundle)?;
        }

        info!(session_id = %session_id, "Starting sub session");
        Ok(self.spawn_locked(session_id, SessionKind::Sub).await)
    }

    pub fn get(&self, session_id: &str) -> Option<SessionHandle> {
        self.handles.get(session_id).map(|h| h.value().clone())
    }

    /// Handles of every session whose supervisor has not terminated.
    pub fn list_active(&self) -> Vec<SessionHandle> {
        self.handles
            .iter()
            .filter(|entry| entry.value().state() != SessionState::Terminated)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Walk the on-disk session directories and bring reality in line:
    /// spawn supervisors for valid or restorable credentials, purge
    /// directories that are dead or past the activation bound, and leave
    /// live sessions untouched.
    pub async fn reconcile(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let ids = match self.ctx.credentials.list_session_ids() {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "Cannot list session directories");
                return report;
            }
        };

        let max_failures = self.ctx.config.session.max_activation_attempts;

        for session_id in ids {
            if session_id == PRIMARY_SESSION_ID {
                continue;
            }

            let _guard = self.creation_locks.acquire(LockKey::Session(&session_id)).await;

            if self.is_live(&session_id) {
                report.skipped.push(session_id);
                continue;
            }

            if self.ctx.activation.failures(&session_id) >= max_failures {
                info!(
                    session_id = %session_id,
                    failures = max_failures,
                    "Activation bound reached, purging session"
                );
                match self.ctx.credentials.purge(&session_id) {
                    Ok(()) => {
                        self.ctx.activation.reset(&session_id);
                        report.purged.push(session_id);
                    }
                    Err(e) => report.errors.push((session_id, e.to_string())),
                }
                continue;
            }

            match self.ctx.credentials.check(&session_id) {
                Ok(CredentialHealth::Valid(_)) => {
                    self.spawn_locked(&session_id, SessionKind::Sub).await;
                    report.started.push(session_id);
                }
                Ok(CredentialHealth::Restored(_)) => {
                    info!(session_id = %session_id, "Credentials restored from backup");
                    self.spawn_locked(&session_id, SessionKind::Sub).await;
                    report.started.push(session_id);
                }
                Ok(CredentialHealth::Purged) => {
                    info!(session_id = %session_id, "Unrecoverable credentials purged");
                    report.purged.push(session_id);
                }
                Err(e) => {
                    error!(session_id = %session_id, error = %e, "Reconcile failed");
                    report.errors.push((session_id, e.to_string()));
                }
            }
        }

        if !report.started.is_empty() || !report.purged.is_empty() {
            info!(
                started = report.started.len(),
                purged = report.purged.len(),
                skipped = report.skipped.len(),
                "Reconcile sweep complete"
            );
        }
        report
    }

    /// Run `reconcile` on a fixed interval until shutdown.
    pub fn spawn_reconcile_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so startup and the
            // first sweep do not overlap.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.reconcile().await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("Reconcile task stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Signal every supervisor to stop and wait for their tasks.
    pub async fn shutdown(&self) {
        info!("Shutting down session registry");
        let _ = self.shutdown_tx.send(true);
        let tasks = {
            let mut guard = self.tasks.lock().await;
            std::mem::take(&mut *guard)
        };
        join_all(tasks).await;
        info!("All supervisors stopped");
    }

    fn is_live(&self, session_id: &str) -> bool {
        self.handles
            .get(session_id)
            .map(|h| h.state() != SessionState::Terminated)
            .unwrap_or(false)
    }

    async fn spawn_locked(&self, session_id: &str, kind: SessionKind) -> SessionHandle {
        let shutdown_rx = self.shutdown_tx.subscribe();
        let (handle, task) = SessionSupervisor::spawn(
            self.ctx.clone(),
            session_id.to_string(),
            kind,
            shutdown_rx,
        );
        self.handles.insert(session_id.to_string(), handle.clone());
        self.tasks.lock().await.push(task);
        handle
    }
}
