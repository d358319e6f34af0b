//! Session handles: the registry's view of one supervised connection.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

use botnest_protocol::PairingArtifact;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// The deployment's main account, started at boot, reconnects forever.
    Primary,
    /// A user-initiated secondary session with bounded reconnects.
    Sub,
}

/// Lifecycle state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unauthenticated,
    Pairing,
    Open,
    Recovering,
    Terminated,
}

/// Requests a handle can place with its supervisor.
#[derive(Debug)]
pub enum SupervisorCommand {
    Send {
        chat_id: String,
        text: String,
    },
    /// Ask for the current pairing artifact. `None` means no artifact is
    /// live right now (expired or already consumed); the connector will
    /// push a fresh one.
    RequestPairing {
        reply: oneshot::Sender<Option<PairingArtifact>>,
    },
    Shutdown,
}

#[derive(Debug, Error)]
pub enum HandleError {
    #[error("session supervisor is gone")]
    SupervisorGone,
}

/// State shared between a supervisor and every clone of its handle.
#[derive(Debug)]
pub(crate) struct HandleShared {
    pub(crate) state_tx: watch::Sender<SessionState>,
    pub(crate) retry_count: AtomicU32,
    pub(crate) last_error: std::sync::Mutex<Option<String>>,
}

/// Cheap-to-clone reference to one supervised session.
#[derive(Clone)]
pub struct SessionHandle {
    pub session_id: String,
    pub kind: SessionKind,
    pub credential_path: PathBuf,
    shared: Arc<HandleShared>,
    state_rx: watch::Receiver<SessionState>,
    commands: mpsc::Sender<SupervisorCommand>,
}

impl SessionHandle {
    pub(crate) fn new(
        session_id: String,
        kind: SessionKind,
        credential_path: PathBuf,
        commands: mpsc::Sender<SupervisorCommand>,
    ) -> (Self, Arc<HandleShared>) {
        let (state_tx, state_rx) = watch::channel(SessionState::Unauthenticated);
        let shared = Arc::new(HandleShared {
            state_tx,
            retry_count: AtomicU32::new(0),
            last_error: std::sync::Mutex::new(None),
        });
        let handle = Self {
            session_id,
            kind,
            credential_path,
            shared: Arc::clone(&shared),
            state_rx,
            commands,
        };
        (handle, shared)
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// A receiver for awaiting state transitions.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    pub fn retry_count(&self) -> u32 {
        self.shared.retry_count.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<String> {
        match self.shared.last_error.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Send a text message through this session's connection.
    pub async fn send_text(
        &self,
        chat_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<(), HandleError> {
        self.commands
            .send(SupervisorCommand::Send {
                chat_id: chat_id.into(),
                text: text.into(),
            })
            .await
            .map_err(|_| HandleError::SupervisorGone)
    }

    /// Fetch the live pairing artifact, if one is within its validity
    /// window.
    pub async fn request_pairing(&self) -> Result<Option<PairingArtifact>, HandleError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SupervisorCommand::RequestPairing { reply })
            .await
            .map_err(|_| HandleError::SupervisorGone)?;
        rx.await.map_err(|_| HandleError::SupervisorGone)
    }

    /// Ask the supervisor to close the connection and terminate.
    pub async fn shutdown(&self) -> Result<(), HandleError> {
        self.commands
            .send(SupervisorCommand::Shutdown)
            .await
            .map_err(|_| HandleError::SupervisorGone)
    }
}

impl HandleShared {
    pub(crate) fn set_state(&self, state: SessionState) {
        // send_replace never fails even with no live receivers
        self.state_tx.send_replace(state);
    }

    pub(crate) fn set_retries(&self, count: u32) {
        self.retry_count.store(count, Ordering::Release);
    }

    pub(crate) fn record_error(&self, error: impl Into<String>) {
        match self.last_error.lock() {
            Ok(mut guard) => *guard = Some(error.into()),
            Err(poisoned) => *poisoned.into_inner() = Some(error.into()),
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}
