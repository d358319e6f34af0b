//! Session supervisor: the lifecycle state machine for one connection.
//!
//! A supervisor owns exactly one connection at a time. It moves through
//! `Unauthenticated → Pairing → Open → Recovering → Terminated`, feeding
//! inbound messages to the dispatch pipeline sequentially, persisting
//! credential rotations, and classifying every disconnect into a recovery
//! action. Sub sessions reconnect with exponential backoff up to a bound;
//! the primary reconnects forever with the same backoff floor.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use botnest_protocol::{
    ConnectOptions, ConnectorCommand, ConnectorEvent, DisconnectReason, PairingArtifact,
};

use crate::config::Config;
use crate::credentials::{CredentialBundle, CredentialStore};
use crate::dispatch::{DispatchPipeline, OwnerNotice};

use super::connector::{Connection, Connector};
use super::handle::{
    HandleShared, SessionHandle, SessionKind, SessionState, SupervisorCommand,
};

/// Upper bound on a single reconnect delay.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Capacity of the handle-to-supervisor command channel.
const COMMAND_CAPACITY: usize = 32;

// ============================================================================
// Recovery classification
// ============================================================================

/// What the supervisor does about a classified disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Reconnect without delay (timeouts).
    ReconnectNow,
    /// Reconnect after exponential backoff (transient and unknown causes).
    ReconnectBackoff,
    /// Server asked for a fresh socket; recreate it immediately without
    /// counting an attempt. In-memory state survives.
    RestartSocket,
    /// Another device took the session. Notify the owner once, never
    /// auto-reconnect.
    NotifyReplaced,
    /// Stored credentials were rejected. Delete the session directory;
    /// coming back requires manual re-pairing.
    PurgeAndRepair,
    /// Server terminated the account. Purge and stop.
    PurgeAndTerminate,
    /// Stop without touching the on-disk directory.
    Terminate,
}

/// The classification table from disconnect reason to recovery action.
pub fn recovery_action(reason: DisconnectReason) -> RecoveryAction {
    match reason {
        DisconnectReason::TimedOut => RecoveryAction::ReconnectNow,
        DisconnectReason::ConnectionLost | DisconnectReason::Unknown => {
            RecoveryAction::ReconnectBackoff
        }
        DisconnectReason::RestartRequired => RecoveryAction::RestartSocket,
        DisconnectReason::SessionReplaced => RecoveryAction::NotifyReplaced,
        DisconnectReason::CredentialsRejected | DisconnectReason::BadSession => {
            RecoveryAction::PurgeAndRepair
        }
        DisconnectReason::LoggedOut => RecoveryAction::PurgeAndTerminate,
        DisconnectReason::ConnectionClosed => RecoveryAction::Terminate,
    }
}

/// Delay before the n-th reconnect attempt: `base * 2^attempt`, capped.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = attempt.min(8);
    base.saturating_mul(1u32 << exp).min(MAX_BACKOFF)
}

fn attempts_exhausted(kind: SessionKind, attempt: u32, max_sub_attempts: u32) -> bool {
    kind == SessionKind::Sub && attempt > max_sub_attempts
}

// ============================================================================
// Activation tracking
// ============================================================================

/// Consecutive failed activations per sub-session id, shared between
/// supervisors (which record outcomes) and the registry's reconcile sweep
/// (which purges a directory once the bound is passed). Reset on any
/// successful open.
#[derive(Clone, Default)]
pub struct ActivationTracker {
    counts: Arc<DashMap<String, u32>>,
}

impl ActivationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(&self, session_id: &str) -> u32 {
        let mut entry = self.counts.entry(session_id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn reset(&self, session_id: &str) {
        self.counts.remove(session_id);
    }

    pub fn failures(&self, session_id: &str) -> u32 {
        self.counts.get(session_id).map(|c| *c).unwrap_or(0)
    }
}

// ============================================================================
// Supervisor
// ============================================================================

/// Shared dependencies for spawning supervisors.
#[derive(Clone)]
pub struct SupervisorContext {
    pub config: Arc<Config>,
    pub connector: Arc<dyn Connector>,
    pub credentials: CredentialStore,
    pub pipeline: Arc<DispatchPipeline>,
    pub owner_notify: mpsc::Sender<OwnerNotice>,
    pub activation: ActivationTracker,
}

enum DriveEnd {
    Closed(DisconnectReason),
    Shutdown,
}

pub struct SessionSupervisor {
    ctx: SupervisorContext,
    session_id: String,
    kind: SessionKind,
    shared: Arc<HandleShared>,
    cmd_rx: mpsc::Receiver<SupervisorCommand>,
    shutdown_rx: watch::Receiver<bool>,
    /// Latest pairing artifact and when it was issued.
    pairing: Option<(PairingArtifact, Instant)>,
    opened_once: bool,
}

impl SessionSupervisor {
    /// Spawn a supervisor task for `session_id` and return its handle.
    pub fn spawn(
        ctx: SupervisorContext,
        session_id: String,
        kind: SessionKind,
        shutdown_rx: watch::Receiver<bool>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let credential_path = ctx.credentials.credential_path(&session_id);
        let (handle, shared) =
            SessionHandle::new(session_id.clone(), kind, credential_path, cmd_tx);

        let supervisor = Self {
            ctx,
            session_id,
            kind,
            shared,
            cmd_rx,
            shutdown_rx,
            pairing: None,
            opened_once: false,
        };
        let task = tokio::spawn(supervisor.run());
        (handle, task)
    }

    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            let credentials = self.load_credentials();
            if credentials.is_none() {
                self.shared.set_state(SessionState::Unauthenticated);
            }

            let options = ConnectOptions {
                browser_label: self.ctx.config.session.browser_label.clone(),
                pairing_method: self.ctx.config.session.pairing_method,
            };

            let connection = match self
                .ctx
                .connector
                .connect(&self.session_id, credentials, options)
                .await
            {
                Ok(connection) => connection,
                Err(e) => {
                    warn!(
                        session_id = %self.session_id,
                        error = %e,
                        "Failed to open connection"
                    );
                    self.shared.record_error(e.to_string());
                    if !self.pause_before_retry(&mut attempt).await {
                        break;
                    }
                    continue;
                }
            };

            match self.drive(connection).await {
                DriveEnd::Shutdown => break,
                DriveEnd::Closed(reason) => {
                    self.shared.set_state(SessionState::Recovering);
                    self.shared.record_error(format!("disconnected: {reason:?}"));
                    info!(
                        session_id = %self.session_id,
                        reason = ?reason,
                        "Session disconnected"
                    );

                    match recovery_action(reason) {
                        RecoveryAction::ReconnectNow => {
                            if !self.note_attempt(&mut attempt) {
                                break;
                            }
                        }
                        RecoveryAction::ReconnectBackoff => {
                            if !self.pause_before_retry(&mut attempt).await {
                                break;
                            }
                        }
                        RecoveryAction::RestartSocket => {}
                        RecoveryAction::NotifyReplaced => {
                            self.notify_owner(format!(
                                "Session {} was taken over by another device and will not reconnect.",
                                self.session_id
                            ))
                            .await;
                            break;
                        }
                        RecoveryAction::PurgeAndRepair => {
                            if let Err(e) = self.ctx.credentials.purge(&self.session_id) {
                                error!(
                                    session_id = %self.session_id,
                                    error = %e,
                                    "Failed to purge rejected credentials"
                                );
                            }
                            self.shared
                                .record_error("credentials rejected; re-pairing required");
                            break;
                        }
                        RecoveryAction::PurgeAndTerminate => {
                            if let Err(e) = self.ctx.credentials.purge(&self.session_id) {
                                error!(
                                    session_id = %self.session_id,
                                    error = %e,
                                    "Failed to purge terminated session"
                                );
                            }
                            break;
                        }
                        RecoveryAction::Terminate => break,
                    }
                }
            }
        }

        self.shared.set_state(SessionState::Terminated);
        if self.kind == SessionKind::Sub && !self.opened_once {
            let failures = self.ctx.activation.record_failure(&self.session_id);
            debug!(
                session_id = %self.session_id,
                failures,
                "Sub session terminated without opening"
            );
        }
        info!(session_id = %self.session_id, "Supervisor stopped");
    }

    /// Pump one connection until it closes or shutdown is requested.
    /// Message handling is sequential: one inbound message is fully
    /// dispatched before the next event is read.
    async fn drive(&mut self, mut connection: Connection) -> DriveEnd {
        loop {
            tokio::select! {
                event = connection.events.recv() => match event {
                    None => return DriveEnd::Closed(DisconnectReason::ConnectionLost),
                    Some(event) => {
                        if let Some(end) = self.handle_event(event, &connection).await {
                            return end;
                        }
                    }
                },

                cmd = self.cmd_rx.recv() => match cmd {
                    None | Some(SupervisorCommand::Shutdown) => {
                        let _ = connection.commands.send(ConnectorCommand::Shutdown).await;
                        return DriveEnd::Shutdown;
                    }
                    Some(SupervisorCommand::Send { chat_id, text }) => {
                        let send = ConnectorCommand::SendMessage { chat_id, text, reply_to: None };
                        if connection.commands.send(send).await.is_err() {
                            debug!(session_id = %self.session_id, "Connection command channel closed");
                        }
                    }
                    Some(SupervisorCommand::RequestPairing { reply }) => {
                        let _ = reply.send(self.fresh_pairing());
                    }
                },

                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        let _ = connection.commands.send(ConnectorCommand::Shutdown).await;
                        return DriveEnd::Shutdown;
                    }
                }
            }
        }
    }

    async fn handle_event(
        &mut self,
        event: ConnectorEvent,
        connection: &Connection,
    ) -> Option<DriveEnd> {
        match event {
            ConnectorEvent::Open { account_id } => {
                self.opened_once = true;
                self.pairing = None;
                self.shared.set_state(SessionState::Open);
                self.shared.set_retries(0);
                self.ctx.activation.reset(&self.session_id);
                info!(
                    session_id = %self.session_id,
                    account_id = %account_id,
                    "Session open"
                );
                self.snapshot_backup();
                None
            }
            ConnectorEvent::Pairing(artifact) => {
                self.shared.set_state(SessionState::Pairing);
                self.pairing = Some((artifact, Instant::now()));
                None
            }
            ConnectorEvent::CredentialsRotated { bundle } => {
                let bundle = CredentialBundle::new(bundle);
                if let Err(e) = self.ctx.credentials.save(&self.session_id, &bundle) {
                    error!(
                        session_id = %self.session_id,
                        error = %e,
                        "Failed to persist rotated credentials"
                    );
                } else if self.opened_once {
                    self.snapshot_backup();
                }
                None
            }
            ConnectorEvent::MessageReceived(message) => {
                self.ctx
                    .pipeline
                    .dispatch(&self.session_id, &connection.commands, *message)
                    .await;
                None
            }
            ConnectorEvent::Closed { code, message } => {
                if let Some(msg) = message {
                    self.shared.record_error(msg);
                }
                Some(DriveEnd::Closed(DisconnectReason::from_close_code(code)))
            }
        }
    }

    fn load_credentials(&self) -> Option<CredentialBundle> {
        match self.ctx.credentials.load(&self.session_id) {
            Ok(Some(bundle)) if bundle.is_valid() => Some(bundle),
            Ok(_) => None,
            Err(e) => {
                warn!(
                    session_id = %self.session_id,
                    error = %e,
                    "Unreadable credentials, connecting unauthenticated"
                );
                None
            }
        }
    }

    /// Snapshot the credentials into the backup tree once, after the
    /// first successful open.
    fn snapshot_backup(&self) {
        if self.ctx.credentials.has_backup(&self.session_id) {
            return;
        }
        match self.ctx.credentials.backup(&self.session_id) {
            Ok(path) => debug!(
                session_id = %self.session_id,
                path = %path.display(),
                "Credential backup written"
            ),
            // No primary on disk yet; the next rotation event writes one.
            Err(e) => debug!(
                session_id = %self.session_id,
                error = %e,
                "Backup deferred"
            ),
        }
    }

    /// Current pairing artifact if it is still inside its validity window.
    fn fresh_pairing(&self) -> Option<PairingArtifact> {
        let (artifact, issued) = self.pairing.as_ref()?;
        if issued.elapsed() < self.ctx.config.session.pairing_expiry() {
            Some(artifact.clone())
        } else {
            None
        }
    }

    fn note_attempt(&self, attempt: &mut u32) -> bool {
        *attempt += 1;
        self.shared.set_retries(*attempt);
        !attempts_exhausted(self.kind, *attempt, self.ctx.config.session.max_sub_attempts)
    }

    /// Returns false when the retry budget is spent or shutdown arrives
    /// mid-delay; a shutdown request never waits out the remaining sleep.
    async fn pause_before_retry(&mut self, attempt: &mut u32) -> bool {
        if !self.note_attempt(attempt) {
            return false;
        }
        let delay = backoff_delay(self.ctx.config.session.reconnect_base_delay(), *attempt);
        debug!(
            session_id = %self.session_id,
            attempt = *attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting after backoff"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            changed = self.shutdown_rx.changed() => {
                changed.is_ok() && !*self.shutdown_rx.borrow()
            }
        }
    }

    async fn notify_owner(&self, text: String) {
        let notice = OwnerNotice {
            session_id: self.session_id.clone(),
            module: None,
            text,
        };
        if self.ctx.owner_notify.send(notice).await.is_err() {
            debug!(session_id = %self.session_id, "Owner notice channel closed");
        }
    }
}
