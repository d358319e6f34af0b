//! Linked-session commands.
//!
//! `serbot`/`jadibot` turns the sender's own account into a sub session
//! running under this process. Without an argument the new session emits a
//! pairing artifact the sender completes on their device; with a base64
//! argument the session boots directly from transferred credentials.
//! `stopbot` terminates the sender's sub session.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use botnest_protocol::PairingArtifact;

use crate::credentials::CredentialBundle;
use crate::dispatch::{
    CommandContext, CommandHandler, CommandModuleDescriptor, MatchPredicate, PermissionFlags,
};
use crate::session::{RegistryError, SessionRegistry, SessionState};

/// How long to wait for the freshly spawned session to reach a state worth
/// reporting back to the sender.
const LINK_WAIT: Duration = Duration::from_secs(60);

/// Canonical session id for a sender's linked session. Sender ids carry
/// transport decorations (`@...` suffixes); only the account digits name
/// the directory.
fn sub_session_id(sender: &str) -> String {
    let account: String = sender
        .chars()
        .take_while(|c| *c != '@')
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    format!("sub-{account}")
}

fn describe_artifact(artifact: &PairingArtifact) -> String {
    match artifact {
        PairingArtifact::Qr { payload, expires_in } => format!(
            "Scan this code from your device within {expires_in}s:\n{payload}"
        ),
        PairingArtifact::NumericCode { code, expires_in } => format!(
            "Enter this code on your device within {expires_in}s: {code}"
        ),
    }
}

pub struct StartSubHandler {
    registry: Arc<SessionRegistry>,
}

#[async_trait]
impl CommandHandler for StartSubHandler {
    async fn execute(&self, ctx: &mut CommandContext) -> anyhow::Result<()> {
        let session_id = sub_session_id(&ctx.message.sender.id);

        let credentials = match ctx.args.trim() {
            "" => None,
            encoded => match CredentialBundle::from_base64(encoded) {
                Ok(bundle) if bundle.is_valid() => Some(bundle),
                Ok(_) | Err(_) => {
                    ctx.reply("That credential bundle is not usable. Send the command without arguments to pair a fresh session.")
                        .await?;
                    return Ok(());
                }
            },
        };
        let transferred = credentials.is_some();

        let handle = match self.registry.start_sub(&session_id, credentials).await {
            Ok(handle) => handle,
            Err(RegistryError::AlreadyActive(_)) => {
                ctx.reply("Your linked session is already running.").await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if transferred {
            ctx.reply("Starting your linked session from the transferred credentials...")
                .await?;
        }

        // Watch the session until it pairs, opens, or dies.
        let mut state_rx = handle.watch_state();
        let wait = tokio::time::timeout(LINK_WAIT, async {
            loop {
                let state = *state_rx.borrow_and_update();
                match state {
                    SessionState::Pairing => {
                        if let Ok(Some(artifact)) = handle.request_pairing().await {
                            return Some(describe_artifact(&artifact));
                        }
                    }
                    SessionState::Open => {
                        return Some("Your linked session is up.".to_string());
                    }
                    SessionState::Terminated => {
                        return Some(
                            "The linked session could not start. Try again later.".to_string(),
                        );
                    }
                    SessionState::Unauthenticated | SessionState::Recovering => {}
                }
                if state_rx.changed().await.is_err() {
                    return None;
                }
            }
        })
        .await;

        match wait {
            Ok(Some(text)) => ctx.reply(text).await?,
            Ok(None) => {
                debug!(session_id = %session_id, "Linked session ended before reporting");
            }
            Err(_) => {
                ctx.reply("The linked session is still starting; it will pair in the background.")
                    .await?;
            }
        }
        Ok(())
    }
}

pub struct StopSubHandler {
    registry: Arc<SessionRegistry>,
}

#[async_trait]
impl CommandHandler for StopSubHandler {
    async fn execute(&self, ctx: &mut CommandContext) -> anyhow::Result<()> {
        let session_id = sub_session_id(&ctx.message.sender.id);
        match self.registry.get(&session_id) {
            Some(handle) if handle.state() != SessionState::Terminated => {
                handle.shutdown().await?;
                ctx.reply("Your linked session is shutting down.").await
            }
            _ => ctx.reply("You have no linked session running.").await,
        }
    }
}

pub fn start_descriptor(registry: Arc<SessionRegistry>) -> CommandModuleDescriptor {
    CommandModuleDescriptor::new(
        "sub_bot_start",
        MatchPredicate::AnyOf(vec!["serbot".into(), "jadibot".into()]),
        Arc::new(StartSubHandler { registry }),
    )
    .permissions(PermissionFlags {
        registration_required: true,
        private_only: true,
        ..PermissionFlags::default()
    })
}

pub fn stop_descriptor(registry: Arc<SessionRegistry>) -> CommandModuleDescriptor {
    CommandModuleDescriptor::new(
        "sub_bot_stop",
        MatchPredicate::AnyOf(vec!["stopbot".into(), "detenerbot".into()]),
        Arc::new(StopSubHandler { registry }),
    )
    .permissions(PermissionFlags {
        registration_required: true,
        ..PermissionFlags::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_strips_transport_suffix() {
        assert_eq!(sub_session_id("5215512345678@s.whatsapp.net"), "sub-5215512345678");
        assert_eq!(sub_session_id("alice"), "sub-alice");
        assert_eq!(sub_session_id("a-b.c@host"), "sub-abc");
    }
}
