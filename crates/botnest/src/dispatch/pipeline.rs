//! Per-message dispatch pipeline.
//!
//! Every inbound message runs the same sequence: normalize, lazily create
//! ledger records, apply global short-circuits, resolve the prefix, guard
//! the cooldown, select at most one module, run the gate chain, execute
//! with fault isolation, and settle ledger deltas. A failure inside one
//! module never reaches the session supervisor; it is redacted, reported,
//! and the pipeline settles as if execution had completed.

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::Utc;
use regex::RegexSet;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use botnest_protocol::{ConnectorCommand, InboundMessage, MessageContent};

use crate::config::Config;
use crate::ledger::LedgerStore;

use super::gates::{self, GateContext, GateRejection, RolePolicy};
use super::module::{CommandContext, CommandModuleDescriptor};
use super::prefix::{PrefixError, PrefixMatcher};
use super::redact::Redactor;
use super::registry::CommandRegistry;

/// Message-id shapes produced by other bot frameworks on the same
/// platform. Dispatching on these would make two bots answer each other
/// in a loop.
static FOREIGN_BOT_IDS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"^BAE5[0-9A-F]{12}$",
        r"^B24E[0-9A-F]{16,20}$",
        r"^3EB0[0-9A-F]{8,28}$",
    ])
    .unwrap_or_else(|_| RegexSet::empty())
});

/// A fault report destined for the owner set.
#[derive(Debug, Clone)]
pub struct OwnerNotice {
    pub session_id: String,
    pub module: Option<String>,
    pub text: String,
}

/// Why a message left the pipeline without reaching module selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropCause {
    /// Protocol-internal stub with no user content.
    ProtocolInternal,
    /// Self-mode and message origin disagree.
    SelfModeMismatch,
    SenderMuted,
    SenderBanned,
    ChatBanned,
    /// Group-only or private-only session saw the other chat scope.
    ScopeMismatch,
    /// Message id matches a known foreign-bot signature.
    ForeignBotSignature,
    /// Chat is in admin-only mode and the sender is not an admin.
    AdminOnlyChat,
    /// Sender is still inside the cooldown window. Dropped silently.
    Cooldown,
    /// Text does not start with the configured prefix.
    NoPrefix,
}

/// Result of dispatching one message.
#[derive(Debug)]
pub enum DispatchOutcome {
    Dropped(DropCause),
    /// Eligible text, but no module matched. Most messages are plain chat.
    NoMatch,
    Rejected {
        module: String,
        rejection: GateRejection,
    },
    Executed {
        module: String,
        failed: bool,
    },
}

// ============================================================================
// DispatchPipeline
// ============================================================================

pub struct DispatchPipeline {
    registry: Arc<CommandRegistry>,
    ledger: Arc<LedgerStore>,
    prefix: PrefixMatcher,
    roles: RolePolicy,
    redactor: Redactor,
    cooldown: Duration,
    self_mode: bool,
    group_only: bool,
    private_only: bool,
    owner_notify: mpsc::Sender<OwnerNotice>,
}

impl DispatchPipeline {
    pub fn new(
        config: &Config,
        registry: Arc<CommandRegistry>,
        ledger: Arc<LedgerStore>,
        owner_notify: mpsc::Sender<OwnerNotice>,
    ) -> Result<Self, PrefixError> {
        Ok(Self {
            registry,
            ledger,
            prefix: PrefixMatcher::from_spec(config.dispatch.prefix.as_ref())?,
            roles: RolePolicy::from_config(&config.roles),
            redactor: Redactor::new(&config.secrets),
            cooldown: config.dispatch.cooldown(),
            self_mode: config.dispatch.self_mode,
            group_only: config.dispatch.group_only,
            private_only: config.dispatch.private_only,
            owner_notify,
        })
    }

    /// Run one message through the pipeline. Sequential per session: the
    /// supervisor awaits this before pulling the next event.
    pub async fn dispatch(
        &self,
        session_id: &str,
        outbound: &mpsc::Sender<ConnectorCommand>,
        message: InboundMessage,
    ) -> DispatchOutcome {
        // 1. Normalize
        let text = match &message.content {
            MessageContent::ProtocolInternal => {
                return DispatchOutcome::Dropped(DropCause::ProtocolInternal);
            }
            content => content.as_text().unwrap_or("").trim().to_string(),
        };
        let sender_id = message.sender.id.clone();
        let chat_id = message.chat_id.clone();
        let now = Utc::now();

        // 2. Lazy-init ledger records with schema defaults
        let user = self.ledger.ensure_user(&sender_id).await;
        let chat = self.ledger.ensure_chat(&chat_id).await;

        let table = self.registry.table().await;
        self.run_before_all(&table, session_id, outbound, &message)
            .await;

        // 3. Global short-circuits
        if message.from_self != self.self_mode {
            return DispatchOutcome::Dropped(DropCause::SelfModeMismatch);
        }
        if user.muted {
            return DispatchOutcome::Dropped(DropCause::SenderMuted);
        }
        if user.banned && !self.roles.is_owner(&sender_id) {
            return DispatchOutcome::Dropped(DropCause::SenderBanned);
        }
        if chat.banned {
            return DispatchOutcome::Dropped(DropCause::ChatBanned);
        }
        if (self.group_only && !message.is_group) || (self.private_only && message.is_group) {
            return DispatchOutcome::Dropped(DropCause::ScopeMismatch);
        }
        if is_foreign_bot_id(&message.message_id) {
            return DispatchOutcome::Dropped(DropCause::ForeignBotSignature);
        }
        if chat.admin_only_mode
            && message.is_group
            && !message.sender_is_admin
            && !self.roles.is_moderator(&sender_id)
        {
            return DispatchOutcome::Dropped(DropCause::AdminOnlyChat);
        }

        // 4. Prefix resolution
        let rest = match self.prefix.split(&text) {
            Some((_, rest)) => rest,
            None => return DispatchOutcome::Dropped(DropCause::NoPrefix),
        };
        let (command, args) = match split_command(rest) {
            Some(parts) => parts,
            None => return DispatchOutcome::NoMatch,
        };

        // 5. Cooldown guard, dropped silently
        if let Some(last) = user.last_command_at {
            let elapsed = now.signed_duration_since(last);
            let window = chrono::Duration::from_std(self.cooldown).unwrap_or_default();
            if elapsed < window && !self.roles.cooldown_exempt(&sender_id, &user, now) {
                return DispatchOutcome::Dropped(DropCause::Cooldown);
            }
        }

        // 6. Module selection: first structural match, or plain chat
        let module = match table.find(&command) {
            Some(m) => m,
            None => return DispatchOutcome::NoMatch,
        };

        // 7. Permission gate chain
        let gate_ctx = GateContext {
            roles: &self.roles,
            user: &user,
            sender_id: &sender_id,
            is_group: message.is_group,
            sender_is_admin: message.sender_is_admin,
            bot_is_admin: message.bot_is_admin,
            now,
        };
        if let Err(rejection) = gates::evaluate(&module.permissions, &module.cost, &gate_ctx) {
            self.send_text(outbound, &chat_id, &message.message_id, rejection.to_string())
                .await;
            return DispatchOutcome::Rejected {
                module: module.name.clone(),
                rejection,
            };
        }

        // 8. Execute with fault isolation
        let mut ctx = CommandContext::new(
            session_id.to_string(),
            message.clone(),
            command,
            args,
            Arc::clone(&self.ledger),
            outbound.clone(),
        );
        let failed = match module.handler.execute(&mut ctx).await {
            Ok(()) => false,
            Err(e) => {
                self.report_fault(session_id, &module, &sender_id, &text, &e, outbound, &message)
                    .await;
                true
            }
        };

        // 9. Settle ledger deltas and usage statistics
        let currency_debit = module.cost.currency + ctx.extra_currency_debit;
        let usage_debit = module.cost.usage_limit;
        let experience = module.cost.experience_grant;
        self.ledger
            .update_user(&sender_id, |record| {
                record.currency_balance -= currency_debit;
                record.usage_limit_balance -= usage_debit;
                record.experience += experience;
                record.last_command_at = Some(now);
            })
            .await;
        self.ledger
            .update_stats(&module.name, |stats| {
                stats.total += 1;
                stats.last_used_at = Some(now);
                if !failed {
                    stats.success += 1;
                    stats.last_success_at = Some(now);
                }
            })
            .await;

        self.run_after_all(&table, session_id, outbound, &message)
            .await;

        // 10. At most one module per message
        DispatchOutcome::Executed {
            module: module.name.clone(),
            failed,
        }
    }

    /// `before_all` hooks run for every inbound message on every enabled
    /// module, isolated like `execute`.
    async fn run_before_all(
        &self,
        table: &super::registry::CommandTable,
        session_id: &str,
        outbound: &mpsc::Sender<ConnectorCommand>,
        message: &InboundMessage,
    ) {
        for module in table.modules() {
            if module.disabled {
                continue;
            }
            let mut ctx = CommandContext::new(
                session_id.to_string(),
                message.clone(),
                String::new(),
                String::new(),
                Arc::clone(&self.ledger),
                outbound.clone(),
            );
            if let Err(e) = module.handler.before_all(&mut ctx).await {
                warn!(module = %module.name, error = %e, "before_all hook failed");
            }
        }
    }

    async fn run_after_all(
        &self,
        table: &super::registry::CommandTable,
        session_id: &str,
        outbound: &mpsc::Sender<ConnectorCommand>,
        message: &InboundMessage,
    ) {
        for module in table.modules() {
            if module.disabled {
                continue;
            }
            let mut ctx = CommandContext::new(
                session_id.to_string(),
                message.clone(),
                String::new(),
                String::new(),
                Arc::clone(&self.ledger),
                outbound.clone(),
            );
            if let Err(e) = module.handler.after_all(&mut ctx).await {
                warn!(module = %module.name, error = %e, "after_all hook failed");
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn report_fault(
        &self,
        session_id: &str,
        module: &CommandModuleDescriptor,
        sender_id: &str,
        text: &str,
        error: &anyhow::Error,
        outbound: &mpsc::Sender<ConnectorCommand>,
        message: &InboundMessage,
    ) {
        let redacted = self.redactor.report(&format!("{error:#}"));
        warn!(
            session_id = %session_id,
            module = %module.name,
            sender = %sender_id,
            error = %redacted,
            "Command module failed"
        );

        // Best-effort reply into the invoking chat
        self.send_text(
            outbound,
            &message.chat_id,
            &message.message_id,
            format!("Command '{}' failed: {redacted}", module.name),
        )
        .await;

        let notice = OwnerNotice {
            session_id: session_id.to_string(),
            module: Some(module.name.clone()),
            text: format!(
                "Module '{}' failed for {} on \"{}\": {redacted}",
                module.name,
                sender_id,
                self.redactor.report(text),
            ),
        };
        if self.owner_notify.send(notice).await.is_err() {
            debug!("Owner notice channel closed");
        }
    }

    async fn send_text(
        &self,
        outbound: &mpsc::Sender<ConnectorCommand>,
        chat_id: &str,
        reply_to: &str,
        text: String,
    ) {
        let command = ConnectorCommand::SendMessage {
            chat_id: chat_id.to_string(),
            text,
            reply_to: Some(reply_to.to_string()),
        };
        if outbound.send(command).await.is_err() {
            debug!("Outbound channel closed");
        }
    }
}

/// Split eligible text into the lowercased command word and its argument
/// string.
fn split_command(rest: &str) -> Option<(String, String)> {
    let trimmed = rest.trim();
    let mut parts = trimmed.splitn(2, char::is_whitespace);
    let word = parts.next().filter(|w| !w.is_empty())?;
    let args = parts.next().unwrap_or("").trim().to_string();
    Some((word.to_ascii_lowercase(), args))
}

fn is_foreign_bot_id(message_id: &str) -> bool {
    FOREIGN_BOT_IDS.is_match(message_id)
}
