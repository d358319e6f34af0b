//! Command module descriptors.
//!
//! A module is data (name, matching rule, permission flags, resource
//! cost) plus a handler implementing the lifecycle hooks. Descriptors are
//! immutable once loaded into a command table; changing a module means
//! building a new table and swapping it in.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::mpsc;

use botnest_protocol::{ConnectorCommand, InboundMessage};

use crate::ledger::LedgerStore;

// ============================================================================
// Matching
// ============================================================================

/// How a module claims a command word.
#[derive(Debug, Clone)]
pub enum MatchPredicate {
    /// One literal command name.
    Exact(String),
    /// Any of a set of literal names (aliases).
    AnyOf(Vec<String>),
    /// An arbitrary pattern matched against the whole command word.
    Pattern(Regex),
}

impl MatchPredicate {
    /// Test the command word (already stripped of prefix and arguments).
    /// Literal matching is case-insensitive.
    pub fn matches(&self, command: &str) -> bool {
        match self {
            MatchPredicate::Exact(name) => name.eq_ignore_ascii_case(command),
            MatchPredicate::AnyOf(names) => {
                names.iter().any(|n| n.eq_ignore_ascii_case(command))
            }
            MatchPredicate::Pattern(regex) => regex.is_match(command),
        }
    }

    /// The literal names this predicate claims, for collision detection
    /// at table build time. Patterns claim no literals.
    pub fn literals(&self) -> Vec<&str> {
        match self {
            MatchPredicate::Exact(name) => vec![name.as_str()],
            MatchPredicate::AnyOf(names) => names.iter().map(String::as_str).collect(),
            MatchPredicate::Pattern(_) => Vec::new(),
        }
    }
}

// ============================================================================
// Permissions and cost
// ============================================================================

/// Gate requirements, evaluated in the pipeline's fixed order.
#[derive(Debug, Clone, Default)]
pub struct PermissionFlags {
    pub restricted_owner_only: bool,
    pub owner_only: bool,
    pub moderator_only: bool,
    pub premium_only: bool,
    pub group_only: bool,
    pub private_only: bool,
    pub admin_only: bool,
    pub bot_admin_only: bool,
    pub registration_required: bool,
    pub minimum_level: u32,
}

/// What running the module costs and grants.
#[derive(Debug, Clone, Default)]
pub struct ResourceCost {
    pub currency: i64,
    pub usage_limit: i64,
    pub experience_grant: i64,
}

// ============================================================================
// Handler hooks
// ============================================================================

/// Execution context handed to a module's hooks.
pub struct CommandContext {
    pub session_id: String,
    pub message: InboundMessage,
    /// The matched command word, lowercased, without prefix.
    pub command: String,
    /// Everything after the command word, trimmed.
    pub args: String,
    pub ledger: Arc<LedgerStore>,
    outbound: mpsc::Sender<ConnectorCommand>,
    /// Additional currency the module decided to charge during execution,
    /// settled together with the declared cost.
    pub extra_currency_debit: i64,
}

impl CommandContext {
    pub fn new(
        session_id: String,
        message: InboundMessage,
        command: String,
        args: String,
        ledger: Arc<LedgerStore>,
        outbound: mpsc::Sender<ConnectorCommand>,
    ) -> Self {
        Self {
            session_id,
            message,
            command,
            args,
            ledger,
            outbound,
            extra_currency_debit: 0,
        }
    }

    /// Send a text reply into the invoking chat.
    pub async fn reply(&self, text: impl Into<String>) -> anyhow::Result<()> {
        self.outbound
            .send(ConnectorCommand::SendMessage {
                chat_id: self.message.chat_id.clone(),
                text: text.into(),
                reply_to: Some(self.message.message_id.clone()),
            })
            .await?;
        Ok(())
    }

    pub fn outbound(&self) -> mpsc::Sender<ConnectorCommand> {
        self.outbound.clone()
    }
}

/// Lifecycle hooks for one command module.
///
/// `before_all` runs for every inbound message regardless of matching;
/// `execute` runs only when this module is the selected one; `after_all`
/// runs on every enabled module, but only after some module executed and
/// its ledger deltas settled.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn before_all(&self, _ctx: &mut CommandContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn execute(&self, ctx: &mut CommandContext) -> anyhow::Result<()>;

    async fn after_all(&self, _ctx: &mut CommandContext) -> anyhow::Result<()> {
        Ok(())
    }
}

// ============================================================================
// Descriptor
// ============================================================================

#[derive(Clone)]
pub struct CommandModuleDescriptor {
    pub name: String,
    pub predicate: MatchPredicate,
    pub permissions: PermissionFlags,
    pub cost: ResourceCost,
    pub disabled: bool,
    pub handler: Arc<dyn CommandHandler>,
}

impl CommandModuleDescriptor {
    pub fn new(
        name: impl Into<String>,
        predicate: MatchPredicate,
        handler: Arc<dyn CommandHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            predicate,
            permissions: PermissionFlags::default(),
            cost: ResourceCost::default(),
            disabled: false,
            handler,
        }
    }

    pub fn permissions(mut self, permissions: PermissionFlags) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn cost(mut self, cost: ResourceCost) -> Self {
        self.cost = cost;
        self
    }

    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }
}

impl std::fmt::Debug for CommandModuleDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandModuleDescriptor")
            .field("name", &self.name)
            .field("predicate", &self.predicate)
            .field("disabled", &self.disabled)
            .finish()
    }
}
