//! Permission and resource gate chain.
//!
//! Gates run in one fixed order and the first failure wins, so a sender
//! failing several requirements always sees the same rejection. Order:
//! restricted-owner, owner, moderator, premium, group scope, bot admin,
//! sender admin, private scope, registration, level, currency, usage
//! limit.
//!
//! Rejections are expected control flow. They become replies to the
//! sender and are never logged as errors.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::RolesConfig;
use crate::ledger::UserLedgerRecord;

use super::module::{PermissionFlags, ResourceCost};

// ============================================================================
// Role policy
// ============================================================================

/// Elevated sender identities from configuration.
#[derive(Debug, Clone, Default)]
pub struct RolePolicy {
    restricted_owners: Vec<String>,
    owners: Vec<String>,
    moderators: Vec<String>,
    premium: Vec<String>,
}

impl RolePolicy {
    pub fn from_config(roles: &RolesConfig) -> Self {
        Self {
            restricted_owners: roles.restricted_owners.clone(),
            owners: roles.owners.clone(),
            moderators: roles.moderators.clone(),
            premium: roles.premium.clone(),
        }
    }

    pub fn is_restricted_owner(&self, sender_id: &str) -> bool {
        self.restricted_owners.iter().any(|id| id == sender_id)
    }

    /// Owners include restricted owners.
    pub fn is_owner(&self, sender_id: &str) -> bool {
        self.is_restricted_owner(sender_id) || self.owners.iter().any(|id| id == sender_id)
    }

    /// Moderators include owners.
    pub fn is_moderator(&self, sender_id: &str) -> bool {
        self.is_owner(sender_id) || self.moderators.iter().any(|id| id == sender_id)
    }

    /// Premium standing: listed in config or carrying an unexpired ledger
    /// expiry. Owners always count.
    pub fn is_premium(&self, sender_id: &str, user: &UserLedgerRecord, now: DateTime<Utc>) -> bool {
        self.is_owner(sender_id)
            || self.premium.iter().any(|id| id == sender_id)
            || user.is_premium_at(now)
    }

    /// Senders the cooldown guard does not apply to.
    pub fn cooldown_exempt(
        &self,
        sender_id: &str,
        user: &UserLedgerRecord,
        now: DateTime<Utc>,
    ) -> bool {
        self.is_moderator(sender_id) || self.is_premium(sender_id, user, now)
    }
}

// ============================================================================
// Rejections
// ============================================================================

/// Typed gate failure. The display string is the reply the sender sees.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateRejection {
    #[error("This command can only be used by the account this bot is paired with.")]
    RestrictedOwnerOnly,

    #[error("This command is reserved for the bot owner.")]
    OwnerOnly,

    #[error("This command is reserved for moderators.")]
    ModeratorOnly,

    #[error("This command is reserved for premium users.")]
    PremiumOnly,

    #[error("This command only works in group chats.")]
    GroupOnly,

    #[error("The bot needs admin rights in this chat to do that.")]
    BotAdminRequired,

    #[error("Only chat admins can use this command.")]
    AdminOnly,

    #[error("This command only works in a private chat with the bot.")]
    PrivateOnly,

    #[error("You need to register before using this command.")]
    RegistrationRequired,

    #[error("You need level {required} to use this command (you are level {actual}).")]
    LevelTooLow { required: u32, actual: u32 },

    #[error("You need {required} coins but only have {balance}.")]
    InsufficientCurrency { required: i64, balance: i64 },

    #[error("You need {required} usage credits but only have {balance}.")]
    UsageLimitExhausted { required: i64, balance: i64 },
}

// ============================================================================
// Evaluation
// ============================================================================

/// Everything the gate chain needs to know about one inbound message.
pub struct GateContext<'a> {
    pub roles: &'a RolePolicy,
    pub user: &'a UserLedgerRecord,
    pub sender_id: &'a str,
    pub is_group: bool,
    pub sender_is_admin: bool,
    pub bot_is_admin: bool,
    pub now: DateTime<Utc>,
}

/// Run the fixed gate chain for one module against one sender.
pub fn evaluate(
    flags: &PermissionFlags,
    cost: &ResourceCost,
    ctx: &GateContext<'_>,
) -> Result<(), GateRejection> {
    if flags.restricted_owner_only && !ctx.roles.is_restricted_owner(ctx.sender_id) {
        return Err(GateRejection::RestrictedOwnerOnly);
    }
    if flags.owner_only && !ctx.roles.is_owner(ctx.sender_id) {
        return Err(GateRejection::OwnerOnly);
    }
    if flags.moderator_only && !ctx.roles.is_moderator(ctx.sender_id) {
        return Err(GateRejection::ModeratorOnly);
    }
    if flags.premium_only && !ctx.roles.is_premium(ctx.sender_id, ctx.user, ctx.now) {
        return Err(GateRejection::PremiumOnly);
    }
    if flags.group_only && !ctx.is_group {
        return Err(GateRejection::GroupOnly);
    }
    if flags.bot_admin_only && !ctx.bot_is_admin {
        return Err(GateRejection::BotAdminRequired);
    }
    if flags.admin_only && !ctx.sender_is_admin {
        return Err(GateRejection::AdminOnly);
    }
    if flags.private_only && ctx.is_group {
        return Err(GateRejection::PrivateOnly);
    }
    if flags.registration_required && !ctx.user.registered {
        return Err(GateRejection::RegistrationRequired);
    }
    if ctx.user.level < flags.minimum_level {
        return Err(GateRejection::LevelTooLow {
            required: flags.minimum_level,
            actual: ctx.user.level,
        });
    }
    if cost.currency > 0 && ctx.user.currency_balance < cost.currency {
        return Err(GateRejection::InsufficientCurrency {
            required: cost.currency,
            balance: ctx.user.currency_balance,
        });
    }
    if cost.usage_limit > 0 && ctx.user.usage_limit_balance < cost.usage_limit {
        return Err(GateRejection::UsageLimitExhausted {
            required: cost.usage_limit,
            balance: ctx.user.usage_limit_balance,
        });
    }
    Ok(())
}
