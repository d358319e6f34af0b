//! Ledger record schemas.
//!
//! Every field carries its default in exactly one place: the `Default`
//! impl. Records created lazily on first contact start from `default()`,
//! and `#[serde(default)]` fills the same values for fields missing from
//! an older on-disk document. There are no per-field fixup passes anywhere
//! else in the runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// UserLedgerRecord
// ============================================================================

/// Persistent per-sender state, keyed by canonical sender id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserLedgerRecord {
    pub currency_balance: i64,
    pub usage_limit_balance: i64,
    pub experience: i64,
    pub level: u32,
    pub registered: bool,
    pub display_name: String,
    pub registered_at: Option<DateTime<Utc>>,
    pub banned: bool,
    pub ban_reason: String,
    pub muted: bool,
    /// Timestamp of the last command this sender ran, for the cooldown
    /// guard.
    pub last_command_at: Option<DateTime<Utc>>,
    pub premium_expires_at: Option<DateTime<Utc>>,
}

impl Default for UserLedgerRecord {
    fn default() -> Self {
        Self {
            currency_balance: 0,
            usage_limit_balance: 25,
            experience: 0,
            level: 0,
            registered: false,
            display_name: String::new(),
            registered_at: None,
            banned: false,
            ban_reason: String::new(),
            muted: false,
            last_command_at: None,
            premium_expires_at: None,
        }
    }
}

impl UserLedgerRecord {
    /// Premium standing at `now`, from the ledger's point of view.
    /// Config-listed premium accounts are handled by role policy, not here.
    pub fn is_premium_at(&self, now: DateTime<Utc>) -> bool {
        self.premium_expires_at.is_some_and(|expiry| expiry > now)
    }
}

// ============================================================================
// ChatConfigRecord
// ============================================================================

/// Persistent per-chat moderation settings, keyed by chat id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfigRecord {
    pub anti_link: bool,
    pub anti_spam: bool,
    pub welcome_enabled: bool,
    pub welcome_template: Option<String>,
    pub bye_template: Option<String>,
    /// When set, only chat admins may run commands in this chat.
    pub admin_only_mode: bool,
    pub auto_read: bool,
    pub banned: bool,
}

impl Default for ChatConfigRecord {
    fn default() -> Self {
        Self {
            anti_link: false,
            anti_spam: false,
            welcome_enabled: true,
            welcome_template: None,
            bye_template: None,
            admin_only_mode: false,
            auto_read: false,
            banned: false,
        }
    }
}

// ============================================================================
// CommandStats
// ============================================================================

/// Usage counters for one command module, keyed by module name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandStats {
    pub total: u64,
    pub success: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Duration;

    #[test]
    fn user_defaults_match_schema() {
        let user = UserLedgerRecord::default();
        assert_eq!(user.currency_balance, 0);
        assert_eq!(user.usage_limit_balance, 25);
        assert_eq!(user.experience, 0);
        assert_eq!(user.level, 0);
        assert!(!user.registered);
        assert!(!user.banned);
        assert_eq!(user.ban_reason, "");
        assert!(!user.muted);
        assert!(user.last_command_at.is_none());
        assert!(user.premium_expires_at.is_none());
    }

    #[test]
    fn missing_fields_deserialize_to_defaults() {
        // A record written by an older schema that only knew about money
        let user: UserLedgerRecord =
            serde_json::from_str(r#"{"currency_balance": 500}"#).unwrap();
        assert_eq!(user.currency_balance, 500);
        assert_eq!(user.usage_limit_balance, 25);
        assert!(!user.registered);

        let chat: ChatConfigRecord = serde_json::from_str(r#"{"anti_link": true}"#).unwrap();
        assert!(chat.anti_link);
        assert!(chat.welcome_enabled);
        assert!(!chat.admin_only_mode);
    }

    #[test]
    fn premium_expiry_is_compared_against_now() {
        let now = Utc::now();
        let mut user = UserLedgerRecord::default();
        assert!(!user.is_premium_at(now));

        user.premium_expires_at = Some(now + Duration::hours(1));
        assert!(user.is_premium_at(now));

        user.premium_expires_at = Some(now - Duration::hours(1));
        assert!(!user.is_premium_at(now));
    }
}
