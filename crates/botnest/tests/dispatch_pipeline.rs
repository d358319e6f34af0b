//! End-to-end dispatch pipeline behavior over an in-memory ledger.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use botnest::config::{Config, PrefixSpec};
use botnest::dispatch::{
    CommandContext, CommandHandler, CommandModuleDescriptor, CommandRegistry, DispatchOutcome,
    DispatchPipeline, DropCause, GateRejection, MatchPredicate, OwnerNotice, PermissionFlags,
    ResourceCost,
};
use botnest::ledger::LedgerStore;
use botnest_protocol::ConnectorCommand;

use common::{sent_texts, text_message};

// ============================================================================
// Fixtures
// ============================================================================

struct Recorder {
    calls: Arc<AtomicU32>,
    fail_with: Option<&'static str>,
}

#[async_trait]
impl CommandHandler for Recorder {
    async fn execute(&self, ctx: &mut CommandContext) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.fail_with {
            Some(message) => anyhow::bail!("{message}"),
            None => ctx.reply("done").await,
        }
    }
}

struct HookCounter {
    before_all: Arc<AtomicU32>,
    after_all: Arc<AtomicU32>,
}

#[async_trait]
impl CommandHandler for HookCounter {
    async fn before_all(&self, _ctx: &mut CommandContext) -> anyhow::Result<()> {
        self.before_all.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn execute(&self, _ctx: &mut CommandContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn after_all(&self, _ctx: &mut CommandContext) -> anyhow::Result<()> {
        self.after_all.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn recorder_module(name: &str, predicate: MatchPredicate) -> (CommandModuleDescriptor, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let descriptor = CommandModuleDescriptor::new(
        name,
        predicate,
        Arc::new(Recorder {
            calls: Arc::clone(&calls),
            fail_with: None,
        }),
    );
    (descriptor, calls)
}

struct Harness {
    pipeline: DispatchPipeline,
    ledger: Arc<LedgerStore>,
    outbound_tx: mpsc::Sender<ConnectorCommand>,
    outbound_rx: mpsc::Receiver<ConnectorCommand>,
    notices_rx: mpsc::Receiver<OwnerNotice>,
}

impl Harness {
    async fn new(config: Config, modules: Vec<CommandModuleDescriptor>) -> Self {
        let ledger = LedgerStore::in_memory();
        let registry = Arc::new(CommandRegistry::empty());
        let (notices_tx, notices_rx) = mpsc::channel(16);
        let pipeline = DispatchPipeline::new(
            &config,
            Arc::clone(&registry),
            Arc::clone(&ledger),
            notices_tx,
        )
        .unwrap();
        let (outbound_tx, outbound_rx) = mpsc::channel(16);

        registry.reload(modules).await.unwrap();
        Self {
            pipeline,
            ledger,
            outbound_tx,
            outbound_rx,
            notices_rx,
        }
    }

    async fn dispatch(&self, message: botnest_protocol::InboundMessage) -> DispatchOutcome {
        self.pipeline
            .dispatch("primary", &self.outbound_tx, message)
            .await
    }

    fn replies(&mut self) -> Vec<String> {
        let mut sent = Vec::new();
        while let Ok(cmd) = self.outbound_rx.try_recv() {
            sent.push(cmd);
        }
        sent_texts(&sent)
    }
}

fn prefixed_config() -> Config {
    let mut config = Config::default();
    config.dispatch.prefix = Some(PrefixSpec::One("!".into()));
    config.dispatch.cooldown_ms = 0;
    config
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn without_a_prefix_plain_chat_is_eligible_but_unmatched() {
    let (module, calls) = recorder_module("ping", MatchPredicate::Exact("ping".into()));
    let mut config = Config::default();
    config.dispatch.cooldown_ms = 0;
    let mut harness = Harness::new(config, vec![module]).await;

    let outcome = harness
        .dispatch(text_message("alice", "room@g.us", "good morning everyone"))
        .await;

    // No prefix configured: the text is eligible, the first word just
    // matches no module. Nothing is said back.
    assert!(matches!(outcome, DispatchOutcome::NoMatch));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(harness.replies().is_empty());

    // First contact still created the record with schema defaults.
    let user = harness.ledger.user("alice").unwrap();
    assert!(!user.registered);
    assert_eq!(user.usage_limit_balance, 25);

    // The bare command word selects the module without any marker.
    let outcome = harness
        .dispatch(text_message("alice", "room@g.us", "ping"))
        .await;
    assert!(matches!(outcome, DispatchOutcome::Executed { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn plain_chat_is_dropped_but_still_recorded() {
    let (module, calls) = recorder_module("ping", MatchPredicate::Exact("ping".into()));
    let harness = Harness::new(prefixed_config(), vec![module]).await;

    let outcome = harness
        .dispatch(text_message("alice", "room@g.us", "good morning everyone"))
        .await;

    assert!(matches!(
        outcome,
        DispatchOutcome::Dropped(DropCause::NoPrefix)
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // First contact created the record with schema defaults.
    let user = harness.ledger.user("alice").unwrap();
    assert_eq!(user.currency_balance, 0);
    assert_eq!(user.usage_limit_balance, 25);
    assert!(!user.registered);
}

#[tokio::test]
async fn redelivered_plain_chat_leaves_the_ledger_unchanged() {
    let (module, _) = recorder_module("ping", MatchPredicate::Exact("ping".into()));
    let harness = Harness::new(prefixed_config(), vec![module]).await;

    harness
        .dispatch(text_message("alice", "room@g.us", "hello"))
        .await;
    let after_first = harness.ledger.user("alice").unwrap();

    // Platforms redeliver; a second pass must observe, not mutate.
    harness
        .dispatch(text_message("alice", "room@g.us", "hello"))
        .await;
    let after_second = harness.ledger.user("alice").unwrap();

    assert_eq!(after_first, after_second);
    assert!(harness.ledger.command_stats("ping").is_none());
}

#[tokio::test]
async fn unmatched_command_word_is_no_match() {
    let (module, calls) = recorder_module("ping", MatchPredicate::Exact("ping".into()));
    let mut harness = Harness::new(prefixed_config(), vec![module]).await;

    let outcome = harness
        .dispatch(text_message("alice", "dm", "!frobnicate now"))
        .await;

    assert!(matches!(outcome, DispatchOutcome::NoMatch));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(harness.replies().is_empty());
}

#[tokio::test]
async fn insufficient_currency_rejects_without_debiting() {
    let (module, calls) = recorder_module("buy", MatchPredicate::Exact("buy".into()));
    let module = module.cost(ResourceCost {
        currency: 40,
        ..ResourceCost::default()
    });
    let mut harness = Harness::new(prefixed_config(), vec![module]).await;

    harness
        .ledger
        .update_user("alice", |user| user.currency_balance = 10)
        .await;

    let outcome = harness.dispatch(text_message("alice", "dm", "!buy sword")).await;

    match outcome {
        DispatchOutcome::Rejected { module, rejection } => {
            assert_eq!(module, "buy");
            assert_eq!(
                rejection,
                GateRejection::InsufficientCurrency {
                    required: 40,
                    balance: 10
                }
            );
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.ledger.user("alice").unwrap().currency_balance, 10);
    // The sender was told why.
    assert_eq!(harness.replies().len(), 1);
}

#[tokio::test]
async fn at_most_one_module_executes() {
    let (first, first_calls) = recorder_module(
        "first",
        MatchPredicate::Pattern(regex::Regex::new("^hit$").unwrap()),
    );
    let (second, second_calls) = recorder_module(
        "second",
        MatchPredicate::Pattern(regex::Regex::new("^hit$").unwrap()),
    );
    let harness = Harness::new(prefixed_config(), vec![first, second]).await;

    let outcome = harness.dispatch(text_message("alice", "dm", "!hit")).await;

    match outcome {
        DispatchOutcome::Executed { module, failed } => {
            assert_eq!(module, "first");
            assert!(!failed);
        }
        other => panic!("expected execution, got {other:?}"),
    }
    assert_eq!(first_calls.load(Ordering::SeqCst), 1);
    assert_eq!(second_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn successful_run_settles_cost_and_stats() {
    let (module, _) = recorder_module("buy", MatchPredicate::Exact("buy".into()));
    let module = module.cost(ResourceCost {
        currency: 40,
        usage_limit: 2,
        experience_grant: 15,
    });
    let harness = Harness::new(prefixed_config(), vec![module]).await;

    harness
        .ledger
        .update_user("alice", |user| user.currency_balance = 100)
        .await;

    let outcome = harness.dispatch(text_message("alice", "dm", "!buy")).await;
    assert!(matches!(
        outcome,
        DispatchOutcome::Executed { failed: false, .. }
    ));

    let user = harness.ledger.user("alice").unwrap();
    assert_eq!(user.currency_balance, 60);
    assert_eq!(user.usage_limit_balance, 23);
    assert_eq!(user.experience, 15);
    assert!(user.last_command_at.is_some());

    let stats = harness.ledger.command_stats("buy").unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.success, 1);
}

#[tokio::test]
async fn cooldown_drops_rapid_commands_silently() {
    let (module, calls) = recorder_module("ping", MatchPredicate::Exact("ping".into()));
    let mut config = prefixed_config();
    config.dispatch.cooldown_ms = 60_000;
    let mut harness = Harness::new(config, vec![module]).await;

    let first = harness.dispatch(text_message("alice", "dm", "!ping")).await;
    assert!(matches!(first, DispatchOutcome::Executed { .. }));

    let second = harness.dispatch(text_message("alice", "dm", "!ping")).await;
    assert!(matches!(
        second,
        DispatchOutcome::Dropped(DropCause::Cooldown)
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // Exactly one reply: the first execution. The cooldown drop says nothing.
    assert_eq!(harness.replies().len(), 1);
}

#[tokio::test]
async fn moderators_are_cooldown_exempt() {
    let (module, calls) = recorder_module("ping", MatchPredicate::Exact("ping".into()));
    let mut config = prefixed_config();
    config.dispatch.cooldown_ms = 60_000;
    config.roles.moderators = vec!["mod".into()];
    let harness = Harness::new(config, vec![module]).await;

    harness.dispatch(text_message("mod", "dm", "!ping")).await;
    harness.dispatch(text_message("mod", "dm", "!ping")).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn banned_sender_is_dropped_unless_owner() {
    let (module, calls) = recorder_module("ping", MatchPredicate::Exact("ping".into()));
    let mut config = prefixed_config();
    config.roles.owners = vec!["boss".into()];
    let harness = Harness::new(config, vec![module]).await;

    harness
        .ledger
        .update_user("alice", |user| user.banned = true)
        .await;
    harness
        .ledger
        .update_user("boss", |user| user.banned = true)
        .await;

    let outcome = harness.dispatch(text_message("alice", "dm", "!ping")).await;
    assert!(matches!(
        outcome,
        DispatchOutcome::Dropped(DropCause::SenderBanned)
    ));

    let outcome = harness.dispatch(text_message("boss", "dm", "!ping")).await;
    assert!(matches!(outcome, DispatchOutcome::Executed { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn admin_only_chat_drops_non_admin_senders() {
    let (module, calls) = recorder_module("ping", MatchPredicate::Exact("ping".into()));
    let mut config = prefixed_config();
    config.roles.moderators = vec!["mod".into()];
    let mut harness = Harness::new(config, vec![module]).await;

    harness
        .ledger
        .update_chat("room@g.us", |chat| chat.admin_only_mode = true)
        .await;

    let outcome = harness
        .dispatch(text_message("alice", "room@g.us", "!ping"))
        .await;
    assert!(matches!(
        outcome,
        DispatchOutcome::Dropped(DropCause::AdminOnlyChat)
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(harness.replies().is_empty());

    // Group admins and configured moderators still get through.
    let mut from_admin = text_message("carol", "room@g.us", "!ping");
    from_admin.sender_is_admin = true;
    assert!(matches!(
        harness.dispatch(from_admin).await,
        DispatchOutcome::Executed { .. }
    ));
    assert!(matches!(
        harness
            .dispatch(text_message("mod", "room@g.us", "!ping"))
            .await,
        DispatchOutcome::Executed { .. }
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn gate_order_reports_the_earliest_failure() {
    // Both the group gate and the registration gate would fail; the group
    // gate comes first in the fixed order.
    let (module, _) = recorder_module("admin", MatchPredicate::Exact("admin".into()));
    let module = module.permissions(PermissionFlags {
        group_only: true,
        registration_required: true,
        ..PermissionFlags::default()
    });
    let harness = Harness::new(prefixed_config(), vec![module]).await;

    let outcome = harness.dispatch(text_message("alice", "dm", "!admin")).await;
    match outcome {
        DispatchOutcome::Rejected { rejection, .. } => {
            assert_eq!(rejection, GateRejection::GroupOnly);
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn handler_fault_is_isolated_reported_and_redacted() {
    let calls = Arc::new(AtomicU32::new(0));
    let module = CommandModuleDescriptor::new(
        "boom",
        MatchPredicate::Exact("boom".into()),
        Arc::new(Recorder {
            calls: Arc::clone(&calls),
            fail_with: Some("upstream said no: token hunter2"),
        }),
    );
    let mut config = prefixed_config();
    config.secrets = vec!["hunter2".into()];
    let mut harness = Harness::new(config, vec![module]).await;

    let outcome = harness.dispatch(text_message("alice", "dm", "!boom")).await;
    match outcome {
        DispatchOutcome::Executed { module, failed } => {
            assert_eq!(module, "boom");
            assert!(failed);
        }
        other => panic!("expected failed execution, got {other:?}"),
    }

    // The chat reply and the owner notice both exist and neither leaks
    // the secret.
    let replies = harness.replies();
    assert_eq!(replies.len(), 1);
    assert!(!replies[0].contains("hunter2"));

    let notice = harness.notices_rx.try_recv().unwrap();
    assert_eq!(notice.module.as_deref(), Some("boom"));
    assert!(notice.text.contains("[redacted]"));
    assert!(!notice.text.contains("hunter2"));

    // Stats count the failure but not a success.
    let stats = harness.ledger.command_stats("boom").unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.success, 0);
}

#[tokio::test]
async fn before_all_sees_every_message_after_all_only_executed_ones() {
    let before_all = Arc::new(AtomicU32::new(0));
    let after_all = Arc::new(AtomicU32::new(0));
    let module = CommandModuleDescriptor::new(
        "hook",
        MatchPredicate::Exact("hook".into()),
        Arc::new(HookCounter {
            before_all: Arc::clone(&before_all),
            after_all: Arc::clone(&after_all),
        }),
    );
    let harness = Harness::new(prefixed_config(), vec![module]).await;

    // Plain chat: before_all fires, but dispatch never settles a module.
    harness
        .dispatch(text_message("alice", "dm", "just chatting"))
        .await;
    assert_eq!(before_all.load(Ordering::SeqCst), 1);
    assert_eq!(after_all.load(Ordering::SeqCst), 0);

    // An executed command fires both hooks.
    harness.dispatch(text_message("alice", "dm", "!hook")).await;
    assert_eq!(before_all.load(Ordering::SeqCst), 2);
    assert_eq!(after_all.load(Ordering::SeqCst), 1);
}
