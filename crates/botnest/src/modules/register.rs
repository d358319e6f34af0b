//! User registration command.
//!
//! Registration flips the ledger flag that registration-gated modules
//! check. The optional argument becomes the display name.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::dispatch::{
    CommandContext, CommandHandler, CommandModuleDescriptor, MatchPredicate, ResourceCost,
};

pub struct RegisterHandler;

#[async_trait]
impl CommandHandler for RegisterHandler {
    async fn execute(&self, ctx: &mut CommandContext) -> anyhow::Result<()> {
        let sender = ctx.message.sender.id.clone();
        let record = ctx.ledger.user(&sender);
        if record.map(|r| r.registered).unwrap_or(false) {
            ctx.reply("You are already registered.").await?;
            return Ok(());
        }

        let name = match ctx.args.trim() {
            "" => ctx
                .message
                .sender
                .display_name
                .clone()
                .unwrap_or_else(|| sender.clone()),
            given => given.to_string(),
        };
        let now = Utc::now();

        ctx.ledger
            .update_user(&sender, |user| {
                user.registered = true;
                user.display_name = name.clone();
                user.registered_at = Some(now);
            })
            .await;

        ctx.reply(format!("Registered as {name}.")).await
    }
}

pub fn descriptor() -> CommandModuleDescriptor {
    CommandModuleDescriptor::new(
        "register",
        MatchPredicate::AnyOf(vec!["register".into(), "reg".into(), "verify".into()]),
        Arc::new(RegisterHandler),
    )
    .cost(ResourceCost {
        experience_grant: 50,
        ..ResourceCost::default()
    })
}
