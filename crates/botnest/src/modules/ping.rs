//! Liveness check command.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::dispatch::{CommandContext, CommandHandler, CommandModuleDescriptor, MatchPredicate};

pub struct PingHandler {
    started_at: Instant,
}

#[async_trait]
impl CommandHandler for PingHandler {
    async fn execute(&self, ctx: &mut CommandContext) -> anyhow::Result<()> {
        let uptime = self.started_at.elapsed().as_secs();
        ctx.reply(format!("pong ({}h {}m up)", uptime / 3600, (uptime % 3600) / 60))
            .await
    }
}

pub fn descriptor() -> CommandModuleDescriptor {
    CommandModuleDescriptor::new(
        "ping",
        MatchPredicate::Exact("ping".into()),
        Arc::new(PingHandler {
            started_at: Instant::now(),
        }),
    )
}
