//! Owner-only session overview.

use std::sync::Arc;

use async_trait::async_trait;

use crate::dispatch::{
    CommandContext, CommandHandler, CommandModuleDescriptor, MatchPredicate, PermissionFlags,
};
use crate::session::SessionRegistry;

pub struct SessionsHandler {
    registry: Arc<SessionRegistry>,
}

#[async_trait]
impl CommandHandler for SessionsHandler {
    async fn execute(&self, ctx: &mut CommandContext) -> anyhow::Result<()> {
        let mut handles = self.registry.list_active();
        handles.sort_by(|a, b| a.session_id.cmp(&b.session_id));

        if handles.is_empty() {
            ctx.reply("No active sessions.").await?;
            return Ok(());
        }

        let mut lines = vec![format!("{} active session(s):", handles.len())];
        for handle in handles {
            let mut line = format!(
                "- {} [{:?}] {:?}",
                handle.session_id,
                handle.kind,
                handle.state()
            );
            if handle.retry_count() > 0 {
                line.push_str(&format!(" retries={}", handle.retry_count()));
            }
            lines.push(line);
        }
        ctx.reply(lines.join("\n")).await
    }
}

pub fn descriptor(registry: Arc<SessionRegistry>) -> CommandModuleDescriptor {
    CommandModuleDescriptor::new(
        "sessions",
        MatchPredicate::Exact("sessions".into()),
        Arc::new(SessionsHandler { registry }),
    )
    .permissions(PermissionFlags {
        owner_only: true,
        ..PermissionFlags::default()
    })
}
