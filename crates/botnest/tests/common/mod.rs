//! Shared fixtures: a scripted connector and message builders.

// Each test binary compiles this module separately and uses a subset.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use botnest::credentials::CredentialBundle;
use botnest::session::{Connection, Connector};
use botnest_protocol::{
    ConnectOptions, ConnectorCommand, ConnectorEvent, InboundMessage, MessageContent, Sender,
};

/// A connector that replays a fixed event script per `connect` call and
/// records every command the supervisor sends back.
pub struct ScriptedConnector {
    scripts: Mutex<VecDeque<Vec<ConnectorEvent>>>,
    sent: Arc<Mutex<Vec<ConnectorCommand>>>,
    connects: AtomicU32,
    credentials_seen: Mutex<Vec<bool>>,
}

impl ScriptedConnector {
    /// One inner vec per expected `connect` call, in order. Extra calls
    /// get an empty script (a connection that never speaks).
    pub fn new(scripts: Vec<Vec<ConnectorEvent>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            sent: Arc::new(Mutex::new(Vec::new())),
            connects: AtomicU32::new(0),
            credentials_seen: Mutex::new(Vec::new()),
        }
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<ConnectorCommand> {
        self.sent.lock().unwrap().clone()
    }

    /// Whether each connect attempt carried credentials.
    pub fn credentials_seen(&self) -> Vec<bool> {
        self.credentials_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(
        &self,
        _session_id: &str,
        credentials: Option<CredentialBundle>,
        _options: ConnectOptions,
    ) -> anyhow::Result<Connection> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.credentials_seen
            .lock()
            .unwrap()
            .push(credentials.is_some());

        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();

        let (evt_tx, evt_rx) = mpsc::channel(64);
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<ConnectorCommand>(64);

        let sent = Arc::clone(&self.sent);
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                sent.lock().unwrap().push(cmd);
            }
        });

        tokio::spawn(async move {
            for event in script {
                if evt_tx.send(event).await.is_err() {
                    return;
                }
            }
            // Hold the channel open so the supervisor sits on a live
            // connection until shutdown or the script's Closed event.
            std::future::pending::<()>().await;
        });

        Ok(Connection {
            events: evt_rx,
            commands: cmd_tx,
        })
    }
}

pub fn text_message(sender: &str, chat_id: &str, text: &str) -> InboundMessage {
    InboundMessage {
        message_id: format!("msg-{}-{}", sender, text.len()),
        chat_id: chat_id.to_string(),
        sender: Sender {
            id: sender.to_string(),
            display_name: None,
        },
        content: MessageContent::Text {
            text: text.to_string(),
        },
        is_group: chat_id.ends_with("@g.us"),
        sender_is_admin: false,
        bot_is_admin: false,
        from_self: false,
        timestamp: None,
    }
}

/// The text payloads of every SendMessage in `sent`, in order.
pub fn sent_texts(sent: &[ConnectorCommand]) -> Vec<String> {
    sent.iter()
        .filter_map(|cmd| match cmd {
            ConnectorCommand::SendMessage { text, .. } => Some(text.clone()),
            _ => None,
        })
        .collect()
}
