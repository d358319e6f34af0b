//! Protocol connector boundary.
//!
//! The wire protocol lives in an external client; the runtime only ever
//! sees typed events and commands. [`StdioConnector`] is the production
//! implementation: one subprocess per connection, JSON lines over stdio.
//! Tests substitute their own [`Connector`] with scripted events.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use botnest_protocol::{ConnectOptions, ConnectorCommand, ConnectorEvent};

use crate::config::ConnectorConfig;
use crate::credentials::CredentialBundle;

/// Channel capacity for events and commands per connection.
const CHANNEL_CAPACITY: usize = 64;

/// One live connection: events in, commands out. Dropping both halves
/// releases the underlying transport.
pub struct Connection {
    pub events: mpsc::Receiver<ConnectorEvent>,
    pub commands: mpsc::Sender<ConnectorCommand>,
}

/// Opens protocol connections for session supervisors.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        session_id: &str,
        credentials: Option<CredentialBundle>,
        options: ConnectOptions,
    ) -> anyhow::Result<Connection>;
}

// ============================================================================
// StdioConnector
// ============================================================================

/// Spawns the configured protocol client process per connection and
/// bridges its stdio to typed channels.
pub struct StdioConnector {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
}

impl StdioConnector {
    pub fn new(config: &ConnectorConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            env: HashMap::new(),
        }
    }
}

#[async_trait]
impl Connector for StdioConnector {
    async fn connect(
        &self,
        session_id: &str,
        credentials: Option<CredentialBundle>,
        options: ConnectOptions,
    ) -> anyhow::Result<Connection> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .envs(&self.env)
            .env("BOTNEST_SESSION_ID", session_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("connector stdin not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("connector stdout not piped"))?;

        let (evt_tx, evt_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_CAPACITY);

        // The first command a client sees carries its options and any
        // stored credentials.
        cmd_tx
            .send(ConnectorCommand::Initialize {
                options,
                credentials: credentials.map(|b| b.raw().clone()),
            })
            .await
            .map_err(|_| anyhow::anyhow!("connector command channel closed at startup"))?;

        let session = session_id.to_string();
        tokio::spawn(bridge(session, child, stdin, stdout, evt_tx, cmd_rx));

        Ok(Connection {
            events: evt_rx,
            commands: cmd_tx,
        })
    }
}

/// Pump stdio until the child exits or both channels close. On child
/// exit, a synthetic `Closed` event with no close code tells the
/// supervisor the transport dropped.
async fn bridge(
    session_id: String,
    mut child: tokio::process::Child,
    mut stdin: tokio::process::ChildStdin,
    stdout: tokio::process::ChildStdout,
    evt_tx: mpsc::Sender<ConnectorEvent>,
    mut cmd_rx: mpsc::Receiver<ConnectorCommand>,
) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => match serde_json::from_str::<ConnectorEvent>(&line) {
                        Ok(event) => {
                            if evt_tx.send(event).await.is_err() {
                                debug!(session_id = %session_id, "Event channel closed");
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(
                                session_id = %session_id,
                                line = %line,
                                error = %e,
                                "Unparseable connector event"
                            );
                        }
                    },
                    Ok(None) => {
                        debug!(session_id = %session_id, "Connector stdout closed");
                        break;
                    }
                    Err(e) => {
                        error!(session_id = %session_id, error = %e, "Error reading connector stdout");
                        break;
                    }
                }
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(command) => {
                        let is_shutdown = matches!(command, ConnectorCommand::Shutdown);
                        match serde_json::to_string(&command) {
                            Ok(json) => {
                                let line = format!("{json}\n");
                                if stdin.write_all(line.as_bytes()).await.is_err()
                                    || stdin.flush().await.is_err()
                                {
                                    error!(session_id = %session_id, "Failed to write to connector stdin");
                                    break;
                                }
                                if is_shutdown {
                                    break;
                                }
                            }
                            Err(e) => {
                                error!(session_id = %session_id, error = %e, "Failed to serialize command");
                            }
                        }
                    }
                    None => {
                        debug!(session_id = %session_id, "Command channel closed");
                        break;
                    }
                }
            }

            status = child.wait() => {
                match status {
                    Ok(status) => debug!(session_id = %session_id, status = %status, "Connector exited"),
                    Err(e) => error!(session_id = %session_id, error = %e, "Error waiting for connector"),
                }
                let _ = evt_tx
                    .send(ConnectorEvent::Closed { code: None, message: None })
                    .await;
                return;
            }
        }
    }

    let _ = child.kill().await;
    let _ = child.wait().await;
    let _ = evt_tx
        .send(ConnectorEvent::Closed {
            code: None,
            message: None,
        })
        .await;
}
