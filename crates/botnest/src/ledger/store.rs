//! Shared persistent ledger for users, chats, and command statistics.
//!
//! Every session's dispatch pipeline reads and writes the same store, so
//! all mutation goes through [`LedgerStore::update_user`] /
//! [`LedgerStore::update_chat`]: the closure runs under that key's lock
//! and the map entry is replaced in one step. Two sessions debiting the
//! same sender concurrently both land.
//!
//! Persistence is a single JSON document, loaded once at startup and
//! flushed on an interval plus once at shutdown. Writes go through a temp
//! file and an atomic rename.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::sync::{KeyedLocks, LockKey};

use super::records::{ChatConfigRecord, CommandStats, UserLedgerRecord};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger document is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// On-disk shape of the ledger. BTreeMaps keep the flushed document
/// stable across runs.
#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerDocument {
    #[serde(default)]
    users: BTreeMap<String, UserLedgerRecord>,
    #[serde(default)]
    chats: BTreeMap<String, ChatConfigRecord>,
    #[serde(default)]
    command_stats: BTreeMap<String, CommandStats>,
}

// ============================================================================
// LedgerStore
// ============================================================================

pub struct LedgerStore {
    path: Option<PathBuf>,
    users: DashMap<String, UserLedgerRecord>,
    chats: DashMap<String, ChatConfigRecord>,
    stats: DashMap<String, CommandStats>,
    write_locks: KeyedLocks,
    dirty: AtomicBool,
}

impl LedgerStore {
    /// Open the store, loading the document at `path` if it exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Arc<Self>, LedgerError> {
        let path = path.into();
        let document = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == ErrorKind::NotFound => LedgerDocument::default(),
            Err(e) => return Err(LedgerError::Io(e)),
        };

        let store = Self::from_document(document, Some(path));
        info!(
            users = store.users.len(),
            chats = store.chats.len(),
            "Ledger loaded"
        );
        Ok(Arc::new(store))
    }

    /// A store with no backing file; `flush` is a no-op.
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self::from_document(LedgerDocument::default(), None))
    }

    fn from_document(document: LedgerDocument, path: Option<PathBuf>) -> Self {
        Self {
            path,
            users: document.users.into_iter().collect(),
            chats: document.chats.into_iter().collect(),
            stats: document.command_stats.into_iter().collect(),
            write_locks: KeyedLocks::new(),
            dirty: AtomicBool::new(false),
        }
    }

    // ------------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------------

    pub fn user(&self, sender_id: &str) -> Option<UserLedgerRecord> {
        self.users.get(sender_id).map(|r| r.clone())
    }

    /// Fetch the sender's record, creating it with schema defaults on
    /// first contact.
    pub async fn ensure_user(&self, sender_id: &str) -> UserLedgerRecord {
        if let Some(record) = self.user(sender_id) {
            return record;
        }
        self.update_user(sender_id, |_| {}).await
    }

    /// Apply `mutate` to the sender's record under that key's write lock.
    /// Absent records are created with defaults first. Returns the record
    /// after mutation.
    pub async fn update_user<F>(&self, sender_id: &str, mutate: F) -> UserLedgerRecord
    where
        F: FnOnce(&mut UserLedgerRecord),
    {
        let _guard = self.write_locks.acquire(LockKey::User(sender_id)).await;

        let mut entry = self.users.entry(sender_id.to_string()).or_default();
        mutate(entry.value_mut());
        let updated = entry.value().clone();
        drop(entry);

        self.dirty.store(true, Ordering::Release);
        updated
    }

    // ------------------------------------------------------------------------
    // Chats
    // ------------------------------------------------------------------------

    pub fn chat(&self, chat_id: &str) -> Option<ChatConfigRecord> {
        self.chats.get(chat_id).map(|r| r.clone())
    }

    pub async fn ensure_chat(&self, chat_id: &str) -> ChatConfigRecord {
        if let Some(record) = self.chat(chat_id) {
            return record;
        }
        self.update_chat(chat_id, |_| {}).await
    }

    pub async fn update_chat<F>(&self, chat_id: &str, mutate: F) -> ChatConfigRecord
    where
        F: FnOnce(&mut ChatConfigRecord),
    {
        let _guard = self.write_locks.acquire(LockKey::Chat(chat_id)).await;

        let mut entry = self.chats.entry(chat_id.to_string()).or_default();
        mutate(entry.value_mut());
        let updated = entry.value().clone();
        drop(entry);

        self.dirty.store(true, Ordering::Release);
        updated
    }

    // ------------------------------------------------------------------------
    // Command statistics
    // ------------------------------------------------------------------------

    pub fn command_stats(&self, name: &str) -> Option<CommandStats> {
        self.stats.get(name).map(|r| r.clone())
    }

    pub async fn update_stats<F>(&self, name: &str, mutate: F)
    where
        F: FnOnce(&mut CommandStats),
    {
        let _guard = self.write_locks.acquire(LockKey::Stats(name)).await;

        let mut entry = self.stats.entry(name.to_string()).or_default();
        mutate(entry.value_mut());
        drop(entry);

        self.dirty.store(true, Ordering::Release);
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    /// Write the document to disk if anything changed since the last
    /// flush. Returns whether a write happened.
    pub fn flush(&self) -> Result<bool, LedgerError> {
        let path = match &self.path {
            Some(p) => p,
            None => return Ok(false),
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }

        let document = LedgerDocument {
            users: self
                .users
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            chats: self
                .chats
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            command_stats: self
                .stats
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        };

        if let Err(e) = self.write_document(path, &document) {
            // Leave the store dirty so the next flush retries
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(true)
    }

    fn write_document(&self, path: &PathBuf, document: &LedgerDocument) -> Result<(), LedgerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_vec_pretty(document)?;
        let temp_path = path.with_extension("json.tmp");
        {
            use std::io::Write;
            let mut file = std::fs::File::create(&temp_path)?;
            file.write_all(&contents)?;
            file.sync_all()?;
        }
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Flush on `interval` until the shutdown signal fires, then flush one
    /// last time.
    pub fn spawn_flush_task(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store.flush() {
                            Ok(true) => debug!("Ledger flushed"),
                            Ok(false) => {}
                            Err(e) => error!(error = %e, "Ledger flush failed"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            if let Err(e) = store.flush() {
                                error!(error = %e, "Final ledger flush failed");
                            }
                            return;
                        }
                    }
                }
            }
        })
    }
}
