//! Command registry: an immutable table of module descriptors behind an
//! atomic swap.
//!
//! Lookup walks the table in insertion order and the first structural
//! match wins, so matching is deterministic. Two modules claiming the
//! same literal command name is a configuration error rejected when the
//! table is built, never resolved silently in favor of one of them.
//!
//! `reload` builds the replacement table completely before swapping it
//! in; a dispatch running concurrently sees either the old table or the
//! new one, never a half-updated mix.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use super::module::CommandModuleDescriptor;

#[derive(Debug, Error)]
pub enum CommandTableError {
    #[error("modules '{first}' and '{second}' both claim command '{command}'")]
    DuplicateCommand {
        command: String,
        first: String,
        second: String,
    },

    #[error("two modules are both named '{0}'")]
    DuplicateModule(String),
}

// ============================================================================
// CommandTable
// ============================================================================

/// An immutable, validated set of command modules.
pub struct CommandTable {
    modules: Vec<Arc<CommandModuleDescriptor>>,
}

impl std::fmt::Debug for CommandTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandTable")
            .field(
                "modules",
                &self.modules.iter().map(|m| &m.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl CommandTable {
    pub fn empty() -> Self {
        Self {
            modules: Vec::new(),
        }
    }

    /// Validate and seal a module set. Rejects duplicate module names and
    /// any literal command name claimed by more than one module, disabled
    /// modules included.
    pub fn build(modules: Vec<CommandModuleDescriptor>) -> Result<Self, CommandTableError> {
        let mut names: HashMap<String, ()> = HashMap::new();
        let mut claimed: HashMap<String, String> = HashMap::new();

        for module in &modules {
            if names.insert(module.name.clone(), ()).is_some() {
                return Err(CommandTableError::DuplicateModule(module.name.clone()));
            }
            for literal in module.predicate.literals() {
                let key = literal.to_ascii_lowercase();
                if let Some(first) = claimed.get(&key) {
                    return Err(CommandTableError::DuplicateCommand {
                        command: key,
                        first: first.clone(),
                        second: module.name.clone(),
                    });
                }
                claimed.insert(key, module.name.clone());
            }
        }

        Ok(Self {
            modules: modules.into_iter().map(Arc::new).collect(),
        })
    }

    /// First enabled module whose predicate matches the command word.
    pub fn find(&self, command: &str) -> Option<Arc<CommandModuleDescriptor>> {
        self.modules
            .iter()
            .find(|m| !m.disabled && m.predicate.matches(command))
            .cloned()
    }

    pub fn modules(&self) -> &[Arc<CommandModuleDescriptor>] {
        &self.modules
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

// ============================================================================
// CommandRegistry
// ============================================================================

/// Shared handle to the current command table.
pub struct CommandRegistry {
    table: RwLock<Arc<CommandTable>>,
}

impl CommandRegistry {
    pub fn new(table: CommandTable) -> Self {
        Self {
            table: RwLock::new(Arc::new(table)),
        }
    }

    pub fn empty() -> Self {
        Self::new(CommandTable::empty())
    }

    /// Snapshot of the current table. Dispatch holds the snapshot for the
    /// whole message, so a concurrent reload never tears a lookup.
    pub async fn table(&self) -> Arc<CommandTable> {
        self.table.read().await.clone()
    }

    /// Replace the table with a freshly validated one. On validation
    /// failure the current table stays in place.
    pub async fn reload(
        &self,
        modules: Vec<CommandModuleDescriptor>,
    ) -> Result<(), CommandTableError> {
        let table = CommandTable::build(modules)?;
        let count = table.len();
        *self.table.write().await = Arc::new(table);
        info!(modules = count, "Command table reloaded");
        Ok(())
    }
}
