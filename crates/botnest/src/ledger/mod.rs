//! Shared persistent ledger: per-user and per-chat records plus command
//! usage statistics.

pub mod records;
pub mod store;

pub use records::{ChatConfigRecord, CommandStats, UserLedgerRecord};
pub use store::{LedgerError, LedgerStore};
