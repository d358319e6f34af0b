//! Botnest - a multi-session chat-bot runtime with a shared command
//! dispatch pipeline.

pub mod config;
pub mod credentials;
pub mod dispatch;
pub mod ledger;
pub mod modules;
pub mod session;
pub mod sync;
