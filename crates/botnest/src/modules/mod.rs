//! Built-in command modules.
//!
//! These are the modules every deployment gets; embedders extend the set
//! by appending descriptors before calling `CommandRegistry::reload`.

use std::sync::Arc;

use crate::dispatch::CommandModuleDescriptor;
use crate::session::SessionRegistry;

pub mod ping;
pub mod register;
pub mod sessions;
pub mod sub_bot;

pub fn builtin_modules(registry: Arc<SessionRegistry>) -> Vec<CommandModuleDescriptor> {
    vec![
        ping::descriptor(),
        register::descriptor(),
        sessions::descriptor(Arc::clone(&registry)),
        sub_bot::start_descriptor(Arc::clone(&registry)),
        sub_bot::stop_descriptor(registry),
    ]
}
