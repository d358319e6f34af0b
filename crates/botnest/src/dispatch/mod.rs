//! Command dispatch: module descriptors, the command registry, and the
//! per-message pipeline.

pub mod gates;
pub mod module;
pub mod pipeline;
pub mod prefix;
pub mod redact;
pub mod registry;

pub use gates::{GateRejection, RolePolicy};
pub use module::{
    CommandContext, CommandHandler, CommandModuleDescriptor, MatchPredicate, PermissionFlags,
    ResourceCost,
};
pub use pipeline::{DispatchOutcome, DispatchPipeline, DropCause, OwnerNotice};
pub use prefix::PrefixMatcher;
pub use registry::{CommandRegistry, CommandTable, CommandTableError};
