//! Session lifecycle: connectors, supervisors, and the registry.

pub mod connector;
pub mod handle;
pub mod registry;
pub mod supervisor;

pub use connector::{Connection, Connector, StdioConnector};
pub use handle::{HandleError, SessionHandle, SessionKind, SessionState};
pub use registry::{ReconcileReport, RegistryError, SessionRegistry, PRIMARY_SESSION_ID};
pub use supervisor::{
    backoff_delay, recovery_action, ActivationTracker, RecoveryAction, SessionSupervisor,
    SupervisorContext,
};
