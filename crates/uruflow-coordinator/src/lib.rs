//! uruflow-coordinator: Central deployment coordinator
//!
//! Accepts inbound worker connections, authenticates each against the
//! pre-provisioned token table, tracks live sessions in the registry,
//! dispatches commands, and fans in metrics, logs, and alerts.

pub mod alerts;
pub mod deploy;
pub mod registry;
pub mod server;
pub mod session;
pub mod tls;

pub use deploy::{DeploymentService, TriggerError};
pub use registry::Registry;
pub use server::{CoordinatorServer, SendError, ServerError};
pub use session::{AuthError, Hooks, Session, SessionContext};
