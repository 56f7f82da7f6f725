//! uruflow-worker: Deployment worker daemon
//!
//! A long-lived daemon on each deployment target. Holds one outbound
//! connection to the coordinator, executes deploy commands, streams
//! metrics and container logs, and reconnects with a fixed backoff.

pub mod deploy;
pub mod docker;
pub mod metrics;
pub mod session;
pub mod tls;

pub use deploy::{DeployConfig, DeployError, DeployOutcome, Deployer, GitDeployer, LogLine};
pub use docker::{ContainerRuntime, DockerError, DockerRuntime};
pub use metrics::{SysinfoProbe, SystemProbe};
pub use session::{ConnectError, WorkerSession};
