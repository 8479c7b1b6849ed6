//! Stagehand: run several interdependent local services from one terminal.
//!
//! The crate is built around three pieces:
//!
//! - [`graph`]: dependency graph, cycle detection and start ordering.
//! - [`supervisor`]: one process per service, ready detection and the
//!   SIGINT/SIGTERM/SIGKILL stop ladder.
//! - [`orchestrator`]: starts services once their dependencies are ready and
//!   coordinates bulk shutdown.
//!
//! Everything that happens to a service is reported as a [`ServiceEvent`] on the
//! stream returned by [`OrchestratorHandle::spawn`].

pub mod config;
pub mod error;
pub mod events;
pub mod graph;
pub mod orchestrator;
pub mod output;
pub mod service;
pub mod supervisor;

pub use error::{GraphError, OrchestratorError, SupervisorError};
pub use events::{EventStream, ServiceEvent, SupervisorEvent};
pub use orchestrator::{OrchestratorHandle, StopOutcome};
pub use output::{LogLine, StreamKind};
pub use service::{RuntimeState, ServiceConfig, ServiceStatus};
pub use supervisor::ShutdownConfig;
