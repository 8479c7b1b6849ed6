//! Event definitions for the orchestration core.
//!
//! `ServiceEvent` is what the core publishes to its listener: logs, status changes,
//! readiness, and errors, each tagged with the service id. `Envelope` carries the
//! internal inputs (output lines, exits, timer fires) that helper tasks post back
//! to the task owning the supervisors.

use tokio::sync::mpsc;

use crate::error::SupervisorError;
use crate::output::{LogLine, StreamKind};
use crate::service::RuntimeState;

/// Something that happened to one service.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    /// A line of output was received.
    Log(LogLine),
    /// The runtime state changed. Carries the full new state.
    StatusChange(RuntimeState),
    /// The service passed its ready condition.
    Ready,
    /// A failure the caller should surface.
    Error(SupervisorError),
}

/// A `SupervisorEvent` tagged with the service it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceEvent {
    pub service: String,
    pub event: SupervisorEvent,
}

/// Listener side of the event contract.
pub type EventSink = mpsc::UnboundedSender<ServiceEvent>;

/// Receiving end handed to whoever consumes events.
pub type EventStream = mpsc::UnboundedReceiver<ServiceEvent>;

/// Signals used by the stop ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    SigInt,
    SigTerm,
    SigKill,
}

impl ProcessSignal {
    pub fn label(self) -> &'static str {
        match self {
            Self::SigInt => "SIGINT",
            Self::SigTerm => "SIGTERM",
            Self::SigKill => "SIGKILL",
        }
    }
}

/// The two timer slots a supervisor owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    Ready,
    Escalation,
}

/// Inputs posted by helper tasks to the owning task.
#[derive(Debug)]
pub(crate) enum Input {
    /// One line read from stdout or stderr.
    Output { stream: StreamKind, line: String },
    /// The process exited. `None` means it was terminated by a signal.
    Exited { code: Option<i32> },
    /// Waiting on the process failed.
    WaitFailed { error: String },
    /// The configured stop command finished, or could not be waited on.
    StopCommandDone,
    /// A timer slot fired.
    Timer { kind: TimerKind, generation: u64 },
}

/// An `Input` addressed to one supervisor and one process run.
#[derive(Debug)]
pub(crate) struct Envelope {
    pub service: String,
    pub run: u64,
    pub input: Input,
}

pub(crate) type Inbox = mpsc::UnboundedSender<Envelope>;
