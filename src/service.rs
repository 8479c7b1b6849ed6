//! Data structures describing services and their runtime state.
//!
//! This module defines the immutable configuration of a service (`ServiceConfig`),
//! its lifecycle status (`ServiceStatus`), and the runtime snapshot (`RuntimeState`)
//! that supervisors publish whenever the status changes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::SystemTime;

use regex::Regex;

/// Default delay before a service without a ready pattern is considered ready.
pub const DEFAULT_READY_DELAY_MS: u64 = 500;

/// Declaration of a service to be run.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Unique key of the service.
    pub id: String,
    /// Shell command used to start the service.
    pub command: String,
    /// Optional shell command used to ask the service to stop.
    pub stop_command: Option<String>,
    /// Working directory. Inherits the current directory when unset.
    pub cwd: Option<PathBuf>,
    /// Environment overrides, merged over the inherited environment.
    pub env: HashMap<String, String>,
    /// Ids of the services that must be ready before this one starts.
    pub depends_on: Vec<String>,
    /// Stdout pattern that marks the service as ready.
    pub ready_pattern: Option<Regex>,
    /// Delay after the first output before the service counts as ready,
    /// used only when no pattern is configured.
    pub ready_delay_ms: u64,
    /// Whether the service is part of the autostart set.
    pub autostart: bool,
    /// Whether bulk stops leave this service running.
    pub keep_running: bool,
}

impl ServiceConfig {
    /// Creates a config with defaults for everything but the id and command.
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            stop_command: None,
            cwd: None,
            env: HashMap::new(),
            depends_on: Vec::new(),
            ready_pattern: None,
            ready_delay_ms: DEFAULT_READY_DELAY_MS,
            autostart: true,
            keep_running: false,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn ready_pattern(mut self, pattern: Regex) -> Self {
        self.ready_pattern = Some(pattern);
        self
    }

    pub fn ready_delay_ms(mut self, ms: u64) -> Self {
        self.ready_delay_ms = ms;
        self
    }

    pub fn stop_command(mut self, command: impl Into<String>) -> Self {
        self.stop_command = Some(command.into());
        self
    }

    pub fn keep_running(mut self, keep: bool) -> Self {
        self.keep_running = keep;
        self
    }

    pub fn autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }
}

/// The current lifecycle status of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceStatus {
    /// Not running. Initial state, and the state after a requested stop completed.
    Stopped,
    /// A start was requested but dependencies are not ready yet.
    Waiting,
    /// The process is running but has not passed its ready condition.
    Starting,
    /// The process passed its ready condition.
    Ready,
    /// A stop or kill is in progress.
    Stopping,
    /// The process exited on its own, failed to spawn, or refused to terminate.
    Crashed,
}

impl ServiceStatus {
    /// Whether a process is attached in this status.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Starting | Self::Ready | Self::Stopping)
    }

    /// Whether this status ends a lifecycle.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Waiting => "waiting",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
            Self::Crashed => "crashed",
        }
    }
}

/// Runtime state of a single service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeState {
    /// Current lifecycle status.
    pub status: ServiceStatus,
    /// Process ID, present only while a process is attached.
    pub pid: Option<u32>,
    /// Exit code recorded by the last transition to `Stopped` or `Crashed`.
    /// `None` there means the process died from a signal or never spawned.
    pub exit_code: Option<i32>,
    /// Time the current process entered `Starting`.
    pub started_at: Option<SystemTime>,
    /// Dependencies that are not ready yet. Non-empty only while `Waiting`.
    pub waiting_for: Vec<String>,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            status: ServiceStatus::Stopped,
            pid: None,
            exit_code: None,
            started_at: None,
            waiting_for: Vec::new(),
        }
    }
}
