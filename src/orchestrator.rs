//! Coordination of all supervised services.
//!
//! The `Orchestrator` owns one lazily created `ProcessSupervisor` per started
//! service, the set of starts that are waiting on dependencies, and the state of
//! an in-flight `stop_all_and_wait`. It lives inside a single tokio task; callers
//! talk to it through the cloneable [`OrchestratorHandle`].

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{GraphError, OrchestratorError};
use crate::events::{Envelope, EventSink, EventStream, Inbox};
use crate::graph::{filter_order, topological_sort};
use crate::service::{RuntimeState, ServiceConfig, ServiceStatus};
use crate::supervisor::{ProcessSupervisor, ShutdownConfig};

/// Default time `stop_all_and_wait` allows before force-killing.
pub const DEFAULT_STOP_ALL_TIMEOUT_MS: u64 = 15_000;
/// Pause between force-killing leftovers and reporting completion.
pub const KILL_GRACE_MS: u64 = 500;

/// How a `stop_all_and_wait` finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// Every stopped service reached a terminal status before the timeout.
    Drained,
    /// The timeout passed; these services were force-killed.
    ForcedKill { killed: Vec<String> },
    /// The orchestrator was disposed while waiting.
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopPhase {
    Draining,
    Grace,
}

#[derive(Debug)]
struct StopWait {
    phase: StopPhase,
    deadline: Instant,
    targets: Vec<String>,
    killed: Vec<String>,
    waiters: Vec<oneshot::Sender<StopOutcome>>,
}

/// Owns every supervisor and reconciles dependency-gated starts.
#[derive(Debug)]
pub struct Orchestrator {
    services: HashMap<String, Arc<ServiceConfig>>,
    order: Vec<String>,
    shutdown: ShutdownConfig,
    supervisors: HashMap<String, ProcessSupervisor>,
    pending: HashSet<String>,
    restarting: HashSet<String>,
    stop_wait: Option<StopWait>,
    inbox: Inbox,
    events: EventSink,
}

impl Orchestrator {
    /// Validates the dependency graph. A cycle or unknown dependency fails here,
    /// before anything is spawned.
    pub(crate) fn new(
        services: Vec<ServiceConfig>,
        shutdown: ShutdownConfig,
        inbox: Inbox,
        events: EventSink,
    ) -> Result<Self, GraphError> {
        let order: Vec<String> = topological_sort(&services)?
            .into_iter()
            .map(|service| service.id.clone())
            .collect();
        let mut by_id = HashMap::with_capacity(services.len());
        for service in services {
            by_id
                .entry(service.id.clone())
                .or_insert_with(|| Arc::new(service));
        }
        debug!("start order: {}", order.join(", "));
        Ok(Self {
            services: by_id,
            order,
            shutdown,
            supervisors: HashMap::new(),
            pending: HashSet::new(),
            restarting: HashSet::new(),
            stop_wait: None,
            inbox,
            events,
        })
    }

    pub fn status_of(&self, id: &str) -> ServiceStatus {
        self.supervisors
            .get(id)
            .map(ProcessSupervisor::status)
            .unwrap_or(ServiceStatus::Stopped)
    }

    /// Starts `id` now if all of its dependencies are ready, otherwise parks it
    /// in `Waiting` until they are.
    pub fn start_service(&mut self, id: &str) {
        if !self.services.contains_key(id) {
            warn!("ignoring start of unknown service {}", id);
            return;
        }
        let missing = self.missing_dependencies(id);
        let Some(supervisor) = self.supervisor_mut(id) else {
            return;
        };
        if supervisor.is_attached() {
            debug!("{} is already running", id);
            return;
        }
        if missing.is_empty() {
            supervisor.start();
            self.pending.remove(id);
        } else {
            info!("{} waiting for {}", id, missing.join(", "));
            supervisor.mark_waiting(missing);
            self.pending.insert(id.to_string());
        }
    }

    /// Starts `ids` in dependency order. Unknown ids are ignored.
    pub fn start_services<S: AsRef<str>>(&mut self, ids: &[S]) {
        for id in ids {
            if !self.services.contains_key(id.as_ref()) {
                warn!("ignoring start of unknown service {}", id.as_ref());
            }
        }
        for id in filter_order(&self.order, ids) {
            self.start_service(&id);
        }
    }

    pub fn start_all(&mut self) {
        for id in self.order.clone() {
            self.start_service(&id);
        }
    }

    /// Starts every service configured with `autostart`.
    pub fn start_autostart(&mut self) {
        let ids: Vec<String> = self
            .order
            .iter()
            .filter(|id| self.services.get(*id).is_some_and(|config| config.autostart))
            .cloned()
            .collect();
        for id in ids {
            self.start_service(&id);
        }
    }

    /// Stops `id`. A start still waiting on dependencies is cancelled instead.
    pub fn stop_service(&mut self, id: &str) {
        self.restarting.remove(id);
        let cancelled = self.pending.remove(id);
        if let Some(supervisor) = self.supervisors.get_mut(id) {
            if cancelled {
                info!("cancelled pending start of {}", id);
                supervisor.cancel_waiting();
            }
            supervisor.stop();
        }
    }

    pub fn kill_service(&mut self, id: &str) {
        self.restarting.remove(id);
        let cancelled = self.pending.remove(id);
        if let Some(supervisor) = self.supervisors.get_mut(id) {
            if cancelled {
                supervisor.cancel_waiting();
            }
            supervisor.kill();
        }
    }

    /// Stops a running service and starts it again once it has exited.
    pub fn restart_service(&mut self, id: &str) {
        if !self.services.contains_key(id) {
            warn!("ignoring restart of unknown service {}", id);
            return;
        }
        let attached = self
            .supervisors
            .get(id)
            .is_some_and(ProcessSupervisor::is_attached);
        if !attached {
            self.start_service(id);
            return;
        }
        info!("restarting {}", id);
        self.restarting.insert(id.to_string());
        if let Some(supervisor) = self.supervisors.get_mut(id) {
            supervisor.stop();
        }
    }

    /// Stops every service except `keep_running` ones, dependents first.
    pub fn stop_all(&mut self) {
        let ids: Vec<String> = self
            .order
            .iter()
            .rev()
            .filter(|id| self.supervisors.contains_key(*id))
            .filter(|id| self.services.get(*id).is_some_and(|config| !config.keep_running))
            .cloned()
            .collect();
        info!("stopping {} service(s)", ids.len());
        for id in ids {
            self.stop_service(&id);
        }
    }

    /// Stops everything like [`stop_all`](Self::stop_all) and reports through
    /// `done` once every managed service is down. Whatever is still up after
    /// `timeout`, `keep_running` services included, is force-killed. A call
    /// during an in-flight wait joins it.
    pub fn stop_all_and_wait(&mut self, timeout: Duration, done: oneshot::Sender<StopOutcome>) {
        self.stop_all();
        if let Some(wait) = self.stop_wait.as_mut() {
            debug!("joining in-flight stop-all");
            wait.waiters.push(done);
            return;
        }
        let targets: Vec<String> = self
            .order
            .iter()
            .filter(|id| self.supervisors.contains_key(*id))
            .filter(|id| !self.status_of(id).is_terminal())
            .cloned()
            .collect();
        self.stop_wait = Some(StopWait {
            phase: StopPhase::Draining,
            deadline: Instant::now() + timeout,
            targets,
            killed: Vec::new(),
            waiters: vec![done],
        });
        self.check_stop_wait();
    }

    /// State of every configured service, in start order.
    pub fn snapshot(&self) -> Vec<(String, RuntimeState)> {
        self.order
            .iter()
            .map(|id| {
                let state = self
                    .supervisors
                    .get(id)
                    .map(|supervisor| supervisor.state().clone())
                    .unwrap_or_default();
                (id.clone(), state)
            })
            .collect()
    }

    /// Tears everything down. Waiters of a pending stop-all get `Interrupted`.
    pub fn dispose(&mut self) {
        if let Some(wait) = self.stop_wait.take() {
            for waiter in wait.waiters {
                let _ = waiter.send(StopOutcome::Interrupted);
            }
        }
        for supervisor in self.supervisors.values_mut() {
            supervisor.dispose();
        }
        self.supervisors.clear();
        self.pending.clear();
        self.restarting.clear();
    }

    pub(crate) fn handle_input(&mut self, envelope: Envelope) {
        let Envelope {
            service,
            run,
            input,
        } = envelope;
        let Some(supervisor) = self.supervisors.get_mut(&service) else {
            return;
        };
        let before = supervisor.status();
        supervisor.handle(run, input);
        let after = supervisor.status();
        if before == after {
            return;
        }
        if after == ServiceStatus::Ready {
            self.reconcile();
        } else if after.is_terminal() && self.restarting.remove(&service) {
            self.start_service(&service);
        }
    }

    // Re-check every waiting start after a service became ready.
    fn reconcile(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let waiting: Vec<String> = self
            .order
            .iter()
            .filter(|id| self.pending.contains(*id))
            .cloned()
            .collect();
        for id in waiting {
            let missing = self.missing_dependencies(&id);
            let Some(supervisor) = self.supervisors.get_mut(&id) else {
                self.pending.remove(&id);
                continue;
            };
            if missing.is_empty() {
                info!("dependencies of {} are ready", id);
                supervisor.start();
                self.pending.remove(&id);
            } else {
                supervisor.mark_waiting(missing);
            }
        }
    }

    fn missing_dependencies(&self, id: &str) -> Vec<String> {
        let Some(config) = self.services.get(id) else {
            return Vec::new();
        };
        config
            .depends_on
            .iter()
            .filter(|dep| self.status_of(dep) != ServiceStatus::Ready)
            .cloned()
            .collect()
    }

    fn supervisor_mut(&mut self, id: &str) -> Option<&mut ProcessSupervisor> {
        let config = self.services.get(id)?;
        let supervisor = self.supervisors.entry(id.to_string()).or_insert_with(|| {
            ProcessSupervisor::new(
                Arc::clone(config),
                self.shutdown,
                self.inbox.clone(),
                self.events.clone(),
            )
        });
        Some(supervisor)
    }

    fn stop_deadline(&self) -> Option<Instant> {
        self.stop_wait.as_ref().map(|wait| wait.deadline)
    }

    fn check_stop_wait(&mut self) {
        let drained = match &self.stop_wait {
            Some(wait) if wait.phase == StopPhase::Draining => wait
                .targets
                .iter()
                .all(|id| self.status_of(id).is_terminal()),
            _ => false,
        };
        if drained {
            info!("all services stopped");
            self.finish_stop_wait(StopOutcome::Drained);
        }
    }

    fn on_stop_deadline(&mut self) {
        let Some(phase) = self.stop_wait.as_ref().map(|wait| wait.phase) else {
            return;
        };
        match phase {
            StopPhase::Draining => {
                let stuck: Vec<String> = self
                    .stop_wait
                    .as_ref()
                    .map(|wait| {
                        wait.targets
                            .iter()
                            .filter(|id| !self.status_of(id).is_terminal())
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                warn!("stop timed out, killing {}", stuck.join(", "));
                for id in &stuck {
                    self.kill_service(id);
                }
                if let Some(wait) = self.stop_wait.as_mut() {
                    wait.phase = StopPhase::Grace;
                    wait.deadline = Instant::now() + Duration::from_millis(KILL_GRACE_MS);
                    wait.killed = stuck;
                }
            }
            StopPhase::Grace => {
                let killed = self
                    .stop_wait
                    .as_mut()
                    .map(|wait| std::mem::take(&mut wait.killed))
                    .unwrap_or_default();
                self.finish_stop_wait(StopOutcome::ForcedKill { killed });
            }
        }
    }

    fn finish_stop_wait(&mut self, outcome: StopOutcome) {
        if let Some(wait) = self.stop_wait.take() {
            for waiter in wait.waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbox: mpsc::UnboundedReceiver<Envelope>,
    ) {
        loop {
            let deadline = self.stop_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if self.execute(command).is_break() {
                            break;
                        }
                    }
                    None => {
                        debug!("all handles dropped, shutting down");
                        self.dispose();
                        break;
                    }
                },
                Some(envelope) = inbox.recv() => self.handle_input(envelope),
                _ = sleep_until_opt(deadline) => self.on_stop_deadline(),
            }
            self.check_stop_wait();
        }
    }

    fn execute(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Start(id) => self.start_service(&id),
            Command::StartMany(ids) => self.start_services(&ids),
            Command::StartAll => self.start_all(),
            Command::StartAutostart => self.start_autostart(),
            Command::Stop(id) => self.stop_service(&id),
            Command::Kill(id) => self.kill_service(&id),
            Command::Restart(id) => self.restart_service(&id),
            Command::StopAll => self.stop_all(),
            Command::StopAllAndWait { timeout, done } => self.stop_all_and_wait(timeout, done),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Dispose(ack) => {
                self.dispose();
                let _ = ack.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

#[derive(Debug)]
enum Command {
    Start(String),
    StartMany(Vec<String>),
    StartAll,
    StartAutostart,
    Stop(String),
    Kill(String),
    Restart(String),
    StopAll,
    StopAllAndWait {
        timeout: Duration,
        done: oneshot::Sender<StopOutcome>,
    },
    Snapshot(oneshot::Sender<Vec<(String, RuntimeState)>>),
    Dispose(oneshot::Sender<()>),
}

/// Cloneable front end of a running orchestrator task.
///
/// Every operation returns immediately; outcomes arrive on the [`EventStream`]
/// returned by [`spawn`](Self::spawn). When the last handle is dropped the task
/// disposes all services and exits.
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl OrchestratorHandle {
    /// Validates `services` and spawns the orchestrator task. Must be called
    /// from within a tokio runtime.
    pub fn spawn(
        services: Vec<ServiceConfig>,
        shutdown: ShutdownConfig,
    ) -> Result<(Self, EventStream), OrchestratorError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let orchestrator = Orchestrator::new(services, shutdown, inbox_tx, events_tx)?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        tokio::spawn(orchestrator.run(commands_rx, inbox_rx));
        Ok((
            Self {
                commands: commands_tx,
            },
            events_rx,
        ))
    }

    pub fn start_service(&self, id: impl Into<String>) {
        self.send(Command::Start(id.into()));
    }

    pub fn start_services<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.send(Command::StartMany(ids.into_iter().map(Into::into).collect()));
    }

    pub fn start_all(&self) {
        self.send(Command::StartAll);
    }

    pub fn start_autostart(&self) {
        self.send(Command::StartAutostart);
    }

    pub fn stop_service(&self, id: impl Into<String>) {
        self.send(Command::Stop(id.into()));
    }

    pub fn kill_service(&self, id: impl Into<String>) {
        self.send(Command::Kill(id.into()));
    }

    pub fn restart_service(&self, id: impl Into<String>) {
        self.send(Command::Restart(id.into()));
    }

    pub fn stop_all(&self) {
        self.send(Command::StopAll);
    }

    /// Completes exactly once with the outcome. If the orchestrator is already
    /// gone the receiver reports a closed channel.
    pub fn stop_all_and_wait(&self, timeout: Duration) -> oneshot::Receiver<StopOutcome> {
        let (done, outcome) = oneshot::channel();
        self.send(Command::StopAllAndWait { timeout, done });
        outcome
    }

    pub async fn snapshot(&self) -> Result<Vec<(String, RuntimeState)>, OrchestratorError> {
        let (reply, snapshot) = oneshot::channel();
        self.commands
            .send(Command::Snapshot(reply))
            .map_err(|_| OrchestratorError::Closed)?;
        snapshot.await.map_err(|_| OrchestratorError::Closed)
    }

    /// Kills every process and stops the orchestrator task.
    pub async fn dispose(&self) -> Result<(), OrchestratorError> {
        let (ack, acked) = oneshot::channel();
        self.commands
            .send(Command::Dispose(ack))
            .map_err(|_| OrchestratorError::Closed)?;
        acked.await.map_err(|_| OrchestratorError::Closed)
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("orchestrator is no longer running");
        }
    }
}
