//! Per-service process supervision.
//!
//! A `ProcessSupervisor` owns one service's OS process, drives its status through
//! `Starting -> Ready -> Stopping -> Stopped` (or `Crashed`), detects readiness, and
//! walks the stop ladder (stop command or SIGINT, then SIGTERM, then SIGKILL).
//!
//! The supervisor never blocks. Helper tasks read output, wait for the exit, and run
//! timers; they report back by posting an `Envelope` to the inbox, and the owner of
//! the supervisor feeds each one into [`ProcessSupervisor::handle`]. All state changes
//! therefore happen on the task that owns the supervisor.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::SupervisorError;
use crate::events::{
    Envelope, EventSink, Inbox, Input, ProcessSignal, ServiceEvent, SupervisorEvent, TimerKind,
};
use crate::output::{decode_line, LogLine, StreamKind};
use crate::service::{RuntimeState, ServiceConfig, ServiceStatus};

/// Time allowed after the graceful step and after SIGTERM before escalating.
pub const SIGTERM_TIMEOUT_MS: u64 = 5000;
/// Time allowed after SIGKILL before the process is declared stuck.
pub const SIGKILL_TIMEOUT_MS: u64 = 2000;

/// Timeouts of the stop ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownConfig {
    sigterm_ms: u64,
    sigkill_ms: u64,
}

impl ShutdownConfig {
    pub fn new(sigterm_ms: u64, sigkill_ms: u64) -> Self {
        Self {
            sigterm_ms,
            sigkill_ms,
        }
    }

    fn sigterm_timeout(&self) -> Duration {
        Duration::from_millis(self.sigterm_ms)
    }

    fn sigkill_timeout(&self) -> Duration {
        Duration::from_millis(self.sigkill_ms)
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self::new(SIGTERM_TIMEOUT_MS, SIGKILL_TIMEOUT_MS)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopStage {
    /// Stop command running, or SIGINT sent.
    Graceful,
    /// SIGTERM sent.
    Terminate,
    /// SIGKILL sent.
    Kill,
}

// A cancellable one-shot timer. Only the most recently armed generation counts.
#[derive(Debug)]
struct TimerSlot {
    kind: TimerKind,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl TimerSlot {
    fn new(kind: TimerKind) -> Self {
        Self {
            kind,
            generation: 0,
            task: None,
        }
    }

    fn arm(&mut self, after: Duration, service: &str, run: u64, inbox: &Inbox) {
        self.cancel();
        self.generation += 1;
        let generation = self.generation;
        let kind = self.kind;
        let service = service.to_string();
        let inbox = inbox.clone();
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = inbox.send(Envelope {
                service,
                run,
                input: Input::Timer { kind, generation },
            });
        }));
    }

    fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Consumes a fire. Returns `false` for fires of cancelled or replaced timers.
    fn fire(&mut self, generation: u64) -> bool {
        if self.task.is_some() && self.generation == generation {
            self.task = None;
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
struct AttachedProcess {
    pid: u32,
    kill_switch: Option<oneshot::Sender<()>>,
}

/// Supervises the process of a single service.
#[derive(Debug)]
pub struct ProcessSupervisor {
    config: Arc<ServiceConfig>,
    shutdown: ShutdownConfig,
    state: RuntimeState,
    process: Option<AttachedProcess>,
    run: u64,
    ready_armed: bool,
    ready_timer: TimerSlot,
    escalation: TimerSlot,
    stage: Option<StopStage>,
    inbox: Inbox,
    events: Option<EventSink>,
}

impl ProcessSupervisor {
    pub(crate) fn new(
        config: Arc<ServiceConfig>,
        shutdown: ShutdownConfig,
        inbox: Inbox,
        events: EventSink,
    ) -> Self {
        Self {
            config,
            shutdown,
            state: RuntimeState::default(),
            process: None,
            run: 0,
            ready_armed: false,
            ready_timer: TimerSlot::new(TimerKind::Ready),
            escalation: TimerSlot::new(TimerKind::Escalation),
            stage: None,
            inbox,
            events: Some(events),
        }
    }

    pub fn status(&self) -> ServiceStatus {
        self.state.status
    }

    pub fn state(&self) -> &RuntimeState {
        &self.state
    }

    /// Whether an OS process is currently attached.
    pub fn is_attached(&self) -> bool {
        self.process.is_some()
    }

    /// Spawns the service command under a shell. No-op if a process is attached.
    ///
    /// Spawn failures are reported as a `Crashed` status plus an error event.
    pub fn start(&mut self) {
        if self.process.is_some() {
            debug!("{} already has a process, ignoring start", self.config.id);
            return;
        }
        self.run += 1;
        self.ready_armed = false;
        self.stage = None;
        self.ready_timer.cancel();
        self.escalation.cancel();

        let mut command = shell_command(&self.config.command);
        self.configure(&mut command);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command.kill_on_drop(true);
        own_process_group(&mut command);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!("failed to spawn {}: {}", self.config.id, err);
                self.state.exit_code = None;
                self.transition(ServiceStatus::Crashed);
                self.emit(SupervisorEvent::Error(SupervisorError::Spawn {
                    service: self.config.id.clone(),
                    reason: err.to_string(),
                }));
                return;
            }
        };
        let pid = child.id().unwrap_or(0);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_lines(
                self.config.id.clone(),
                self.run,
                StreamKind::Stdout,
                stdout,
                self.inbox.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(read_lines(
                self.config.id.clone(),
                self.run,
                StreamKind::Stderr,
                stderr,
                self.inbox.clone(),
            ));
        }
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(wait_for_exit(
            child,
            kill_rx,
            self.config.id.clone(),
            self.run,
            self.inbox.clone(),
        ));
        self.process = Some(AttachedProcess {
            pid,
            kill_switch: Some(kill_tx),
        });

        info!("started {} (pid {})", self.config.id, pid);
        self.state.pid = Some(pid);
        self.state.exit_code = None;
        self.state.started_at = Some(SystemTime::now());
        self.transition(ServiceStatus::Starting);
    }

    /// Begins the stop ladder. No-op without a process or when already stopping.
    pub fn stop(&mut self) {
        let Some(pid) = self.pid() else {
            return;
        };
        if self.stage.is_some() {
            debug!("{} is already stopping", self.config.id);
            return;
        }
        self.ready_timer.cancel();
        self.transition(ServiceStatus::Stopping);
        self.stage = Some(StopStage::Graceful);

        match self.config.stop_command.clone() {
            Some(stop_command) => self.run_stop_command(&stop_command),
            None => self.send_signal(pid, ProcessSignal::SigInt),
        }
        if self.stage == Some(StopStage::Graceful) {
            self.escalation.arm(
                self.shutdown.sigterm_timeout(),
                &self.config.id,
                self.run,
                &self.inbox,
            );
        }
    }

    /// Sends SIGKILL right away. No-op without a process.
    pub fn kill(&mut self) {
        if self.process.is_none() || self.stage == Some(StopStage::Kill) {
            return;
        }
        self.ready_timer.cancel();
        self.escalation.cancel();
        if self.state.status != ServiceStatus::Stopping {
            self.transition(ServiceStatus::Stopping);
        }
        self.force_kill();
    }

    /// Tears the supervisor down: timers cleared, process killed without
    /// escalation, listener detached. Safe to call more than once.
    pub fn dispose(&mut self) {
        self.ready_timer.cancel();
        self.escalation.cancel();
        self.stage = None;
        if let Some(mut process) = self.process.take() {
            debug!("disposing {} (pid {})", self.config.id, process.pid);
            send_os_signal(process.pid, ProcessSignal::SigKill);
            if let Some(kill_switch) = process.kill_switch.take() {
                let _ = kill_switch.send(());
            }
        }
        self.events = None;
    }

    /// Puts a not-yet-spawned service into `Waiting` on the given dependencies.
    pub(crate) fn mark_waiting(&mut self, waiting_for: Vec<String>) {
        if self.process.is_some() {
            return;
        }
        if self.state.status == ServiceStatus::Waiting && self.state.waiting_for == waiting_for {
            return;
        }
        self.state.exit_code = None;
        self.state.waiting_for = waiting_for;
        self.transition(ServiceStatus::Waiting);
    }

    /// Returns a `Waiting` service to `Stopped`.
    pub(crate) fn cancel_waiting(&mut self) {
        if self.state.status == ServiceStatus::Waiting {
            self.transition(ServiceStatus::Stopped);
        }
    }

    /// Applies one input posted by a helper task of run `run`.
    pub(crate) fn handle(&mut self, run: u64, input: Input) {
        let current = run == self.run;
        match input {
            Input::Output { stream, line } => self.on_output(current, stream, line),
            Input::Exited { code } if current => self.on_exit(code),
            Input::WaitFailed { error } if current => self.on_wait_failed(error),
            Input::StopCommandDone if current => {
                if self.stage == Some(StopStage::Graceful) {
                    debug!("stop command for {} finished", self.config.id);
                    self.terminate();
                }
            }
            Input::Timer { kind, generation } if current => self.on_timer(kind, generation),
            input => trace!("{}: dropping {:?} from run {}", self.config.id, input, run),
        }
    }

    fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|process| process.pid)
    }

    fn configure(&self, command: &mut Command) {
        if let Some(cwd) = &self.config.cwd {
            command.current_dir(cwd);
        }
        if !self.config.env.is_empty() {
            command.envs(&self.config.env);
        }
    }

    fn on_output(&mut self, current: bool, stream: StreamKind, line: String) {
        let became_ready = current
            && self.state.status == ServiceStatus::Starting
            && match &self.config.ready_pattern {
                Some(pattern) => stream == StreamKind::Stdout && pattern.is_match(&line),
                None => {
                    if !self.ready_armed {
                        self.ready_armed = true;
                        self.ready_timer.arm(
                            Duration::from_millis(self.config.ready_delay_ms),
                            &self.config.id,
                            self.run,
                            &self.inbox,
                        );
                    }
                    false
                }
            };
        self.emit(SupervisorEvent::Log(LogLine::new(line, stream)));
        if became_ready {
            self.become_ready();
        }
    }

    fn on_timer(&mut self, kind: TimerKind, generation: u64) {
        match kind {
            TimerKind::Ready => {
                if self.ready_timer.fire(generation)
                    && self.state.status == ServiceStatus::Starting
                {
                    self.become_ready();
                }
            }
            TimerKind::Escalation => {
                if !self.escalation.fire(generation) {
                    return;
                }
                match self.stage {
                    Some(StopStage::Graceful) => self.terminate(),
                    Some(StopStage::Terminate) => self.force_kill(),
                    Some(StopStage::Kill) => self.fail_termination(),
                    None => {}
                }
            }
        }
    }

    fn become_ready(&mut self) {
        self.ready_timer.cancel();
        info!("{} is ready", self.config.id);
        self.transition(ServiceStatus::Ready);
        self.emit(SupervisorEvent::Ready);
    }

    fn on_exit(&mut self, code: Option<i32>) {
        if self.process.take().is_none() {
            return;
        }
        self.ready_timer.cancel();
        self.escalation.cancel();
        self.stage = None;
        self.state.exit_code = code;
        if self.state.status == ServiceStatus::Stopping {
            info!("{} stopped (exit code {:?})", self.config.id, code);
            self.transition(ServiceStatus::Stopped);
        } else {
            warn!("{} exited unexpectedly (exit code {:?})", self.config.id, code);
            self.transition(ServiceStatus::Crashed);
        }
    }

    fn on_wait_failed(&mut self, reason: String) {
        if self.process.take().is_none() {
            return;
        }
        self.ready_timer.cancel();
        self.escalation.cancel();
        self.stage = None;
        error!("lost track of {}: {}", self.config.id, reason);
        self.state.exit_code = None;
        self.transition(ServiceStatus::Crashed);
        self.emit(SupervisorEvent::Error(SupervisorError::Wait {
            service: self.config.id.clone(),
            reason,
        }));
    }

    // Run an optional stop command. Its exit moves the ladder on to SIGTERM.
    fn run_stop_command(&mut self, stop_command: &str) {
        let mut command = shell_command(stop_command);
        self.configure(&mut command);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        match command.spawn() {
            Ok(mut child) => {
                debug!("running stop command for {}", self.config.id);
                let inbox = self.inbox.clone();
                let service = self.config.id.clone();
                let run = self.run;
                tokio::spawn(async move {
                    let _ = child.wait().await;
                    let _ = inbox.send(Envelope {
                        service,
                        run,
                        input: Input::StopCommandDone,
                    });
                });
            }
            Err(err) => {
                warn!("stop command for {} failed to spawn: {}", self.config.id, err);
                self.terminate();
            }
        }
    }

    fn terminate(&mut self) {
        let Some(pid) = self.pid() else {
            return;
        };
        self.stage = Some(StopStage::Terminate);
        self.send_signal(pid, ProcessSignal::SigTerm);
        self.escalation.arm(
            self.shutdown.sigterm_timeout(),
            &self.config.id,
            self.run,
            &self.inbox,
        );
    }

    fn force_kill(&mut self) {
        let Some(process) = self.process.as_mut() else {
            return;
        };
        let pid = process.pid;
        let kill_switch = process.kill_switch.take();
        self.stage = Some(StopStage::Kill);
        self.send_signal(pid, ProcessSignal::SigKill);
        if let Some(kill_switch) = kill_switch {
            let _ = kill_switch.send(());
        }
        self.escalation.arm(
            self.shutdown.sigkill_timeout(),
            &self.config.id,
            self.run,
            &self.inbox,
        );
    }

    fn fail_termination(&mut self) {
        let Some(process) = self.process.take() else {
            return;
        };
        self.stage = None;
        error!(
            "{} (pid {}) is still alive after SIGKILL",
            self.config.id, process.pid
        );
        self.state.exit_code = None;
        self.transition(ServiceStatus::Crashed);
        self.emit(SupervisorEvent::Error(SupervisorError::Termination {
            service: self.config.id.clone(),
            pid: process.pid,
        }));
    }

    fn send_signal(&self, pid: u32, signal: ProcessSignal) {
        info!("sending {} to {} (pid {})", signal.label(), self.config.id, pid);
        send_os_signal(pid, signal);
    }

    fn transition(&mut self, status: ServiceStatus) {
        self.state.status = status;
        if status != ServiceStatus::Waiting {
            self.state.waiting_for.clear();
        }
        if !status.is_running() {
            self.state.pid = None;
            self.state.started_at = None;
        }
        debug!("{} -> {}", self.config.id, status.label());
        self.emit(SupervisorEvent::StatusChange(self.state.clone()));
    }

    fn emit(&self, event: SupervisorEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(ServiceEvent {
                service: self.config.id.clone(),
                event,
            });
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn shell_command(script: &str) -> Command {
    #[cfg(windows)]
    {
        let mut command = Command::new("cmd");
        command.arg("/C").arg(script);
        command
    }
    #[cfg(not(windows))]
    {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }
}

fn own_process_group(command: &mut Command) {
    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
        command.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }
}

#[cfg(unix)]
fn send_os_signal(pid: u32, signal: ProcessSignal) {
    // pid 0 would address our own process group.
    if pid == 0 {
        return;
    }
    unsafe {
        let sig = match signal {
            ProcessSignal::SigInt => libc::SIGINT,
            ProcessSignal::SigTerm => libc::SIGTERM,
            ProcessSignal::SigKill => libc::SIGKILL,
        };
        let pid = pid as i32;
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(windows)]
fn send_os_signal(pid: u32, signal: ProcessSignal) {
    use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
    use windows_sys::Win32::System::Console::CTRL_BREAK_EVENT;
    // SIGKILL goes through the kill switch; the soft signals map to CTRL_BREAK.
    if pid == 0 || signal == ProcessSignal::SigKill {
        return;
    }
    unsafe {
        let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
    }
}

#[cfg(all(not(unix), not(windows)))]
fn send_os_signal(_pid: u32, _signal: ProcessSignal) {}

async fn read_lines<R>(service: String, run: u64, stream: StreamKind, reader: R, inbox: Inbox)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let envelope = Envelope {
                    service: service.clone(),
                    run,
                    input: Input::Output {
                        stream,
                        line: decode_line(&buf),
                    },
                };
                if inbox.send(envelope).is_err() {
                    break;
                }
            }
        }
    }
}

async fn wait_for_exit(
    mut child: Child,
    mut kill_switch: oneshot::Receiver<()>,
    service: String,
    run: u64,
    inbox: Inbox,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = &mut kill_switch => {
            let _ = child.start_kill();
            child.wait().await
        }
    };
    let input = match status {
        Ok(status) => Input::Exited {
            code: status.code(),
        },
        Err(err) => Input::WaitFailed {
            error: err.to_string(),
        },
    };
    let _ = inbox.send(Envelope {
        service,
        run,
        input,
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use regex::Regex;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    struct Harness {
        supervisor: ProcessSupervisor,
        inbox: mpsc::UnboundedReceiver<Envelope>,
        events: mpsc::UnboundedReceiver<ServiceEvent>,
        seen: Vec<SupervisorEvent>,
    }

    impl Harness {
        fn new(config: ServiceConfig, shutdown: ShutdownConfig) -> Self {
            let (inbox_tx, inbox) = mpsc::unbounded_channel();
            let (events_tx, events) = mpsc::unbounded_channel();
            let supervisor =
                ProcessSupervisor::new(Arc::new(config), shutdown, inbox_tx, events_tx);
            Self {
                supervisor,
                inbox,
                events,
                seen: Vec::new(),
            }
        }

        fn quick(config: ServiceConfig) -> Self {
            Self::new(config, ShutdownConfig::new(200, 500))
        }

        fn drain(&mut self) {
            while let Ok(event) = self.events.try_recv() {
                self.seen.push(event.event);
            }
        }

        // Feed inputs into the supervisor until `done` holds or `limit` passes.
        async fn pump_until(&mut self, limit: Duration, done: impl Fn(&Harness) -> bool) -> bool {
            let deadline = Instant::now() + limit;
            loop {
                self.drain();
                if done(self) {
                    return true;
                }
                match tokio::time::timeout_at(deadline, self.inbox.recv()).await {
                    Ok(Some(envelope)) => self.supervisor.handle(envelope.run, envelope.input),
                    _ => return false,
                }
            }
        }

        fn status(&self) -> ServiceStatus {
            self.supervisor.status()
        }

        fn logs(&self) -> Vec<String> {
            self.seen
                .iter()
                .filter_map(|event| match event {
                    SupervisorEvent::Log(line) => Some(line.text.clone()),
                    _ => None,
                })
                .collect()
        }

        fn has_log(&self, text: &str) -> bool {
            self.logs().iter().any(|line| line == text)
        }

        fn statuses(&self) -> Vec<ServiceStatus> {
            self.seen
                .iter()
                .filter_map(|event| match event {
                    SupervisorEvent::StatusChange(state) => Some(state.status),
                    _ => None,
                })
                .collect()
        }

        fn errors(&self) -> Vec<SupervisorError> {
            self.seen
                .iter()
                .filter_map(|event| match event {
                    SupervisorEvent::Error(err) => Some(err.clone()),
                    _ => None,
                })
                .collect()
        }

        fn ready_events(&self) -> usize {
            self.seen
                .iter()
                .filter(|event| matches!(event, SupervisorEvent::Ready))
                .count()
        }
    }

    const TRAP_INT: &str =
        "trap 'echo got INT; exit 0' INT; echo up; while true; do sleep 0.05; done";
    const IGNORE_INT_TRAP_TERM: &str = "trap 'echo got INT' INT; trap 'echo got TERM; exit 0' TERM; echo up; while true; do sleep 0.05; done";
    const IGNORE_ALL: &str = "trap '' INT TERM; echo up; while true; do sleep 0.05; done";

    #[tokio::test]
    async fn ready_pattern_marks_ready_without_delay() {
        let config = ServiceConfig::new(
            "api",
            "echo booting; echo 'Listening on port 3000'; sleep 5",
        )
        .ready_pattern(Regex::new("Listening on port").unwrap())
        .ready_delay_ms(10_000);
        let mut h = Harness::quick(config);
        let started = Instant::now();
        h.supervisor.start();
        assert_eq!(h.status(), ServiceStatus::Starting);

        assert!(h.pump_until(Duration::from_secs(3), |h| h.status() == ServiceStatus::Ready).await);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(h.has_log("Listening on port 3000"));
        assert_eq!(h.ready_events(), 1);
        h.supervisor.dispose();
    }

    #[tokio::test]
    async fn ready_pattern_ignores_stderr() {
        let config = ServiceConfig::new("api", "echo 'Listening' 1>&2; sleep 5")
            .ready_pattern(Regex::new("Listening").unwrap())
            .ready_delay_ms(10);
        let mut h = Harness::quick(config);
        h.supervisor.start();
        assert!(h.pump_until(Duration::from_secs(3), |h| h.has_log("Listening")).await);
        h.pump_until(Duration::from_millis(200), |_| false).await;
        assert_eq!(h.status(), ServiceStatus::Starting);
        h.supervisor.dispose();
    }

    #[tokio::test]
    async fn ready_delay_starts_at_first_output() {
        let config = ServiceConfig::new("worker", "echo hi; echo again; sleep 5").ready_delay_ms(100);
        let mut h = Harness::quick(config);
        h.supervisor.start();
        assert!(h.pump_until(Duration::from_secs(3), |h| !h.logs().is_empty()).await);
        let first_output = Instant::now();
        assert_eq!(h.status(), ServiceStatus::Starting);

        assert!(h.pump_until(Duration::from_secs(3), |h| h.status() == ServiceStatus::Ready).await);
        assert!(first_output.elapsed() >= Duration::from_millis(90));
        assert_eq!(h.ready_events(), 1);
        h.supervisor.dispose();
    }

    #[tokio::test]
    async fn silent_service_without_pattern_stays_starting() {
        let config = ServiceConfig::new("quiet", "sleep 5").ready_delay_ms(20);
        let mut h = Harness::quick(config);
        h.supervisor.start();
        h.pump_until(Duration::from_millis(300), |_| false).await;
        assert_eq!(h.status(), ServiceStatus::Starting);
        assert_eq!(h.ready_events(), 0);
        h.supervisor.dispose();
    }

    #[tokio::test]
    async fn exit_while_running_is_a_crash_even_with_code_zero() {
        for (script, code) in [("exit 3", 3), ("echo bye; exit 0", 0)] {
            let mut h = Harness::quick(ServiceConfig::new("job", script));
            h.supervisor.start();
            assert!(
                h.pump_until(Duration::from_secs(3), |h| h.status() == ServiceStatus::Crashed)
                    .await
            );
            assert_eq!(h.supervisor.state().exit_code, Some(code));
            assert_eq!(h.supervisor.state().pid, None);
            assert!(!h.supervisor.is_attached());
        }
    }

    #[tokio::test]
    async fn stop_without_stop_command_sends_sigint() {
        let mut h = Harness::quick(ServiceConfig::new("api", TRAP_INT));
        h.supervisor.start();
        assert!(h.pump_until(Duration::from_secs(3), |h| h.has_log("up")).await);

        h.supervisor.stop();
        assert_eq!(h.status(), ServiceStatus::Stopping);
        assert!(
            h.pump_until(Duration::from_secs(3), |h| {
                h.status() == ServiceStatus::Stopped && h.has_log("got INT")
            })
            .await
        );
        assert_eq!(h.supervisor.state().exit_code, Some(0));
        assert!(h.statuses().ends_with(&[ServiceStatus::Stopping, ServiceStatus::Stopped]));
    }

    #[tokio::test]
    async fn ignored_sigint_escalates_to_sigterm() {
        let mut h = Harness::quick(ServiceConfig::new("api", IGNORE_INT_TRAP_TERM));
        h.supervisor.start();
        assert!(h.pump_until(Duration::from_secs(3), |h| h.has_log("up")).await);

        let stopped_at = Instant::now();
        h.supervisor.stop();
        assert!(
            h.pump_until(Duration::from_secs(3), |h| {
                h.status() == ServiceStatus::Stopped && h.has_log("got TERM")
            })
            .await
        );
        assert!(stopped_at.elapsed() >= Duration::from_millis(180));
        let logs = h.logs();
        let int_at = logs.iter().position(|l| l == "got INT").unwrap();
        let term_at = logs.iter().position(|l| l == "got TERM").unwrap();
        assert!(int_at < term_at);
    }

    #[tokio::test]
    async fn stop_command_exit_leads_to_sigterm_then_sigkill() {
        let config = ServiceConfig::new("db", IGNORE_ALL).stop_command("true");
        let mut h = Harness::new(config, ShutdownConfig::new(200, 2000));
        h.supervisor.start();
        assert!(h.pump_until(Duration::from_secs(3), |h| h.has_log("up")).await);

        let stopped_at = Instant::now();
        h.supervisor.stop();
        assert!(
            h.pump_until(Duration::from_secs(3), |h| h.status() == ServiceStatus::Stopped)
                .await
        );
        // SIGTERM is ignored, so only SIGKILL after the SIGTERM timeout ends it.
        assert!(stopped_at.elapsed() >= Duration::from_millis(180));
        assert_eq!(h.supervisor.state().exit_code, None);
        assert!(h.errors().is_empty());
    }

    #[tokio::test]
    async fn stop_command_exit_sends_sigterm_right_away() {
        let dir = tempfile::tempdir().unwrap();
        let script = "trap 'echo got TERM; exit 0' TERM; trap '' INT; echo up; while true; do sleep 0.05; done";
        let mut config = ServiceConfig::new("queue", script).stop_command("touch stop-requested");
        config.cwd = Some(dir.path().to_path_buf());
        let mut h = Harness::new(config, ShutdownConfig::new(5000, 2000));
        h.supervisor.start();
        assert!(h.pump_until(Duration::from_secs(3), |h| h.has_log("up")).await);

        let stopped_at = Instant::now();
        h.supervisor.stop();
        assert!(
            h.pump_until(Duration::from_secs(3), |h| {
                h.status() == ServiceStatus::Stopped && h.has_log("got TERM")
            })
            .await
        );
        assert!(stopped_at.elapsed() < Duration::from_secs(3));
        assert!(dir.path().join("stop-requested").exists());
        assert_eq!(h.supervisor.state().exit_code, Some(0));
    }

    #[tokio::test]
    async fn kill_skips_the_graceful_steps() {
        let mut h = Harness::new(ServiceConfig::new("db", IGNORE_ALL), ShutdownConfig::new(5000, 2000));
        h.supervisor.start();
        assert!(h.pump_until(Duration::from_secs(3), |h| h.has_log("up")).await);

        let killed_at = Instant::now();
        h.supervisor.kill();
        assert_eq!(h.status(), ServiceStatus::Stopping);
        assert!(
            h.pump_until(Duration::from_secs(3), |h| h.status() == ServiceStatus::Stopped)
                .await
        );
        assert!(killed_at.elapsed() < Duration::from_secs(2));
        assert_eq!(h.supervisor.state().exit_code, None);
    }

    #[tokio::test]
    async fn kill_during_stop_jumps_to_sigkill() {
        let mut h = Harness::new(ServiceConfig::new("db", IGNORE_ALL), ShutdownConfig::new(5000, 2000));
        h.supervisor.start();
        assert!(h.pump_until(Duration::from_secs(3), |h| h.has_log("up")).await);

        h.supervisor.stop();
        h.supervisor.kill();
        assert!(
            h.pump_until(Duration::from_secs(2), |h| h.status() == ServiceStatus::Stopped)
                .await
        );
        let stopping = h
            .statuses()
            .iter()
            .filter(|status| **status == ServiceStatus::Stopping)
            .count();
        assert_eq!(stopping, 1);
    }

    #[tokio::test]
    async fn survivor_of_sigkill_timeout_is_reported_as_crash() {
        let mut h = Harness::new(ServiceConfig::new("db", IGNORE_ALL), ShutdownConfig::new(5000, 2000));
        h.supervisor.start();
        assert!(h.pump_until(Duration::from_secs(3), |h| h.has_log("up")).await);
        let pid = h.supervisor.pid().unwrap();

        h.supervisor.kill();
        // The SIGKILL timeout fires before the exit of the killed process is seen.
        let run = h.supervisor.run;
        let generation = h.supervisor.escalation.generation;
        h.supervisor.handle(
            run,
            Input::Timer {
                kind: TimerKind::Escalation,
                generation,
            },
        );
        h.drain();
        assert_eq!(h.status(), ServiceStatus::Crashed);
        assert_eq!(h.supervisor.state().exit_code, None);
        assert!(!h.supervisor.is_attached());
        assert!(matches!(
            h.errors().as_slice(),
            [SupervisorError::Termination { service, pid: reported }] if service == "db" && *reported == pid
        ));

        // The late exit no longer changes anything.
        h.pump_until(Duration::from_millis(500), |_| false).await;
        assert_eq!(h.status(), ServiceStatus::Crashed);
        assert_eq!(h.statuses().last(), Some(&ServiceStatus::Crashed));
        assert!(!h.statuses().contains(&ServiceStatus::Stopped));
    }

    #[tokio::test]
    async fn stop_cancels_pending_ready_timer() {
        let config = ServiceConfig::new("web", TRAP_INT).ready_delay_ms(300);
        let mut h = Harness::quick(config);
        h.supervisor.start();
        assert!(h.pump_until(Duration::from_secs(3), |h| h.has_log("up")).await);
        h.supervisor.stop();
        assert!(
            h.pump_until(Duration::from_secs(3), |h| h.status() == ServiceStatus::Stopped)
                .await
        );
        h.pump_until(Duration::from_millis(400), |_| false).await;
        assert_eq!(h.ready_events(), 0);
        assert_eq!(h.status(), ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn spawn_error_is_reported_as_crash() {
        let mut config = ServiceConfig::new("ghost", "echo never");
        config.cwd = Some("/nonexistent/stagehand-test-dir".into());
        let mut h = Harness::quick(config);
        h.supervisor.start();
        h.drain();
        assert_eq!(h.status(), ServiceStatus::Crashed);
        assert_eq!(h.supervisor.state().exit_code, None);
        assert!(!h.supervisor.is_attached());
        assert!(matches!(
            h.errors().as_slice(),
            [SupervisorError::Spawn { service, .. }] if service == "ghost"
        ));
    }

    #[tokio::test]
    async fn start_is_idempotent_and_idle_stop_is_noop() {
        let mut h = Harness::quick(ServiceConfig::new("api", "sleep 5"));
        h.supervisor.stop();
        h.supervisor.kill();
        h.drain();
        assert!(h.seen.is_empty());
        assert_eq!(h.status(), ServiceStatus::Stopped);

        h.supervisor.start();
        let pid = h.supervisor.state().pid;
        h.supervisor.start();
        h.drain();
        assert_eq!(h.supervisor.state().pid, pid);
        assert_eq!(h.statuses(), vec![ServiceStatus::Starting]);
        h.supervisor.dispose();
    }

    #[tokio::test]
    async fn output_is_tagged_by_stream_and_env_applies() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServiceConfig::new("env", "echo \"$GREETING from $(pwd -P)\"; echo oops 1>&2");
        config.cwd = Some(dir.path().to_path_buf());
        config.env.insert("GREETING".into(), "hello".into());
        let mut h = Harness::quick(config);
        h.supervisor.start();
        assert!(
            h.pump_until(Duration::from_secs(3), |h| {
                h.status() == ServiceStatus::Crashed && h.logs().len() == 2
            })
            .await
        );
        let expected = format!("hello from {}", dir.path().canonicalize().unwrap().display());
        let lines: Vec<(String, StreamKind)> = h
            .seen
            .iter()
            .filter_map(|event| match event {
                SupervisorEvent::Log(line) => Some((line.text.clone(), line.stream)),
                _ => None,
            })
            .collect();
        assert!(lines.contains(&(expected, StreamKind::Stdout)));
        assert!(lines.contains(&("oops".to_string(), StreamKind::Stderr)));
    }

    #[tokio::test]
    async fn waiting_state_round_trip() {
        let mut h = Harness::quick(ServiceConfig::new("web", "sleep 5"));
        h.supervisor.mark_waiting(vec!["api".into()]);
        h.supervisor.mark_waiting(vec!["api".into()]);
        h.drain();
        assert_eq!(h.status(), ServiceStatus::Waiting);
        assert_eq!(h.supervisor.state().waiting_for, vec!["api"]);
        assert_eq!(h.statuses(), vec![ServiceStatus::Waiting]);

        h.supervisor.cancel_waiting();
        assert_eq!(h.status(), ServiceStatus::Stopped);
        assert!(h.supervisor.state().waiting_for.is_empty());
    }

    #[tokio::test]
    async fn dispose_kills_and_detaches_listener() {
        let mut h = Harness::quick(ServiceConfig::new("db", IGNORE_ALL));
        h.supervisor.start();
        assert!(h.pump_until(Duration::from_secs(3), |h| h.has_log("up")).await);
        h.supervisor.dispose();
        assert!(!h.supervisor.is_attached());
        h.drain();
        let before = h.seen.len();
        // The exit still arrives on the inbox, but nothing is published any more.
        h.pump_until(Duration::from_millis(300), |_| false).await;
        assert_eq!(h.seen.len(), before);
    }
}
