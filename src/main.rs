//! Stagehand command-line runner.
//!
//! Parses arguments, loads `stagehand.toml`, starts the selected services through
//! the orchestrator and prints their output until they are all down or the user
//! interrupts, in which case every service is stopped before exiting.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::builder::styling::{AnsiColor, Color, Effects, Style};
use clap::builder::Styles;
use clap::Parser;
use tokio::sync::{mpsc, oneshot};
use tracing_subscriber::EnvFilter;

use stagehand::config::{self, Settings, DEFAULT_CONFIG_FILE};
use stagehand::events::ProcessSignal;
use stagehand::graph::start_order;
use stagehand::output::LinePrinter;
use stagehand::{
    OrchestratorHandle, RuntimeState, ServiceEvent, ServiceStatus, StopOutcome, SupervisorEvent,
};

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "stagehand",
    version,
    about = "Start interdependent local services in dependency order",
    styles = HELP_STYLES,
    disable_help_subcommand = true
)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Services to start. Defaults to every service with `autostart` set.
    services: Vec<String>,
    /// Start every configured service.
    #[arg(long, conflicts_with = "services")]
    all: bool,
    /// Validate the configuration, print the start order and exit.
    #[arg(long)]
    check: bool,
    /// Prepend elapsed time to each line.
    #[arg(long)]
    timestamp: bool,
    /// Strip ANSI escape codes from service output.
    #[arg(long)]
    strip_ansi: bool,
    /// Do not colorize the `[id]` prefixes.
    #[arg(long)]
    no_color: bool,
    /// Time to wait for services to stop before killing them (ms).
    #[arg(long)]
    stop_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Selection {
    All,
    Autostart,
    Named,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let settings = config::load_settings(&cli.config)?;
    let (selection, targets) = select_services(&cli, &settings)?;

    if cli.check {
        let order = start_order(targets.as_slice(), &settings.services)?;
        println!("start order: {}", order.join(" -> "));
        return Ok(());
    }
    run(&cli, settings, selection, targets).await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("STAGEHAND_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn select_services(cli: &Cli, settings: &Settings) -> Result<(Selection, Vec<String>)> {
    let known: Vec<&str> = settings.services.iter().map(|s| s.id.as_str()).collect();
    let (selection, targets) = if cli.all {
        (Selection::All, known.iter().map(|id| id.to_string()).collect())
    } else if cli.services.is_empty() {
        let autostart = settings
            .services
            .iter()
            .filter(|service| service.autostart)
            .map(|service| service.id.clone())
            .collect();
        (Selection::Autostart, autostart)
    } else {
        for id in &cli.services {
            if !known.contains(&id.as_str()) {
                bail!("unknown service: {}", id);
            }
        }
        (Selection::Named, cli.services.clone())
    };
    if targets.is_empty() {
        bail!("nothing to start (no service has autostart set; name services or pass --all)");
    }
    Ok((selection, targets))
}

async fn run(cli: &Cli, settings: Settings, selection: Selection, targets: Vec<String>) -> Result<()> {
    let ids: Vec<String> = settings.services.iter().map(|s| s.id.clone()).collect();
    let printer = LinePrinter::new(ids.iter().map(String::as_str))
        .strip_ansi(cli.strip_ansi)
        .timestamp(cli.timestamp)
        .colors(!cli.no_color);
    let colors: HashMap<String, usize> = ids
        .iter()
        .enumerate()
        .map(|(index, id)| (id.clone(), index))
        .collect();
    let stop_timeout = Duration::from_millis(cli.stop_timeout_ms.unwrap_or(settings.stop_timeout_ms));

    let (handle, mut events) = OrchestratorHandle::spawn(settings.services, settings.shutdown)
        .context("cannot orchestrate services")?;
    match selection {
        Selection::All => handle.start_all(),
        Selection::Autostart => handle.start_autostart(),
        Selection::Named => handle.start_services(targets),
    }

    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
    spawn_signal_listener(signal_tx);

    let mut statuses: HashMap<String, ServiceStatus> = HashMap::new();
    let mut stopping: Option<oneshot::Receiver<StopOutcome>> = None;

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                if let SupervisorEvent::StatusChange(state) = &event.event {
                    statuses.insert(event.service.clone(), state.status);
                }
                print_event(&printer, &colors, &event);
                if stopping.is_none() && all_down(&statuses) {
                    println!("{}", printer.format_message("all services have exited"));
                    break;
                }
            }
            Some(signal) = signal_rx.recv(), if stopping.is_none() => {
                println!(
                    "{}",
                    printer.format_message(&format!("received {}, stopping services", signal.label()))
                );
                stopping = Some(handle.stop_all_and_wait(stop_timeout));
            }
            outcome = stop_outcome(&mut stopping), if stopping.is_some() => {
                println!("{}", printer.format_message(&outcome_notice(&outcome)));
                break;
            }
        }
    }

    let _ = handle.dispose().await;
    while let Ok(event) = events.try_recv() {
        print_event(&printer, &colors, &event);
    }
    Ok(())
}

fn all_down(statuses: &HashMap<String, ServiceStatus>) -> bool {
    !statuses.is_empty() && statuses.values().all(|status| status.is_terminal())
}

async fn stop_outcome(stopping: &mut Option<oneshot::Receiver<StopOutcome>>) -> StopOutcome {
    match stopping {
        Some(outcome) => outcome.await.unwrap_or(StopOutcome::Interrupted),
        None => std::future::pending().await,
    }
}

fn print_event(printer: &LinePrinter, colors: &HashMap<String, usize>, event: &ServiceEvent) {
    let index = colors.get(&event.service).copied().unwrap_or(0);
    let line = match &event.event {
        SupervisorEvent::Log(line) => Some(printer.format_line(&event.service, index, line)),
        SupervisorEvent::StatusChange(state) => {
            status_notice(state).map(|text| printer.format_notice(&event.service, &text))
        }
        SupervisorEvent::Ready => Some(printer.format_notice(&event.service, "ready")),
        SupervisorEvent::Error(err) => Some(printer.format_notice(&event.service, &err.to_string())),
    };
    if let Some(line) = line {
        println!("{}", line);
    }
}

fn status_notice(state: &RuntimeState) -> Option<String> {
    let with_code = |label: &str| match state.exit_code {
        Some(code) => format!("{} (exit code {})", label, code),
        None => label.to_string(),
    };
    match state.status {
        ServiceStatus::Waiting => Some(format!("waiting for {}", state.waiting_for.join(", "))),
        ServiceStatus::Starting => Some(match state.pid {
            Some(pid) => format!("starting (pid {})", pid),
            None => "starting".to_string(),
        }),
        ServiceStatus::Stopping => Some("stopping".to_string()),
        ServiceStatus::Stopped => Some(with_code("stopped")),
        ServiceStatus::Crashed => Some(with_code("crashed")),
        // Reported through the ready event.
        ServiceStatus::Ready => None,
    }
}

fn outcome_notice(outcome: &StopOutcome) -> String {
    match outcome {
        StopOutcome::Drained => "all services stopped".to_string(),
        StopOutcome::ForcedKill { killed } => {
            format!("stop timed out, killed {}", killed.join(", "))
        }
        StopOutcome::Interrupted => "shutdown interrupted".to_string(),
    }
}

fn spawn_signal_listener(tx: mpsc::UnboundedSender<ProcessSignal>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            loop {
                let received = tokio::select! {
                    _ = tokio::signal::ctrl_c() => ProcessSignal::SigInt,
                    _ = sigterm.recv() => ProcessSignal::SigTerm,
                };
                if tx.send(received).is_err() {
                    break;
                }
            }
        }
        #[cfg(not(unix))]
        {
            while tokio::signal::ctrl_c().await.is_ok() {
                if tx.send(ProcessSignal::SigInt).is_err() {
                    break;
                }
            }
        }
    });
}

const BOLD_CYAN: Style = Style::new()
    .fg_color(Some(Color::Ansi(AnsiColor::Cyan)))
    .effects(Effects::BOLD);

const HELP_STYLES: Styles = Styles::styled()
    .header(BOLD_CYAN.effects(Effects::BOLD.insert(Effects::UNDERLINE)))
    .usage(BOLD_CYAN)
    .literal(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Green))))
    .placeholder(Style::new().effects(Effects::ITALIC))
    .error(
        Style::new()
            .fg_color(Some(Color::Ansi(AnsiColor::Red)))
            .effects(Effects::BOLD),
    );
