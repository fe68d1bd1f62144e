//! turborack: run the dev servers of a Turborepo workspace from one terminal.
//!
//! This is the entry point of the application. It parses command-line arguments,
//! loads configuration, discovers the workspace packages and drives the main
//! event loop that connects the process manager with the TUI.

mod app;
mod clipboard;
mod config;
mod discovery;
mod events;
mod fs;
mod output;
mod package;
mod process;
mod runner;
mod tui;
mod workspace;

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use crate::app::{strip_carriage, App, AppAction};
use crate::config::{load_config, Config, CONFIG_FILE};
use crate::discovery::discover;
use crate::events::{Event, Severity};
use crate::fs::{DiskFs, Entry, WorkspaceFs};
use crate::output::ChannelSink;
use crate::package::{Invocation, Package, PackageManager};
use crate::runner::{OutputSink, ProcessManager, ShutdownConfig};

const DEFAULT_MAX_LINES: usize = 10_000;
const DEFAULT_SIGINT_MS: u64 = 800;
const DEFAULT_SIGTERM_MS: u64 = 800;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "turborack",
    version,
    about = "Start and stop the dev servers of a Turborepo workspace",
    styles = help_styles(),
    args_conflicts_with_subcommands = true,
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Workspace root (defaults to the current directory).
    root: Option<PathBuf>,
    /// Path to a turborack.toml configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Ignore any turborack.toml in the workspace root.
    #[arg(long)]
    no_config: bool,
    /// Disable the TUI and print prefixed output to stdout (implies --start-all).
    #[arg(long)]
    no_ui: bool,
    /// Start every package once discovery completes.
    #[arg(long)]
    start_all: bool,
    /// Max console lines kept per package.
    #[arg(long)]
    max_lines: Option<usize>,
    /// Time to wait after SIGINT before escalating (ms).
    #[arg(long)]
    shutdown_sigint_ms: Option<u64>,
    /// Time to wait after SIGTERM before killing (ms).
    #[arg(long)]
    shutdown_sigterm_ms: Option<u64>,
    /// Write log records to this file.
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the packages of the workspace and exit.
    List {
        /// Workspace root (defaults to the current directory).
        root: Option<PathBuf>,
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Print version information.
    Version,
}

/// Runtime configuration derived from CLI arguments and the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RunSettings {
    max_lines: usize,
    use_symbols: bool,
    no_ui: bool,
    start_all: bool,
    shutdown_sigint_ms: u64,
    shutdown_sigterm_ms: u64,
    log_file: Option<PathBuf>,
    verbose: bool,
}

impl RunSettings {
    fn from_cli(cli: &Cli, config: Config) -> Self {
        Self {
            max_lines: cli
                .max_lines
                .or(config.max_lines)
                .unwrap_or(DEFAULT_MAX_LINES)
                .max(1),
            use_symbols: config.symbols.unwrap_or(true),
            no_ui: cli.no_ui,
            start_all: cli.no_ui || cli.start_all || config.start_all.unwrap_or(false),
            shutdown_sigint_ms: cli
                .shutdown_sigint_ms
                .or(config.shutdown_sigint_ms)
                .unwrap_or(DEFAULT_SIGINT_MS),
            shutdown_sigterm_ms: cli
                .shutdown_sigterm_ms
                .or(config.shutdown_sigterm_ms)
                .unwrap_or(DEFAULT_SIGTERM_MS),
            log_file: cli
                .log_file
                .clone()
                .or_else(|| config.log_file.map(PathBuf::from)),
            verbose: cli.verbose,
        }
    }
}

/// Lifecycle requests handed to the command worker.
#[derive(Debug)]
enum Command {
    Start(Package),
    Stop(String),
    Restart(Package),
    StartAll(Vec<Package>),
    StopAll(Vec<Package>),
}

/// Sending side of the command worker, counting commands not yet finished.
struct CommandQueue {
    tx: mpsc::UnboundedSender<Command>,
    pending: Arc<AtomicUsize>,
}

impl CommandQueue {
    fn new() -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            tx,
            pending: Arc::new(AtomicUsize::new(0)),
        };
        (queue, rx)
    }

    fn send(&self, command: Command) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(command).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn is_idle(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0
    }
}

#[derive(Debug, Serialize)]
struct PackageRow {
    name: String,
    script: String,
    manager: &'static str,
    command: String,
    path: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match &cli.command {
        Some(Commands::Version) => {
            println!("turborack {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some(Commands::List { root, json }) => {
            init_tracing(cli.verbose, true, None)?;
            let root = workspace_root(root.as_deref())?;
            return list_packages(&root, *json);
        }
        None => {}
    }

    let root = workspace_root(cli.root.as_deref())?;
    let config = load_settings_config(&cli, &root)?;
    let settings = RunSettings::from_cli(&cli, config);
    init_tracing(settings.verbose, settings.no_ui, settings.log_file.as_deref())?;
    run(root, settings).await
}

async fn run(root: PathBuf, settings: RunSettings) -> Result<()> {
    info!(root = %root.display(), no_ui = settings.no_ui, "starting turborack");
    let fs: Arc<dyn WorkspaceFs> = Arc::new(DiskFs);
    let (event_tx, mut event_rx) = mpsc::channel(256);
    let shutdown = ShutdownConfig::new(settings.shutdown_sigint_ms, settings.shutdown_sigterm_ms);
    let manager = ProcessManager::new(fs.clone(), event_tx.clone(), shutdown);
    let mut app = App::new(root.clone(), settings.max_lines, settings.use_symbols);

    let closing = Arc::new(AtomicBool::new(false));
    let (commands, command_rx) = CommandQueue::new();
    let worker = tokio::spawn(command_worker(
        manager.clone(),
        command_rx,
        commands.pending.clone(),
        event_tx.clone(),
        closing.clone(),
    ));

    spawn_discovery(fs.clone(), root.clone(), event_tx.clone());

    let mut terminal = if settings.no_ui {
        None
    } else {
        Some(tui::init_terminal().context("failed to initialise terminal")?)
    };
    if !settings.no_ui {
        spawn_input_listener(event_tx.clone());
    }
    spawn_signal_listener(event_tx.clone());

    let mut ticker = tokio::time::interval(Duration::from_millis(150));
    let mut result = Ok(());
    let mut start_pending = settings.start_all;
    let mut started_all = false;

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                announce(&mut app, &event, settings.no_ui);
                match event {
                    Event::PackagesLoaded(packages) => {
                        info!(count = packages.len(), "packages loaded");
                        app.on_packages_loaded(packages);
                        if start_pending {
                            start_pending = false;
                            started_all = true;
                            commands.send(Command::StartAll(app.snapshot()));
                        }
                    }
                    Event::DiscoveryError { message } => {
                        error!(error = %message, "discovery failed");
                        app.loading = false;
                        if settings.no_ui {
                            result = Err(anyhow!("Error loading Turborepo packages: {}", message));
                            app.should_quit = true;
                        }
                    }
                    Event::Key(key) => {
                        let action = app.handle_key(key);
                        handle_app_action(action, &mut app, &commands, &fs, &event_tx);
                    }
                    Event::Resize { width, height } => {
                        debug!(width, height, "terminal resized");
                        if let Some(term) = terminal.as_mut() {
                            let _ = term.autoresize();
                        }
                    }
                    Event::Shutdown => {
                        info!("shutdown requested");
                        app.should_quit = true;
                    }
                    other => apply_event(&mut app, other, settings.no_ui),
                }
            }
            _ = ticker.tick() => {
                if settings.no_ui && started_all && commands.is_idle() && manager.running_names().is_empty() {
                    info!("every package has stopped");
                    app.should_quit = true;
                }
            }
        }

        if let Some(term) = terminal.as_mut() {
            if let Err(err) = tui::draw(&mut app, term) {
                result = Err(err.into());
                break;
            }
        }

        if app.should_quit {
            break;
        }
    }

    closing.store(true, Ordering::SeqCst);
    drop(commands);
    app.set_status_message("Stopping packages...", Severity::Info);
    if let Some(term) = terminal.as_mut() {
        let _ = tui::draw(&mut app, term);
    }
    let finish = async {
        let _ = worker.await;
        manager.shutdown_all().await;
    };
    tokio::select! {
        _ = finish => {}
        _ = drain_events(&mut event_rx, &mut app, settings.no_ui) => {}
    }
    while let Ok(event) = event_rx.try_recv() {
        handle_event(&mut app, event, settings.no_ui);
    }

    if let Some(term) = terminal {
        tui::restore_terminal(term).context("failed to restore terminal")?;
    }
    info!("turborack finished");
    result
}

/// Executes lifecycle commands one at a time so that a stop followed by a
/// start of the same package is applied in order.
async fn command_worker(
    manager: ProcessManager,
    mut commands: mpsc::UnboundedReceiver<Command>,
    pending: Arc<AtomicUsize>,
    event_tx: mpsc::Sender<Event>,
    closing: Arc<AtomicBool>,
) {
    while let Some(command) = commands.recv().await {
        if closing.load(Ordering::SeqCst) {
            break;
        }
        debug!(?command, "handling command");
        match command {
            Command::Start(package) => {
                manager.start(&package, sink_for(&package.name, &event_tx)).await;
            }
            Command::Stop(name) => manager.stop_named(&name).await,
            Command::Restart(package) => {
                manager.restart(&package, sink_for(&package.name, &event_tx)).await;
            }
            Command::StartAll(packages) => {
                for package in &packages {
                    if closing.load(Ordering::SeqCst) {
                        break;
                    }
                    manager.start(package, sink_for(&package.name, &event_tx)).await;
                }
            }
            Command::StopAll(packages) => manager.stop_all(&packages).await,
        }
        pending.fetch_sub(1, Ordering::SeqCst);
    }
}

fn sink_for(name: &str, event_tx: &mpsc::Sender<Event>) -> Arc<dyn OutputSink> {
    Arc::new(ChannelSink::new(name, event_tx.clone()))
}

fn handle_event(app: &mut App, event: Event, no_ui: bool) {
    announce(app, &event, no_ui);
    apply_event(app, event, no_ui);
}

/// Applies lifecycle and output events to the view state.
fn apply_event(app: &mut App, event: Event, no_ui: bool) {
    match event {
        Event::PackageStarted { name, pid, command } => app.on_package_started(&name, pid, &command),
        Event::PackageStopped { name } => app.on_package_stopped(&name),
        Event::PackageExited { name, code } => {
            if no_ui {
                println!("[{}] exited with code {}", name, exit_label(code));
            }
            app.on_package_exited(&name, code);
        }
        Event::PackageError { name, message } => app.on_package_error(&name, &message),
        Event::PackageOutput { name, line, stream } => {
            if no_ui {
                println!("[{}] {}", name, strip_carriage(&line));
            }
            app.on_package_output(&name, line, stream);
        }
        Event::ConsoleCleared { name } => app.on_console_cleared(&name),
        Event::PackagesLoaded(packages) => app.on_packages_loaded(packages),
        Event::DiscoveryError { .. } => app.loading = false,
        Event::Key(_) | Event::Resize { .. } | Event::Shutdown => {}
    }
}

async fn drain_events(event_rx: &mut mpsc::Receiver<Event>, app: &mut App, no_ui: bool) {
    while let Some(event) = event_rx.recv().await {
        handle_event(app, event, no_ui);
    }
}

fn announce(app: &mut App, event: &Event, no_ui: bool) {
    if no_ui {
        if let Some(text) = event.notification() {
            match event.severity() {
                Severity::Info => println!("[turborack] {}", text),
                Severity::Error => eprintln!("[turborack] {}", text),
            }
        }
    }
    app.notify(event);
}

fn exit_label(code: Option<i32>) -> String {
    code.map(|code| code.to_string())
        .unwrap_or_else(|| "signal".to_string())
}

fn handle_app_action(
    action: AppAction,
    app: &mut App,
    commands: &CommandQueue,
    fs: &Arc<dyn WorkspaceFs>,
    event_tx: &mpsc::Sender<Event>,
) {
    let command = match action {
        AppAction::None | AppAction::Quit => None,
        AppAction::Refresh => {
            spawn_discovery(fs.clone(), app.root.clone(), event_tx.clone());
            None
        }
        AppAction::Start(name) => listed_package(app, &name).map(Command::Start),
        AppAction::Stop(name) => Some(Command::Stop(name)),
        AppAction::Restart(name) => listed_package(app, &name).map(Command::Restart),
        AppAction::StartAll => Some(Command::StartAll(app.snapshot())),
        AppAction::StopAll => Some(Command::StopAll(app.snapshot())),
        AppAction::CopyConsole => {
            copy_selected_console(app);
            None
        }
    };
    if let Some(command) = command {
        commands.send(command);
    }
}

/// Package of the current snapshot named `name`; removed packages cannot be started.
fn listed_package(app: &App, name: &str) -> Option<Package> {
    app.packages
        .iter()
        .find(|state| state.name() == name && !state.stale)
        .map(|state| state.package.clone())
}

fn copy_selected_console(app: &mut App) {
    let Some(name) = app.selected_package().map(|state| state.name().to_string()) else {
        return;
    };
    let text = app.selected_console_text().unwrap_or_default();
    match clipboard::copy_console(&name, &text) {
        Ok(()) => app.set_status_message(format!("Copied console of {}", name), Severity::Info),
        Err(err) => app.set_status_message(format!("{:#}", err), Severity::Error),
    }
}

/// Runs a discovery pass on a blocking worker and reports the outcome as an event.
fn spawn_discovery(fs: Arc<dyn WorkspaceFs>, root: PathBuf, tx: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        let result = tokio::task::spawn_blocking(move || discover(fs.as_ref(), &Entry::new(root))).await;
        let event = match result {
            Ok(Ok(packages)) => Event::PackagesLoaded(packages),
            Ok(Err(err)) => Event::DiscoveryError {
                message: err.to_string(),
            },
            Err(err) => Event::DiscoveryError {
                message: format!("discovery task failed: {}", err),
            },
        };
        let _ = tx.send(event).await;
    });
}

fn spawn_input_listener(tx: mpsc::Sender<Event>) {
    std::thread::spawn(move || loop {
        if crossterm::event::poll(Duration::from_millis(100)).unwrap_or(false) {
            let sent = match crossterm::event::read() {
                Ok(crossterm::event::Event::Key(key)) => tx.blocking_send(Event::Key(key)),
                Ok(crossterm::event::Event::Resize(width, height)) => {
                    tx.blocking_send(Event::Resize { width, height })
                }
                _ => Ok(()),
            };
            if sent.is_err() {
                break;
            }
        }
    });
}

fn spawn_signal_listener(tx: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    error!(error = %err, "failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        let _ = tx.send(Event::Shutdown).await;
    });
}

fn workspace_root(root: Option<&Path>) -> Result<PathBuf> {
    let cwd = std::env::current_dir().context("failed to read current directory")?;
    Ok(match root {
        Some(root) if root.is_absolute() => root.to_path_buf(),
        Some(root) => cwd.join(root),
        None => cwd,
    })
}

fn load_settings_config(cli: &Cli, root: &Path) -> Result<Config> {
    if cli.no_config {
        return Ok(Config::default());
    }
    if let Some(path) = &cli.config {
        return load_config(path);
    }
    let path = root.join(CONFIG_FILE);
    if path.is_file() {
        load_config(&path)
    } else {
        Ok(Config::default())
    }
}

fn init_tracing(verbose: bool, no_ui: bool, log_file: Option<&Path>) -> Result<()> {
    let default = if verbose { "turborack=debug" } else { "turborack=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let (writer, ansi) = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None if no_ui => (BoxMakeWriter::new(io::stderr), true),
        None => (BoxMakeWriter::new(io::sink), false),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(false)
        .init();
    Ok(())
}

fn list_packages(root: &Path, json: bool) -> Result<()> {
    let fs = DiskFs;
    let packages = discover(&fs, &Entry::new(root))
        .with_context(|| format!("Error loading Turborepo packages from {}", root.display()))?;
    let rows = package_rows(&fs, &packages);
    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("No Turborepo packages found in {}", root.display());
        return Ok(());
    }
    let width = rows.iter().map(|row| row.name.len()).max().unwrap_or(0);
    for row in rows {
        println!(
            "{:<width$}  {:<6}  {:<5}  {}",
            row.name,
            row.script,
            row.manager,
            row.path,
            width = width
        );
    }
    Ok(())
}

fn package_rows(fs: &dyn WorkspaceFs, packages: &[Package]) -> Vec<PackageRow> {
    packages
        .iter()
        .map(|package| PackageRow {
            name: package.name.clone(),
            script: package.script.clone(),
            manager: PackageManager::detect(fs, &package.dir).label(),
            command: Invocation::for_package(fs, package).display(),
            path: package.path().display().to_string(),
        })
        .collect()
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn list_subcommand_takes_its_own_root() {
        let cli = Cli::try_parse_from(["turborack", "list", "repo", "--json"]).unwrap();
        match cli.command {
            Some(Commands::List { root, json }) => {
                assert_eq!(root, Some(PathBuf::from("repo")));
                assert!(json);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn cli_flags_override_config() {
        let cli = Cli::try_parse_from([
            "turborack",
            "repo",
            "--max-lines",
            "50",
            "--shutdown-sigint-ms",
            "0",
        ])
        .unwrap();
        let config = Config {
            max_lines: Some(2000),
            symbols: Some(false),
            shutdown_sigint_ms: Some(300),
            shutdown_sigterm_ms: Some(1500),
            log_file: Some("turborack.log".into()),
            ..Config::default()
        };
        let settings = RunSettings::from_cli(&cli, config);
        assert_eq!(settings.max_lines, 50);
        assert!(!settings.use_symbols);
        assert_eq!(settings.shutdown_sigint_ms, 0);
        assert_eq!(settings.shutdown_sigterm_ms, 1500);
        assert_eq!(settings.log_file, Some(PathBuf::from("turborack.log")));
        assert!(!settings.start_all);
    }

    #[test]
    fn no_ui_implies_start_all() {
        let cli = Cli::try_parse_from(["turborack", "--no-ui"]).unwrap();
        let settings = RunSettings::from_cli(&cli, Config::default());
        assert!(settings.no_ui);
        assert!(settings.start_all);
        assert_eq!(settings.max_lines, DEFAULT_MAX_LINES);
        assert_eq!(settings.shutdown_sigterm_ms, DEFAULT_SIGTERM_MS);
    }

    #[test]
    fn config_file_in_root_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::try_parse_from(["turborack"]).unwrap();
        let config = load_settings_config(&cli, dir.path()).unwrap();
        assert!(config.max_lines.is_none());

        std::fs::write(dir.path().join(CONFIG_FILE), "start_all = true").unwrap();
        let config = load_settings_config(&cli, dir.path()).unwrap();
        assert_eq!(config.start_all, Some(true));

        let cli = Cli::try_parse_from(["turborack", "--no-config"]).unwrap();
        let config = load_settings_config(&cli, dir.path()).unwrap();
        assert!(config.start_all.is_none());
    }

    #[test]
    fn package_rows_describe_invocation() {
        let dir = tempfile::tempdir().unwrap();
        let web = dir.path().join("apps/web");
        std::fs::create_dir_all(&web).unwrap();
        std::fs::write(web.join("yarn.lock"), "").unwrap();
        let packages = vec![Package::new("web", Entry::new(&web), "start")];

        let rows = package_rows(&DiskFs, &packages);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].manager, "yarn");
        assert!(rows[0].command.ends_with("start"));
        assert_eq!(rows[0].path, web.display().to_string());
    }

    #[test]
    fn listed_package_skips_stale_entries() {
        let mut app = App::new(PathBuf::from("/repo"), 10, false);
        let api = Package::new("api", Entry::new("/repo/apps/api"), "dev");
        app.on_packages_loaded(vec![api.clone()]);
        app.on_package_started("api", Some(1), "npm run dev");
        app.on_packages_loaded(Vec::new());

        assert!(listed_package(&app, "api").is_none());
        app.on_packages_loaded(vec![api.clone()]);
        assert_eq!(listed_package(&app, "api"), Some(api));
    }
}
