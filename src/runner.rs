//! Process execution and management.
//!
//! This module contains the `ProcessManager`, which starts, tracks and stops
//! the dev process of each workspace package. At most one process runs per
//! package name; the live-process registry is the single source of truth for
//! whether a package is running.
//!
//! Every run owns a waiter task holding the child. The waiter forwards the
//! exit (natural or requested) back to the registry and the event channel, so
//! an explicit `stop` and a process ending on its own may race freely. A new
//! run of a package starts only after the previous run has reported its exit.

use std::collections::HashMap;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::events::Event;
use crate::fs::WorkspaceFs;
use crate::output::StreamKind;
use crate::package::{Invocation, Package};

/// How long a finished run waits for its output readers to drain.
const READER_DRAIN: Duration = Duration::from_millis(500);
/// Extra wait, on top of the stop grace periods, for a previous run to report.
const SETTLE_SLACK: Duration = Duration::from_secs(1);

/// Receives the console output of one package run.
#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Called once before a new run writes its first line.
    async fn clear(&self) {}
    async fn line(&self, stream: StreamKind, text: String);
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to run `{command}` in {cwd}: {source}")]
    Spawn {
        command: String,
        cwd: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    SigInt,
    SigTerm,
    Kill,
}

/// Grace periods used when stopping a process.
///
/// A stop sends SIGINT, then SIGTERM, then kills, waiting the configured
/// time after each signal. A zero duration skips that stage.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownConfig {
    sigint_ms: u64,
    sigterm_ms: u64,
}

impl ShutdownConfig {
    pub fn new(sigint_ms: u64, sigterm_ms: u64) -> Self {
        Self {
            sigint_ms,
            sigterm_ms,
        }
    }

    fn stages(&self) -> Vec<(ProcessSignal, Duration)> {
        [
            (ProcessSignal::SigInt, self.sigint_ms),
            (ProcessSignal::SigTerm, self.sigterm_ms),
        ]
        .into_iter()
        .filter(|(_, ms)| *ms > 0)
        .map(|(signal, ms)| (signal, Duration::from_millis(ms)))
        .collect()
    }

    fn total(&self) -> Duration {
        Duration::from_millis(self.sigint_ms + self.sigterm_ms)
    }
}

struct LiveProcess {
    run: u64,
    pid: Option<u32>,
    stop_tx: Option<oneshot::Sender<()>>,
    done: watch::Receiver<bool>,
}

/// A run that left the registry but has not reported its exit yet.
struct ExitingRun {
    run: u64,
    done: watch::Receiver<bool>,
}

#[derive(Default)]
struct Runs {
    live: HashMap<String, LiveProcess>,
    exiting: HashMap<String, ExitingRun>,
}

impl Runs {
    fn retire(&mut self, name: &str) -> Option<LiveProcess> {
        let entry = self.live.remove(name)?;
        self.exiting.insert(
            name.to_string(),
            ExitingRun {
                run: entry.run,
                done: entry.done.clone(),
            },
        );
        Some(entry)
    }
}

type Registry = Arc<Mutex<Runs>>;

fn lock(registry: &Registry) -> MutexGuard<'_, Runs> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Starts, stops and tracks one process per package.
#[derive(Clone)]
pub struct ProcessManager {
    fs: Arc<dyn WorkspaceFs>,
    registry: Registry,
    event_tx: mpsc::Sender<Event>,
    shutdown: ShutdownConfig,
    next_run: Arc<AtomicU64>,
    live: Arc<AtomicUsize>,
}

impl ProcessManager {
    pub fn new(
        fs: Arc<dyn WorkspaceFs>,
        event_tx: mpsc::Sender<Event>,
        shutdown: ShutdownConfig,
    ) -> Self {
        Self {
            fs,
            registry: Arc::new(Mutex::new(Runs::default())),
            event_tx,
            shutdown,
            next_run: Arc::new(AtomicU64::new(1)),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        lock(&self.registry).live.contains_key(name)
    }

    /// Pid of the running process for `name`, if any.
    pub fn pid(&self, name: &str) -> Option<u32> {
        lock(&self.registry).live.get(name).and_then(|process| process.pid)
    }

    pub fn running_names(&self) -> Vec<String> {
        let mut names = lock(&self.registry).live.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    /// Starts the dev process of `package`, writing its output to `sink`.
    ///
    /// Does nothing when the package is already running. Spawn failures are
    /// reported as [`Event::PackageError`] and leave the package stopped.
    pub async fn start(&self, package: &Package, sink: Arc<dyn OutputSink>) {
        if self.is_running(&package.name) {
            debug!(package = %package.name, "already running");
            return;
        }
        let invocation = Invocation::for_package(self.fs.as_ref(), package);
        self.launch(&package.name, invocation, sink).await;
    }

    /// Requests termination of the process of `package`.
    ///
    /// Does nothing when the package is not running. Completion is observed
    /// later through [`Event::PackageExited`].
    pub async fn stop(&self, package: &Package) {
        self.stop_named(&package.name).await;
    }

    pub async fn stop_named(&self, name: &str) {
        let entry = lock(&self.registry).retire(name);
        let Some(mut entry) = entry else {
            debug!(package = %name, "not running");
            return;
        };
        if let Some(stop_tx) = entry.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        info!(package = %name, pid = ?entry.pid, "stopped package");
        let _ = self
            .event_tx
            .send(Event::PackageStopped {
                name: name.to_string(),
            })
            .await;
    }

    pub async fn restart(&self, package: &Package, sink: Arc<dyn OutputSink>) {
        self.stop(package).await;
        self.start(package, sink).await;
    }

    /// Starts every package of the snapshot that is not running yet.
    pub async fn start_all<F>(&self, packages: &[Package], mut sink_for: F)
    where
        F: FnMut(&Package) -> Arc<dyn OutputSink>,
    {
        for package in packages {
            if !self.is_running(&package.name) {
                self.start(package, sink_for(package)).await;
            }
        }
    }

    /// Stops every running package of the snapshot.
    pub async fn stop_all(&self, packages: &[Package]) {
        for package in packages {
            if self.is_running(&package.name) {
                self.stop(package).await;
            }
        }
    }

    /// Stops every registered process and waits for their waiters to finish.
    pub async fn shutdown_all(&self) {
        for name in self.running_names() {
            self.stop_named(&name).await;
        }
        let deadline = tokio::time::Instant::now() + self.shutdown.total() + Duration::from_secs(1);
        while self.live.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(remaining = self.live.load(Ordering::SeqCst), "processes still exiting at shutdown");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Waits until the previous run of `name` has delivered its last output
    /// and exit events, so they never land in a newer run's console.
    async fn settle(&self, name: &str) {
        let pending = lock(&self.registry)
            .exiting
            .get(name)
            .map(|exiting| exiting.done.clone());
        let Some(mut done) = pending else {
            return;
        };
        let limit = self.shutdown.total() + READER_DRAIN + SETTLE_SLACK;
        let settled = tokio::time::timeout(limit, done.wait_for(|finished| *finished)).await;
        if !matches!(settled, Ok(Ok(_))) {
            warn!(package = %name, "previous run still exiting, starting anyway");
        }
    }

    pub(crate) async fn launch(&self, name: &str, invocation: Invocation, sink: Arc<dyn OutputSink>) {
        self.settle(name).await;
        let command_line = invocation.display();
        let run = self.next_run.fetch_add(1, Ordering::Relaxed);
        let (stop_tx, stop_rx) = oneshot::channel();
        let (done_tx, done_rx) = watch::channel(false);

        // Check, spawn and register under one lock so racing starts cannot
        // produce two processes for the same name.
        let spawned = {
            let mut registry = lock(&self.registry);
            if registry.live.contains_key(name) {
                debug!(package = %name, "already running");
                return;
            }
            spawn(&invocation).map(|child| {
                let pid = child.id();
                registry.live.insert(
                    name.to_string(),
                    LiveProcess {
                        run,
                        pid,
                        stop_tx: Some(stop_tx),
                        done: done_rx,
                    },
                );
                (child, pid)
            })
        };

        let (mut child, pid) = match spawned {
            Ok(spawned) => spawned,
            Err(source) => {
                let err = LaunchError::Spawn {
                    command: command_line,
                    cwd: invocation.cwd.display().to_string(),
                    source,
                };
                error!(package = %name, error = %err, "error starting package");
                let _ = self
                    .event_tx
                    .send(Event::PackageError {
                        name: name.to_string(),
                        message: err.to_string(),
                    })
                    .await;
                return;
            }
        };
        self.live.fetch_add(1, Ordering::SeqCst);
        info!(package = %name, pid = ?pid, command = %command_line, "started package");

        sink.clear().await;
        let _ = self
            .event_tx
            .send(Event::PackageStarted {
                name: name.to_string(),
                pid,
                command: command_line,
            })
            .await;

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(StreamKind::Stdout, stdout, sink.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(StreamKind::Stderr, stderr, sink)));
        }

        tokio::spawn(watch_exit(
            RunHandle {
                name: name.to_string(),
                run,
                done: done_tx,
            },
            child,
            stop_rx,
            readers,
            self.clone(),
        ));
    }
}

fn spawn(invocation: &Invocation) -> io::Result<Child> {
    let mut command = Command::new(&invocation.program);
    command
        .args(&invocation.args)
        .current_dir(&invocation.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command.kill_on_drop(true);

    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
        command.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    // Own process group, so a stop reaches the servers npm/yarn spawn too.
    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }

    command.spawn()
}

enum Outcome {
    Exited(io::Result<ExitStatus>),
    StopRequested,
}

struct RunHandle {
    name: String,
    run: u64,
    done: watch::Sender<bool>,
}

// Termination listener of one run.
async fn watch_exit(
    handle: RunHandle,
    mut child: Child,
    mut stop_rx: oneshot::Receiver<()>,
    readers: Vec<JoinHandle<()>>,
    manager: ProcessManager,
) {
    let outcome = tokio::select! {
        status = child.wait() => Outcome::Exited(status),
        _ = &mut stop_rx => Outcome::StopRequested,
    };
    let RunHandle { name, run, done } = handle;
    let status = match outcome {
        Outcome::Exited(status) => status,
        Outcome::StopRequested => terminate(&mut child, manager.shutdown).await,
    };
    for mut reader in readers {
        if tokio::time::timeout(READER_DRAIN, &mut reader).await.is_err() {
            // A grandchild still holds the pipe open.
            reader.abort();
        }
    }

    let code = match &status {
        Ok(status) => {
            debug!(package = %name, code = ?status.code(), "process exited");
            status.code()
        }
        Err(err) => {
            warn!(package = %name, error = %err, "failed to wait for process");
            None
        }
    };

    // A restart may already have registered a newer run under this name.
    let removed = {
        let mut registry = lock(&manager.registry);
        if registry.live.get(&name).is_some_and(|entry| entry.run == run) {
            registry.retire(&name);
            true
        } else {
            false
        }
    };

    let _ = manager
        .event_tx
        .send(Event::PackageExited {
            name: name.clone(),
            code,
        })
        .await;
    if removed {
        info!(package = %name, "package has stopped");
        let _ = manager
            .event_tx
            .send(Event::PackageStopped { name: name.clone() })
            .await;
    }

    {
        let mut registry = lock(&manager.registry);
        if registry.exiting.get(&name).is_some_and(|exiting| exiting.run == run) {
            registry.exiting.remove(&name);
        }
    }
    done.send_replace(true);
    manager.live.fetch_sub(1, Ordering::SeqCst);
}

async fn terminate(child: &mut Child, shutdown: ShutdownConfig) -> io::Result<ExitStatus> {
    for (signal, timeout) in shutdown.stages() {
        let Some(pid) = child.id() else {
            break;
        };
        send_os_signal(pid, signal);
        if let Some(status) = wait_for_exit(child, timeout).await? {
            return Ok(status);
        }
    }
    if let Some(pid) = child.id() {
        send_os_signal(pid, ProcessSignal::Kill);
    }
    let _ = child.start_kill();
    child.wait().await
}

#[cfg(unix)]
fn send_os_signal(pid: u32, signal: ProcessSignal) {
    unsafe {
        let sig = match signal {
            ProcessSignal::SigInt => libc::SIGINT,
            ProcessSignal::SigTerm => libc::SIGTERM,
            ProcessSignal::Kill => libc::SIGKILL,
        };
        let pid = pid as i32;
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(not(unix))]
fn send_os_signal(pid: u32, signal: ProcessSignal) {
    send_ctrl_break(pid, signal);
}

#[cfg(all(not(unix), windows))]
fn send_ctrl_break(pid: u32, signal: ProcessSignal) {
    use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
    use windows_sys::Win32::System::Console::CTRL_BREAK_EVENT;
    // Kill is left to Child::start_kill.
    if signal == ProcessSignal::Kill {
        return;
    }
    unsafe {
        let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
    }
}

#[cfg(all(not(unix), not(windows)))]
fn send_ctrl_break(_pid: u32, _signal: ProcessSignal) {}

async fn wait_for_exit(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    if timeout.is_zero() {
        return Ok(None);
    }
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Ok(Some(status)),
        Ok(Err(err)) => Err(err),
        Err(_) => Ok(None),
    }
}

async fn forward_lines<R>(stream: StreamKind, reader: R, sink: Arc<dyn OutputSink>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buffer);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                sink.line(stream, line).await;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::PathBuf;

    use tokio::sync::mpsc::error::TryRecvError;

    use super::*;
    use crate::fs::{Entry, MemoryFs};

    #[derive(Default)]
    struct RecordingSink {
        lines: Mutex<Vec<(StreamKind, String)>>,
        clears: AtomicUsize,
        transcript: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl OutputSink for RecordingSink {
        async fn clear(&self) {
            self.clears.fetch_add(1, Ordering::SeqCst);
            self.transcript.lock().unwrap().push("<clear>".to_string());
        }

        async fn line(&self, stream: StreamKind, text: String) {
            self.transcript.lock().unwrap().push(text.clone());
            self.lines.lock().unwrap().push((stream, text));
        }
    }

    fn manager() -> (ProcessManager, mpsc::Receiver<Event>, MemoryFs) {
        let fs = MemoryFs::new("/repo").file("apps/web/package.json", r#"{"name": "web"}"#);
        let (tx, rx) = mpsc::channel(64);
        let manager = ProcessManager::new(Arc::new(fs.clone()), tx, ShutdownConfig::new(300, 300));
        (manager, rx, fs)
    }

    fn sh(script: &str) -> Invocation {
        Invocation {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            cwd: std::env::temp_dir(),
        }
    }

    fn package(name: &str, dir: &str) -> Package {
        Package::new(name, Entry::new(PathBuf::from(dir)), "dev")
    }

    async fn next_event(rx: &mut mpsc::Receiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn wait_for_exit_event(rx: &mut mpsc::Receiver<Event>, package: &str) -> Vec<Event> {
        let mut seen = Vec::new();
        loop {
            let event = next_event(rx).await;
            let done = matches!(&event, Event::PackageExited { name, .. } if name == package);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    fn stopped_count(events: &[Event], package: &str) -> usize {
        events
            .iter()
            .filter(|event| matches!(event, Event::PackageStopped { name } if name == package))
            .count()
    }

    #[tokio::test]
    async fn output_is_forwarded_and_exit_clears_state() {
        let (manager, mut rx, _) = manager();
        let sink = Arc::new(RecordingSink::default());
        manager
            .launch("web", sh("echo hello; echo oops 1>&2; exit 3"), sink.clone())
            .await;

        assert!(matches!(next_event(&mut rx).await, Event::PackageStarted { name, .. } if name == "web"));
        let events = wait_for_exit_event(&mut rx, "web").await;
        assert!(matches!(events.last(), Some(Event::PackageExited { code: Some(3), .. })));
        assert!(matches!(next_event(&mut rx).await, Event::PackageStopped { name } if name == "web"));
        assert!(!manager.is_running("web"));
        assert_eq!(manager.pid("web"), None);

        let lines = sink.lines.lock().unwrap().clone();
        assert!(lines.contains(&(StreamKind::Stdout, "hello".to_string())));
        assert!(lines.contains(&(StreamKind::Stderr, "oops".to_string())));
        assert_eq!(sink.clears.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn start_while_running_is_a_noop() {
        let (manager, mut rx, fs) = manager();
        let sink = Arc::new(RecordingSink::default());
        manager.launch("web", sh("sleep 30"), sink.clone()).await;
        assert!(matches!(next_event(&mut rx).await, Event::PackageStarted { .. }));
        let pid = manager.pid("web");
        assert!(pid.is_some());

        let web = Package::new("web", fs.find_relative(&fs.root(), "apps/web").unwrap(), "dev");
        manager.start(&web, sink.clone()).await;
        manager.launch("web", sh("sleep 30"), sink.clone()).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(manager.pid("web"), pid);
        assert_eq!(manager.running_names(), vec!["web"]);

        manager.stop(&web).await;
        let events = wait_for_exit_event(&mut rx, "web").await;
        assert_eq!(stopped_count(&events, "web"), 1);
        assert!(!manager.is_running("web"));
    }

    #[tokio::test]
    async fn stop_while_stopped_is_a_noop() {
        let (manager, mut rx, _) = manager();
        manager.stop(&package("web", "/repo/apps/web")).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert!(!manager.is_running("web"));
    }

    #[tokio::test]
    async fn stop_and_exit_emit_a_single_stopped_event() {
        let (manager, mut rx, _) = manager();
        let sink = Arc::new(RecordingSink::default());
        manager.launch("web", sh("sleep 30"), sink).await;
        assert!(matches!(next_event(&mut rx).await, Event::PackageStarted { .. }));

        manager.stop_named("web").await;
        manager.stop_named("web").await;
        let events = wait_for_exit_event(&mut rx, "web").await;
        assert_eq!(stopped_count(&events, "web"), 1);
        assert!(!manager.is_running("web"));

        let late = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(late.is_err(), "unexpected event after exit: {:?}", late);
    }

    #[tokio::test]
    async fn stop_escalates_past_ignored_sigint() {
        let (manager, mut rx, _) = manager();
        let sink = Arc::new(RecordingSink::default());
        manager
            .launch("api", sh("trap '' INT; sleep 30"), sink)
            .await;
        assert!(matches!(next_event(&mut rx).await, Event::PackageStarted { .. }));

        manager.stop_named("api").await;
        let events = wait_for_exit_event(&mut rx, "api").await;
        assert!(matches!(events.last(), Some(Event::PackageExited { code: None, .. })));
    }

    #[tokio::test]
    async fn spawn_failure_reports_error_and_stays_stopped() {
        let (manager, mut rx, _) = manager();
        let missing = package("web", "/definitely/not/a/turborack/dir");
        manager
            .start(&missing, Arc::new(RecordingSink::default()))
            .await;

        match next_event(&mut rx).await {
            Event::PackageError { name, message } => {
                assert_eq!(name, "web");
                assert!(message.contains("npm run dev"), "{}", message);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(!manager.is_running("web"));
    }

    #[tokio::test]
    async fn restarted_run_survives_previous_exit() {
        let (manager, mut rx, _) = manager();
        let sink: Arc<dyn OutputSink> = Arc::new(RecordingSink::default());
        manager.launch("web", sh("sleep 30"), sink.clone()).await;
        let first = manager.pid("web");

        manager.stop_named("web").await;
        manager.launch("web", sh("sleep 30"), sink.clone()).await;
        let second = manager.pid("web");
        assert_ne!(first, second);

        wait_for_exit_event(&mut rx, "web").await;
        assert!(manager.is_running("web"));
        assert_eq!(manager.pid("web"), second);

        manager.shutdown_all().await;
        assert!(!manager.is_running("web"));
    }

    #[tokio::test]
    async fn new_run_starts_after_previous_run_reported() {
        let (manager, mut rx, _) = manager();
        let sink = Arc::new(RecordingSink::default());
        manager
            .launch(
                "web",
                sh("trap 'echo old-bye; exit 0' INT; while true; do sleep 0.05; done"),
                sink.clone(),
            )
            .await;
        assert!(matches!(next_event(&mut rx).await, Event::PackageStarted { .. }));

        manager.stop_named("web").await;
        manager.launch("web", sh("sleep 5"), sink.clone()).await;
        assert!(manager.is_running("web"));

        let mut events = Vec::new();
        loop {
            let event = next_event(&mut rx).await;
            let started = matches!(event, Event::PackageStarted { .. });
            events.push(event);
            if started {
                break;
            }
        }
        assert!(matches!(events[0], Event::PackageStopped { .. }));
        assert!(matches!(events[1], Event::PackageExited { code: Some(0), .. }));
        assert_eq!(events.len(), 3);
        assert_eq!(
            sink.transcript.lock().unwrap().clone(),
            vec!["<clear>", "old-bye", "<clear>"]
        );

        manager.shutdown_all().await;
        assert!(!manager.is_running("web"));
    }

    #[tokio::test]
    async fn restart_keeps_previous_exit_out_of_new_run() {
        let (manager, mut rx, _) = manager();
        let sink: Arc<dyn OutputSink> = Arc::new(RecordingSink::default());
        manager.launch("web", sh("sleep 30"), sink.clone()).await;
        assert!(matches!(next_event(&mut rx).await, Event::PackageStarted { .. }));

        manager.stop_named("web").await;
        manager.launch("web", sh("sleep 30"), sink.clone()).await;
        let events = [
            next_event(&mut rx).await,
            next_event(&mut rx).await,
            next_event(&mut rx).await,
        ];
        assert!(matches!(events[0], Event::PackageStopped { .. }));
        assert!(matches!(events[1], Event::PackageExited { .. }));
        assert!(matches!(events[2], Event::PackageStarted { .. }));

        let late = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(late.is_err(), "unexpected event after restart: {:?}", late);
        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn output_of_lingering_grandchild_is_dropped_after_exit() {
        let (manager, mut rx, _) = manager();
        let sink = Arc::new(RecordingSink::default());
        manager
            .launch("web", sh("echo early; (sleep 1; echo late) & exit 0"), sink.clone())
            .await;
        wait_for_exit_event(&mut rx, "web").await;

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let lines = sink.transcript.lock().unwrap().clone();
        assert_eq!(lines, vec!["<clear>", "early"]);
    }

    #[tokio::test]
    async fn bulk_operations_skip_packages_already_in_state() {
        let (manager, mut rx, _) = manager();
        let sink: Arc<dyn OutputSink> = Arc::new(RecordingSink::default());
        manager.launch("web", sh("sleep 30"), sink.clone()).await;
        assert!(matches!(next_event(&mut rx).await, Event::PackageStarted { .. }));

        let packages = vec![
            package("web", "/repo/apps/web"),
            package("api", "/definitely/not/a/turborack/dir"),
        ];
        manager.start_all(&packages, |_| sink.clone()).await;
        assert!(matches!(next_event(&mut rx).await, Event::PackageError { name, .. } if name == "api"));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        manager.stop_all(&packages).await;
        let events = wait_for_exit_event(&mut rx, "web").await;
        assert_eq!(stopped_count(&events, "web"), 1);
        assert_eq!(stopped_count(&events, "api"), 0);
        assert!(manager.running_names().is_empty());
    }
}
