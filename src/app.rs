//! Application state and UI logic.
//!
//! This module holds the core `App` struct: the listed packages with their
//! consoles, the selection, and the status line. It reconciles every discovery
//! snapshot with the previous one by package name and translates key presses
//! into `AppAction`s for the event loop.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

use crate::events::{Event, Severity};
use crate::output::{detect_local_url, sanitize_text, LogLine, StreamKind};
use crate::package::Package;
use crate::process::{PackageState, PackageStatus};

/// The main application state container.
#[derive(Debug)]
pub struct App {
    /// Listed packages, in discovery order (stale ones last).
    pub packages: Vec<PackageState>,
    /// Index of the currently selected package.
    pub selected: usize,
    /// Workspace root shown in the title.
    pub root: PathBuf,
    /// A discovery pass is in flight.
    pub loading: bool,
    pub should_quit: bool,
    /// Height of the console area (for scrolling calculations).
    pub log_view_height: usize,
    pub use_symbols: bool,
    pub show_help: bool,
    max_lines: usize,
    status_message: Option<StatusMessage>,
}

/// Actions resulting from user interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppAction {
    None,
    Quit,
    /// Re-run discovery.
    Refresh,
    Start(String),
    Stop(String),
    Restart(String),
    StartAll,
    StopAll,
    /// Copy the selected console to the clipboard.
    CopyConsole,
}

#[derive(Debug, Clone)]
struct StatusMessage {
    text: String,
    at: Instant,
    ttl: Duration,
    level: Severity,
}

impl App {
    pub fn new(root: PathBuf, max_lines: usize, use_symbols: bool) -> Self {
        Self {
            packages: Vec::new(),
            selected: 0,
            root,
            loading: true,
            should_quit: false,
            log_view_height: 0,
            use_symbols,
            show_help: false,
            max_lines,
            status_message: None,
        }
    }

    pub fn selected_package(&self) -> Option<&PackageState> {
        self.packages.get(self.selected)
    }

    pub fn selected_package_mut(&mut self) -> Option<&mut PackageState> {
        self.packages.get_mut(self.selected)
    }

    fn package_mut(&mut self, name: &str) -> Option<&mut PackageState> {
        self.packages.iter_mut().find(|state| state.name() == name)
    }

    /// Packages of the current workspace snapshot, for bulk operations.
    pub fn snapshot(&self) -> Vec<Package> {
        self.packages
            .iter()
            .filter(|state| !state.stale)
            .map(|state| state.package.clone())
            .collect()
    }

    /// Replaces the package list with a new discovery snapshot.
    ///
    /// Console buffers, status and the selection carry over by name. A package
    /// that disappeared while running stays listed as stale until it stops.
    pub fn on_packages_loaded(&mut self, packages: Vec<Package>) {
        let selected_name = self.selected_package().map(|state| state.name().to_string());
        let mut previous = std::mem::take(&mut self.packages);

        let mut next = Vec::with_capacity(packages.len());
        for package in packages {
            let state = match previous.iter().position(|state| state.name() == package.name) {
                Some(index) => {
                    let mut state = previous.remove(index);
                    state.package = package;
                    state.stale = false;
                    state
                }
                None => PackageState::new(package, self.max_lines),
            };
            next.push(state);
        }
        for mut state in previous {
            if state.is_running() {
                state.stale = true;
                next.push(state);
            }
        }

        self.packages = next;
        self.selected = selected_name
            .and_then(|name| self.packages.iter().position(|state| state.name() == name))
            .unwrap_or(0);
        self.loading = false;
    }

    pub fn on_console_cleared(&mut self, name: &str) {
        if let Some(state) = self.package_mut(name) {
            state.logs.clear();
            state.scroll = 0;
        }
    }

    pub fn on_package_started(&mut self, name: &str, pid: Option<u32>, command: &str) {
        if let Some(state) = self.package_mut(name) {
            state.status = PackageStatus::Running;
            state.pid = pid;
            state.started_at = Some(Instant::now());
            state.exit_code = None;
            state.last_error = None;
            state.url = None;
        }
        self.push_tool_line(name, format!("$ {}", command));
    }

    pub fn on_package_stopped(&mut self, name: &str) {
        let Some(index) = self.packages.iter().position(|state| state.name() == name) else {
            return;
        };
        if self.packages[index].stale {
            self.packages.remove(index);
            if self.selected > index || self.selected >= self.packages.len() {
                self.selected = self.selected.saturating_sub(1);
            }
            return;
        }
        let state = &mut self.packages[index];
        state.status = PackageStatus::Stopped;
        state.pid = None;
        state.started_at = None;
    }

    pub fn on_package_exited(&mut self, name: &str, code: Option<i32>) {
        if let Some(state) = self.package_mut(name) {
            state.exit_code = code;
        }
        let line = match code {
            Some(0) => "process ended successfully".to_string(),
            Some(code) => format!("process ended with code {}", code),
            None => "process ended".to_string(),
        };
        self.push_tool_line(name, line);
    }

    pub fn on_package_error(&mut self, name: &str, message: &str) {
        if let Some(state) = self.package_mut(name) {
            state.status = PackageStatus::Stopped;
            state.pid = None;
            state.last_error = Some(message.to_string());
        }
        self.push_tool_line(name, format!("failed to start: {}", message));
    }

    pub fn on_package_output(&mut self, name: &str, line: String, stream: StreamKind) {
        let view = self.log_view_height.max(1);
        let Some(state) = self.package_mut(name) else {
            return;
        };
        if state.url.is_none() {
            state.url = detect_local_url(&line);
        }
        let dropped = state.logs.push(LogLine { text: line, stream });
        if state.follow {
            state.scroll = state.logs.len().saturating_sub(view);
        } else if dropped && state.scroll > 0 {
            state.scroll -= 1;
        }
    }

    /// Shows the notification carried by `event`, if any, in the status line.
    pub fn notify(&mut self, event: &Event) {
        if let Some(text) = event.notification() {
            self.set_status_message(text, event.severity());
        }
    }

    fn push_tool_line(&mut self, name: &str, text: String) {
        let marker = if self.use_symbols { "●" } else { "*" };
        self.on_package_output(name, format!("{} {}", marker, text), StreamKind::Stderr);
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> AppAction {
        if self.show_help {
            self.show_help = false;
            return AppAction::None;
        }
        let selected = self.selected_package().map(|state| state.name().to_string());
        match key.code {
            KeyCode::Char('q') => {
                self.should_quit = true;
                AppAction::Quit
            }
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                self.should_quit = true;
                AppAction::Quit
            }
            KeyCode::Up | KeyCode::Char('k') => {
                if self.selected > 0 {
                    self.selected -= 1;
                    self.ensure_follow();
                }
                AppAction::None
            }
            KeyCode::Down | KeyCode::Char('j') => {
                if self.selected + 1 < self.packages.len() {
                    self.selected += 1;
                    self.ensure_follow();
                }
                AppAction::None
            }
            KeyCode::Tab => {
                if !self.packages.is_empty() {
                    self.selected = (self.selected + 1) % self.packages.len();
                    self.ensure_follow();
                }
                AppAction::None
            }
            KeyCode::Char('s') | KeyCode::Enter => selected.map(AppAction::Start).unwrap_or(AppAction::None),
            KeyCode::Char('x') => selected.map(AppAction::Stop).unwrap_or(AppAction::None),
            KeyCode::Char('r') => selected.map(AppAction::Restart).unwrap_or(AppAction::None),
            KeyCode::Char('a') => AppAction::StartAll,
            KeyCode::Char('z') => AppAction::StopAll,
            KeyCode::Char('R') | KeyCode::F(5) => {
                if self.loading {
                    return AppAction::None;
                }
                self.loading = true;
                AppAction::Refresh
            }
            KeyCode::Char('y') => AppAction::CopyConsole,
            KeyCode::Char('f') => {
                self.toggle_follow();
                AppAction::None
            }
            KeyCode::Char('?') => {
                self.show_help = true;
                AppAction::None
            }
            KeyCode::PageUp => {
                self.scroll_up(self.log_view_height.max(1));
                AppAction::None
            }
            KeyCode::PageDown => {
                self.scroll_down(self.log_view_height.max(1));
                AppAction::None
            }
            KeyCode::Home => {
                self.scroll_to_top();
                AppAction::None
            }
            KeyCode::End => {
                if let Some(state) = self.selected_package_mut() {
                    state.follow = true;
                }
                self.ensure_follow();
                AppAction::None
            }
            _ => AppAction::None,
        }
    }

    pub fn scroll_up(&mut self, amount: usize) {
        let view = self.log_view_height.max(1);
        if let Some(state) = self.selected_package_mut() {
            let max_scroll = state.logs.len().saturating_sub(view);
            let current = if state.follow { max_scroll } else { state.scroll };
            state.scroll = current.saturating_sub(amount).min(max_scroll);
            state.follow = false;
        }
    }

    pub fn scroll_down(&mut self, amount: usize) {
        let view = self.log_view_height.max(1);
        if let Some(state) = self.selected_package_mut() {
            let max_scroll = state.logs.len().saturating_sub(view);
            let current = if state.follow { max_scroll } else { state.scroll };
            let next = (current + amount).min(max_scroll);
            state.scroll = next;
            state.follow = next == max_scroll;
        }
    }

    pub fn scroll_to_top(&mut self) {
        if let Some(state) = self.selected_package_mut() {
            state.scroll = 0;
            state.follow = false;
        }
    }

    pub fn ensure_follow(&mut self) {
        let view = self.log_view_height.max(1);
        if let Some(state) = self.selected_package_mut() {
            if state.follow {
                state.scroll = state.logs.len().saturating_sub(view);
            }
        }
    }

    fn toggle_follow(&mut self) {
        if let Some(state) = self.selected_package_mut() {
            state.follow = !state.follow;
        }
        self.ensure_follow();
    }

    pub fn set_log_view_height(&mut self, height: usize) {
        self.log_view_height = height;
        let view = height.max(1);
        if let Some(state) = self.selected_package_mut() {
            let max_scroll = state.logs.len().saturating_sub(view);
            if state.follow {
                state.scroll = max_scroll;
            } else {
                state.scroll = state.scroll.min(max_scroll);
            }
        }
    }

    pub fn running_count(&self) -> usize {
        self.packages.iter().filter(|state| state.is_running()).count()
    }

    pub fn status_line(&self) -> String {
        if self.loading {
            return format!("Discovering packages in {}", self.root.display());
        }
        let Some(state) = self.selected_package() else {
            return format!("No packages found in {}", self.root.display());
        };
        let status = match (&state.status, &state.last_error) {
            (PackageStatus::Running, _) => "running".to_string(),
            (PackageStatus::Stopped, Some(_)) => "failed".to_string(),
            (PackageStatus::Stopped, None) => match state.exit_code {
                Some(code) => format!("stopped ({})", code),
                None => "stopped".to_string(),
            },
        };
        let pid = state
            .pid
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "-".into());
        let elapsed = state
            .started_at
            .map(|at| format_duration(at.elapsed()))
            .unwrap_or_else(|| "-".into());
        format!(
            "{} | {} | pid: {} | script: {} | up: {} | running: {}/{} | follow: {}",
            state.name(),
            status,
            pid,
            state.package.script,
            elapsed,
            self.running_count(),
            self.packages.len(),
            if state.follow { "on" } else { "off" }
        )
    }

    pub fn status_message(&self) -> Option<(&str, Severity)> {
        self.status_message
            .as_ref()
            .filter(|message| message.at.elapsed() < message.ttl)
            .map(|message| (message.text.as_str(), message.level))
    }

    pub fn set_status_message(&mut self, message: impl Into<String>, level: Severity) {
        let ttl = match level {
            Severity::Info => Duration::from_secs(4),
            Severity::Error => Duration::from_secs(10),
        };
        self.status_message = Some(StatusMessage {
            text: message.into(),
            at: Instant::now(),
            ttl,
            level,
        });
    }

    /// Plain text of the selected console, ANSI codes removed.
    pub fn selected_console_text(&self) -> Option<String> {
        let state = self.selected_package()?;
        let lines = state
            .logs
            .iter()
            .map(|line| strip_carriage(&sanitize_text(&line.text, true)))
            .collect::<Vec<_>>();
        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }
}

pub fn strip_carriage(text: &str) -> String {
    text.rsplit('\r').next().unwrap_or("").to_string()
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::Entry;

    fn package(name: &str) -> Package {
        Package::new(name, Entry::new(format!("/repo/packages/{}", name)), "dev")
    }

    fn make_app(names: &[&str]) -> App {
        let mut app = App::new(PathBuf::from("/repo"), 100, false);
        app.on_packages_loaded(names.iter().map(|name| package(name)).collect());
        app
    }

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn console(app: &App, name: &str) -> Vec<String> {
        app.packages
            .iter()
            .find(|state| state.name() == name)
            .map(|state| state.logs.iter().map(|line| line.text.clone()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn reload_keeps_console_status_and_selection_by_name() {
        let mut app = make_app(&["api", "web"]);
        app.selected = 1;
        app.on_package_started("web", Some(7), "npm run dev");
        app.on_package_output("web", "ready".into(), StreamKind::Stdout);

        app.on_packages_loaded(vec![package("docs"), package("web"), package("api")]);
        let names = app.packages.iter().map(|s| s.name()).collect::<Vec<_>>();
        assert_eq!(names, vec!["docs", "web", "api"]);
        assert_eq!(app.selected_package().unwrap().name(), "web");
        assert!(app.selected_package().unwrap().is_running());
        assert_eq!(console(&app, "web"), vec!["* $ npm run dev", "ready"]);
        assert!(!app.loading);
    }

    #[test]
    fn vanished_running_package_stays_until_stopped() {
        let mut app = make_app(&["api", "web"]);
        app.on_package_started("api", Some(3), "npm run dev");

        app.on_packages_loaded(vec![package("web")]);
        let names = app.packages.iter().map(|s| s.name()).collect::<Vec<_>>();
        assert_eq!(names, vec!["web", "api"]);
        assert!(app.packages[1].stale);
        assert_eq!(app.snapshot(), vec![package("web")]);

        app.on_package_stopped("api");
        assert_eq!(app.packages.len(), 1);
        assert_eq!(app.selected, 0);
    }

    #[test]
    fn lifecycle_events_update_status() {
        let mut app = make_app(&["web"]);
        app.on_package_started("web", Some(11), "yarn dev");
        assert_eq!(app.packages[0].pid, Some(11));
        app.on_package_exited("web", Some(1));
        app.on_package_stopped("web");
        assert_eq!(app.packages[0].status, PackageStatus::Stopped);
        assert_eq!(app.packages[0].exit_code, Some(1));
        assert!(app.status_line().contains("stopped (1)"));

        app.on_package_error("web", "No such file or directory");
        assert_eq!(app.packages[0].last_error.as_deref(), Some("No such file or directory"));
        assert!(app.status_line().contains("failed"));
    }

    #[test]
    fn console_clear_and_url_detection() {
        let mut app = make_app(&["web"]);
        app.on_package_output("web", "old".into(), StreamKind::Stdout);
        app.on_console_cleared("web");
        assert!(console(&app, "web").is_empty());

        app.on_package_output("web", "  Local:   http://localhost:3000".into(), StreamKind::Stdout);
        app.on_package_output("web", "  Network: http://127.0.0.1:3001".into(), StreamKind::Stdout);
        assert_eq!(app.packages[0].url.as_deref(), Some("http://localhost:3000"));
        assert_eq!(app.selected_console_text().unwrap().lines().count(), 2);
    }

    #[test]
    fn keys_map_to_actions_for_selected_package() {
        let mut app = make_app(&["api", "web"]);
        assert_eq!(app.handle_key(key(KeyCode::Char('s'))), AppAction::Start("api".into()));
        app.handle_key(key(KeyCode::Down));
        assert_eq!(app.handle_key(key(KeyCode::Char('x'))), AppAction::Stop("web".into()));
        assert_eq!(app.handle_key(key(KeyCode::Char('r'))), AppAction::Restart("web".into()));
        assert_eq!(app.handle_key(key(KeyCode::Char('a'))), AppAction::StartAll);
        assert_eq!(app.handle_key(key(KeyCode::Char('z'))), AppAction::StopAll);
        assert_eq!(app.handle_key(key(KeyCode::F(5))), AppAction::Refresh);
        assert_eq!(app.handle_key(key(KeyCode::Char('R'))), AppAction::None);
        assert_eq!(app.handle_key(key(KeyCode::Char('q'))), AppAction::Quit);
        assert!(app.should_quit);
    }

    #[test]
    fn scrolling_disables_and_restores_follow() {
        let mut app = make_app(&["web"]);
        app.set_log_view_height(2);
        for i in 0..5 {
            app.on_package_output("web", format!("line {}", i), StreamKind::Stdout);
        }
        assert_eq!(app.packages[0].scroll, 3);

        app.scroll_up(2);
        assert!(!app.packages[0].follow);
        assert_eq!(app.packages[0].scroll, 1);

        app.scroll_down(5);
        assert!(app.packages[0].follow);
        assert_eq!(app.packages[0].scroll, 3);
    }

    #[test]
    fn notifications_follow_event_severity() {
        let mut app = make_app(&["web"]);
        app.notify(&Event::PackageError {
            name: "web".into(),
            message: "spawn failed".into(),
        });
        let (text, level) = app.status_message().unwrap();
        assert!(text.contains("web"));
        assert_eq!(level, Severity::Error);
    }
}
