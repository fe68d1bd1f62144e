//! Terminal User Interface (TUI) rendering and management.
//!
//! This module handles initializing the terminal in raw mode, restoring it on exit,
//! and drawing the package list and the selected console using `ratatui`.

use std::io::{self, Stdout};

use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen, SetTitle,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, BorderType, Borders, Clear, List, ListItem, ListState, Paragraph};
use ratatui::Terminal;

use crate::app::{strip_carriage, App};
use crate::events::Severity;
use crate::output::{sanitize_text, StreamKind};
use crate::process::{PackageState, PackageStatus};

/// Type alias for the specific terminal backend used.
pub type TuiTerminal = Terminal<CrosstermBackend<Stdout>>;

/// Enables raw mode, enters the alternate screen, and creates a `ratatui` Terminal instance.
pub fn init_terminal() -> io::Result<TuiTerminal> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend)
}

/// Restores the terminal to its original state.
pub fn restore_terminal(mut terminal: TuiTerminal) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

/// Draws the current application state to the terminal.
pub fn draw(app: &mut App, terminal: &mut TuiTerminal) -> io::Result<()> {
    let title = window_title(app);
    execute!(terminal.backend_mut(), SetTitle(title))?;
    terminal.draw(|frame| {
        let area = frame.size();
        let vertical = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(1), Constraint::Length(4)])
            .split(area);
        let main = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(30), Constraint::Percentage(70)])
            .split(vertical[0]);

        let border_style = Style::default().fg(Color::DarkGray);
        let items = app
            .packages
            .iter()
            .enumerate()
            .map(|(index, state)| package_item(state, index == app.selected, app.use_symbols, main[0].width))
            .collect::<Vec<_>>();
        let list_title = if app.loading && !app.packages.is_empty() {
            "Packages (refreshing)".to_string()
        } else {
            format!("Packages ({})", app.packages.len())
        };
        let list = List::new(items).block(
            Block::default()
                .title(list_title)
                .borders(Borders::ALL)
                .border_type(BorderType::Rounded)
                .border_style(border_style),
        );
        let mut list_state = ListState::default();
        if !app.packages.is_empty() {
            list_state.select(Some(app.selected.min(app.packages.len() - 1)));
        }
        frame.render_stateful_widget(list, main[0], &mut list_state);

        let console_block = Block::default()
            .title(console_title(app))
            .borders(Borders::ALL)
            .border_type(BorderType::Rounded)
            .border_style(border_style);
        let console_area = console_block.inner(main[1]);
        let console_height = console_area.height as usize;
        app.set_log_view_height(console_height);

        let (console_lines, total) = render_console(app, console_height, console_area.width as usize);
        frame.render_widget(Paragraph::new(console_lines).block(console_block), main[1]);
        if total == 0 {
            let placeholder = if app.loading {
                "Discovering packages..."
            } else if app.packages.is_empty() {
                "No Turborepo packages found"
            } else {
                "No output yet (press s to start)"
            };
            let empty = Paragraph::new(placeholder).style(Style::default().fg(Color::DarkGray));
            frame.render_widget(empty, console_area);
        }

        let (help_line, help_style) = match app.status_message() {
            Some((text, Severity::Error)) => (text.to_string(), Style::default().fg(Color::Red)),
            Some((text, Severity::Info)) => (text.to_string(), Style::default().fg(Color::Yellow)),
            None => (default_help(app.use_symbols).to_string(), Style::default().fg(Color::DarkGray)),
        };
        let status = Paragraph::new(Text::from(vec![
            Line::from(Span::raw(app.status_line())),
            Line::from(Span::styled(help_line, help_style)),
        ]))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_type(BorderType::Rounded)
                .border_style(border_style),
        );
        frame.render_widget(status, vertical[1]);

        if app.show_help {
            let popup_area = centered_rect(60, 70, area);
            let help = Paragraph::new(HELP_TEXT.join("\n"))
                .block(
                    Block::default()
                        .title("Help")
                        .borders(Borders::ALL)
                        .border_type(BorderType::Rounded),
                )
                .style(Style::default().bg(Color::DarkGray).fg(Color::White));
            frame.render_widget(Clear, popup_area);
            frame.render_widget(help, popup_area);
        }
    })?;
    Ok(())
}

const HELP_TEXT: &[&str] = &[
    "Navigation:",
    "  Up/Down j/k  Select package",
    "  Tab          Cycle selection",
    "  PageUp/Dn    Scroll console",
    "  Home/End     Scroll to top/bottom",
    "  f            Toggle auto-follow",
    "",
    "Packages:",
    "  s / Enter    Start selected",
    "  x            Stop selected",
    "  r            Restart selected",
    "  a            Start all",
    "  z            Stop all",
    "  R / F5       Refresh package list",
    "",
    "General:",
    "  y            Copy console to clipboard",
    "  ?            Toggle this help",
    "  q            Quit (stops every package)",
];

fn default_help(use_symbols: bool) -> &'static str {
    if use_symbols {
        "↑/↓ select | s start | x stop | r restart | a all | z stop all | R refresh | y copy | f follow | q quit | ? help"
    } else {
        "Up/Down select | s start | x stop | r restart | a all | z stop all | R refresh | y copy | f follow | q quit | ? help"
    }
}

fn package_item(state: &PackageState, selected: bool, use_symbols: bool, width: u16) -> ListItem<'static> {
    let (indent, name_style) = if selected {
        ("▶ ", Style::default().fg(Color::White).add_modifier(Modifier::BOLD))
    } else {
        ("  ", Style::default().fg(Color::Gray))
    };
    let mut spans = vec![
        Span::styled(indent, Style::default().fg(Color::Cyan)),
        Span::styled(format!("[{}] ", status_char(state, use_symbols)), status_style(state)),
        Span::styled(state.name().to_string(), name_style),
        Span::styled(format!(" {}", state.package.script), Style::default().fg(Color::DarkGray)),
    ];
    if state.stale {
        spans.push(Span::styled(" (removed)", Style::default().fg(Color::Yellow)));
    }

    let mut text = Text::from(Line::from(spans));
    if let Some(url) = &state.url {
        let available = (width as usize).saturating_sub(6);
        text.lines.push(Line::from(vec![
            Span::raw("    "),
            Span::styled(truncate(url, available), Style::default().fg(Color::Blue)),
        ]));
    }
    ListItem::new(text)
}

fn status_char(state: &PackageState, use_symbols: bool) -> char {
    let failed = state.last_error.is_some() || state.exit_code.map(|code| code != 0).unwrap_or(false);
    match (state.status, use_symbols) {
        (PackageStatus::Running, true) => '▲',
        (PackageStatus::Running, false) => 'R',
        (PackageStatus::Stopped, true) => {
            if failed {
                '■'
            } else {
                '·'
            }
        }
        (PackageStatus::Stopped, false) => {
            if failed {
                'X'
            } else {
                '.'
            }
        }
    }
}

fn status_style(state: &PackageState) -> Style {
    match state.status {
        PackageStatus::Running => Style::default().fg(Color::Green),
        PackageStatus::Stopped if state.last_error.is_some() => Style::default().fg(Color::Red),
        PackageStatus::Stopped => match state.exit_code {
            Some(code) if code != 0 => Style::default().fg(Color::Red),
            _ => Style::default().fg(Color::DarkGray),
        },
    }
}

fn window_title(app: &App) -> String {
    match app.selected_package() {
        Some(state) => format!("turborack · {}", state.name()),
        None => "turborack".to_string(),
    }
}

fn console_title(app: &App) -> String {
    let Some(state) = app.selected_package() else {
        return format!("turborack · {}", app.root.display());
    };
    match state.status {
        PackageStatus::Running => format!("{} (running)", state.name()),
        PackageStatus::Stopped => match state.exit_code {
            Some(code) => format!("{} (exited {})", state.name(), code),
            None => format!("{} (stopped)", state.name()),
        },
    }
}

fn render_console(app: &App, height: usize, width: usize) -> (Text<'static>, usize) {
    let Some(state) = app.selected_package() else {
        return (Text::default(), 0);
    };
    let total = state.logs.len();
    if height == 0 || total == 0 {
        return (Text::default(), total);
    }
    let max_scroll = total.saturating_sub(height);
    let start = if state.follow {
        max_scroll
    } else {
        state.scroll.min(max_scroll)
    };
    let lines = state
        .logs
        .iter()
        .skip(start)
        .take(height)
        .map(|line| {
            let plain = strip_carriage(&sanitize_text(&line.text, true));
            let style = match line.stream {
                StreamKind::Stdout => Style::default(),
                StreamKind::Stderr => Style::default().fg(Color::LightRed),
            };
            Line::from(Span::styled(truncate(&plain, width.saturating_sub(1)), style))
        })
        .collect::<Vec<_>>();
    (Text::from(lines), total)
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

fn truncate(text: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out = text.chars().take(max.saturating_sub(1)).collect::<String>();
    out.push('~');
    out
}
