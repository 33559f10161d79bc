use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use log::{Level, LevelFilter, Log, Metadata, Record};
use ratatui::Frame;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph, Row, Table};

use snapnet::{ServerStatus, SessionState};

const MAX_LOG_LINES: usize = 1000;

#[derive(Debug, Clone)]
pub struct LogLine {
    pub level: Level,
    pub text: String,
}

/// Log lines shared between the logger and the renderer.
#[derive(Debug, Clone, Default)]
pub struct LogBuffer(Arc<Mutex<VecDeque<LogLine>>>);

impl LogBuffer {
    pub fn push(&self, level: Level, text: String) {
        let mut lines = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == MAX_LOG_LINES {
            lines.pop_front();
        }
        lines.push_back(LogLine { level, text });
    }

    pub fn snapshot(&self) -> Vec<LogLine> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

/// Routes `log` records into the log pane instead of the terminal.
pub struct TuiLogger {
    buffer: LogBuffer,
    level: LevelFilter,
}

impl TuiLogger {
    pub fn install(buffer: LogBuffer, level: LevelFilter) -> Result<(), log::SetLoggerError> {
        log::set_logger(Box::leak(Box::new(Self { buffer, level })))?;
        log::set_max_level(level);
        Ok(())
    }
}

impl Log for TuiLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.buffer.push(record.level(), record.args().to_string());
        }
    }

    fn flush(&self) {}
}

#[derive(Debug, Default)]
pub struct TuiState {
    pub logs: LogBuffer,
    input: String,
    history: Vec<String>,
    history_cursor: Option<usize>,
    /// Lines scrolled back from the bottom of the log.
    scroll: usize,
}

impl TuiState {
    pub fn new(logs: LogBuffer) -> Self {
        Self {
            logs,
            ..Self::default()
        }
    }

    pub fn type_char(&mut self, c: char) {
        self.input.push(c);
        self.history_cursor = None;
    }

    pub fn backspace(&mut self) {
        self.input.pop();
    }

    /// Takes the typed command line, if any.
    pub fn submit(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.input);
        self.history_cursor = None;
        let line = line.trim().to_string();
        if line.is_empty() {
            return None;
        }
        if self.history.last() != Some(&line) {
            self.history.push(line.clone());
        }
        self.scroll = 0;
        Some(line)
    }

    pub fn history_prev(&mut self) {
        if self.history.is_empty() {
            return;
        }
        let index = match self.history_cursor {
            Some(index) => index.saturating_sub(1),
            None => self.history.len() - 1,
        };
        self.history_cursor = Some(index);
        self.input = self.history[index].clone();
    }

    pub fn history_next(&mut self) {
        let Some(index) = self.history_cursor else {
            return;
        };
        if index + 1 < self.history.len() {
            self.history_cursor = Some(index + 1);
            self.input = self.history[index + 1].clone();
        } else {
            self.history_cursor = None;
            self.input.clear();
        }
    }

    pub fn scroll_up(&mut self) {
        self.scroll = self.scroll.saturating_add(10);
    }

    pub fn scroll_down(&mut self) {
        self.scroll = self.scroll.saturating_sub(10);
    }

    pub fn scroll_to_bottom(&mut self) {
        self.scroll = 0;
    }
}

pub fn render(frame: &mut Frame, state: &TuiState, status: &ServerStatus) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(6),
            Constraint::Min(5),
            Constraint::Length(3),
        ])
        .split(frame.area());

    render_header(frame, chunks[0], status);
    render_connections(frame, chunks[1], status);
    render_log(frame, chunks[2], state);
    render_input(frame, chunks[3], state);
}

fn render_header(frame: &mut Frame, area: Rect, status: &ServerStatus) {
    let (label, color) = match status.state {
        SessionState::Running => ("running", Color::Green),
        SessionState::Starting => ("starting", Color::Yellow),
        SessionState::Stopping => ("stopping", Color::Yellow),
        SessionState::Stopped => ("stopped", Color::Red),
    };
    let addr = status
        .local_addr
        .map_or_else(|| "-".to_string(), |addr| addr.to_string());
    let net = &status.stats;

    let block = Block::default()
        .title(format!(" snapnet server - {addr} "))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    let line = Line::from(vec![
        Span::styled(label, Style::default().fg(color).add_modifier(Modifier::BOLD)),
        Span::raw(format!(
            "  |  Level: {}  |  Frame: {}  |  Clients: {}  |  {} / {} pkts  |  {} / {}  |  RTT {:.1}ms",
            status.level.as_deref().unwrap_or("-"),
            status.frame,
            status.connections.len(),
            net.packets_sent,
            net.packets_received,
            format_bytes(net.bytes_sent),
            format_bytes(net.bytes_received),
            net.rtt_ms,
        )),
    ]);

    frame.render_widget(Paragraph::new(line).block(block), area);
}

fn render_connections(frame: &mut Frame, area: Rect, status: &ServerStatus) {
    let block = Block::default()
        .title(" Connections ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow));

    let rows = status.connections.iter().map(|connection| {
        Row::new(vec![
            connection.identity.to_string(),
            format!("{:?}", connection.state),
            connection.last_acked_frame.to_string(),
            if connection.active { "yes" } else { "no" }.to_string(),
        ])
    });
    let table = Table::new(
        rows,
        [
            Constraint::Length(24),
            Constraint::Length(14),
            Constraint::Length(10),
            Constraint::Length(8),
        ],
    )
    .header(
        Row::new(vec!["Address", "State", "Acked", "Active"])
            .style(Style::default().fg(Color::Gray).add_modifier(Modifier::BOLD)),
    )
    .block(block);

    frame.render_widget(table, area);
}

fn render_log(frame: &mut Frame, area: Rect, state: &TuiState) {
    let block = Block::default()
        .title(" Log (PgUp/PgDn to scroll) ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray));

    let visible = area.height.saturating_sub(2) as usize;
    let lines = state.logs.snapshot();
    let end = lines.len().saturating_sub(state.scroll);
    let start = end.saturating_sub(visible);

    let text: Vec<Line> = lines[start..end]
        .iter()
        .map(|line| {
            let color = match line.level {
                Level::Error => Color::Red,
                Level::Warn => Color::Yellow,
                Level::Info => Color::White,
                Level::Debug | Level::Trace => Color::DarkGray,
            };
            Line::from(Span::styled(line.text.clone(), Style::default().fg(color)))
        })
        .collect();

    frame.render_widget(Paragraph::new(text).block(block), area);
}

fn render_input(frame: &mut Frame, area: Rect, state: &TuiState) {
    let block = Block::default()
        .title(" Command (Enter to run, Esc to stop) ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Green));

    let line = Line::from(vec![
        Span::styled("> ", Style::default().fg(Color::Green)),
        Span::raw(state.input.as_str()),
    ]);
    frame.render_widget(Paragraph::new(line).block(block), area);
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{}B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1}KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1}MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1}GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
