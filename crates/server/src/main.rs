mod config;
mod simulation;
mod tui;

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{self, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::{cursor, execute};
use log::LevelFilter;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use tokio::io::{AsyncBufReadExt, BufReader};

use config::FileConfig;
use simulation::ArenaSimulation;
use snapnet::{
    GameServer, LossSimulation, ServerHandle, SessionState, Transport, TransportError,
    UdpTransport,
};
use tui::{LogBuffer, TuiLogger, TuiState};

#[derive(Parser)]
#[command(name = "snapnet-server")]
#[command(about = "Authoritative snapnet arena server")]
struct Args {
    #[arg(short, long, help = "JSON config file; flags override it")]
    config: Option<PathBuf>,

    #[arg(short, long)]
    bind: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(short, long)]
    tick_rate: Option<u32>,

    #[arg(short, long)]
    max_clients: Option<usize>,

    #[arg(short, long, help = "Level to load")]
    level: Option<String>,

    #[arg(short, long, help = "Command to run once the level is loaded")]
    exec: Option<String>,

    #[arg(long)]
    headless: bool,

    #[arg(long, help = "Log every snapshot sent")]
    show_snapshots: bool,

    #[arg(short, long, help = "Debug logging in the TUI")]
    verbose: bool,

    #[arg(long, help = "Enable packet loss simulation")]
    simulate_packet_loss: bool,

    #[arg(long, default_value_t = 0.0, help = "Packet loss percentage (0-100)")]
    loss_percent: f32,

    #[arg(long, default_value_t = 0, help = "Minimum latency in ms")]
    min_latency: u32,

    #[arg(long, default_value_t = 0, help = "Maximum latency in ms")]
    max_latency: u32,

    #[arg(long, default_value_t = 0, help = "Jitter in ms")]
    jitter: u32,
}

impl Args {
    /// File settings with every flag that was given laid over them.
    fn resolve(&self) -> Result<FileConfig> {
        let mut config = match &self.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };

        if let Some(bind) = &self.bind {
            config.network.bind = bind.clone();
        }
        if let Some(port) = self.port {
            config.network.port = port;
        }
        if let Some(max_clients) = self.max_clients {
            config.network.max_clients = max_clients;
            config.arena.max_players = max_clients;
        }
        if let Some(tick_rate) = self.tick_rate {
            config.session.tick_rate = tick_rate;
        }
        if let Some(level) = &self.level {
            config.arena.level = level.clone();
        }
        if let Some(exec) = &self.exec {
            config.arena.exec = Some(exec.clone());
        }
        if self.show_snapshots {
            config.session.show_snapshots = true;
        }
        if self.simulate_packet_loss {
            config.network.loss = LossSimulation {
                enabled: true,
                loss_percent: self.loss_percent.clamp(0.0, 100.0),
                min_latency_ms: self.min_latency,
                max_latency_ms: self.max_latency.max(self.min_latency),
                jitter_ms: self.jitter,
            };
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.resolve()?;

    let bind_addr = config.network.bind_addr();
    let udp = config.network.udp_config();
    let factory = move || -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(UdpTransport::listen(bind_addr.as_str(), udp.clone())?))
    };
    let server = GameServer::new(
        ArenaSimulation::new(config.arena.max_players),
        factory,
        config.session.clone(),
    );

    if args.headless {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
        server
            .start(&config.arena.level, config.arena.exec.as_deref())
            .context("failed to start the server")?;

        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(run_headless(server.handle()))?;
        server.stop();
        server.wait();
        log::info!("Server shut down");
    } else {
        let logs = LogBuffer::default();
        let level = if args.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        };
        TuiLogger::install(logs.clone(), level)?;
        server
            .start(&config.arena.level, config.arena.exec.as_deref())
            .context("failed to start the server")?;
        run_with_tui(&server, TuiState::new(logs))?;
    }

    Ok(())
}

/// Feeds stdin lines to the server until it stops or Ctrl-C arrives.
async fn run_headless(handle: ServerHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut ticker = tokio::time::interval(Duration::from_millis(100));

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                log::info!("Interrupted");
                break;
            }
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => handle.push_command(line),
                None => stdin_open = false,
            },
            _ = ticker.tick() => {
                if handle.state() == SessionState::Stopped {
                    break;
                }
            }
        }
    }
    Ok(())
}

fn run_with_tui(server: &GameServer, mut tui_state: TuiState) -> io::Result<()> {
    terminal::enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, cursor::Hide)?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    while server.state() != SessionState::Stopped {
        if event::poll(Duration::from_millis(16))?
            && let Event::Key(key) = event::read()?
            && key.kind == KeyEventKind::Press
        {
            match key.code {
                KeyCode::Esc => server.stop(),
                KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                    server.stop()
                }
                KeyCode::Char(c) => tui_state.type_char(c),
                KeyCode::Backspace => tui_state.backspace(),
                KeyCode::Enter => {
                    if let Some(line) = tui_state.submit() {
                        log::info!("> {line}");
                        server.push_command(line);
                    }
                }
                KeyCode::Up => tui_state.history_prev(),
                KeyCode::Down => tui_state.history_next(),
                KeyCode::PageUp => tui_state.scroll_up(),
                KeyCode::PageDown => tui_state.scroll_down(),
                KeyCode::End => tui_state.scroll_to_bottom(),
                _ => {}
            }
        }

        let status = server.status();
        terminal.draw(|frame| {
            tui::render(frame, &tui_state, &status);
        })?;
    }

    server.wait();

    terminal::disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, cursor::Show)?;

    Ok(())
}
