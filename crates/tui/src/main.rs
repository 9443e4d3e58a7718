//! relaycast channel dashboard
//!
//! Terminal interface for watching live channels: state, listener counts and
//! endpoints. Polls the daemon's channel list at <base>/channels, where the
//! base defaults to http://127.0.0.1:7878 and can be given as the first
//! argument or in RCTOP_URL.

use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    symbols,
    text::{Line, Span},
    widgets::{Axis, Block, Borders, Cell, Chart, Dataset, Paragraph, Row, Table, Wrap},
    Frame, Terminal,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, VecDeque},
    io::{self, Stdout},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:7878";
const POLL_INTERVAL_MS: u64 = 500;
const MAX_LISTENER_POINTS: usize = 120;
const MAX_EVENT_LOG_ENTRIES: usize = 100;

// ============================================================================
// Data Models (mirroring the daemon's channel status)
// ============================================================================

/// One row of the daemon's channel list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelStatus {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub state: String,
    pub listeners: u32,
    pub peak_listeners: u32,
    pub max_listeners: u32,
    pub start_date: i64,
    pub target: String,
    pub stream_type: String,
    pub bitrate: u32,
    pub interface: String,
    pub port: u16,
    pub fixed_endpoint: bool,
    #[serde(default)]
    pub play_url: String,
}

impl ChannelStatus {
    fn is_running(&self) -> bool {
        self.state == "running"
    }
}

// ============================================================================
// App State
// ============================================================================

/// Main application state for the dashboard
pub struct App {
    /// Channel list from the last successful poll
    pub channels: Vec<ChannelStatus>,
    /// Event log with channel state changes
    pub event_log: VecDeque<String>,
    /// Total listeners over time (elapsed_secs, listeners)
    pub listener_history: VecDeque<(f64, f64)>,
    /// Connection status
    pub connected: bool,
    channels_url: String,
    client: reqwest::Client,
    start_time: Instant,
}

impl App {
    pub fn new(base_url: &str) -> Self {
        Self {
            channels: Vec::new(),
            event_log: VecDeque::with_capacity(MAX_EVENT_LOG_ENTRIES),
            listener_history: VecDeque::with_capacity(MAX_LISTENER_POINTS),
            connected: false,
            channels_url: format!("{}/channels", base_url.trim_end_matches('/')),
            client: reqwest::Client::new(),
            start_time: Instant::now(),
        }
    }

    /// Add an event to the log
    pub fn log_event(&mut self, event: String) {
        if self.event_log.len() >= MAX_EVENT_LOG_ENTRIES {
            self.event_log.pop_front();
        }
        self.event_log.push_back(event);
    }

    pub fn total_listeners(&self) -> u32 {
        self.channels.iter().map(|c| c.listeners).sum()
    }

    pub fn running_channels(&self) -> usize {
        self.channels.iter().filter(|c| c.is_running()).count()
    }

    /// Fetch the channel list from the daemon
    pub async fn fetch_channels(&mut self) {
        match self.client.get(&self.channels_url).send().await {
            Ok(response) => {
                if response.status().is_success() {
                    match response.json::<Vec<ChannelStatus>>().await {
                        Ok(channels) => {
                            let elapsed = self.start_time.elapsed().as_secs_f64();
                            self.apply_channels(channels, elapsed);
                            if !self.connected {
                                self.log_event("Connected".to_string());
                            }
                            self.connected = true;
                        }
                        Err(e) => {
                            self.log_event(format!("JSON parse error: {}", e));
                            self.connected = false;
                        }
                    }
                } else {
                    self.log_event(format!("HTTP error: {}", response.status()));
                    self.connected = false;
                }
            }
            Err(e) => {
                if self.connected {
                    self.log_event(format!("Connection lost: {}", e));
                }
                self.connected = false;
            }
        }
    }

    /// Replace the channel list, logging what changed since the last poll.
    fn apply_channels(&mut self, channels: Vec<ChannelStatus>, elapsed_secs: f64) {
        let previous: HashMap<i64, &ChannelStatus> =
            self.channels.iter().map(|c| (c.id, c)).collect();

        let mut events = Vec::new();
        for channel in &channels {
            match previous.get(&channel.id) {
                None => events.push(format!("#{} {} appeared", channel.id, channel.name)),
                Some(before) => {
                    if before.state != channel.state {
                        events.push(format!(
                            "#{} {} {} -> {}",
                            channel.id, channel.name, before.state, channel.state
                        ));
                    }
                    if channel.peak_listeners > before.peak_listeners {
                        events.push(format!(
                            "#{} {} new peak: {}",
                            channel.id, channel.name, channel.peak_listeners
                        ));
                    }
                }
            }
        }
        for id in previous.keys() {
            if !channels.iter().any(|c| c.id == *id) {
                events.push(format!("#{} removed", id));
            }
        }

        self.channels = channels;
        for event in events {
            self.log_event(event);
        }

        if self.listener_history.len() >= MAX_LISTENER_POINTS {
            self.listener_history.pop_front();
        }
        self.listener_history
            .push_back((elapsed_secs, self.total_listeners() as f64));
    }
}

// ============================================================================
// Terminal Setup/Teardown
// ============================================================================

fn setup_terminal() -> io::Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend)
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;
    Ok(())
}

// ============================================================================
// Widget Rendering
// ============================================================================

/// Render the channel table
fn render_channel_table(f: &mut Frame, area: Rect, app: &App, now: i64) {
    let header_cells = ["ID", "Name", "State", "Listeners", "Peak", "Endpoint", "Stream", "Uptime"]
        .iter()
        .map(|h| Cell::from(*h).style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)));
    let header = Row::new(header_cells).height(1).bottom_margin(1);

    let rows: Vec<Row> = app
        .channels
        .iter()
        .map(|channel| {
            let state_style = if channel.is_running() {
                Style::default().fg(Color::Green)
            } else {
                Style::default().fg(Color::DarkGray)
            };
            let uptime = if channel.is_running() && channel.start_date > 0 {
                format_duration((now - channel.start_date).max(0) as u64)
            } else {
                "-".to_string()
            };
            Row::new(vec![
                Cell::from(channel.id.to_string()),
                Cell::from(channel.name.clone()),
                Cell::from(channel.state.clone()).style(state_style),
                Cell::from(format_listeners(channel.listeners, channel.max_listeners)),
                Cell::from(channel.peak_listeners.to_string()),
                Cell::from(format_endpoint(channel)),
                Cell::from(format!("{} {}k", channel.stream_type, channel.bitrate)),
                Cell::from(uptime),
            ])
        })
        .collect();

    let widths = [
        Constraint::Length(5),
        Constraint::Min(12),
        Constraint::Length(9),
        Constraint::Length(10),
        Constraint::Length(6),
        Constraint::Length(22),
        Constraint::Length(10),
        Constraint::Length(9),
    ];

    let title = if app.connected {
        " Channels "
    } else {
        " Channels (Disconnected) "
    };

    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(title));

    f.render_widget(table, area);
}

/// Render total listeners over time
fn render_listener_chart(f: &mut Frame, area: Rect, app: &App) {
    let data: Vec<(f64, f64)> = app.listener_history.iter().cloned().collect();

    if data.is_empty() {
        let block = Block::default().borders(Borders::ALL).title(" Listeners ");
        f.render_widget(block, area);
        return;
    }

    let min_x = data.first().map(|(x, _)| *x).unwrap_or(0.0);
    let max_x = data.last().map(|(x, _)| *x).unwrap_or(60.0).max(min_x + 1.0);
    let max_y = data.iter().map(|(_, y)| *y).fold(0.0f64, f64::max).max(1.0);

    let datasets = vec![Dataset::default()
        .name("listeners")
        .marker(symbols::Marker::Braille)
        .style(Style::default().fg(Color::Green))
        .data(&data)];

    let chart = Chart::new(datasets)
        .block(Block::default().borders(Borders::ALL).title(" Listeners "))
        .x_axis(
            Axis::default()
                .title("Time (s)")
                .style(Style::default().fg(Color::Gray))
                .bounds([min_x, max_x])
                .labels(vec![
                    Span::raw(format!("{:.0}", min_x)),
                    Span::raw(format!("{:.0}", max_x)),
                ]),
        )
        .y_axis(
            Axis::default()
                .style(Style::default().fg(Color::Gray))
                .bounds([0.0, max_y])
                .labels(vec![
                    Span::raw("0"),
                    Span::raw(format!("{:.0}", max_y)),
                ]),
        );

    f.render_widget(chart, area);
}

fn render_event_log(f: &mut Frame, area: Rect, app: &App) {
    let events: Vec<Line> = app
        .event_log
        .iter()
        .rev()
        .take((area.height as usize).saturating_sub(2))
        .map(|e| Line::from(e.as_str()))
        .collect();

    let paragraph = Paragraph::new(events)
        .block(Block::default().borders(Borders::ALL).title(" Event Log "))
        .wrap(Wrap { trim: true });

    f.render_widget(paragraph, area);
}

fn render_status_bar(f: &mut Frame, area: Rect, app: &App) {
    let status = if app.connected {
        format!(
            " Channels: {} | Running: {} | Listeners: {} | Press 'q' to quit ",
            app.channels.len(),
            app.running_channels(),
            app.total_listeners()
        )
    } else {
        format!(" Connecting to {}... | Press 'q' to quit ", app.channels_url)
    };

    let paragraph =
        Paragraph::new(status).style(Style::default().fg(Color::White).bg(Color::DarkGray));

    f.render_widget(paragraph, area);
}

fn format_listeners(listeners: u32, max_listeners: u32) -> String {
    if max_listeners == 0 {
        listeners.to_string()
    } else {
        format!("{}/{}", listeners, max_listeners)
    }
}

fn format_endpoint(channel: &ChannelStatus) -> String {
    let endpoint = if channel.port == 0 {
        "-".to_string()
    } else {
        format!("{}:{}", channel.interface, channel.port)
    };
    if channel.fixed_endpoint {
        format!("{} (fixed)", endpoint)
    } else {
        endpoint
    }
}

/// Format duration in seconds to human-readable string
fn format_duration(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ============================================================================
// Main UI Layout
// ============================================================================

fn ui(f: &mut Frame, app: &App) {
    let size = f.area();

    let main_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(1)])
        .split(size);

    // Channel table on top, chart and event log below
    let content_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
        .split(main_chunks[0]);

    let bottom_chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(content_chunks[1]);

    render_channel_table(f, content_chunks[0], app, unix_now());
    render_listener_chart(f, bottom_chunks[0], app);
    render_event_log(f, bottom_chunks[1], app);
    render_status_bar(f, main_chunks[1], app);
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> io::Result<()> {
    let base_url = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("RCTOP_URL").ok())
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

    let mut terminal = setup_terminal()?;

    let mut app = App::new(&base_url);
    app.log_event("rctop started".to_string());

    let result = run_app(&mut terminal, &mut app).await;

    restore_terminal(&mut terminal)?;

    result
}

async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    app: &mut App,
) -> io::Result<()> {
    let poll_interval = Duration::from_millis(POLL_INTERVAL_MS);
    let mut last_fetch: Option<Instant> = None;

    loop {
        if last_fetch.map_or(true, |t| t.elapsed() >= poll_interval) {
            app.fetch_channels().await;
            last_fetch = Some(Instant::now());
        }

        terminal.draw(|f| ui(f, app))?;

        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => {
                            return Ok(());
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}
