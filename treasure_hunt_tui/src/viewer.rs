use std::collections::HashMap;
use std::io::{self, Stdout};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use ratatui::{
    crossterm::{
        event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode},
        execute,
        terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
    },
    prelude::*,
    widgets::*,
};
use treasure_hunt_core::engine::EngineSnapshot;
use treasure_hunt_core::percept::Percept;
use treasure_hunt_core::server::{Hub, ServerHandle};
use treasure_hunt_core::{AgentId, ItemKind, Position};

struct App {
    hub: Arc<Hub>,
    addr: String,
    snapshot: EngineSnapshot,
    started: Instant,
    /// Set the first time every agent reports completion.
    finished_after: Option<Duration>,
    should_quit: bool,
}

impl App {
    fn new(server: &ServerHandle) -> Self {
        let hub = Arc::clone(server.hub());
        let snapshot = hub.snapshot();
        App {
            hub,
            addr: server.local_addr().to_string(),
            snapshot,
            started: Instant::now(),
            finished_after: None,
            should_quit: false,
        }
    }

    /// Pulls a fresh copy of the session.
    fn tick(&mut self) {
        self.snapshot = self.hub.snapshot();
        if self.finished_after.is_none() && self.snapshot.agents.iter().all(|a| a.completed) {
            self.finished_after = Some(self.started.elapsed());
        }
    }

    fn quit(&mut self) {
        self.should_quit = true;
    }
}

/// Draws the session until the user quits.
pub fn run(server: &ServerHandle) -> Result<()> {
    let mut terminal = setup_terminal()?;
    let mut app = App::new(server);
    let result = run_app(&mut terminal, &mut app);
    restore_terminal(&mut terminal)?;
    result
}

/// Configures the terminal for the viewer.
fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>> {
    let mut stdout = io::stdout();
    enable_raw_mode()?;
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend).map_err(Into::into)
}

/// Restores the terminal to its original state.
fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;
    Ok(())
}

/// Runs the viewer loop, refreshing the snapshot every tick.
fn run_app(terminal: &mut Terminal<CrosstermBackend<Stdout>>, app: &mut App) -> Result<()> {
    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();

    loop {
        terminal.draw(|f| ui(f, app))?;

        let timeout = tick_rate
            .checked_sub(last_tick.elapsed())
            .unwrap_or(Duration::ZERO);
        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if matches!(key.code, KeyCode::Char('q') | KeyCode::Esc) {
                    app.quit();
                }
            }
        }

        if last_tick.elapsed() >= tick_rate {
            app.tick();
            last_tick = Instant::now();
        }
        if app.should_quit {
            return Ok(());
        }
    }
}

/// Lays out the map, the agent list and the status line.
fn ui(frame: &mut Frame, app: &App) {
    let rows = app.snapshot.agents.len() as u16 + 2;
    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(5),
            Constraint::Length(rows),
            Constraint::Length(2),
        ])
        .split(frame.area());

    render_map(frame, layout[0], &app.snapshot);
    render_agents(frame, layout[1], &app.snapshot);

    let status = match app.finished_after {
        Some(elapsed) => format!("All missions completed in {elapsed:.1?}. Press 'q' or 'Esc' to quit."),
        None => format!(
            "Listening on {} ({}/{} connected). Press 'q' or 'Esc' to quit.",
            app.addr,
            app.snapshot.connected,
            app.snapshot.agents.len()
        ),
    };
    let help = Paragraph::new(status)
        .alignment(Alignment::Center)
        .block(Block::default().borders(Borders::TOP));
    frame.render_widget(help, layout[2]);
}

fn agent_color(color: [u8; 3]) -> Color {
    Color::Rgb(color[0], color[1], color[2])
}

/// Glyph and style of an empty cell, from its percept value.
fn heat_span(value: f64) -> Span<'static> {
    match Percept::from_value(value) {
        Percept::KeyNeighbour => Span::styled("+", Style::default().fg(Color::Yellow)),
        Percept::KeyOuter => Span::styled("-", Style::default().fg(Color::Yellow).dim()),
        Percept::BoxNeighbour => Span::styled("+", Style::default().fg(Color::Magenta)),
        Percept::BoxOuter => Span::styled("-", Style::default().fg(Color::Magenta).dim()),
        Percept::ObstacleNeighbour => Span::styled("~", Style::default().fg(Color::DarkGray)),
        Percept::Target => Span::styled("#", Style::default().fg(Color::Gray)),
        Percept::Empty | Percept::Unknown => Span::raw(" "),
    }
}

/// Renders the grid with its items, agents and trails.
fn render_map(frame: &mut Frame, area: Rect, snapshot: &EngineSnapshot) {
    let colors: Vec<Color> = snapshot.agents.iter().map(|a| agent_color(a.color)).collect();
    let color_of = |id: AgentId| colors.get(id).copied().unwrap_or(Color::White);

    let mut items: HashMap<Position, (ItemKind, AgentId)> = HashMap::new();
    for item in snapshot.keys.iter().chain(snapshot.boxes.iter()) {
        items.insert(item.position, (item.kind, item.owner));
    }
    let mut trails: HashMap<Position, AgentId> = HashMap::new();
    for agent in &snapshot.agents {
        for &cell in &agent.path {
            trails.insert(cell, agent.id);
        }
    }
    let agents: HashMap<Position, AgentId> = snapshot
        .agents
        .iter()
        .filter(|a| a.connected || a.completed)
        .map(|a| (a.position, a.id))
        .collect();

    let grid = &snapshot.values;
    let mut lines: Vec<Line> = Vec::with_capacity(grid.height());
    for y in 0..grid.height() {
        let mut spans: Vec<Span> = Vec::with_capacity(grid.width());
        for x in 0..grid.width() {
            let position = Position::new(x, y);
            let span = if let Some(&id) = agents.get(&position) {
                Span::styled("@", Style::default().fg(color_of(id)).bold())
            } else if let Some(&(kind, owner)) = items.get(&position) {
                let glyph = match kind {
                    ItemKind::Key => "k",
                    ItemKind::Box => "B",
                };
                Span::styled(glyph, Style::default().fg(color_of(owner)).bold())
            } else {
                let value = grid.get(x, y).copied().unwrap_or(0.0);
                match (Percept::from_value(value), trails.get(&position)) {
                    (Percept::Empty, Some(&id)) => {
                        Span::styled(".", Style::default().fg(color_of(id)))
                    }
                    _ => heat_span(value),
                }
            };
            spans.push(span);
        }
        lines.push(Line::from(spans));
    }

    let map = Paragraph::new(lines)
        .block(Block::default().title("Treasure Hunt").borders(Borders::ALL))
        .alignment(Alignment::Center);
    frame.render_widget(map, area);
}

/// Renders one status line per agent.
fn render_agents(frame: &mut Frame, area: Rect, snapshot: &EngineSnapshot) {
    let area_cells = snapshot.values.area().max(1);
    let rows: Vec<ListItem> = snapshot
        .agents
        .iter()
        .map(|agent| {
            let status = if agent.completed {
                Span::styled("completed", Style::default().fg(Color::Green).bold())
            } else if agent.connected {
                Span::styled("searching", Style::default().fg(Color::Yellow))
            } else {
                Span::styled("waiting", Style::default().fg(Color::DarkGray))
            };
            ListItem::from(Line::from(vec![
                Span::styled(
                    format!("Agent {} ", agent.id),
                    Style::default().fg(agent_color(agent.color)).bold(),
                ),
                Span::raw(format!(
                    "at {} visited {} cells ({:.0}%) ",
                    agent.position,
                    agent.path.len(),
                    agent.path.len() as f64 * 100.0 / area_cells as f64
                )),
                status,
            ]))
        })
        .collect();

    let list = List::new(rows).block(Block::default().borders(Borders::ALL).title("Agents"));
    frame.render_widget(list, area);
}
