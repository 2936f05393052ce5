use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event as TermEvent, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use emglink::{
    session::{CaptureParameters, Event},
    ui::UiEvent,
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Constraint, Direction, Layout},
    style::{Color, Style},
    text::Line,
    widgets::{Block, Borders, List, ListItem, Paragraph},
    Frame, Terminal,
};
use std::{
    collections::VecDeque,
    error::Error,
    io,
    sync::mpsc::{Receiver, Sender},
    time::Duration,
};

const LOG_CAPACITY: usize = 200;

struct DeviceRow {
    name: String,
    connected: bool,
    samples: usize,
}

struct App {
    devices: Vec<DeviceRow>,
    log: VecDeque<String>,
    capture_active: bool,
    start_enabled: bool,
}

impl App {
    fn new(names: &[String]) -> App {
        App {
            devices: names
                .iter()
                .map(|name| DeviceRow {
                    name: name.clone(),
                    connected: false,
                    samples: 0,
                })
                .collect(),
            log: VecDeque::new(),
            capture_active: false,
            start_enabled: false,
        }
    }

    fn push_log(&mut self, line: String) {
        if self.log.len() == LOG_CAPACITY {
            self.log.pop_front();
        }
        self.log.push_back(line);
    }

    fn apply(&mut self, event: UiEvent) {
        match event {
            UiEvent::Status(line) => self.push_log(line),
            UiEvent::Connectivity { device, connected } => {
                if let Some(row) = self.devices.iter_mut().find(|r| r.name == device) {
                    row.connected = connected;
                }
            }
            UiEvent::CaptureActive(active) => {
                self.capture_active = active;
                if active {
                    for row in &mut self.devices {
                        row.samples = 0;
                    }
                }
            }
            UiEvent::StartControl(enabled) => self.start_enabled = enabled,
            UiEvent::LiveSamples { device, channels } => {
                if let Some(row) = self.devices.iter_mut().find(|r| r.name == device) {
                    row.samples += channels.first().map_or(0, |ch| ch.len());
                }
            }
        }
    }
}

pub fn engage_gui(
    devices: &[String],
    params: CaptureParameters,
    session: Sender<Event>,
    updates: Receiver<UiEvent>,
) -> Result<(), Box<dyn Error>> {
    // setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let app = App::new(devices);
    let res = run_app(&mut terminal, app, params, session, updates);

    // restore terminal
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    if let Err(err) = res {
        println!("{:?}", err)
    }

    Ok(())
}

fn run_app<B: Backend>(
    terminal: &mut Terminal<B>,
    mut app: App,
    params: CaptureParameters,
    session: Sender<Event>,
    updates: Receiver<UiEvent>,
) -> io::Result<()> {
    loop {
        while let Ok(update) = updates.try_recv() {
            app.apply(update);
        }
        terminal.draw(|f| ui(f, &app))?;

        if event::poll(Duration::from_millis(16))? {
            if let TermEvent::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                match key.code {
                    KeyCode::Char('q') => return Ok(()),
                    KeyCode::Char('s') => {
                        let _ = session.send(Event::Start(params.clone()));
                    }
                    KeyCode::Char('t') => {
                        let _ = session.send(Event::Stop);
                    }
                    KeyCode::Char('p') => {
                        let _ = session.send(Event::Probe);
                    }
                    _ => {}
                }
            }
        }
    }
}

fn ui(f: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(4 + app.devices.len() as u16), Constraint::Min(5)])
        .split(f.size());

    let mut lines = vec![Line::from(format!(
        "[s]tart  s[t]op  [p]robe  [q]uit    capture: {}  start: {}",
        if app.capture_active { "RUNNING" } else { "idle" },
        if app.start_enabled { "ready" } else { "unavailable" },
    ))];
    for row in &app.devices {
        let marker = if row.connected { "+" } else { "-" };
        lines.push(Line::from(format!(
            " {marker} {:<12} {:>9} samples",
            row.name, row.samples
        )));
    }
    let header = Paragraph::new(lines).block(
        Block::default()
            .borders(Borders::ALL)
            .title("emglink monitor"),
    );
    f.render_widget(header, chunks[0]);

    let items: Vec<ListItem> = app
        .log
        .iter()
        .rev()
        .map(|line| ListItem::new(line.as_str()))
        .collect();
    let log = List::new(items)
        .style(Style::default().fg(Color::Gray))
        .block(Block::default().borders(Borders::ALL).title("session log"));
    f.render_widget(log, chunks[1]);
}
