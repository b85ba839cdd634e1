//! Coverage (region totals, layers, providers, recent scans)
//! Tasks (schedule, last status, next run)
//! Runs (latest task runs across all tasks)

use std::{
  error::Error,
  io,
  sync::Arc,
  thread,
  time::{Duration, Instant},
};

use crossterm::{
  event::{self, DisableMouseCapture, EnableMouseCapture, Event as CEvent, KeyCode},
  execute,
  terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use tui::{
  backend::{Backend, CrosstermBackend},
  layout::{Constraint, Direction, Layout, Rect},
  style::{Color, Modifier, Style},
  text::{Span, Spans},
  widgets::{Block, Borders, List, ListItem, Paragraph, Tabs},
  Terminal,
};
use chrono::{DateTime, Utc};
use envcache::cache::RegionalCacheManager;
use envcache::config::Config;
use envcache::coverage::{CoverageReport, CoverageReporter};
use envcache::database::setup_database;
use envcache::locks::RunRegistry;
use envcache::messaging::{create_rabbit_channel, RUN_QUEUE};
use envcache::models::{RunStatus, ScannedRegion, TaskRun};
use envcache::store::MeasurementStore;
use envcache::tasks::{TaskHistory, TaskRegistry};
use lapin::Channel;
use tokio::runtime::Runtime;

const REFRESH: Duration = Duration::from_secs(2);

#[derive(Clone, Copy)]
enum DashboardTab {
  Coverage,
  Tasks,
  Runs,
}

struct Snapshot {
  report: Option<CoverageReport>,
  regions: Vec<ScannedRegion>,
  runs: Vec<TaskRun>,
  pending_count: Option<u32>,
  error: Option<String>,
}

impl Snapshot {
  fn empty() -> Self {
    Self { report: None, regions: vec![], runs: vec![], pending_count: None, error: None }
  }
}

struct App {
  current_tab: DashboardTab,
  snapshot: Snapshot,
}

impl App {
  fn new() -> Self {
    Self { current_tab: DashboardTab::Coverage, snapshot: Snapshot::empty() }
  }

  fn next_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Coverage => DashboardTab::Tasks,
      DashboardTab::Tasks => DashboardTab::Runs,
      DashboardTab::Runs => DashboardTab::Coverage,
    }
  }

  fn previous_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Coverage => DashboardTab::Runs,
      DashboardTab::Tasks => DashboardTab::Coverage,
      DashboardTab::Runs => DashboardTab::Tasks,
    }
  }
}

struct Sources {
  reporter: CoverageReporter,
  cache: RegionalCacheManager,
  history: TaskHistory,
  channel: Option<Channel>,
}

impl Sources {
  async fn connect(config: &Config) -> anyhow::Result<Self> {
    let pool = setup_database(&config.database_url).await?;
    let store = MeasurementStore::new(pool.clone());
    let cache = RegionalCacheManager::new(pool.clone(), Arc::new(Default::default()));
    let registry = TaskRegistry::new(pool.clone());
    let history = TaskHistory::new(pool);
    let reporter = CoverageReporter::new(store, cache.clone(), registry, history.clone(), RunRegistry::new());
    let channel = match &config.rabbitmq_url {
      Some(url) => create_rabbit_channel(url).await.ok(),
      None => None,
    };
    Ok(Self { reporter, cache, history, channel })
  }

  async fn snapshot(&self) -> Snapshot {
    let mut snapshot = Snapshot::empty();
    match self.reporter.report().await {
      Ok(report) => snapshot.report = Some(report),
      Err(e) => snapshot.error = Some(e.to_string()),
    }
    snapshot.regions = self.cache.recent_regions(10).await.unwrap_or_default();
    snapshot.runs = self.history.recent(30).await.unwrap_or_default();
    if let Some(channel) = &self.channel {
      snapshot.pending_count = fetch_queue_depth(channel).await.ok();
    }
    snapshot
  }
}

async fn fetch_queue_depth(channel: &Channel) -> Result<u32, lapin::Error> {
  let queue = channel
    .queue_declare(RUN_QUEUE, lapin::options::QueueDeclareOptions { passive: true, ..Default::default() }, lapin::types::FieldTable::default())
    .await?;
  Ok(queue.message_count())
}

fn timestamp(ts: Option<DateTime<Utc>>) -> String {
  ts.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string()).unwrap_or_else(|| "N/A".into())
}

fn status_color(status: Option<RunStatus>) -> Color {
  match status {
    Some(RunStatus::Completed) => Color::Green,
    Some(RunStatus::Failed) => Color::Red,
    Some(RunStatus::Running) => Color::Yellow,
    None => Color::Gray,
  }
}

fn main() -> Result<(), Box<dyn Error>> {
  let config = Config::from_env()?;
  let (tx, rx) = std::sync::mpsc::channel::<Snapshot>();

  thread::spawn(move || {
    let rt_bg = match Runtime::new() {
      Ok(rt) => rt,
      Err(e) => {
        let _ = tx.send(Snapshot { error: Some(e.to_string()), ..Snapshot::empty() });
        return;
      }
    };
    let sources = match rt_bg.block_on(Sources::connect(&config)) {
      Ok(sources) => sources,
      Err(e) => {
        let _ = tx.send(Snapshot { error: Some(e.to_string()), ..Snapshot::empty() });
        return;
      }
    };
    loop {
      if tx.send(rt_bg.block_on(sources.snapshot())).is_err() {
        break;
      }
      thread::sleep(REFRESH);
    }
  });

  enable_raw_mode()?;
  let mut stdout = io::stdout();
  execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
  let backend = CrosstermBackend::new(stdout);
  let mut terminal = Terminal::new(backend)?;

  let mut app = App::new();
  let tick_rate = Duration::from_millis(500);
  let mut last_tick = Instant::now();

  loop {
    if let Ok(snapshot) = rx.try_recv() {
      app.snapshot = snapshot;
    }
    terminal.draw(|f| ui(f, &app))?;

    let timeout = tick_rate
      .checked_sub(last_tick.elapsed())
      .unwrap_or_else(|| Duration::from_secs(0));
    if event::poll(timeout)? {
      if let CEvent::Key(key) = event::read()? {
        match key.code {
          KeyCode::Char('q') => break,
          KeyCode::Right => app.next_tab(),
          KeyCode::Left => app.previous_tab(),
          _ => {}
        }
      }
    }
    if last_tick.elapsed() >= tick_rate {
      last_tick = Instant::now();
    }
  }

  disable_raw_mode()?;
  execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
  terminal.show_cursor()?;
  Ok(())
}

fn ui<B: Backend>(f: &mut tui::Frame<B>, app: &App) {
  let chunks = Layout::default()
    .direction(Direction::Vertical)
    .margin(1)
    .constraints([
      Constraint::Length(3),
      Constraint::Min(0),
      Constraint::Length(3),
    ].as_ref())
    .split(f.size());

  let tab_titles = vec!["Coverage", "Tasks", "Runs"];
  let tabs = Tabs::new(
    tab_titles
      .iter()
      .map(|t| Spans::from(Span::styled(*t, Style::default().fg(Color::Yellow))))
      .collect(),
  )
    .block(Block::default().borders(Borders::ALL).title("envcache monitor"))
    .highlight_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
    .select(match app.current_tab {
      DashboardTab::Coverage => 0,
      DashboardTab::Tasks => 1,
      DashboardTab::Runs => 2,
    });
  f.render_widget(tabs, chunks[0]);

  match app.current_tab {
    DashboardTab::Coverage => render_coverage(f, &app.snapshot, chunks[1]),
    DashboardTab::Tasks => render_tasks(f, &app.snapshot, chunks[1]),
    DashboardTab::Runs => render_runs(f, &app.snapshot, chunks[1]),
  }

  let footer_text = match &app.snapshot.error {
    Some(error) => format!("error: {error}"),
    None => "←/→: Switch Tabs | q: Quit".to_string(),
  };
  let footer = Paragraph::new(footer_text)
    .style(Style::default().fg(if app.snapshot.error.is_some() { Color::Red } else { Color::White }))
    .block(Block::default().borders(Borders::ALL));
  f.render_widget(footer, chunks[2]);
}

fn render_coverage<B: Backend>(f: &mut tui::Frame<B>, snapshot: &Snapshot, area: Rect) {
  let chunks = Layout::default()
    .direction(Direction::Horizontal)
    .constraints([Constraint::Percentage(40), Constraint::Percentage(60)].as_ref())
    .split(area);

  let mut lines: Vec<ListItem> = Vec::new();
  if let Some(report) = &snapshot.report {
    let stats = &report.stats;
    lines.push(ListItem::new(Spans::from(Span::styled(
      format!("Regions: {}  Points: {}", stats.total_regions, stats.total_data_points),
      Style::default().add_modifier(Modifier::BOLD),
    ))));
    lines.push(ListItem::new(Spans::from(Span::raw(format!("Avg points/region: {:.1}", stats.avg_points_per_region)))));
    lines.push(ListItem::new(Spans::from(Span::raw(format!("Oldest scan: {}", timestamp(stats.oldest_scan))))));
    lines.push(ListItem::new(Spans::from(Span::raw(format!("Newest scan: {}", timestamp(stats.newest_scan))))));
    lines.push(ListItem::new(Spans::from(Span::raw(format!("Measurements: {}", report.measurements)))));
    lines.push(ListItem::new(Spans::from(Span::raw(""))));
    for (layer, regions) in &report.layers {
      lines.push(ListItem::new(Spans::from(Span::raw(format!("layer {layer}: {regions} regions")))));
    }
    for (provider, count) in &report.providers {
      lines.push(ListItem::new(Spans::from(Span::raw(format!("provider {provider}: {count} records")))));
    }
  }
  if let Some(pending) = snapshot.pending_count {
    lines.push(ListItem::new(Spans::from(Span::raw(format!("Queued run requests: {pending}")))));
  }
  let summary = List::new(lines).block(Block::default().borders(Borders::ALL).title("Coverage"));
  f.render_widget(summary, chunks[0]);

  let region_items: Vec<ListItem> = snapshot.regions.iter().map(|r| {
    let layers: Vec<String> = r.layers_scanned().into_iter().collect();
    ListItem::new(vec![
      Spans::from(Span::styled(format!("#{} {} z{}", r.id, r.bbox, r.zoom), Style::default().fg(Color::Yellow))),
      Spans::from(Span::raw(format!(
        "  {} | {} points | {} | {}",
        layers.join(","),
        r.data_points_cached,
        r.actor.as_str(),
        timestamp(Some(r.last_updated))
      ))),
    ])
  }).collect();
  let regions = List::new(region_items).block(Block::default().borders(Borders::ALL).title("Recent Scans"));
  f.render_widget(regions, chunks[1]);
}

fn render_tasks<B: Backend>(f: &mut tui::Frame<B>, snapshot: &Snapshot, area: Rect) {
  let tasks = snapshot.report.as_ref().map(|r| r.tasks.as_slice()).unwrap_or_default();
  let task_items: Vec<ListItem> = tasks.iter().map(|t| {
    let status = t.last_status.map(|s| s.as_str()).unwrap_or("never run");
    ListItem::new(Spans::from(vec![
      Span::styled(format!("{} ", t.name), Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)),
      Span::raw(format!("[{}] {} | ", t.provider, t.schedule)),
      Span::styled(status, Style::default().fg(status_color(t.last_status))),
      Span::raw(format!(
        " | last {} | next {}{}",
        timestamp(t.last_started),
        timestamp(t.next_run),
        if t.active { "" } else { " | inactive" }
      )),
    ]))
  }).collect();
  let list = List::new(task_items).block(Block::default().borders(Borders::ALL).title("Tasks"));
  f.render_widget(list, area);
}

fn render_runs<B: Backend>(f: &mut tui::Frame<B>, snapshot: &Snapshot, area: Rect) {
  let run_items: Vec<ListItem> = snapshot.runs.iter().map(|r| {
    let detail = r.error.as_deref().or(r.output.as_deref()).unwrap_or("");
    ListItem::new(Spans::from(vec![
      Span::styled(timestamp(Some(r.started_at)), Style::default().fg(Color::Green)),
      Span::raw(format!(" {} ", r.task_name)),
      Span::styled(r.status.as_str(), Style::default().fg(status_color(Some(r.status)))),
      Span::raw(format!(" ({}, {} records) {}", r.trigger.as_str(), r.records_processed, detail)),
    ]))
  }).collect();
  let list = List::new(run_items).block(Block::default().borders(Borders::ALL).title("Latest Runs"));
  f.render_widget(list, area);
}
