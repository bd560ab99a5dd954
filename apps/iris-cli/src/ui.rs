use std::{collections::VecDeque, time::Duration};

use anyhow::Result;
use crossterm::{
    event::{self, Event as CEvent, KeyCode, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use iris_types::{
    analysis::FaceAnalysis,
    frame::FrameId,
    state::{ConnectionState, UiSnapshot},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph},
    Terminal,
};
use tokio::sync::watch;

const MAX_LOG_ENTRIES: usize = 120;

/// Blocking dashboard loop; returns when the user quits or the pipeline goes away.
pub fn run(snapshots: watch::Receiver<UiSnapshot>, summary: String) -> Result<()> {
    enable_raw_mode()?;
    let mut stdout = std::io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    terminal.hide_cursor()?;

    let res = run_loop(&mut terminal, snapshots, summary.as_str());

    terminal.show_cursor()?;
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    res
}

fn run_loop<B: ratatui::backend::Backend>(
    terminal: &mut Terminal<B>,
    mut snapshots: watch::Receiver<UiSnapshot>,
    summary: &str,
) -> Result<()> {
    let mut logs: VecDeque<String> = VecDeque::with_capacity(MAX_LOG_ENTRIES);
    let mut last_frame: Option<FrameId> = None;
    let mut last_connection = ConnectionState::Disconnected;

    loop {
        if snapshots.has_changed().is_err() {
            break;
        }
        let snapshot = snapshots.borrow_and_update().clone();

        if snapshot.connection != last_connection {
            push_log(&mut logs, format!("connection {:?}", snapshot.connection));
            last_connection = snapshot.connection;
        }
        if snapshot.displayed_frame != last_frame {
            if let Some(frame) = snapshot.displayed_frame {
                push_log(&mut logs, format_frame(frame, &snapshot));
            }
            last_frame = snapshot.displayed_frame;
        }

        terminal.draw(|f| {
            let chunks = Layout::default()
                .direction(Direction::Vertical)
                .constraints(
                    [
                        Constraint::Length(3),
                        Constraint::Length(4),
                        Constraint::Min(0),
                    ]
                    .as_ref(),
                )
                .split(f.size());

            let header = Paragraph::new(Line::from(vec![
                Span::styled(
                    "IRIS",
                    Style::default()
                        .fg(Color::Cyan)
                        .add_modifier(Modifier::BOLD),
                ),
                Span::raw("  "),
                Span::styled(
                    format!("{:?}", snapshot.connection),
                    Style::default().fg(connection_color(snapshot.connection)),
                ),
                Span::raw(if snapshot.is_processing {
                    "  processing"
                } else {
                    "  idle"
                }),
                Span::raw("  "),
                Span::styled("config:", Style::default().fg(Color::Magenta)),
                Span::raw(" "),
                Span::raw(summary),
                Span::raw("  "),
                Span::styled("q", Style::default().fg(Color::Yellow)),
                Span::raw(" to quit"),
            ]))
            .block(Block::default().borders(Borders::ALL).title("Status"));
            f.render_widget(header, chunks[0]);

            let perf = &snapshot.performance;
            let stats = Paragraph::new(vec![
                Line::from(format!(
                    "fps {:.1}  latency avg {:.0}ms  min {:.0}ms  max {:.0}ms  processing {:.0}ms",
                    perf.fps,
                    perf.avg_latency_ms,
                    perf.min_latency_ms,
                    perf.max_latency_ms,
                    perf.avg_processing_ms
                )),
                Line::from(format!(
                    "captured {}  sent {}  accepted {}  dropped {}  timed out {}  stale {}  failures {}",
                    perf.counters.captured,
                    perf.counters.sent,
                    perf.counters.accepted,
                    perf.counters.throttled,
                    perf.counters.timed_out,
                    perf.counters.stale,
                    perf.counters.capture_failures
                )),
            ])
            .block(Block::default().borders(Borders::ALL).title("Performance"));
            f.render_widget(stats, chunks[1]);

            let body = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([Constraint::Percentage(50), Constraint::Percentage(50)].as_ref())
                .split(chunks[2]);

            let mut faces: Vec<ListItem> = snapshot
                .faces
                .iter()
                .map(|face| {
                    let analysis = snapshot
                        .analysis
                        .iter()
                        .find(|a| a.face_id == face.local_id);
                    let b = face.bounding_box;
                    ListItem::new(format!(
                        "{} @ ({:.0},{:.0} {:.0}x{:.0}) {:.0}%  {}",
                        face.local_id,
                        b.x,
                        b.y,
                        b.width,
                        b.height,
                        face.confidence * 100.0,
                        analysis.map(describe).unwrap_or_default()
                    ))
                })
                .collect();
            if let Some(error) = &snapshot.last_error {
                faces.push(ListItem::new(format!("service error: {error}")).style(
                    Style::default().fg(Color::Red),
                ));
            }
            let faces = List::new(faces).block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(format!("Faces ({})", snapshot.faces.len())),
            );
            f.render_widget(faces, body[0]);

            let items: Vec<ListItem> = logs
                .iter()
                .rev()
                .map(|entry| ListItem::new(entry.clone()))
                .collect();
            let list = List::new(items)
                .block(Block::default().borders(Borders::ALL).title("Recent frames"))
                .highlight_style(Style::default().fg(Color::Yellow));
            f.render_widget(list, body[1]);
        })?;

        if event::poll(Duration::from_millis(100))? {
            if let CEvent::Key(key) = event::read()? {
                let interrupt = key.code == KeyCode::Char('c')
                    && key.modifiers.contains(KeyModifiers::CONTROL);
                if interrupt || matches!(key.code, KeyCode::Char('q') | KeyCode::Esc) {
                    break;
                }
            }
        }
    }

    Ok(())
}

fn push_log(logs: &mut VecDeque<String>, entry: String) {
    if logs.len() == MAX_LOG_ENTRIES {
        logs.pop_front();
    }
    let timestamp = chrono::Local::now().format("%H:%M:%S");
    logs.push_back(format!("[{timestamp}] {entry}"));
}

fn format_frame(frame: FrameId, snapshot: &UiSnapshot) -> String {
    format!(
        "frame {} {} face(s) {:.0}ms",
        frame,
        snapshot.faces.len(),
        snapshot.performance.last_latency_ms
    )
}

fn describe(analysis: &FaceAnalysis) -> String {
    let mut parts = Vec::new();
    if let Some(age) = analysis.age {
        parts.push(format!("age {age:.0}"));
    }
    if let Some(gender) = &analysis.gender {
        parts.push(gender.clone());
    }
    if let Some(emotion) = analysis.top_emotion() {
        parts.push(emotion.to_string());
    }
    parts.join(", ")
}

fn connection_color(state: ConnectionState) -> Color {
    match state {
        ConnectionState::Connected => Color::Green,
        ConnectionState::Connecting => Color::Yellow,
        ConnectionState::Disconnected => Color::Red,
    }
}
