use std::io;
use std::time::Duration;

use anyhow::Result;
use chrono::{Local, Utc};
use crossterm::{
    event::{Event, EventStream, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use foldctl_client::Aggregator;
use foldctl_core::view::{build_view, table_lines};
use futures_util::StreamExt;
use ratatui::{backend::CrosstermBackend, text::Text, widgets::Paragraph, Terminal};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;

const REFRESH: Duration = Duration::from_secs(1);

/// Live units table. Redraws on every peer message, with a periodic tick so
/// ETAs and deadlines stay current; q quits, space forces a redraw.
pub async fn run(aggregator: &Aggregator) -> Result<()> {
    let (draw_tx, mut draw_rx) = mpsc::channel::<()>(1);
    for session in aggregator.sessions() {
        let mut events = session.subscribe();
        let draw_tx = draw_tx.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    // a full channel already means a redraw is coming
                    Ok(_) => {
                        let _ = draw_tx.try_send(());
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }
    drop(draw_tx);
    aggregator.start();

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;
    let outcome = run_loop(aggregator, &mut terminal, &mut draw_rx).await;
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    outcome
}

async fn run_loop(
    aggregator: &Aggregator,
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    draw_rx: &mut mpsc::Receiver<()>,
) -> Result<()> {
    let mut input = EventStream::new();
    let mut ticker = tokio::time::interval(REFRESH);
    let mut peers_done = false;
    let mut dirty = true;
    loop {
        if dirty {
            draw(aggregator, terminal).await?;
            dirty = false;
        }
        tokio::select! {
            _ = ticker.tick() => dirty = true,
            signal = draw_rx.recv(), if !peers_done => match signal {
                Some(()) => dirty = true,
                None => peers_done = true,
            },
            event = input.next() => match event {
                Some(Ok(Event::Key(key))) if key.kind == KeyEventKind::Press => match key.code {
                    KeyCode::Char('q') => break,
                    KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => break,
                    KeyCode::Char(' ') => dirty = true,
                    _ => {}
                },
                Some(Ok(Event::Resize(_, _))) => dirty = true,
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break,
            },
        }
    }
    Ok(())
}

async fn draw(
    aggregator: &Aggregator,
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
) -> Result<()> {
    let view = build_view(&aggregator.snapshots().await, Utc::now());
    let mut lines = table_lines(&view);
    if lines.first().map(|l| l.starts_with("---")).unwrap_or(false) {
        lines.remove(0);
    }
    lines.push(String::new());
    lines.push(Local::now().format("%Y-%m-%d %H:%M:%S").to_string());
    let text = Text::from(lines.join("\n"));
    terminal.draw(|frame| {
        frame.render_widget(Paragraph::new(text), frame.size());
    })?;
    Ok(())
}
