//! UI rendering for the TUI

use ratatui::{
    Frame,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, List, ListItem, Paragraph, Wrap},
};
use unicode_width::UnicodeWidthStr;

use crew_core::{AppPhase, MergeKind, Role, SessionRecord, SessionStore};

use super::app::{App, Mode};

/// Draw the entire UI
pub fn draw(frame: &mut Frame, app: &mut App, store: &SessionStore, phase: AppPhase) {
    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Length(30), Constraint::Min(40)])
        .split(frame.area());

    draw_sidebar(frame, app, store, columns[0]);

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1), // Header
            Constraint::Min(5),    // Transcript
            Constraint::Length(3), // Input
            Constraint::Length(1), // Status bar
        ])
        .split(columns[1]);

    draw_header(frame, app, rows[0]);
    draw_transcript(frame, app, store, rows[1]);
    draw_input(frame, app, rows[2]);
    draw_status_bar(frame, app, phase, rows[3]);

    match app.mode {
        Mode::Permission => draw_permission_modal(frame, app),
        Mode::Question => draw_question_modal(frame, app),
        Mode::Commit => draw_commit_modal(frame, app),
        Mode::Conflict => draw_conflict_modal(frame, app),
        Mode::ConfirmDelete => draw_confirm_modal(frame, app),
        _ => {}
    }
}

/// Status badges for one sidebar entry, derived from read-only state
/// probes (never allocating store entries)
fn badges(record: &SessionRecord, store: &SessionStore) -> String {
    let mut badges = String::new();
    if let Some(snapshot) = store.snapshot(&record.id) {
        if let Some(since) = snapshot.waiting_since {
            badges.push_str(&format!(" ~{}s", since.elapsed().as_secs()));
        }
        if let Some(kind) = snapshot.merge_kind {
            badges.push_str(match kind {
                MergeKind::Merge | MergeKind::MergeToParent => " [merge]",
                MergeKind::PullRequest => " [pr]",
                MergeKind::Push => " [push]",
            });
        }
        if snapshot.pending_permission.is_some() || snapshot.pending_question.is_some() {
            badges.push_str(" [?]");
        }
        if snapshot.session_in_use_error {
            badges.push_str(" [!]");
        }
    }
    badges
}

fn draw_sidebar(frame: &mut Frame, app: &App, store: &SessionStore, area: Rect) {
    let block = Block::default().borders(Borders::ALL).title(" Sessions ");
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let max_width = inner.width as usize;
    let items: Vec<ListItem> = app
        .sessions
        .iter()
        .enumerate()
        .map(|(index, record)| {
            let focused = app
                .focused
                .as_ref()
                .is_some_and(|f| f.id == record.id);
            let marker = if focused { "*" } else { " " };
            let mut text = format!("{}{}{}", marker, record.name, badges(record, store));
            if text.width() > max_width {
                text = text.chars().take(max_width.saturating_sub(1)).collect();
            }
            let mut style = Style::default();
            if index == app.selected {
                style = style.bg(Color::DarkGray).add_modifier(Modifier::BOLD);
            }
            if focused {
                style = style.fg(Color::Cyan);
            }
            ListItem::new(text).style(style)
        })
        .collect();

    frame.render_widget(List::new(items), inner);
}

fn draw_header(frame: &mut Frame, app: &App, area: Rect) {
    let header = if app.header.is_empty() {
        "no session focused".to_string()
    } else {
        app.header.clone()
    };
    let paragraph = Paragraph::new(header).style(
        Style::default()
            .fg(Color::Cyan)
            .add_modifier(Modifier::BOLD),
    );
    frame.render_widget(paragraph, area);
}

fn role_style(role: Role) -> (&'static str, Style) {
    match role {
        Role::User => ("You: ", Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)),
        Role::Assistant => ("Agent: ", Style::default().fg(Color::Green)),
        Role::System => ("", Style::default().fg(Color::Yellow)),
        Role::Error => ("Error: ", Style::default().fg(Color::Red)),
    }
}

fn draw_transcript(frame: &mut Frame, app: &mut App, store: &SessionStore, area: Rect) {
    let block = Block::default().borders(Borders::ALL).title(" Transcript ");
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let mut lines: Vec<Line> = Vec::new();
    for message in &app.transcript {
        let (prefix, style) = role_style(message.role);
        let stamp = message.timestamp.format("%H:%M");
        for (index, text) in message.content.lines().enumerate() {
            if index == 0 {
                lines.push(Line::from(vec![
                    Span::styled(format!("{} ", stamp), Style::default().fg(Color::DarkGray)),
                    Span::styled(prefix.to_string(), style),
                    Span::raw(text.to_string()),
                ]));
            } else {
                lines.push(Line::from(Span::raw(text.to_string())));
            }
        }
        lines.push(Line::from(""));
    }
    if !app.streaming.is_empty() {
        for text in app.streaming.lines() {
            lines.push(Line::from(Span::raw(text.to_string())));
        }
    }
    if let Some(record) = &app.focused
        && let Some(since) = store.snapshot(&record.id).and_then(|s| s.waiting_since)
    {
        lines.push(Line::from(Span::styled(
            format!("... working ({}s)", since.elapsed().as_secs()),
            Style::default().fg(Color::DarkGray),
        )));
    }

    let total = lines.len();
    let visible = inner.height as usize;
    let scroll = if app.scroll_offset == usize::MAX {
        total.saturating_sub(visible)
    } else {
        app.scroll_offset.min(total.saturating_sub(visible))
    };
    if app.scroll_offset == usize::MAX && total > visible {
        app.scroll_offset = total - visible;
    }

    let paragraph = Paragraph::new(lines)
        .wrap(Wrap { trim: false })
        .scroll((scroll as u16, 0));
    frame.render_widget(paragraph, inner);
}

fn draw_input(frame: &mut Frame, app: &App, area: Rect) {
    let active = app.mode == Mode::Input;
    let border_style = if active {
        Style::default().fg(Color::Cyan)
    } else {
        Style::default().fg(Color::DarkGray)
    };
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(border_style)
        .title(if active { " Message (Enter sends, Esc back) " } else { " Message (Tab to type) " });
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let value = app.input.value();
    frame.render_widget(Paragraph::new(value), inner);
    if active {
        // Keep the cursor where tui-input thinks it is
        let cursor = app.input.visual_cursor() as u16;
        frame.set_cursor_position((inner.x + cursor, inner.y));
    }
}

fn draw_status_bar(frame: &mut Frame, app: &App, phase: AppPhase, area: Rect) {
    let indicator = match phase {
        AppPhase::Idle => "idle",
        AppPhase::StreamingClaude => "streaming",
    };
    let text = format!(
        " {} | {} | m merge  p pr  u push  d delete  r resume",
        indicator, app.status
    );
    frame.render_widget(
        Paragraph::new(text).style(Style::default().fg(Color::DarkGray)),
        area,
    );
}

/// Centered overlay rectangle as a percentage of the frame
fn centered_rect(percent_x: u16, percent_y: u16, area: Rect) -> Rect {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(area);
    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(vertical[1])[1]
}

fn draw_permission_modal(frame: &mut Frame, app: &App) {
    let Some(request) = &app.pending_permission else {
        return;
    };
    let area = centered_rect(60, 40, frame.area());
    frame.render_widget(Clear, area);

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow))
        .title(" Permission required ");
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let args = serde_json::to_string_pretty(&request.arguments).unwrap_or_default();
    let mut lines = vec![
        Line::from(Span::styled(
            format!("Tool: {}", request.tool_name),
            Style::default().add_modifier(Modifier::BOLD),
        )),
        Line::from(""),
    ];
    if let Some(description) = &request.description {
        lines.push(Line::from(description.clone()));
        lines.push(Line::from(""));
    }
    for text in args.lines().take(10) {
        lines.push(Line::from(text.to_string()));
    }
    lines.push(Line::from(""));
    lines.push(Line::from(Span::styled(
        "y allow once   a always allow   n deny",
        Style::default().fg(Color::Yellow),
    )));
    frame.render_widget(Paragraph::new(lines).wrap(Wrap { trim: false }), inner);
}

fn draw_question_modal(frame: &mut Frame, app: &App) {
    let Some(question) = &app.pending_question else {
        return;
    };
    let area = centered_rect(60, 50, frame.area());
    frame.render_widget(Clear, area);

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow))
        .title(" Question ");
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let mut lines = vec![Line::from(question.question.clone()), Line::from("")];
    for (index, option) in question.options.iter().enumerate() {
        let marker = if index == app.question_choice { "> " } else { "  " };
        let style = if index == app.question_choice {
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)
        } else {
            Style::default()
        };
        lines.push(Line::from(Span::styled(
            format!("{}{}", marker, option.label),
            style,
        )));
        if let Some(description) = &option.description {
            lines.push(Line::from(Span::styled(
                format!("    {}", description),
                Style::default().fg(Color::DarkGray),
            )));
        }
    }
    frame.render_widget(Paragraph::new(lines).wrap(Wrap { trim: false }), inner);
}

fn draw_commit_modal(frame: &mut Frame, app: &App) {
    let Some(prompt) = &app.commit_prompt else {
        return;
    };
    let area = centered_rect(70, 30, frame.area());
    frame.render_widget(Clear, area);

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow))
        .title(format!(" Commit message for {} (Enter runs, Esc aborts) ", prompt.kind));
    let inner = block.inner(area);
    frame.render_widget(block, area);

    frame.render_widget(
        Paragraph::new(prompt.input.value()).wrap(Wrap { trim: false }),
        inner,
    );
}

fn draw_conflict_modal(frame: &mut Frame, app: &App) {
    let Some(prompt) = &app.conflict_prompt else {
        return;
    };
    let area = centered_rect(60, 50, frame.area());
    frame.render_widget(Clear, area);

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Red))
        .title(" Merge conflicts ");
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let mut lines = vec![Line::from("Conflicted files:"), Line::from("")];
    for file in &prompt.files {
        lines.push(Line::from(format!("  {}", file)));
    }
    lines.push(Line::from(""));
    lines.push(Line::from("1. hand the conflicts to the agent"));
    lines.push(Line::from("2. abort the merge"));
    lines.push(Line::from("3. show manual instructions"));
    frame.render_widget(Paragraph::new(lines).wrap(Wrap { trim: false }), inner);
}

fn draw_confirm_modal(frame: &mut Frame, app: &App) {
    let Some(record) = &app.confirm_delete else {
        return;
    };
    let area = centered_rect(50, 20, frame.area());
    frame.render_widget(Clear, area);

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Red))
        .title(" Delete session ");
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let lines = vec![
        Line::from(format!(
            "Delete '{}'? This stops its agent and drops its state.",
            record.name
        )),
        Line::from(""),
        Line::from(Span::styled(
            "y delete   n keep",
            Style::default().fg(Color::Red),
        )),
    ];
    frame.render_widget(Paragraph::new(lines).wrap(Wrap { trim: false }), inner);
}
