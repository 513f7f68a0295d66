use docchat_core::ChatRole;
use ratatui::{
    Frame,
    layout::{Constraint, Layout, Rect},
    style::{Color, Modifier, Style, Stylize},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Paragraph, Wrap},
};

use crate::app::{App, InputMode, Screen, TextInput, UploadState};

pub fn render(app: &mut App, frame: &mut Frame) {
    let area = frame.area();

    // Main layout: header, body, footer
    let [header_area, body_area, footer_area] = Layout::vertical([
        Constraint::Length(1),
        Constraint::Min(0),
        Constraint::Length(1),
    ])
    .areas(area);

    render_header(app, frame, header_area);

    match app.screen {
        Screen::Upload => render_upload_screen(app, frame, body_area),
        Screen::Chat => render_chat_screen(app, frame, body_area),
    }

    render_footer(app, frame, footer_area);
}

fn render_header(app: &App, frame: &mut Frame, area: Rect) {
    let document = match &app.document {
        Some(name) => format!(" [{}]", name),
        None => String::new(),
    };

    let title = Line::from(vec![
        Span::styled(" Document Chat ", Style::default().fg(Color::Cyan).bold()),
        Span::styled(document, Style::default().fg(Color::White)),
        Span::raw(" "),
        Span::styled(app.backend_url().to_string(), Style::default().fg(Color::Gray)),
        Span::raw(" "),
        Span::styled(
            format!("v{}", env!("CARGO_PKG_VERSION")),
            Style::default().fg(Color::Gray),
        ),
    ]);

    let header = Paragraph::new(title).style(Style::default().bg(Color::DarkGray));
    frame.render_widget(header, area);
}

fn render_footer(app: &App, frame: &mut Frame, area: Rect) {
    let mode_style = match app.input_mode {
        InputMode::Normal => Style::default().bg(Color::Blue).fg(Color::White),
        InputMode::Editing => Style::default().bg(Color::Yellow).fg(Color::Black),
    };

    let mode_text = match app.screen {
        Screen::Upload => " UPLOAD ",
        Screen::Chat => " CHAT ",
    };

    // Key style: dark background with bright text for visibility on both light/dark terminals
    let key_style = Style::default().bg(Color::DarkGray).fg(Color::White);
    let label_style = Style::default().bg(Color::Black).fg(Color::White);

    let hints = match (app.screen, app.input_mode) {
        (Screen::Upload, _) => vec![
            Span::styled(" Enter ", key_style),
            Span::styled(" upload ", label_style),
            Span::styled(" Esc ", key_style),
            Span::styled(" quit ", label_style),
        ],
        (Screen::Chat, InputMode::Normal) => {
            let mut hints = vec![
                Span::styled(" j/k ", key_style),
                Span::styled(" scroll ", label_style),
                Span::styled(" i ", key_style),
                Span::styled(" ask ", label_style),
            ];
            if !app.is_streaming() {
                hints.extend(vec![
                    Span::styled(" n ", key_style),
                    Span::styled(" new document ", label_style),
                ]);
            }
            hints.extend(vec![
                Span::styled(" q ", key_style),
                Span::styled(" quit ", label_style),
            ]);
            hints
        }
        (Screen::Chat, InputMode::Editing) => vec![
            Span::styled(" Enter ", key_style),
            Span::styled(" send ", label_style),
            Span::styled(" Esc ", key_style),
            Span::styled(" stop typing ", label_style),
        ],
    };

    let footer_content = Line::from(
        vec![
            Span::styled(mode_text, mode_style),
            Span::styled(" ", label_style),
        ]
        .into_iter()
        .chain(hints)
        .collect::<Vec<_>>(),
    );

    let footer = Paragraph::new(footer_content).style(Style::default().bg(Color::Black));
    frame.render_widget(footer, area);
}

fn render_upload_screen(app: &mut App, frame: &mut Frame, area: Rect) {
    app.chat_area = None;

    let width = 70.min(area.width.saturating_sub(4));
    let [_, column, _] = Layout::horizontal([
        Constraint::Min(0),
        Constraint::Length(width),
        Constraint::Min(0),
    ])
    .areas(area);
    let [_, intro_area, input_area, status_area, _] = Layout::vertical([
        Constraint::Min(0),
        Constraint::Length(3),
        Constraint::Length(3),
        Constraint::Length(2),
        Constraint::Min(0),
    ])
    .areas(column);

    let intro = Paragraph::new(vec![
        Line::from(Span::styled("Upload a document to start", Style::default().bold())),
        Line::from(Span::styled(
            "PDF or plain text. The backend indexes it for questions.",
            Style::default().fg(Color::DarkGray),
        )),
    ]);
    frame.render_widget(intro, intro_area);

    let uploading = matches!(app.upload_state, UploadState::Uploading(_));
    let border_color = if uploading { Color::DarkGray } else { Color::Yellow };
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border_color))
        .title(" File path ");
    render_text_input(frame, &app.path_input, block, input_area, !uploading);

    let status = match &app.upload_state {
        UploadState::Idle => Line::from(Span::styled(
            "Press Enter to upload",
            Style::default().fg(Color::DarkGray),
        )),
        UploadState::Uploading(path) => Line::from(Span::styled(
            format!("Uploading {}…", path.display()),
            Style::default().fg(Color::Cyan).add_modifier(Modifier::ITALIC),
        )),
        UploadState::Failed(message) => Line::from(Span::styled(
            format!("Upload failed: {}", message),
            Style::default().fg(Color::Red),
        )),
    };
    frame.render_widget(Paragraph::new(status).wrap(Wrap { trim: true }), status_area);
}

fn render_chat_screen(app: &mut App, frame: &mut Frame, area: Rect) {
    let [chat_area, input_area] = Layout::vertical([
        Constraint::Min(0),
        Constraint::Length(3),
    ])
    .areas(area);

    // Store chat area for mouse hit-testing and its inner size for scroll calculations
    app.chat_area = Some(chat_area);
    app.chat_height = chat_area.height.saturating_sub(2);
    app.chat_width = chat_area.width.saturating_sub(2);

    let chat_border_color = if app.input_mode == InputMode::Normal {
        Color::Cyan
    } else {
        Color::DarkGray
    };
    let chat_block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(chat_border_color))
        .title(" Conversation ");

    let conversation = app.session.transcript();
    let chat_text = if conversation.is_empty() {
        Text::from(Span::styled(
            "Start a conversation by asking a question...",
            Style::default().fg(Color::DarkGray),
        ))
    } else {
        let mut lines: Vec<Line> = Vec::new();

        for msg in conversation.messages() {
            match msg.role {
                ChatRole::User => {
                    lines.push(Line::from(Span::styled(
                        "You:",
                        Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
                    )));
                }
                ChatRole::Assistant => {
                    lines.push(Line::from(Span::styled(
                        "AI:",
                        Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
                    )));
                }
            }
            let style = if msg.content.starts_with(docchat_core::state::ERROR_PREFIX) {
                Style::default().fg(Color::Red)
            } else {
                Style::default()
            };
            for line in msg.content.lines() {
                lines.push(Line::from(Span::styled(line.to_string(), style)));
            }
            lines.push(Line::default());
        }

        if app.awaiting_answer() {
            lines.push(Line::from(Span::styled(
                "AI:",
                Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
            )));
            // Animated ellipsis: cycles through ".", "..", "..."
            let dots = ".".repeat((app.animation_frame as usize) + 1);
            lines.push(Line::from(Span::styled(
                format!("Thinking{}", dots),
                Style::default().fg(Color::DarkGray).add_modifier(Modifier::ITALIC),
            )));
        }

        Text::from(lines)
    };

    let chat = Paragraph::new(chat_text)
        .block(chat_block)
        .wrap(Wrap { trim: false })
        .scroll((app.chat_scroll, 0));
    frame.render_widget(chat, chat_area);

    // Question input: the title doubles as the send button
    let editing = app.input_mode == InputMode::Editing;
    let (title, border_color) = if app.is_streaming() {
        (" Thinking… ", Color::DarkGray)
    } else if editing {
        (" Ask ", Color::Yellow)
    } else {
        (" Ask (i to type) ", Color::DarkGray)
    };
    let input_block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border_color))
        .title(title);

    render_text_input(frame, &app.question, input_block, input_area, editing);
}

/// Single-line input with horizontal scrolling that keeps the cursor visible.
fn render_text_input(frame: &mut Frame, input: &TextInput, block: Block, area: Rect, show_cursor: bool) {
    // Inner width = total width - 2 (for borders)
    let inner_width = area.width.saturating_sub(2) as usize;
    let cursor_pos = input.cursor;

    let scroll_offset = if inner_width == 0 {
        0
    } else if cursor_pos >= inner_width {
        cursor_pos - inner_width + 1
    } else {
        0
    };

    let visible_text: String = input
        .value
        .chars()
        .skip(scroll_offset)
        .take(inner_width)
        .collect();

    let paragraph = Paragraph::new(visible_text)
        .style(Style::default().fg(Color::Cyan))
        .block(block);
    frame.render_widget(paragraph, area);

    if show_cursor {
        let cursor_x = (cursor_pos - scroll_offset) as u16;
        frame.set_cursor_position((area.x + cursor_x + 1, area.y + 1));
    }
}
