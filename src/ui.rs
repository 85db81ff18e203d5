use crate::controller::ChatController;
use crate::transcript::{ChatTurn, Speaker, StepKind, ThinkingStep, Visualization};
use crossterm::cursor::MoveTo;
use crossterm::event::{self, Event, KeyCode, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use ratatui::backend::CrosstermBackend;
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Paragraph, Widget, Wrap};
use ratatui::{Frame, Terminal, TerminalOptions, Viewport};
use std::io;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

type TuiTerminal = Terminal<CrosstermBackend<io::Stdout>>;
type UiResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const INPUT_HEIGHT: u16 = 3;
const ARGS_PREVIEW_CHARS: usize = 120;
const RESULT_PREVIEW_CHARS: usize = 160;

// Restores terminal settings even if the loop exits early.
struct TerminalGuard;

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = io::stdout().flush();
    }
}

#[derive(Debug, Clone)]
struct LineSpec {
    text: String,
    style: Style,
}

impl LineSpec {
    fn new(text: impl Into<String>, style: Style) -> Self {
        Self {
            text: text.into(),
            style,
        }
    }
}

fn truncate(value: &str, max_chars: usize, suffix: &str) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let cut: String = value.chars().take(max_chars).collect();
    format!("{}{}", cut, suffix)
}

/// One scrollback line for a live thinking step.
fn step_line(step: &ThinkingStep) -> String {
    match step.kind {
        StepKind::ToolInvoked => {
            let args = step
                .arguments
                .as_ref()
                .map(|args| serde_json::to_string(args).unwrap_or_default())
                .unwrap_or_default();
            format!("⚙ {}({})", step.name, truncate(&args, ARGS_PREVIEW_CHARS, "…"))
        }
        StepKind::ToolCompleted => {
            let preview = step.preview.as_deref().unwrap_or("");
            format!("→ {}: {}", step.name, truncate(preview, RESULT_PREVIEW_CHARS, "…"))
        }
    }
}

fn step_style() -> Style {
    Style::default()
        .fg(Color::DarkGray)
        .add_modifier(Modifier::ITALIC)
}

/// Scrollback lines for one finalized turn. `artifact_note` replaces the raw
/// HTML body, which never belongs in the terminal.
fn turn_lines(turn: &ChatTurn, artifact_note: Option<&str>) -> Vec<LineSpec> {
    let (header, color) = match turn.speaker {
        Speaker::User => ("You:", Color::Blue),
        Speaker::Assistant => ("Agent:", Color::Yellow),
    };
    let header_style = Style::default().fg(color).add_modifier(Modifier::BOLD);
    let body_style = Style::default().fg(color);

    let mut lines = vec![LineSpec::new(
        format!("{} [{}]", header, turn.created_at.format("%H:%M:%S")),
        header_style,
    )];
    if let Some(steps) = &turn.steps {
        lines.push(LineSpec::new(
            format!("  ({} tool steps)", steps.len()),
            step_style(),
        ));
    }
    for line in turn.text.lines() {
        lines.push(LineSpec::new(format!("  {}", line), body_style));
    }
    match &turn.visualization {
        Some(viz @ Visualization::Chart(_)) => {
            lines.push(LineSpec::new(
                format!("  [{}]", viz.describe()),
                Style::default().fg(Color::Green),
            ));
        }
        Some(Visualization::Html(_)) => {
            if let Some(note) = artifact_note {
                lines.push(LineSpec::new(
                    format!("  [{}]", note),
                    Style::default().fg(Color::Cyan),
                ));
            }
        }
        None => {}
    }
    lines
}

fn save_artifact(id: &Uuid, html: &str) -> io::Result<PathBuf> {
    let path = std::env::temp_dir().join(format!("routedesk-artifact-{}.html", id));
    std::fs::write(&path, html)?;
    Ok(path)
}

struct Console {
    controller: ChatController,
    input: String,
    cursor: usize,
    rendered_turns: usize,
    rendered_steps: usize,
    should_quit: bool,
}

impl Console {
    fn new(controller: ChatController) -> Self {
        Self {
            controller,
            input: String::new(),
            cursor: 0,
            rendered_turns: 0,
            rendered_steps: 0,
            should_quit: false,
        }
    }

    fn draw(&self, f: &mut Frame) {
        let area = f.area();
        let title = if self.controller.is_loading() {
            " Ask about your tickets (Enter to send, Esc to cancel) [Thinking...] "
        } else {
            " Ask about your tickets (Enter to send, Esc to quit) "
        };

        let content: Text = if self.input.is_empty() {
            Text::from(Span::styled(
                "e.g. show the sentiment breakdown by office",
                Style::default().fg(Color::DarkGray),
            ))
        } else {
            Text::from(self.input.clone())
        };

        let input = Paragraph::new(content)
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(title)
                    .border_style(Style::default().fg(Color::DarkGray)),
            )
            .wrap(Wrap { trim: false });
        f.render_widget(input, area);

        let x = (area.x + 1 + self.cursor as u16).min(area.x + area.width.saturating_sub(2));
        let y = area.y + 1;
        f.set_cursor_position((x, y));
    }

    /// Pushes unrendered steps and turns into the scrollback.
    fn flush_output(&mut self, terminal: &mut TuiTerminal) -> UiResult<()> {
        let steps = self.controller.thinking_steps();
        if steps.len() < self.rendered_steps {
            // The live log was cleared by a terminal transition.
            self.rendered_steps = 0;
        }
        let pending: Vec<LineSpec> = steps[self.rendered_steps..]
            .iter()
            .map(|step| {
                LineSpec::new(
                    format!(
                        "  [{}] {}",
                        step.observed_at.format("%H:%M:%S"),
                        step_line(step)
                    ),
                    step_style(),
                )
            })
            .collect();
        self.rendered_steps = steps.len();
        for line in pending {
            append_lines(terminal, vec![line], false)?;
        }

        while self.rendered_turns < self.controller.turns().len() {
            let turn = self.controller.turns()[self.rendered_turns].clone();
            self.rendered_turns += 1;
            let note = match &turn.visualization {
                Some(Visualization::Html(html)) => Some(match save_artifact(&turn.id, html) {
                    Ok(path) => format!("artifact saved to {}", path.display()),
                    Err(err) => format!("artifact could not be saved: {}", err),
                }),
                _ => None,
            };
            append_lines(terminal, turn_lines(&turn, note.as_deref()), true)?;
        }
        Ok(())
    }

    fn handle_input(&mut self, terminal: &mut TuiTerminal) -> UiResult<()> {
        if !event::poll(Duration::from_millis(50))? {
            return Ok(());
        }
        let Event::Key(key) = event::read()? else {
            return Ok(());
        };

        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            self.should_quit = true;
            return Ok(());
        }

        match key.code {
            KeyCode::Esc => {
                if self.controller.is_loading() {
                    self.controller.cancel();
                } else {
                    self.should_quit = true;
                }
            }
            KeyCode::Enter => {
                let question = self.input.trim().to_string();
                if !question.is_empty() {
                    self.controller.submit(&question);
                    self.rendered_steps = 0;
                    self.input.clear();
                    self.cursor = 0;
                    self.flush_output(terminal)?;
                }
            }
            KeyCode::Char(c) => {
                let at = self.byte_index(self.cursor);
                self.input.insert(at, c);
                self.cursor += 1;
            }
            KeyCode::Backspace => {
                if self.cursor > 0 {
                    let at = self.byte_index(self.cursor - 1);
                    self.input.remove(at);
                    self.cursor -= 1;
                }
            }
            KeyCode::Left => self.cursor = self.cursor.saturating_sub(1),
            KeyCode::Right => {
                self.cursor = (self.cursor + 1).min(self.input.chars().count());
            }
            KeyCode::Home => self.cursor = 0,
            KeyCode::End => self.cursor = self.input.chars().count(),
            _ => {}
        }
        Ok(())
    }

    fn byte_index(&self, char_index: usize) -> usize {
        self.input
            .char_indices()
            .nth(char_index)
            .map(|(idx, _)| idx)
            .unwrap_or(self.input.len())
    }
}

fn append_lines(terminal: &mut TuiTerminal, lines: Vec<LineSpec>, trailing_blank: bool) -> UiResult<()> {
    let width = terminal.size()?.width.max(1) as usize;
    let mut height = 0usize;
    for line in &lines {
        height += (line.text.chars().count().max(1) + width - 1) / width;
    }
    if trailing_blank {
        height += 1;
    }

    let mut text = Text::from(
        lines
            .into_iter()
            .map(|line| Line::from(Span::styled(line.text, line.style)))
            .collect::<Vec<_>>(),
    );
    if trailing_blank {
        text.extend(Text::raw("\n"));
    }

    // Insert above the inline viewport so the conversation stays in scrollback.
    terminal.insert_before(height as u16, |buf| {
        let paragraph = Paragraph::new(text).wrap(Wrap { trim: false });
        paragraph.render(buf.area, buf);
    })?;
    Ok(())
}

pub fn run_console(controller: ChatController) -> UiResult<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    let (_, rows) = size()?;
    if rows > 0 {
        // Push existing screen content into scrollback without clearing it.
        for _ in 0..rows {
            writeln!(stdout)?;
        }
        stdout.flush()?;
    }
    execute!(stdout, MoveTo(0, 0))?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::with_options(
        backend,
        TerminalOptions {
            viewport: Viewport::Inline(INPUT_HEIGHT),
        },
    )?;

    let mut console = Console::new(controller);
    let _guard = TerminalGuard;

    terminal.draw(|f| console.draw(f))?;

    while !console.should_quit {
        while console.controller.poll_once() {
            console.flush_output(&mut terminal)?;
        }
        console.handle_input(&mut terminal)?;
        terminal.draw(|f| console.draw(f))?;
    }

    disable_raw_mode()?;
    io::stdout().flush()?;

    Ok(())
}
