//! Terminal surfaces.
//!
//! A surface displays bytes and reports its size. Keystrokes and resizes
//! travel the other way as [`TerminalEvent`]s on a channel.

use std::io::{self, Write};

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use exec_protocol::TtySize;
use tokio::sync::mpsc;

/// Buffer size for terminal event channels.
const EVENT_BUFFER_SIZE: usize = 256;

/// Input produced by a terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    /// Raw keystroke bytes.
    Input(Vec<u8>),
    /// The terminal changed size.
    Resize(TtySize),
}

/// Where session output is rendered.
pub trait TerminalSurface: Send {
    /// Writes bytes verbatim; escape sequences are the surface's business.
    fn write(&mut self, bytes: &[u8]);

    /// Current dimensions.
    fn size(&self) -> TtySize;

    /// Writes one human-readable status line.
    fn write_line(&mut self, line: &str) {
        self.write(line.as_bytes());
        self.write(b"\r\n");
    }
}

/// In-memory surface that records everything written to it.
///
/// `screen_lines` applies carriage returns, line feeds and backspaces so
/// assertions can look at what a user would see.
#[derive(Debug, Clone)]
pub struct BufferTerminal {
    output: Vec<u8>,
    size: TtySize,
}

impl Default for BufferTerminal {
    fn default() -> Self {
        Self::new(TtySize::default())
    }
}

impl BufferTerminal {
    pub fn new(size: TtySize) -> Self {
        Self {
            output: Vec::new(),
            size,
        }
    }

    pub fn set_size(&mut self, size: TtySize) {
        self.size = size;
    }

    /// Everything written so far.
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn clear(&mut self) {
        self.output.clear();
    }

    /// Rendered lines with trailing whitespace trimmed.
    pub fn screen_lines(&self) -> Vec<String> {
        let mut lines: Vec<Vec<char>> = vec![Vec::new()];
        let mut col = 0usize;

        for c in String::from_utf8_lossy(&self.output).chars() {
            match c {
                '\n' => {
                    lines.push(Vec::new());
                    col = 0;
                }
                '\r' => col = 0,
                '\u{8}' => col = col.saturating_sub(1),
                c => {
                    if let Some(line) = lines.last_mut() {
                        if col < line.len() {
                            line[col] = c;
                        } else {
                            line.push(c);
                        }
                        col += 1;
                    }
                }
            }
        }

        lines
            .into_iter()
            .map(|line| line.into_iter().collect::<String>().trim_end().to_string())
            .collect()
    }

    /// Rendered lines, without blank ones.
    pub fn non_empty_lines(&self) -> Vec<String> {
        self.screen_lines()
            .into_iter()
            .filter(|line| !line.is_empty())
            .collect()
    }
}

impl TerminalSurface for BufferTerminal {
    fn write(&mut self, bytes: &[u8]) {
        self.output.extend_from_slice(bytes);
    }

    fn size(&self) -> TtySize {
        self.size
    }
}

/// The process's own terminal, in raw mode for as long as this value lives.
pub struct LocalTerminal {
    stdout: io::Stdout,
}

impl LocalTerminal {
    /// Switches the terminal to raw mode.
    pub fn enter() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self {
            stdout: io::stdout(),
        })
    }

    /// Starts a thread that forwards key and resize events.
    ///
    /// The thread exits once the receiver is dropped and the next event
    /// arrives, or when reading events fails.
    pub fn spawn_input(&self) -> mpsc::Receiver<TerminalEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER_SIZE);

        std::thread::spawn(move || loop {
            let event = match event::read() {
                Ok(event) => event,
                Err(e) => {
                    tracing::error!("failed to read terminal event: {}", e);
                    break;
                }
            };

            let forwarded = match event {
                Event::Key(key) => key_to_bytes(key).map(TerminalEvent::Input),
                Event::Paste(text) => Some(TerminalEvent::Input(text.into_bytes())),
                Event::Resize(width, height) => {
                    Some(TerminalEvent::Resize(TtySize::new(width, height)))
                }
                _ => None,
            };

            if let Some(forwarded) = forwarded {
                if tx.blocking_send(forwarded).is_err() {
                    break;
                }
            }
        });

        rx
    }
}

impl Drop for LocalTerminal {
    fn drop(&mut self) {
        if let Err(e) = terminal::disable_raw_mode() {
            tracing::warn!("failed to restore terminal mode: {}", e);
        }
    }
}

impl TerminalSurface for LocalTerminal {
    fn write(&mut self, bytes: &[u8]) {
        if let Err(e) = self
            .stdout
            .write_all(bytes)
            .and_then(|_| self.stdout.flush())
        {
            tracing::warn!("failed to write to terminal: {}", e);
        }
    }

    fn size(&self) -> TtySize {
        terminal::size()
            .map(|(width, height)| TtySize::new(width, height))
            .unwrap_or_default()
    }
}

/// Translates a key press into the bytes a terminal would send.
pub fn key_to_bytes(key: KeyEvent) -> Option<Vec<u8>> {
    if key.kind == KeyEventKind::Release {
        return None;
    }

    let bytes: Vec<u8> = match key.code {
        KeyCode::Char(c) if key.modifiers.contains(KeyModifiers::CONTROL) => {
            let c = c.to_ascii_lowercase();
            match c {
                'a'..='z' => vec![(c as u8) & 0x1f],
                '[' => vec![0x1b],
                '\\' => vec![0x1c],
                ']' => vec![0x1d],
                ' ' | '@' => vec![0x00],
                _ => return None,
            }
        }
        KeyCode::Char(c) => {
            let mut buf = [0u8; 4];
            c.encode_utf8(&mut buf).as_bytes().to_vec()
        }
        KeyCode::Enter => b"\r".to_vec(),
        KeyCode::Backspace => vec![0x7f],
        KeyCode::Tab => b"\t".to_vec(),
        KeyCode::BackTab => b"\x1b[Z".to_vec(),
        KeyCode::Esc => vec![0x1b],
        KeyCode::Up => b"\x1b[A".to_vec(),
        KeyCode::Down => b"\x1b[B".to_vec(),
        KeyCode::Right => b"\x1b[C".to_vec(),
        KeyCode::Left => b"\x1b[D".to_vec(),
        KeyCode::Home => b"\x1b[H".to_vec(),
        KeyCode::End => b"\x1b[F".to_vec(),
        KeyCode::Insert => b"\x1b[2~".to_vec(),
        KeyCode::Delete => b"\x1b[3~".to_vec(),
        KeyCode::PageUp => b"\x1b[5~".to_vec(),
        KeyCode::PageDown => b"\x1b[6~".to_vec(),
        _ => return None,
    };

    if key.modifiers.contains(KeyModifiers::ALT) {
        let mut prefixed = Vec::with_capacity(bytes.len() + 1);
        prefixed.push(0x1b);
        prefixed.extend(bytes);
        return Some(prefixed);
    }

    Some(bytes)
}
