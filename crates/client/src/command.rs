//! Command persistence and command-line editing.
//!
//! The last command a user confirmed is remembered process-wide (not per
//! task) and seeds the editor for the next session.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

/// Command offered when nothing has been persisted.
pub const DEFAULT_COMMAND: &str = "/bin/bash";

/// Errors raised by command stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to write command store {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read command store {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Holds the last used command across sessions.
pub trait CommandStore: Send + Sync {
    /// Returns the persisted command, if any.
    fn get(&self) -> Option<String>;

    /// Persists a new command.
    fn set(&self, command: &str) -> Result<(), StoreError>;

    /// Forgets the persisted command.
    fn clear(&self) -> Result<(), StoreError>;

    /// The persisted command, or `fallback` when there is none.
    fn get_or(&self, fallback: &str) -> String {
        self.get().unwrap_or_else(|| fallback.to_string())
    }
}

/// In-memory store; nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryCommandStore {
    command: Mutex<Option<String>>,
}

impl MemoryCommandStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-seeded with `command`.
    pub fn with_command(command: impl Into<String>) -> Self {
        Self {
            command: Mutex::new(Some(command.into())),
        }
    }
}

impl CommandStore for MemoryCommandStore {
    fn get(&self) -> Option<String> {
        self.command
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set(&self, command: &str) -> Result<(), StoreError> {
        *self.command.lock().unwrap_or_else(|e| e.into_inner()) = Some(command.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self.command.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}

/// File-backed store.
///
/// The file holds the command as a JSON string. It is read once when the
/// store is opened and rewritten on every `set`.
#[derive(Debug)]
pub struct FileCommandStore {
    path: PathBuf,
    command: Mutex<Option<String>>,
}

impl FileCommandStore {
    /// Opens the store at `path`, loading any persisted command.
    ///
    /// A missing file means no command. An unreadable JSON body is logged
    /// and treated the same way.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let command = if path.exists() {
            let contents = fs::read_to_string(&path).map_err(|source| StoreError::Read {
                path: path.clone(),
                source,
            })?;
            match serde_json::from_str::<String>(&contents) {
                Ok(command) => Some(command),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Ignoring corrupt command store");
                    None
                }
            }
        } else {
            None
        };

        tracing::debug!(path = %path.display(), loaded = command.is_some(), "Opened command store");

        Ok(Self {
            path,
            command: Mutex::new(command),
        })
    }

    fn write_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Write {
            path: self.path.clone(),
            source,
        }
    }
}

impl CommandStore for FileCommandStore {
    fn get(&self) -> Option<String> {
        self.command
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set(&self, command: &str) -> Result<(), StoreError> {
        let body = serde_json::to_string(command)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.write_error(e))?;
        }
        fs::write(&self.path, body).map_err(|e| self.write_error(e))?;

        *self.command.lock().unwrap_or_else(|e| e.into_inner()) = Some(command.to_string());
        tracing::debug!(path = %self.path.display(), "Persisted command");
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        if self.path.exists() {
            fs::remove_file(&self.path).map_err(|e| self.write_error(e))?;
        }
        *self.command.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}

/// Result of feeding input to a [`CommandEditor`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EditOutcome {
    /// Bytes to write back to the terminal so the visible line matches.
    pub echo: Vec<u8>,
    /// Set when the user confirmed the command with return.
    pub submitted: Option<String>,
    /// Input that followed return in the same chunk. It is meant for the
    /// command, not the editor.
    pub trailing: Vec<u8>,
    /// Set when the user abandoned editing (Ctrl-C, Ctrl-D or Esc).
    pub cancelled: bool,
}

/// Line editor for the command, shown after a fixed, non-erasable prefix.
#[derive(Debug, Clone)]
pub struct CommandEditor {
    command: String,
}

impl CommandEditor {
    pub fn new(initial: impl Into<String>) -> Self {
        Self {
            command: initial.into(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Removes the last character. Returns false at the start of the line.
    pub fn backspace(&mut self) -> bool {
        self.command.pop().is_some()
    }

    pub fn insert(&mut self, c: char) {
        self.command.push(c);
    }

    /// Applies raw terminal input.
    ///
    /// Return submits a non-empty command; whatever follows it in the same
    /// chunk is handed back in [`EditOutcome::trailing`]. Ctrl-C, Ctrl-D and
    /// a lone Esc cancel. Escape sequences and other control bytes are
    /// ignored.
    pub fn feed(&mut self, input: &[u8]) -> EditOutcome {
        let mut outcome = EditOutcome::default();

        if matches!(input, [0x1b]) {
            outcome.cancelled = true;
            return outcome;
        }
        if input.first() == Some(&0x1b) {
            return outcome;
        }

        let text = String::from_utf8_lossy(input);
        for (i, c) in text.char_indices() {
            match c {
                '\r' | '\n' => {
                    if !self.command.trim().is_empty() {
                        let mut rest = &text[i + 1..];
                        if c == '\r' {
                            rest = rest.strip_prefix('\n').unwrap_or(rest);
                        }
                        outcome.submitted = Some(self.command.clone());
                        outcome.trailing = rest.as_bytes().to_vec();
                        outcome.echo.extend_from_slice(b"\r\n");
                        break;
                    }
                }
                '\u{3}' | '\u{4}' => {
                    outcome.cancelled = true;
                    break;
                }
                '\u{7f}' | '\u{8}' => {
                    if self.backspace() {
                        outcome.echo.extend_from_slice(b"\x08 \x08");
                    }
                }
                c if c.is_control() || c == char::REPLACEMENT_CHARACTER => {}
                c => {
                    self.insert(c);
                    let mut buf = [0u8; 4];
                    outcome
                        .echo
                        .extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                }
            }
        }

        outcome
    }
}

/// Escapes a word for display on a POSIX shell command line.
pub fn shell_escape(word: &str) -> String {
    let mut escaped = String::with_capacity(word.len());
    for c in word.chars() {
        if !(c.is_ascii_alphanumeric() || "-_./:@%+=,".contains(c)) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Splits a command line into an argv on whitespace.
pub fn command_argv(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}
