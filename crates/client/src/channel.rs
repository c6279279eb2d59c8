//! Session channel.
//!
//! One channel carries one exec session: it dials exactly one transport,
//! sends the terminal size once the transport opens, forwards keystrokes and
//! resizes as frames, renders output, and ends in a closed state it never
//! leaves.
//!
//! ```text
//! Idle ──dial──▶ Dialing ──open──▶ Open ──close──▶ Closed
//!                   │                                 ▲
//!                   └───────────── dial failure ──────┘
//! ```
//!
//! Every way of reaching `Closed` writes exactly one status line to the
//! terminal surface.

use std::mem;
use std::time::Duration;

use exec_protocol::{Frame, ProtocolError, TtySize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::target::ExecutionTarget;
use crate::terminal::{TerminalEvent, TerminalSurface};
use crate::transport::{Connection, Dialer, Transport, TransportError, TransportEvent};

/// Status line written when the connection closes.
pub const CLOSED_NOTICE: &str = "The connection has closed.";

/// Channel errors. All of them are terminal for the channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("channel is closed")]
    Closed,

    #[error("channel has not been dialed")]
    NotOpen,
}

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Dialing,
    Open,
    Closed,
}

/// A single exec session over one transport.
pub struct SessionChannel {
    target: ExecutionTarget,
    command: String,
    state: ChannelState,
    transport: Option<Box<dyn Transport>>,
    /// Keystrokes typed while dialing, flushed after the initial size.
    pending_input: Vec<Vec<u8>>,
}

impl SessionChannel {
    pub fn new(target: ExecutionTarget, command: impl Into<String>) -> Self {
        Self {
            target,
            command: command.into(),
            state: ChannelState::Idle,
            transport: None,
            pending_input: Vec::new(),
        }
    }

    /// Builds a channel and dials it.
    ///
    /// On success the returned receiver delivers the transport events that
    /// must be fed back through [`handle_event`](Self::handle_event).
    pub async fn open(
        target: ExecutionTarget,
        command: impl Into<String>,
        dialer: &dyn Dialer,
        dial_timeout: Option<Duration>,
        term: &mut dyn TerminalSurface,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), ChannelError> {
        let mut channel = Self::new(target, command);
        let events = channel.dial(dialer, dial_timeout, term).await?;
        Ok((channel, events))
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn target(&self) -> &ExecutionTarget {
        &self.target
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn is_closed(&self) -> bool {
        self.state == ChannelState::Closed
    }

    /// Whether this channel serves `target` running `command`.
    pub fn serves(&self, target: &ExecutionTarget, command: &str) -> bool {
        &self.target == target && self.command == command
    }

    /// Dials the transport. Only valid from `Idle`.
    ///
    /// A failed or timed out dial closes the channel and writes one
    /// `Failed to connect` line.
    pub async fn dial(
        &mut self,
        dialer: &dyn Dialer,
        dial_timeout: Option<Duration>,
        term: &mut dyn TerminalSurface,
    ) -> Result<mpsc::Receiver<TransportEvent>, ChannelError> {
        match self.state {
            ChannelState::Idle => {}
            ChannelState::Closed => return Err(ChannelError::Closed),
            ChannelState::Dialing | ChannelState::Open => {
                return Err(ChannelError::Connection(
                    "channel is already connected".to_string(),
                ))
            }
        }

        self.set_state(ChannelState::Dialing);
        tracing::info!(session = %self.target, command = %self.command, "Dialing exec session");

        let dial = dialer.dial(&self.target, &self.command);
        let result = match dial_timeout {
            Some(limit) => tokio::time::timeout(limit, dial)
                .await
                .unwrap_or(Err(TransportError::Timeout(limit))),
            None => dial.await,
        };

        match result {
            Ok(Connection { transport, events }) => {
                self.transport = Some(transport);
                Ok(events)
            }
            Err(e) => {
                tracing::warn!(session = %self.target, error = %e, "Exec dial failed");
                self.terminate();
                write_notice(term, &format!("Failed to connect: {}", e));
                Err(ChannelError::Connection(e.to_string()))
            }
        }
    }

    fn set_state(&mut self, state: ChannelState) {
        if self.state != state {
            tracing::debug!(session = %self.target, from = ?self.state, to = ?state, "Channel state changed");
            self.state = state;
        }
    }

    /// Moves to `Closed` and releases the transport without writing anything.
    fn terminate(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.pending_input.clear();
        self.set_state(ChannelState::Closed);
    }

    fn send_frame(&mut self, frame: &Frame) -> Result<(), ChannelError> {
        let text = frame.to_json()?;
        tracing::debug!(kind = frame.kind(), "Sending frame");

        let transport = self.transport.as_mut().ok_or(ChannelError::NotOpen)?;
        transport.send(text).map_err(|e| match e {
            TransportError::Closed => ChannelError::Closed,
            e => ChannelError::Connection(e.to_string()),
        })
    }

    /// Transport reported it is ready: sends the terminal size, then any
    /// keystrokes typed while dialing.
    pub fn on_open(&mut self, term: &dyn TerminalSurface) -> Result<(), ChannelError> {
        match self.state {
            ChannelState::Dialing => {}
            ChannelState::Open => return Ok(()),
            ChannelState::Idle => return Err(ChannelError::NotOpen),
            ChannelState::Closed => return Err(ChannelError::Closed),
        }

        self.set_state(ChannelState::Open);
        tracing::info!(session = %self.target, "Exec session open");

        self.send_frame(&Frame::TtySize(term.size()))?;
        for input in mem::take(&mut self.pending_input) {
            self.send_frame(&Frame::Stdin(input))?;
        }
        Ok(())
    }

    /// Sends raw keystrokes as one `stdin` frame.
    ///
    /// While dialing, keystrokes are held until the transport opens.
    pub fn send_keystrokes(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        match self.state {
            ChannelState::Open => self.send_frame(&Frame::stdin(bytes)),
            ChannelState::Dialing => {
                self.pending_input.push(bytes.to_vec());
                Ok(())
            }
            ChannelState::Idle => Err(ChannelError::NotOpen),
            ChannelState::Closed => Err(ChannelError::Closed),
        }
    }

    /// Sends new terminal dimensions.
    ///
    /// A resize while dialing is dropped; the size at open time is sent.
    pub fn send_resize(&mut self, size: TtySize) -> Result<(), ChannelError> {
        match self.state {
            ChannelState::Open => self.send_frame(&Frame::TtySize(size)),
            ChannelState::Dialing => Ok(()),
            ChannelState::Idle => Err(ChannelError::NotOpen),
            ChannelState::Closed => Err(ChannelError::Closed),
        }
    }

    /// Handles one inbound message.
    ///
    /// Output is written to the terminal unchanged. Anything that is not a
    /// valid `stdout` frame closes the channel with a `Protocol error` line.
    pub fn on_message(
        &mut self,
        text: &str,
        term: &mut dyn TerminalSurface,
    ) -> Result<(), ChannelError> {
        match self.state {
            ChannelState::Open | ChannelState::Dialing => {}
            ChannelState::Idle => return Err(ChannelError::NotOpen),
            ChannelState::Closed => return Err(ChannelError::Closed),
        }

        match Frame::decode_output(text) {
            Ok(bytes) => {
                term.write(&bytes);
                Ok(())
            }
            Err(e) => Err(self.fail_protocol(e, term)),
        }
    }

    /// Binary messages are never valid and close the channel like any
    /// other malformed frame.
    pub fn on_binary(
        &mut self,
        data: &[u8],
        term: &mut dyn TerminalSurface,
    ) -> Result<(), ChannelError> {
        match self.state {
            ChannelState::Open | ChannelState::Dialing => {}
            ChannelState::Idle => return Err(ChannelError::NotOpen),
            ChannelState::Closed => return Err(ChannelError::Closed),
        }

        tracing::debug!(len = data.len(), "Received binary message");
        Err(self.fail_protocol(ProtocolError::UnexpectedFrame { kind: "binary" }, term))
    }

    fn fail_protocol(&mut self, e: ProtocolError, term: &mut dyn TerminalSurface) -> ChannelError {
        tracing::warn!(session = %self.target, error = %e, "Closing exec session on protocol error");
        self.terminate();
        write_notice(term, &format!("Protocol error: {}", e));
        e.into()
    }

    /// Transport reported closure. Idempotent: only the first call writes
    /// the closure line. Returns whether this call closed the channel.
    pub fn on_close(&mut self, term: &mut dyn TerminalSurface) -> bool {
        if self.is_closed() {
            return false;
        }

        tracing::info!(session = %self.target, "Exec session closed");
        self.terminate();
        write_notice(term, CLOSED_NOTICE);
        true
    }

    /// Tears the channel down from this side.
    pub fn close(&mut self, term: &mut dyn TerminalSurface) -> bool {
        if !self.is_closed() {
            tracing::debug!(session = %self.target, "Tearing down exec session");
        }
        self.on_close(term)
    }

    /// Dispatches one transport event.
    pub fn handle_event(
        &mut self,
        event: TransportEvent,
        term: &mut dyn TerminalSurface,
    ) -> Result<(), ChannelError> {
        match event {
            TransportEvent::Open => self.on_open(term),
            TransportEvent::Message(text) => self.on_message(&text, term),
            TransportEvent::Binary(data) => self.on_binary(&data, term),
            TransportEvent::Closed { reason } => {
                if let Some(reason) = reason {
                    tracing::debug!(%reason, "Transport closed");
                }
                self.on_close(term);
                Ok(())
            }
        }
    }

    /// Dispatches one terminal event.
    pub fn handle_input(&mut self, event: TerminalEvent) -> Result<(), ChannelError> {
        match event {
            TerminalEvent::Input(bytes) => self.send_keystrokes(&bytes),
            TerminalEvent::Resize(size) => self.send_resize(size),
        }
    }
}

/// Writes a status line on a line of its own.
fn write_notice(term: &mut dyn TerminalSurface, line: &str) {
    term.write(b"\r\n");
    term.write_line(line);
}
