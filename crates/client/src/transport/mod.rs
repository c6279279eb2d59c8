//! Transports for exec sessions.
//!
//! A [`Dialer`] opens one bidirectional text connection per session. The
//! resulting [`Transport`] sends frames; lifecycle and inbound messages
//! arrive in order on the event receiver of the [`Connection`].
//!
//! - [`websocket`]: the production transport
//! - [`memory`]: an in-process transport driven by hand, for tests and demos

pub mod memory;
pub mod websocket;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::target::ExecutionTarget;

pub use memory::{DialRecord, MemoryDialer, MemoryPeer};
pub use websocket::WebSocketDialer;

/// Buffer size for transport event channels.
pub(crate) const EVENT_BUFFER_SIZE: usize = 256;

/// Something that happened on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is ready to carry frames.
    Open,
    /// One inbound text message.
    Message(String),
    /// One inbound binary message. Exec sessions only speak text.
    Binary(Vec<u8>),
    /// The connection ended, from either side or through a network failure.
    Closed { reason: Option<String> },
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid endpoint: {0}")]
    Endpoint(String),

    #[error("{0}")]
    Dial(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport is closed")]
    Closed,
}

/// Sending half of a connection.
pub trait Transport: Send {
    /// Queues one text message. Messages are delivered in call order.
    fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Starts closing the connection. A `Closed` event follows.
    fn close(&mut self);
}

/// A dialed connection.
pub struct Connection {
    pub transport: Box<dyn Transport>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Opens connections to the exec endpoint of a target.
///
/// This trait abstracts the transport so that sessions can run over a
/// websocket in production and over an in-memory pipe in tests.
pub trait Dialer: Send + Sync {
    /// Dials one connection running `command` in `target`.
    fn dial<'a>(
        &'a self,
        target: &'a ExecutionTarget,
        command: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Connection, TransportError>> + Send + 'a>>;
}
