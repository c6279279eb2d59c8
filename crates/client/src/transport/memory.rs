//! In-process transport.
//!
//! [`MemoryDialer`] records every dial and hands back a [`MemoryPeer`] per
//! connection. The peer plays the server: it injects open/message/close
//! events and exposes what the client sent.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::{Connection, Dialer, Transport, TransportError, TransportEvent, EVENT_BUFFER_SIZE};
use crate::target::ExecutionTarget;

/// One recorded dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialRecord {
    pub target: ExecutionTarget,
    pub command: String,
}

#[derive(Default)]
struct DialerState {
    dials: Vec<DialRecord>,
    peers: Vec<MemoryPeer>,
    fail_with: Option<String>,
    hang: bool,
}

/// Dialer whose connections stay inside the process.
#[derive(Clone, Default)]
pub struct MemoryDialer {
    state: Arc<Mutex<DialerState>>,
}

impl MemoryDialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A dialer whose every dial fails with `reason`.
    pub fn failing(reason: impl Into<String>) -> Self {
        let dialer = Self::default();
        dialer.lock().fail_with = Some(reason.into());
        dialer
    }

    /// A dialer whose dials never complete.
    pub fn hanging() -> Self {
        let dialer = Self::default();
        dialer.lock().hang = true;
        dialer
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DialerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of dials attempted so far.
    pub fn dial_count(&self) -> usize {
        self.lock().dials.len()
    }

    pub fn dials(&self) -> Vec<DialRecord> {
        self.lock().dials.clone()
    }

    /// Peer of the `index`-th successful connection.
    pub fn peer(&self, index: usize) -> Option<MemoryPeer> {
        self.lock().peers.get(index).cloned()
    }

    /// Peer of the most recent successful connection.
    pub fn last_peer(&self) -> Option<MemoryPeer> {
        self.lock().peers.last().cloned()
    }
}

impl Dialer for MemoryDialer {
    fn dial<'a>(
        &'a self,
        target: &'a ExecutionTarget,
        command: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Connection, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let (fail_with, hang) = {
                let mut state = self.lock();
                state.dials.push(DialRecord {
                    target: target.clone(),
                    command: command.to_string(),
                });
                (state.fail_with.clone(), state.hang)
            };

            if hang {
                std::future::pending::<()>().await;
            }
            if let Some(reason) = fail_with {
                return Err(TransportError::Dial(reason));
            }

            let (events_tx, events) = mpsc::channel(EVENT_BUFFER_SIZE);
            let sent = Arc::new(Mutex::new(Vec::new()));
            let closed = Arc::new(AtomicBool::new(false));

            let peer = MemoryPeer {
                events: events_tx,
                sent: sent.clone(),
                closed: closed.clone(),
            };
            self.lock().peers.push(peer);

            Ok(Connection {
                transport: Box::new(MemoryTransport { sent, closed }),
                events,
            })
        })
    }
}

/// Client half of an in-memory connection.
struct MemoryTransport {
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

impl Transport for MemoryTransport {
    fn send(&mut self, text: String) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(text);
        Ok(())
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Server half of an in-memory connection.
#[derive(Clone)]
pub struct MemoryPeer {
    events: mpsc::Sender<TransportEvent>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

impl MemoryPeer {
    fn emit(&self, event: TransportEvent) {
        if let Err(e) = self.events.try_send(event) {
            tracing::debug!("memory peer dropped event: {}", e);
        }
    }

    /// Reports the connection as ready.
    pub fn open(&self) {
        self.emit(TransportEvent::Open);
    }

    /// Delivers one text message to the client.
    pub fn deliver(&self, text: impl Into<String>) {
        self.emit(TransportEvent::Message(text.into()));
    }

    pub fn deliver_binary(&self, data: impl Into<Vec<u8>>) {
        self.emit(TransportEvent::Binary(data.into()));
    }

    /// Closes the connection from the server side.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.emit(TransportEvent::Closed { reason: None });
    }

    /// Messages the client has sent, in order.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Whether either side has closed the connection.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> ExecutionTarget {
        ExecutionTarget::new("web", "web", "abc123-0000")
    }

    #[tokio::test]
    async fn test_dial_records_target_and_command() {
        let dialer = MemoryDialer::new();
        let target = target();

        let _connection = dialer.dial(&target, "/bin/bash").await.unwrap();

        assert_eq!(
            dialer.dials(),
            vec![DialRecord {
                target,
                command: "/bin/bash".to_string(),
            }]
        );
        assert!(dialer.last_peer().is_some());
    }

    #[tokio::test]
    async fn test_peer_sees_sent_messages() {
        let dialer = MemoryDialer::new();
        let target = target();
        let mut connection = dialer.dial(&target, "/bin/sh").await.unwrap();

        connection.transport.send("one".to_string()).unwrap();
        connection.transport.send("two".to_string()).unwrap();

        assert_eq!(dialer.peer(0).unwrap().sent(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_peer_events_arrive_in_order() {
        let dialer = MemoryDialer::new();
        let target = target();
        let mut connection = dialer.dial(&target, "/bin/sh").await.unwrap();
        let peer = dialer.last_peer().unwrap();

        peer.open();
        peer.deliver("hello");
        peer.close();

        assert_eq!(connection.events.recv().await, Some(TransportEvent::Open));
        assert_eq!(
            connection.events.recv().await,
            Some(TransportEvent::Message("hello".to_string()))
        );
        assert_eq!(
            connection.events.recv().await,
            Some(TransportEvent::Closed { reason: None })
        );
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let dialer = MemoryDialer::new();
        let target = target();
        let mut connection = dialer.dial(&target, "/bin/sh").await.unwrap();

        connection.transport.close();
        assert!(dialer.last_peer().unwrap().is_closed());
        assert!(matches!(
            connection.transport.send("late".to_string()),
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_failing_dialer() {
        let dialer = MemoryDialer::failing("connection refused");
        let target = target();

        let result = dialer.dial(&target, "/bin/sh").await;
        assert!(matches!(result, Err(TransportError::Dial(ref reason)) if reason == "connection refused"));
        assert_eq!(dialer.dial_count(), 1);
        assert!(dialer.last_peer().is_none());
    }

    #[tokio::test]
    async fn test_hanging_dialer_never_completes() {
        let dialer = MemoryDialer::hanging();
        let target = target();

        let result = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            dialer.dial(&target, "/bin/sh"),
        )
        .await;
        assert!(result.is_err());
    }
}
