//! Socket factory: owns the one live channel of a session.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::channel::{ChannelError, SessionChannel};
use crate::target::ExecutionTarget;
use crate::terminal::TerminalSurface;
use crate::transport::{Dialer, TransportEvent};

/// A dialed channel together with its transport events.
pub struct LiveChannel {
    pub channel: SessionChannel,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Builds channels and guarantees at most one is live at a time.
///
/// Connecting to a different `(task, allocation, command)` tears the current
/// channel down before the new one is dialed.
pub struct SocketFactory {
    dialer: Arc<dyn Dialer>,
    dial_timeout: Option<Duration>,
    live: Option<LiveChannel>,
    built: usize,
}

impl SocketFactory {
    pub fn new(dialer: Arc<dyn Dialer>, dial_timeout: Option<Duration>) -> Self {
        Self {
            dialer,
            dial_timeout,
            live: None,
            built: 0,
        }
    }

    /// Returns the live channel for `target` and `command`, dialing a new one
    /// when none is live or the live one serves something else.
    pub async fn connect(
        &mut self,
        target: &ExecutionTarget,
        command: &str,
        term: &mut dyn TerminalSurface,
    ) -> Result<&mut LiveChannel, ChannelError> {
        let reusable = self
            .live
            .as_ref()
            .is_some_and(|live| !live.channel.is_closed() && live.channel.serves(target, command));

        if !reusable {
            self.teardown(term);
            self.built += 1;
            tracing::debug!(session = %target, built = self.built, "Building exec channel");

            let (channel, events) = SessionChannel::open(
                target.clone(),
                command,
                self.dialer.as_ref(),
                self.dial_timeout,
                term,
            )
            .await?;
            self.live = Some(LiveChannel { channel, events });
        }

        self.live.as_mut().ok_or(ChannelError::Closed)
    }

    /// Closes and drops the live channel, if any.
    ///
    /// A channel that is still open writes its closure line.
    pub fn teardown(&mut self, term: &mut dyn TerminalSurface) {
        if let Some(mut live) = self.live.take() {
            live.channel.close(term);
        }
    }

    pub fn live(&self) -> Option<&LiveChannel> {
        self.live.as_ref()
    }

    pub fn live_mut(&mut self) -> Option<&mut LiveChannel> {
        self.live.as_mut()
    }

    /// Number of channels built so far.
    pub fn sockets_built(&self) -> usize {
        self.built
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::CLOSED_NOTICE;
    use crate::terminal::BufferTerminal;
    use crate::transport::MemoryDialer;

    fn factory(dialer: &MemoryDialer) -> SocketFactory {
        SocketFactory::new(Arc::new(dialer.clone()), None)
    }

    #[tokio::test]
    async fn test_same_key_reuses_channel() {
        let dialer = MemoryDialer::new();
        let mut factory = factory(&dialer);
        let mut term = BufferTerminal::default();
        let target = ExecutionTarget::new("web", "web", "abc123");

        factory.connect(&target, "/bin/bash", &mut term).await.unwrap();
        factory.connect(&target, "/bin/bash", &mut term).await.unwrap();

        assert_eq!(factory.sockets_built(), 1);
        assert_eq!(dialer.dial_count(), 1);
    }

    #[tokio::test]
    async fn test_switching_target_tears_down_first() {
        let dialer = MemoryDialer::new();
        let mut factory = factory(&dialer);
        let mut term = BufferTerminal::default();
        let web = ExecutionTarget::new("web", "web", "abc123");
        let api = ExecutionTarget::new("api", "api", "def456");

        factory.connect(&web, "/bin/bash", &mut term).await.unwrap();
        let first = dialer.peer(0).unwrap();
        first.open();
        {
            let live = factory.live_mut().unwrap();
            let event = live.events.recv().await.unwrap();
            live.channel.handle_event(event, &mut term).unwrap();
        }

        factory.connect(&api, "/bin/bash", &mut term).await.unwrap();

        assert!(first.is_closed());
        assert_eq!(factory.sockets_built(), 2);
        assert_eq!(factory.live().unwrap().channel.target(), &api);
        assert_eq!(term.non_empty_lines(), vec![CLOSED_NOTICE]);
    }

    #[tokio::test]
    async fn test_command_change_builds_new_channel() {
        let dialer = MemoryDialer::new();
        let mut factory = factory(&dialer);
        let mut term = BufferTerminal::default();
        let target = ExecutionTarget::new("web", "web", "abc123");

        factory.connect(&target, "/bin/bash", &mut term).await.unwrap();
        factory.connect(&target, "/bin/sh", &mut term).await.unwrap();

        let commands: Vec<String> = dialer.dials().into_iter().map(|d| d.command).collect();
        assert_eq!(commands, vec!["/bin/bash", "/bin/sh"]);
        assert!(dialer.peer(0).unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_closed_channel_is_replaced() {
        let dialer = MemoryDialer::new();
        let mut factory = factory(&dialer);
        let mut term = BufferTerminal::default();
        let target = ExecutionTarget::new("web", "web", "abc123");

        factory.connect(&target, "/bin/bash", &mut term).await.unwrap();
        factory.live_mut().unwrap().channel.on_close(&mut term);
        factory.connect(&target, "/bin/bash", &mut term).await.unwrap();

        assert_eq!(factory.sockets_built(), 2);
        assert_eq!(term.non_empty_lines(), vec![CLOSED_NOTICE]);
    }

    #[tokio::test]
    async fn test_failed_dial_leaves_nothing_live() {
        let dialer = MemoryDialer::failing("no route to host");
        let mut factory = factory(&dialer);
        let mut term = BufferTerminal::default();
        let target = ExecutionTarget::new("web", "web", "abc123");

        let result = factory.connect(&target, "/bin/bash", &mut term).await;

        assert!(matches!(result, Err(ChannelError::Connection(_))));
        assert!(factory.live().is_none());
    }

    #[tokio::test]
    async fn test_teardown_without_channel() {
        let dialer = MemoryDialer::new();
        let mut factory = factory(&dialer);
        let mut term = BufferTerminal::default();

        factory.teardown(&mut term);
        assert!(term.output().is_empty());
    }
}
