//! Exec session controller.
//!
//! Drives one user-visible session through its phases:
//!
//! - `Idle`: no task selected, or the last channel has ended
//! - `Editing`: a target is resolved and the command line is being edited
//! - `Running`: the command was confirmed and keystrokes go to the channel
//!
//! The controller owns the [`SocketFactory`], so there is never more than
//! one live channel per session.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError};

use crate::channel::{ChannelError, SessionChannel};
use crate::command::{shell_escape, CommandEditor, CommandStore, DEFAULT_COMMAND};
use crate::sockets::SocketFactory;
use crate::target::{Allocation, ExecutionTarget, ResolveError, TargetResolver};
use crate::terminal::{TerminalEvent, TerminalSurface};
use crate::transport::TransportEvent;

/// Shown before a task is chosen.
pub const SELECT_TASK_NOTICE: &str = "Select a task to start your session.";

/// Shown when the allocation was drawn among several.
pub const RANDOM_DRAW_NOTICE: &str =
    "Multiple instances of this task are running. The allocation below was selected by random draw.";

/// Shown above the editable command line.
pub const CUSTOMIZE_NOTICE: &str = "Customize your command, then hit ‘return’ to run.";

/// Shown when editing is abandoned.
pub const CANCELLED_NOTICE: &str = "Session cancelled.";

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Coarse phase of a session, for callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Editing,
    Running,
}

enum Phase {
    Idle,
    Editing {
        target: ExecutionTarget,
        editor: CommandEditor,
    },
    Running,
}

/// Fixed part of the command line shown while editing.
pub fn prompt_prefix(target: &ExecutionTarget) -> String {
    format!(
        "$ nomad alloc exec -i -t -task {} {} ",
        shell_escape(&target.task),
        target.short_allocation_id()
    )
}

/// Names the job a session belongs to. Namespace and region appear only
/// when set.
pub fn session_header(job: &str, namespace: Option<&str>, region: Option<&str>) -> String {
    let mut parts = Vec::with_capacity(3);
    if let Some(region) = region {
        parts.push(format!("Region: {}", region));
    }
    if let Some(namespace) = namespace {
        parts.push(format!("Namespace: {}", namespace));
    }
    parts.push(format!("Job: {}", job));
    parts.join("  ")
}

enum Step {
    Transport(TransportEvent),
    Input(Option<TerminalEvent>),
}

/// One interactive exec session.
pub struct ExecSession {
    resolver: TargetResolver,
    store: Arc<dyn CommandStore>,
    default_command: String,
    initial_command: Option<String>,
    factory: SocketFactory,
    phase: Phase,
}

impl ExecSession {
    pub fn new(
        resolver: TargetResolver,
        store: Arc<dyn CommandStore>,
        factory: SocketFactory,
    ) -> Self {
        Self {
            resolver,
            store,
            default_command: DEFAULT_COMMAND.to_string(),
            initial_command: None,
            factory,
            phase: Phase::Idle,
        }
    }

    /// Command offered when the store holds none.
    pub fn with_default_command(mut self, command: impl Into<String>) -> Self {
        self.default_command = command.into();
        self
    }

    /// Command offered for the next selection only, ahead of the store.
    pub fn with_initial_command(mut self, command: impl Into<String>) -> Self {
        self.initial_command = Some(command.into());
        self
    }

    pub fn phase(&self) -> SessionPhase {
        match self.phase {
            Phase::Idle => SessionPhase::Idle,
            Phase::Editing { .. } => SessionPhase::Editing,
            Phase::Running => SessionPhase::Running,
        }
    }

    /// Command currently in the editor.
    pub fn pending_command(&self) -> Option<&str> {
        match &self.phase {
            Phase::Editing { editor, .. } => Some(editor.command()),
            _ => None,
        }
    }

    pub fn channel(&self) -> Option<&SessionChannel> {
        self.factory.live().map(|live| &live.channel)
    }

    pub fn sockets(&self) -> &SocketFactory {
        &self.factory
    }

    /// Writes the session header.
    pub fn show_intro(
        &self,
        job: &str,
        namespace: Option<&str>,
        region: Option<&str>,
        term: &mut dyn TerminalSurface,
    ) {
        term.write_line(&session_header(job, namespace, region));
    }

    /// Resolves `task` to one allocation and starts editing the command.
    ///
    /// Any live channel is torn down first.
    pub fn select_task(
        &mut self,
        allocations: &[Allocation],
        task_group: Option<&str>,
        task: &str,
        pinned: Option<&str>,
        term: &mut dyn TerminalSurface,
    ) -> Result<ExecutionTarget, SessionError> {
        let resolution = self
            .resolver
            .resolve(allocations, task_group, task, pinned)?;

        self.factory.teardown(term);

        let command = self
            .initial_command
            .take()
            .unwrap_or_else(|| self.store.get_or(&self.default_command));

        tracing::info!(session = %resolution.target, drawn = resolution.drawn, "Selected task");

        term.write(b"\r\n");
        if resolution.drawn {
            term.write_line(RANDOM_DRAW_NOTICE);
            term.write(b"\r\n");
        }
        term.write_line(CUSTOMIZE_NOTICE);
        term.write(b"\r\n");
        term.write(prompt_prefix(&resolution.target).as_bytes());
        term.write(command.as_bytes());

        self.phase = Phase::Editing {
            target: resolution.target.clone(),
            editor: CommandEditor::new(command),
        };
        Ok(resolution.target)
    }

    /// Handles one terminal event.
    ///
    /// While editing, input edits the command, return starts the channel
    /// and a cancel key ends the session. While running, input and resizes
    /// go to the channel.
    pub async fn handle_input(
        &mut self,
        event: TerminalEvent,
        term: &mut dyn TerminalSurface,
    ) -> Result<(), SessionError> {
        match &mut self.phase {
            Phase::Idle => Ok(()),
            Phase::Editing { target, editor } => {
                let TerminalEvent::Input(bytes) = event else {
                    return Ok(());
                };
                let outcome = editor.feed(&bytes);
                term.write(&outcome.echo);

                if outcome.cancelled {
                    tracing::info!(session = %target, "Session cancelled before running");
                    self.phase = Phase::Idle;
                    term.write(b"\r\n");
                    term.write_line(CANCELLED_NOTICE);
                    return Ok(());
                }

                match outcome.submitted {
                    Some(command) => {
                        let target = target.clone();
                        self.submit(target, command, outcome.trailing, term).await
                    }
                    None => Ok(()),
                }
            }
            Phase::Running => {
                let result = match self.factory.live_mut() {
                    Some(live) => live.channel.handle_input(event),
                    None => Ok(()),
                };
                self.settle(term);
                result.map_err(SessionError::from)
            }
        }
    }

    async fn submit(
        &mut self,
        target: ExecutionTarget,
        command: String,
        trailing: Vec<u8>,
        term: &mut dyn TerminalSurface,
    ) -> Result<(), SessionError> {
        if let Err(e) = self.store.set(&command) {
            tracing::warn!(error = %e, "Failed to persist command");
        }

        self.phase = Phase::Running;
        let live = match self.factory.connect(&target, &command, term).await {
            Ok(live) => live,
            Err(e) => {
                self.phase = Phase::Idle;
                return Err(e.into());
            }
        };
        if !trailing.is_empty() {
            live.channel.send_keystrokes(&trailing)?;
        }
        Ok(())
    }

    /// Drops a channel that has reached its closed state.
    fn settle(&mut self, term: &mut dyn TerminalSurface) {
        let closed = self
            .factory
            .live()
            .map_or(true, |live| live.channel.is_closed());
        if closed && matches!(self.phase, Phase::Running) {
            self.factory.teardown(term);
            self.phase = Phase::Idle;
        }
    }

    /// Feeds one transport event to the live channel.
    pub fn handle_transport_event(
        &mut self,
        event: TransportEvent,
        term: &mut dyn TerminalSurface,
    ) -> Result<(), SessionError> {
        let result = match self.factory.live_mut() {
            Some(live) => live.channel.handle_event(event, term),
            None => Ok(()),
        };
        self.settle(term);
        result.map_err(SessionError::from)
    }

    /// Handles every transport event that is already queued.
    ///
    /// Returns the error that ended the channel, if any.
    pub fn pump(&mut self, term: &mut dyn TerminalSurface) -> Result<(), SessionError> {
        loop {
            let event = match self.factory.live_mut() {
                Some(live) => match live.events.try_recv() {
                    Ok(event) => event,
                    Err(TryRecvError::Empty) => return Ok(()),
                    Err(TryRecvError::Disconnected) => TransportEvent::Closed { reason: None },
                },
                None => return Ok(()),
            };
            if let Err(e) = self.handle_transport_event(event, term) {
                if matches!(self.phase, Phase::Idle) {
                    return Err(e);
                }
                tracing::warn!(error = %e, "Dropped session event");
            }
        }
    }

    /// Runs the session until it goes idle or terminal input ends.
    ///
    /// Returns the error that ended the channel, if any. Events that fail
    /// while the channel stays up are logged and dropped.
    pub async fn run(
        &mut self,
        input: &mut mpsc::Receiver<TerminalEvent>,
        term: &mut dyn TerminalSurface,
    ) -> Result<(), SessionError> {
        while !matches!(self.phase, Phase::Idle) {
            let step = {
                let events = self.factory.live_mut().map(|live| &mut live.events);
                tokio::select! {
                    event = next_transport_event(events) => Step::Transport(event),
                    event = input.recv() => Step::Input(event),
                }
            };

            let result = match step {
                Step::Transport(event) => self.handle_transport_event(event, term),
                Step::Input(Some(event)) => self.handle_input(event, term).await,
                Step::Input(None) => {
                    tracing::debug!("Terminal input ended");
                    self.factory.teardown(term);
                    self.phase = Phase::Idle;
                    Ok(())
                }
            };

            if let Err(e) = result {
                if matches!(self.phase, Phase::Idle) {
                    return Err(e);
                }
                tracing::warn!(error = %e, "Dropped session event");
            }
        }
        Ok(())
    }
}

async fn next_transport_event(
    events: Option<&mut mpsc::Receiver<TransportEvent>>,
) -> TransportEvent {
    match events {
        Some(events) => events
            .recv()
            .await
            .unwrap_or(TransportEvent::Closed { reason: None }),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::MemoryCommandStore;
    use crate::target::{FirstPicker, TaskState};
    use crate::terminal::BufferTerminal;
    use crate::transport::MemoryDialer;
    use std::collections::BTreeMap;

    fn alloc(id: &str, group: &str, task: &str) -> Allocation {
        let mut states = BTreeMap::new();
        states.insert(
            task.to_string(),
            TaskState {
                state: "running".to_string(),
                finished_at: None,
            },
        );
        Allocation {
            id: id.to_string(),
            task_group: group.to_string(),
            client_status: "running".to_string(),
            task_states: Some(states),
        }
    }

    fn session(dialer: &MemoryDialer) -> ExecSession {
        ExecSession::new(
            TargetResolver::new(Arc::new(FirstPicker)),
            Arc::new(MemoryCommandStore::new()),
            SocketFactory::new(Arc::new(dialer.clone()), None),
        )
    }

    #[test]
    fn test_prompt_prefix_escapes_task() {
        let target = ExecutionTarget::new("g", "spaced name!", "a1b2c3d4-0000");
        assert_eq!(
            prompt_prefix(&target),
            "$ nomad alloc exec -i -t -task spaced\\ name\\! a1b2c3d4 "
        );
    }

    #[test]
    fn test_session_header() {
        assert_eq!(session_header("web", None, None), "Job: web");
        assert_eq!(
            session_header("web", Some("prod"), Some("region-2")),
            "Region: region-2  Namespace: prod  Job: web"
        );
    }

    #[test]
    fn test_intro_line() {
        let dialer = MemoryDialer::new();
        let session = session(&dialer);
        let mut term = BufferTerminal::default();

        session.show_intro("web", Some("prod"), None, &mut term);
        assert_eq!(term.non_empty_lines(), vec!["Namespace: prod  Job: web"]);
        assert_eq!(session.phase(), SessionPhase::Idle);
    }

    #[test]
    fn test_recalled_command_is_offered() {
        let dialer = MemoryDialer::new();
        let mut session = ExecSession::new(
            TargetResolver::new(Arc::new(FirstPicker)),
            Arc::new(MemoryCommandStore::with_command("/bin/sh -l")),
            SocketFactory::new(Arc::new(dialer.clone()), None),
        );
        let mut term = BufferTerminal::default();

        session
            .select_task(&[alloc("abc-1", "web", "web")], None, "web", None, &mut term)
            .unwrap();
        assert_eq!(session.pending_command(), Some("/bin/sh -l"));
    }

    #[test]
    fn test_select_task_shows_prompt() {
        let dialer = MemoryDialer::new();
        let mut session = session(&dialer);
        let mut term = BufferTerminal::default();

        let target = session
            .select_task(&[alloc("abc123-1", "web", "web")], None, "web", None, &mut term)
            .unwrap();

        assert_eq!(target.allocation_id, "abc123-1");
        assert_eq!(session.phase(), SessionPhase::Editing);
        assert_eq!(session.pending_command(), Some("/bin/bash"));
        assert_eq!(
            term.non_empty_lines(),
            vec![
                CUSTOMIZE_NOTICE,
                "$ nomad alloc exec -i -t -task web abc123 /bin/bash",
            ]
        );
        assert_eq!(dialer.dial_count(), 0);
    }

    #[test]
    fn test_select_task_reports_random_draw() {
        let dialer = MemoryDialer::new();
        let mut session = session(&dialer);
        let mut term = BufferTerminal::default();
        let allocs = [alloc("aaa-1", "web", "web"), alloc("bbb-2", "web", "web")];

        session
            .select_task(&allocs, None, "web", None, &mut term)
            .unwrap();

        assert_eq!(term.non_empty_lines()[0], RANDOM_DRAW_NOTICE);
    }

    #[test]
    fn test_select_unknown_task_keeps_phase() {
        let dialer = MemoryDialer::new();
        let mut session = session(&dialer);
        let mut term = BufferTerminal::default();

        let result = session.select_task(&[alloc("a-1", "web", "web")], None, "db", None, &mut term);

        assert!(matches!(
            result,
            Err(SessionError::Resolve(ResolveError::NoRunningInstances { .. }))
        ));
        assert_eq!(session.phase(), SessionPhase::Idle);
        assert!(term.output().is_empty());
    }

    #[test]
    fn test_initial_command_used_once() {
        let dialer = MemoryDialer::new();
        let mut session = session(&dialer).with_initial_command("/bin/zsh");
        let mut term = BufferTerminal::default();
        let allocs = [alloc("abc-1", "web", "web")];

        session
            .select_task(&allocs, None, "web", None, &mut term)
            .unwrap();
        assert_eq!(session.pending_command(), Some("/bin/zsh"));

        session
            .select_task(&allocs, None, "web", None, &mut term)
            .unwrap();
        assert_eq!(session.pending_command(), Some("/bin/bash"));
    }

    #[tokio::test]
    async fn test_resize_while_editing_is_ignored() {
        let dialer = MemoryDialer::new();
        let mut session = session(&dialer);
        let mut term = BufferTerminal::default();
        session
            .select_task(&[alloc("abc-1", "web", "web")], None, "web", None, &mut term)
            .unwrap();

        session
            .handle_input(
                TerminalEvent::Resize(exec_protocol::TtySize::new(100, 50)),
                &mut term,
            )
            .await
            .unwrap();

        assert_eq!(session.phase(), SessionPhase::Editing);
        assert_eq!(dialer.dial_count(), 0);
    }

    #[tokio::test]
    async fn test_run_returns_after_close() {
        let dialer = MemoryDialer::new();
        let mut session = session(&dialer);
        let mut term = BufferTerminal::default();
        session
            .select_task(&[alloc("abc-1", "web", "web")], None, "web", None, &mut term)
            .unwrap();
        session
            .handle_input(TerminalEvent::Input(b"\r".to_vec()), &mut term)
            .await
            .unwrap();

        let peer = dialer.last_peer().unwrap();
        peer.open();
        session.pump(&mut term).unwrap();
        peer.deliver(r#"{"stdout":{"data":"aGk="}}"#);
        peer.close();

        let (_input_tx, mut input_rx) = mpsc::channel(8);
        session.run(&mut input_rx, &mut term).await.unwrap();

        assert_eq!(session.phase(), SessionPhase::Idle);
        assert!(session.channel().is_none());
        assert_eq!(
            peer.sent(),
            vec![r#"{"tty_size":{"width":80,"height":24}}"#]
        );
    }

    #[tokio::test]
    async fn test_cancel_keys_end_editing() {
        for key in [0x03u8, 0x04, 0x1b] {
            let dialer = MemoryDialer::new();
            let mut session = session(&dialer);
            let mut term = BufferTerminal::default();
            session
                .select_task(&[alloc("abc-1", "web", "web")], None, "web", None, &mut term)
                .unwrap();

            let (input_tx, mut input_rx) = mpsc::channel(8);
            input_tx.send(TerminalEvent::Input(vec![key])).await.unwrap();

            tokio::time::timeout(
                std::time::Duration::from_millis(500),
                session.run(&mut input_rx, &mut term),
            )
            .await
            .expect("run should return after a cancel key")
            .unwrap();

            assert_eq!(session.phase(), SessionPhase::Idle);
            assert_eq!(dialer.dial_count(), 0);
            let lines = term.non_empty_lines();
            assert_eq!(lines.last().map(String::as_str), Some(CANCELLED_NOTICE));
            assert_eq!(lines.iter().filter(|l| *l == CANCELLED_NOTICE).count(), 1);
        }
    }

    #[tokio::test]
    async fn test_input_after_return_goes_to_command() {
        let dialer = MemoryDialer::new();
        let mut session = session(&dialer);
        let mut term = BufferTerminal::default();
        session
            .select_task(&[alloc("abc-1", "web", "web")], None, "web", None, &mut term)
            .unwrap();

        session
            .handle_input(TerminalEvent::Input(b"\rls\r".to_vec()), &mut term)
            .await
            .unwrap();
        assert_eq!(dialer.dials()[0].command, "/bin/bash");

        let peer = dialer.last_peer().unwrap();
        peer.open();
        session.pump(&mut term).unwrap();

        assert_eq!(
            peer.sent(),
            vec![
                r#"{"tty_size":{"width":80,"height":24}}"#,
                r#"{"stdin":{"data":"bHMN"}}"#,
            ]
        );
    }

    #[tokio::test]
    async fn test_run_ends_when_input_closes() {
        let dialer = MemoryDialer::new();
        let mut session = session(&dialer);
        let mut term = BufferTerminal::default();
        session
            .select_task(&[alloc("abc-1", "web", "web")], None, "web", None, &mut term)
            .unwrap();

        let (input_tx, mut input_rx) = mpsc::channel(8);
        input_tx
            .send(TerminalEvent::Input(b"\r".to_vec()))
            .await
            .unwrap();
        drop(input_tx);

        session.run(&mut input_rx, &mut term).await.unwrap();

        assert_eq!(session.phase(), SessionPhase::Idle);
        assert_eq!(dialer.dial_count(), 1);
        assert!(dialer.last_peer().unwrap().is_closed());
    }
}
