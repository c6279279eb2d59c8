//! # alloc-exec
//!
//! Interactive terminal sessions inside running allocations.
//!
//! ## Overview
//!
//! A session resolves a task of a job to one running allocation, lets the
//! user confirm or edit the command to run, then opens a websocket to the
//! allocation's exec endpoint and bridges it to a terminal:
//!
//! ```text
//! ┌──────────────┐  keystrokes   ┌──────────────┐  stdin/tty_size  ┌────────────┐
//! │   terminal   │ ────────────▶ │ ExecSession  │ ───────────────▶ │ allocation │
//! │   surface    │ ◀──────────── │  + channel   │ ◀─────────────── │    task    │
//! └──────────────┘    output     └──────────────┘      stdout      └────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use exec_client::{
//!     ApiClient, Config, ExecSession, FileCommandStore, LocalTerminal, SocketFactory,
//!     TargetResolver, WebSocketDialer,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let api = ApiClient::new(config.api.clone())?;
//!     let allocations = api.job_allocations("example").await?;
//!
//!     let factory = SocketFactory::new(
//!         Arc::new(WebSocketDialer::new(config.api.clone())),
//!         config.exec.dial_timeout(),
//!     );
//!     let store = Arc::new(FileCommandStore::open(&config.exec.command_store)?);
//!     let mut session = ExecSession::new(TargetResolver::default(), store, factory);
//!
//!     let mut term = LocalTerminal::enter()?;
//!     let mut input = term.spawn_input();
//!     session.select_task(&allocations, None, "web", None, &mut term)?;
//!     session.run(&mut input, &mut term).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: TOML configuration
//! - [`api`]: cluster HTTP API client and exec endpoint URLs
//! - [`target`]: allocation listing and target resolution
//! - [`command`]: command store and command-line editor
//! - [`terminal`]: terminal surfaces
//! - [`transport`]: websocket and in-memory transports
//! - [`channel`]: the session channel state machine
//! - [`sockets`]: single live channel ownership
//! - [`session`]: the interactive session controller
//! - [`logging`]: log file setup

pub mod api;
pub mod channel;
pub mod command;
pub mod config;
pub mod logging;
pub mod session;
pub mod sockets;
pub mod target;
pub mod terminal;
pub mod transport;

pub use api::{ApiClient, ApiError};
pub use channel::{ChannelError, ChannelState, SessionChannel, CLOSED_NOTICE};
pub use command::{
    CommandEditor, CommandStore, FileCommandStore, MemoryCommandStore, StoreError,
    DEFAULT_COMMAND,
};
pub use config::{Config, ConfigError};
pub use session::{ExecSession, SessionError, SessionPhase};
pub use sockets::{LiveChannel, SocketFactory};
pub use target::{
    Allocation, AllocationPicker, ExecutionTarget, FirstPicker, RandomPicker, ResolveError,
    TargetResolver,
};
pub use terminal::{BufferTerminal, LocalTerminal, TerminalEvent, TerminalSurface};
pub use transport::{
    Dialer, MemoryDialer, MemoryPeer, Transport, TransportError, TransportEvent, WebSocketDialer,
};
