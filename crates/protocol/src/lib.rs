//! # Exec Protocol
//!
//! Wire definitions for interactive exec sessions against a running
//! allocation.
//!
//! ## Overview
//!
//! An exec session is a single websocket carrying JSON text messages in both
//! directions. The client sends keystrokes and terminal dimensions; the
//! server sends process output:
//!
//! ```text
//! ┌────────────┐   tty_size, stdin   ┌────────────┐
//! │   client   │ ──────────────────▶ │   server   │
//! │  terminal  │ ◀────────────────── │  alloc/task│
//! └────────────┘       stdout        └────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use exec_protocol::Frame;
//!
//! let json = Frame::tty_size(80, 24).to_json().unwrap();
//! assert_eq!(json, r#"{"tty_size":{"width":80,"height":24}}"#);
//!
//! let output = Frame::decode_output(r#"{"stdout":{"data":"aGk="}}"#).unwrap();
//! assert_eq!(output, b"hi");
//! ```
//!
//! ## Modules
//!
//! - [`frames`]: Frame definitions and JSON/base64 codec
//! - [`error`]: Error types

pub mod error;
pub mod frames;

pub use error::{ProtocolError, Result};
pub use frames::{Frame, TtySize};
