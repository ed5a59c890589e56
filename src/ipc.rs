//! Connection to the engine-side server.
//!
//! The engine runs a small server loop behind a ZeroMQ REP socket and answers
//! one JSON request at a time. This module owns the byte-level side of that
//! conversation:
//!
//! ```text
//! ┌──────────────────┐     ipc:// or tcp:// (REQ/REP)    ┌─────────────────────┐
//! │     Session      │  ◄──────────────────────────────► │  matlabserver loop  │
//! │ (SocketTransport)│      one JSON document per frame  │  (MATLAB / Octave)  │
//! └──────────────────┘                                   └─────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use matbridge::config::Address;
//! use matbridge::ipc::{SocketTransport, Transport};
//!
//! let mut transport = SocketTransport::new(Address::parse("tcp://127.0.0.1:4000")?);
//! let reply = transport.exchange(r#"{"cmd":"connect"}"#).await?;
//! ```

mod transport;

pub use transport::{SocketTransport, Transport, TransportError, MAX_MESSAGE_SIZE};
