//! matbridge: drive a MATLAB or Octave engine from Rust.
//!
//! The engine runs as a subprocess with a small server loop; this crate
//! launches it, keeps the connection open and marshals calls across:
//!
//! - `session` - engine lifecycle and every request type
//! - `binding` - engine functions as local callables, call arguments
//! - `proxy` - handles to variables left in the engine workspace
//! - `codec` - values and their wire encoding (base64 arrays, complex, sparse)
//! - `protocol` - request/response messages
//! - `ipc` - ZeroMQ request/reply transport to the engine
//! - `engine` - the engine subprocess
//! - `config` - session configuration and environment overrides
//!
//! # Example
//!
//! ```ignore
//! use matbridge::{Args, Session, SessionConfig};
//!
//! let session = Session::new(SessionConfig::octave().apply_env()?);
//! session.start().await?;
//!
//! let reply = session.run_func("abs", Args::new().arg(-5.0)).await?;
//! assert_eq!(reply.result.as_f64(), Some(5.0));
//!
//! let svd = session.resolve("svd").await?;
//! let usv = svd.call(Args::new().arg(matrix).nargout(3)).await?;
//!
//! session.stop().await?;
//! ```

pub mod binding;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod protocol;
pub mod proxy;
pub mod session;

pub use binding::{Args, BoundFunction};
pub use codec::{Complex, ComplexNdArray, NdArray, SparseMatrix, Value};
pub use config::{Address, EngineKind, SessionConfig};
pub use error::{BridgeError, Result};
pub use protocol::Reply;
pub use proxy::RemoteVar;
pub use session::{Connector, EngineConnector, Link, Session, SessionPhase};
