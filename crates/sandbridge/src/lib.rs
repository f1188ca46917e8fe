//! Host–sandbox bridge for a single-threaded, blocking interpreter.
//!
//! The interpreter runs on its own worker thread and talks to the host over
//! two channels:
//!
//! - a synchronous channel built on a fixed-size [`region::SharedRegion`],
//!   used when the interpreter must block for an answer (next command, input
//!   line, host call);
//! - an asynchronous [`queue::AsyncChannel`] per direction for notifications
//!   (output lines, prompts, images, responses) and queued commands.
//!
//! Host code drives everything through [`Session`]: evaluation results come
//! back as [`Proxy`] values whose sandbox-side lifetime is governed by the
//! [`Shelter`] they belong to. [`Console`] layers an interactive REPL on top.

pub mod cbor;
pub mod config;
pub mod console;
pub mod error;
pub mod host;
pub mod protocol;
pub mod queue;
pub mod region;
pub mod sandbox;
pub mod session;
pub mod shelter;
pub mod value;

pub const TRACE_TARGET_BRIDGE: &str = "sandbridge::bridge";
pub const TRACE_TARGET_CONSOLE: &str = "sandbridge::console";

pub use config::SessionConfig;
pub use console::{Console, ConsoleCallbacks, ConsoleState};
pub use error::{Error, Result, TransportError};
pub use host::{BoxError, Host, NoopHost};
pub use protocol::{
    Arg, ArgValue, CaptureId, Handle, Image, ImageFormat, Message, MessageId, OutputRecord,
    PackageStatus, Stream, ValueKind,
};
pub use sandbox::{Argument, Condition, Interpreter, Io};
pub use session::{
    Captured, EvalOptions, MessageStream, OutputMode, Session, SessionBuilder, SessionState,
    SubscriptionId,
};
pub use shelter::{Proxy, Shelter, ShelterId};
pub use value::Value;
