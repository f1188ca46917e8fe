//! Wire protocol shared by the sync and async channels.
//!
//! Every frame is an [`Envelope`] around one of four body enums, chosen by
//! direction and channel:
//!
//! | body        | direction       | channel |
//! |-------------|-----------------|---------|
//! | [`Message`] | sandbox → host  | async   |
//! | [`Command`] | host → sandbox  | async, delivered through a `read` sync reply |
//! | [`Request`] | sandbox → host  | sync    |
//! | [`Reply`]   | host → sandbox  | sync    |
//!
//! Bodies are adjacently tagged, so each serializes as `{ "type", "data" }`.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{error::TransportError, value::Value};

pub const PROTOCOL_VERSION: u16 = 1;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            #[must_use]
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            #[must_use]
            pub const fn raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Correlates a request with its response. Unique within a session.
    MessageId
);
id_type!(
    /// Opaque identifier of a value living in sandbox memory.
    ///
    /// Allocated by the sandbox and never reused within a session.
    Handle
);
id_type!(
    /// Scope of one output capture.
    CaptureId
);

/// Id source for one side of the bridge.
///
/// Each side owns its allocator. Host ids are odd and sandbox ids even, so
/// ids stay unique within a session without either side reading the other's
/// counter.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    #[must_use]
    pub const fn host() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub const fn sandbox() -> Self {
        Self {
            next: AtomicU64::new(2),
        }
    }

    fn next(&self) -> u64 {
        self.next.fetch_add(2, Ordering::Relaxed)
    }

    pub fn message(&self) -> MessageId {
        MessageId(self.next())
    }

    pub fn capture(&self) -> CaptureId {
        CaptureId(self.next())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub version: u16,
    pub id: MessageId,
    /// Capture scope active in the sandbox when the frame was produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture: Option<CaptureId>,
    pub body: T,
}

impl<T> Envelope<T> {
    pub const fn new(id: MessageId, body: T) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            id,
            capture: None,
            body,
        }
    }

    #[must_use]
    pub const fn with_capture(mut self, capture: Option<CaptureId>) -> Self {
        self.capture = capture;
        self
    }
}

/// Closed set of interpreter value kinds a [`Proxy`](crate::Proxy) can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Null,
    Logical,
    Integer,
    Double,
    Complex,
    Character,
    List,
    Function,
    Environment,
    Symbol,
    Other,
}

impl ValueKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Logical => "logical",
            Self::Integer => "integer",
            Self::Double => "double",
            Self::Complex => "complex",
            Self::Character => "character",
            Self::List => "list",
            Self::Function => "function",
            Self::Environment => "environment",
            Self::Symbol => "symbol",
            Self::Other => "other",
        }
    }

    /// Atomic vectors: logical, integer, double, complex, character.
    #[must_use]
    pub const fn is_atomic(self) -> bool {
        matches!(
            self,
            Self::Logical | Self::Integer | Self::Double | Self::Complex | Self::Character
        )
    }

    #[must_use]
    pub const fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::Double)
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// One line written by the interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub stream: Stream,
    pub line: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    Png,
    /// Binary portable pixmap (`P6`).
    Ppm,
    /// Raw 8-bit RGBA, row-major, `width * height * 4` bytes.
    Rgba8,
}

/// Bitmap produced by the interpreter's graphics device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageStatus {
    Downloading,
    Installing,
    Installed,
    Failed,
}

/// Sandbox → host notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Message {
    Output(OutputRecord),
    /// The interpreter is about to wait for a line of input.
    Prompt {
        text: String,
    },
    Canvas(Image),
    PackageProgress {
        package: String,
        status: PackageStatus,
    },
    /// Completion of the command whose id is `to`.
    Response {
        to: MessageId,
        outcome: Outcome,
    },
    /// The sandbox worker has exited; nothing follows on this channel.
    Closed {
        reason: Option<String>,
    },
}

impl Message {
    /// Wire name of the variant.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Output(_) => "output",
            Self::Prompt { .. } => "prompt",
            Self::Canvas(_) => "canvas",
            Self::PackageProgress { .. } => "package_progress",
            Self::Response { .. } => "response",
            Self::Closed { .. } => "closed",
        }
    }

    #[must_use]
    pub const fn as_output(&self) -> Option<&OutputRecord> {
        match self {
            Self::Output(record) => Some(record),
            _ => None,
        }
    }
}

/// Argument value: either copied across as wire data or referring to a value
/// already held in the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ArgValue {
    Value(Value),
    Handle(Handle),
}

impl From<Value> for ArgValue {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

/// Function argument passed with a `call` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Arg {
    Positional(ArgValue),
    Named(String, ArgValue),
}

impl Arg {
    pub fn value(value: impl Into<ArgValue>) -> Self {
        Self::Positional(value.into())
    }

    pub fn named(name: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        Self::Named(name.into(), value.into())
    }
}

/// Name bound in the evaluation environment before the code runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub name: String,
    pub value: ArgValue,
}

/// What the sandbox sends back for a successful evaluation or call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultMode {
    /// Retain the result and return its handle.
    Handle,
    /// Drop the result.
    Discard,
    /// Return the result converted to a wire value.
    Value,
    /// Return the interpreter's textual rendering of the result.
    Text,
}

/// Host → sandbox command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Command {
    Eval {
        code: String,
        env: Vec<Binding>,
        result: ResultMode,
    },
    Call {
        function: Handle,
        args: Vec<Arg>,
        result: ResultMode,
    },
    /// Bind a value in the interpreter's global environment.
    Bind {
        name: String,
        value: ArgValue,
    },
    /// Convert a retained value; `result` must be `Value` or `Text`.
    Convert {
        handle: Handle,
        result: ResultMode,
    },
    /// One line of console input.
    Stdin {
        line: String,
    },
    /// Handles whose host-side membership dropped to zero.
    Release {
        handles: Vec<Handle>,
    },
    /// Probe whether a handle is still retained by the sandbox.
    Retained {
        handle: Handle,
    },
    InstallPackages {
        names: Vec<String>,
        quiet: bool,
    },
    /// Enter console mode: prompt for and evaluate stdin lines.
    StartRepl,
    Ping,
    Shutdown,
}

impl Command {
    /// Commands answered with a [`Message::Response`].
    #[must_use]
    pub const fn expects_response(&self) -> bool {
        !matches!(
            self,
            Self::Release { .. } | Self::StartRepl | Self::Shutdown
        )
    }
}

/// Sandbox → host blocking request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Request {
    /// Wait for the next queued command. `input` marks a wait for a console
    /// line, which an interrupt may cut short.
    Read { input: bool },
    HostCall { call_type: String, payload: Value },
}

/// Host → sandbox answer to a [`Request`]. Always echoes the request id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Reply {
    Command(Envelope<Command>),
    HostCall(Value),
    Interrupt,
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Completion {
    Handle { handle: Handle, kind: ValueKind },
    Value(Value),
    Text(String),
    Flag(bool),
    Unit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The interpreter signalled a condition.
    Evaluation,
    Interrupted,
    /// A command named a handle the sandbox no longer holds.
    UnknownHandle { handle: Handle },
    /// Sandbox-side bookkeeping failed. Fatal to the session.
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum Outcome {
    Success(Completion),
    Failure(Failure),
}

impl Outcome {
    pub fn into_result(self) -> Result<Completion, Failure> {
        match self {
            Self::Success(completion) => Ok(completion),
            Self::Failure(failure) => Err(failure),
        }
    }
}

impl Completion {
    /// Reject a completion of the wrong shape.
    ///
    /// # Errors
    /// Returns [`TransportError::Malformed`] describing what arrived.
    pub fn unexpected<T>(self, wanted: &str) -> Result<T, TransportError> {
        Err(TransportError::Malformed(format!(
            "expected {wanted} completion, got {self:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_message_has_documented_shape() {
        let message = Message::Output(OutputRecord {
            stream: Stream::Stdout,
            line: "[1] 2".to_string(),
        });
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "output", "data": {"stream": "stdout", "line": "[1] 2"}})
        );
    }

    #[test]
    fn canvas_message_carries_dimensions_and_bytes() {
        let message = Message::Canvas(Image {
            width: 2,
            height: 1,
            format: ImageFormat::Ppm,
            bytes: Bytes::from_static(b"P6\n2 1\n255\n\0\0\0\0\0\0"),
        });
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "canvas");
        assert_eq!(json["data"]["width"], 2);
        assert_eq!(json["data"]["height"], 1);
        assert_eq!(json["data"]["format"], "ppm");
    }

    #[test]
    fn ids_are_unique_across_kinds() {
        let ids = IdAllocator::host();
        let a = ids.message();
        let b = ids.capture();
        let c = ids.message();
        assert_ne!(a.raw(), b.raw());
        assert!(c > a);
    }

    #[test]
    fn host_and_sandbox_ids_never_collide() {
        let host = IdAllocator::host();
        let sandbox = IdAllocator::sandbox();
        let host_ids: Vec<_> = (0..4).map(|_| host.message().raw()).collect();
        let sandbox_ids: Vec<_> = (0..4).map(|_| sandbox.message().raw()).collect();
        assert_eq!(host_ids, [1, 3, 5, 7]);
        assert_eq!(sandbox_ids, [2, 4, 6, 8]);
    }

    #[test]
    fn only_fire_and_forget_commands_skip_responses() {
        assert!(Command::Ping.expects_response());
        assert!(Command::Stdin { line: "1".into() }.expects_response());
        assert!(!Command::Release { handles: vec![] }.expects_response());
        assert!(!Command::Shutdown.expects_response());
    }

    #[test]
    fn reply_nests_command_envelope() {
        let command = Envelope::new(MessageId::new(3), Command::Ping);
        let reply = Envelope::new(MessageId::new(2), Reply::Command(command.clone()));
        let frame = crate::cbor::encode_frame(&reply).unwrap();
        let decoded: Envelope<Reply> = crate::cbor::decode_frame(&frame).unwrap();
        assert_eq!(decoded.id, MessageId::new(2));
        assert_eq!(decoded.body, Reply::Command(command));
    }
}
