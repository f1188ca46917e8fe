use thiserror::Error;

use crate::{
    protocol::{Failure, FailureKind, Handle, MessageId, ValueKind},
    session::SessionState,
    shelter::ShelterId,
};

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Failure of the bridge itself, as opposed to the code it runs.
///
/// Any of these observed by the host pump moves the session to
/// [`SessionState::Failed`]; the session refuses further requests.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("a sync request ({pending}) is already outstanding")]
    RequestOutstanding { pending: MessageId },

    #[error("frame of {len} bytes exceeds the shared region capacity of {capacity} bytes")]
    PayloadTooLarge { len: usize, capacity: usize },

    #[error("channel desync: expected reply to {expected:?}, got {actual}")]
    Desync {
        expected: Option<MessageId>,
        actual: MessageId,
    },

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u16, actual: u16 },

    #[error("channel closed")]
    Closed,

    #[error("sandbox exited: {0}")]
    SandboxExited(String),
}

#[derive(Error, Debug)]
pub enum Error {
    /// The interpreter reported a condition. The session stays usable.
    #[error("evaluation error: {message}")]
    Evaluation { message: String },

    /// The evaluation observed an interrupt request.
    #[error("evaluation interrupted")]
    Interrupted,

    /// The bridge failed. Fatal to the session.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A proxy was used after its shelter membership ended.
    #[error("proxy for handle {handle} is no longer sheltered")]
    Lifetime { handle: Handle },

    #[error("shelter {0} does not exist")]
    UnknownShelter(ShelterId),

    #[error("expected a {expected} value, found {found}")]
    KindMismatch {
        expected: ValueKind,
        found: ValueKind,
    },

    #[error("operation not valid while session is {state}")]
    State { state: SessionState },

    #[error("value conversion failed: {0}")]
    Codec(#[from] crate::value::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Whether the error means the session itself is no longer usable.
    ///
    /// An oversized payload is rejected before it reaches the region, so it
    /// only fails the request that carried it.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(e) if !matches!(e, TransportError::PayloadTooLarge { .. }))
    }
}

impl From<Failure> for Error {
    fn from(value: Failure) -> Self {
        let Failure { kind, message } = value;
        match kind {
            FailureKind::Evaluation => Self::Evaluation { message },
            FailureKind::Interrupted => Self::Interrupted,
            FailureKind::UnknownHandle { handle } => Self::Lifetime { handle },
            FailureKind::Internal => Self::Transport(TransportError::Malformed(message)),
        }
    }
}
