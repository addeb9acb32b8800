use thiserror::Error;

use crate::message::InstanceId;

/// Errors raised while decoding a frame payload into a `Message`.
///
/// These are per-frame faults: the ingestion loop logs them and moves on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum FrameError {
    #[error("frame does not begin with '>>': {0:?}")]
    MissingStartMarker(String),

    #[error("frame does not end with '<<': {0:?}")]
    MissingEndMarker(String),

    /// The payload between the markers did not split into exactly four fields.
    #[error("expected 4 '|'-separated fields, found {found}: {raw:?}")]
    FieldCount { found: usize, raw: String },

    #[error("frame payload is not ASCII")]
    NonAscii,
}

/// The field of a `Message` that failed validation at the send boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    InstanceId,
    Type,
    MessageId,
    Args,
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Field::InstanceId => "instance_id",
            Field::Type => "type",
            Field::MessageId => "message_id",
            Field::Args => "args",
        };
        f.write_str(name)
    }
}

/// A caller tried to send a field the framing cannot carry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum FieldEncodingError {
    #[error("field '{0}' contains the '|' separator")]
    Separator(Field),

    #[error("field '{0}' contains a '>>' or '<<' frame marker")]
    Marker(Field),

    #[error("field '{0}' is not ASCII")]
    NonAscii(Field),

    /// A vocabulary entry would be split apart when the list is announced.
    #[error("choice {0:?} contains the ',' list separator")]
    ChoiceSeparator(String),
}

/// No destination instance could be determined for an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum RouteError {
    /// A grammar match whose text is in no registered session's vocabulary.
    #[error("no session vocabulary contains {text:?}")]
    NoMatch { text: String },

    /// A dictation result arrived while no session was foregrounded.
    #[error("dictation result with no active session")]
    NoActiveSession,

    /// The message addressed an instance the registry does not know.
    #[error("unknown instance '{0}'")]
    UnknownInstance(String),
}

/// Faults in the underlying byte stream. These end the ingestion loop.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("transport I/O error")]
    Io(#[from] std::io::Error),

    #[error("transport closed by peer")]
    Closed,

    /// Validated before allocating the payload buffer.
    #[error("frame length {len} exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },
}

/// Errors surfaced by the router's session-facing API.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RouterError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    FieldEncoding(#[from] FieldEncodingError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("instance '{0}' is not registered")]
    UnknownInstance(InstanceId),

    /// A session operation was attempted before `start()` or after `cleanup()`.
    #[error("session '{0}' is not initialized")]
    NotInitialized(String),

    #[error("no app registered as '{0}'")]
    UnknownApp(String),
}
