use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use crate::error::{Field, FieldEncodingError, FrameError};

const START_MARKER: &str = ">>";
const END_MARKER: &str = "<<";
const SEPARATOR: char = '|';
/// Joins vocabulary entries in `grammarSet` args.
pub(crate) const CHOICE_SEPARATOR: &str = ",";

/// Well-known values of the `type` field.
///
/// The type vocabulary is open; these are the tags the engine and the
/// sessions exchange today.
pub mod kind {
    pub const GRAMMAR_MATCH: &str = "grammarMatch";
    pub const GRAMMAR_SET: &str = "grammarSet";
    pub const DICTATION_RESULT: &str = "dictationResult";
    pub const START_DICTATION: &str = "startDictation";
    pub const SPEECH_SYNTH: &str = "speechSynth";
    pub const SYNTHESIS_DONE: &str = "synthesisDone";
    pub const SYNTHESIS_PAUSE: &str = "synthesisPause";
    pub const SYNTHESIS_RESUME: &str = "synthesisResume";
    pub const BREAK: &str = "break";
    pub const PLAY: &str = "play";
    pub const PLAY_ASYNC: &str = "playAsync";
    pub const PLAYER_DONE: &str = "playerDone";
    pub const PAUSE: &str = "pause";
    pub const UNPAUSE: &str = "unpause";
    pub const STOP: &str = "stop";
    pub const BACK: &str = "back";
    pub const SKIP: &str = "skip";
    pub const SEEK: &str = "seek";
    pub const VOLUME: &str = "volume";
    pub const RECORD: &str = "record";
    pub const RECORD_DONE: &str = "recordDone";
    pub const CREATE: &str = "create";
    pub const DELETE: &str = "delete";
    pub const CLEAR_INSTANCE: &str = "clearInstance";

    /// Generated locally to release a blocked read during shutdown.
    /// Never sent by the engine.
    pub const WAKEUP: &str = "wakeup";

    /// Types that satisfy any correlated read, because their owner was
    /// decided by routing rather than by message id.
    pub fn is_routed(kind: &str) -> bool {
        kind == GRAMMAR_MATCH || kind == DICTATION_RESULT
    }
}

macro_rules! sequential_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse().map(Self)
            }
        }
    };
}

sequential_id! {
    /// Identifies one registered session. Allocated from 1 upwards, never reused.
    InstanceId
}

sequential_id! {
    /// Correlates a request with its asynchronous reply.
    MessageId
}

/// One routed unit of traffic.
///
/// Fields are kept as the strings that travel on the wire; the engine may
/// echo identifiers the router did not allocate, so parsing them into
/// typed ids happens on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub instance_id: String,
    pub kind: String,
    pub message_id: String,
    pub args: String,
}

impl Message {
    pub fn new(
        instance_id: InstanceId,
        kind: impl Into<String>,
        message_id: MessageId,
        args: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            kind: kind.into(),
            message_id: message_id.to_string(),
            args: args.into(),
        }
    }

    /// The addressed instance, if the field holds a valid identifier.
    pub fn instance(&self) -> Option<InstanceId> {
        self.instance_id.parse().ok()
    }

    pub fn id(&self) -> Option<MessageId> {
        self.message_id.parse().ok()
    }

    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind == kind
    }

    /// Whether this message satisfies a read correlated on `message_id`.
    ///
    /// Routed kinds and the shutdown wakeup answer every correlation.
    pub fn answers(&self, message_id: MessageId) -> bool {
        kind::is_routed(&self.kind) || self.kind == kind::WAKEUP || self.id() == Some(message_id)
    }

    /// Check every field against the framing rules.
    pub fn validate(&self) -> Result<(), FieldEncodingError> {
        for (field, value) in self.fields() {
            validate_field(field, value)?;
        }
        Ok(())
    }

    /// Render the frame payload: `>>instance|type|id|args<<`.
    pub fn encode(&self) -> Result<String, FieldEncodingError> {
        self.validate()?;
        Ok(format!(
            "{START_MARKER}{}{SEPARATOR}{}{SEPARATOR}{}{SEPARATOR}{}{END_MARKER}",
            self.instance_id, self.kind, self.message_id, self.args
        ))
    }

    /// Parse a frame payload.
    pub fn decode(raw: &str) -> Result<Self, FrameError> {
        if !raw.is_ascii() {
            return Err(FrameError::NonAscii);
        }

        let body = raw
            .strip_prefix(START_MARKER)
            .ok_or_else(|| FrameError::MissingStartMarker(raw.to_owned()))?;
        let body = body
            .strip_suffix(END_MARKER)
            .ok_or_else(|| FrameError::MissingEndMarker(raw.to_owned()))?;

        let parts: Vec<&str> = body.split(SEPARATOR).collect();
        let [instance_id, kind, message_id, args] = parts[..] else {
            return Err(FrameError::FieldCount {
                found: parts.len(),
                raw: raw.to_owned(),
            });
        };

        Ok(Self {
            instance_id: instance_id.to_owned(),
            kind: kind.to_owned(),
            message_id: message_id.to_owned(),
            args: args.to_owned(),
        })
    }

    /// Parse raw frame bytes as read off the transport.
    pub fn decode_bytes(raw: &[u8]) -> Result<Self, FrameError> {
        let raw = std::str::from_utf8(raw).map_err(|_| FrameError::NonAscii)?;
        Self::decode(raw)
    }

    fn fields(&self) -> [(Field, &str); 4] {
        [
            (Field::InstanceId, self.instance_id.as_str()),
            (Field::Type, self.kind.as_str()),
            (Field::MessageId, self.message_id.as_str()),
            (Field::Args, self.args.as_str()),
        ]
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}#{}({})",
            self.instance_id, self.kind, self.message_id, self.args
        )
    }
}

/// Check that `value` can travel in `field` of a frame.
pub fn validate_field(field: Field, value: &str) -> Result<(), FieldEncodingError> {
    if !value.is_ascii() {
        return Err(FieldEncodingError::NonAscii(field));
    }
    if value.contains(SEPARATOR) {
        return Err(FieldEncodingError::Separator(field));
    }
    if value.contains(START_MARKER) || value.contains(END_MARKER) {
        return Err(FieldEncodingError::Marker(field));
    }
    Ok(())
}

/// Check that every vocabulary entry survives a `grammarSet` announcement,
/// whose args are the entries joined with `,`.
pub fn validate_choices<S: AsRef<str>>(choices: &[S]) -> Result<(), FieldEncodingError> {
    for choice in choices {
        let choice = choice.as_ref();
        validate_field(Field::Args, choice)?;
        if choice.contains(CHOICE_SEPARATOR) {
            return Err(FieldEncodingError::ChoiceSeparator(choice.to_owned()));
        }
    }
    Ok(())
}
