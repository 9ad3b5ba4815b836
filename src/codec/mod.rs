//! Serialization codec between typed values and the persisted
//! property-list representation.

pub mod event_codec;
pub mod serializable;
pub mod value;

pub use event_codec::{decode, encode, SCHEMA_VERSION};
pub use serializable::{EventSequence, PropertyListSerializable};
pub use value::{PlistValue, Record};

/// Errors for records that must not be silently dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    UnknownEventType(String),
    UnsupportedVersion(i64),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::UnknownEventType(tag) => write!(f, "Unknown event type: {tag}"),
            CodecError::UnsupportedVersion(v) => {
                write!(f, "Unsupported event schema version: {v} (expected {SCHEMA_VERSION})")
            }
        }
    }
}

impl std::error::Error for CodecError {}
