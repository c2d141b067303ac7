use crate::protocol::{NumericId, WireEntity};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error("Unexpected end of buffer: needed {needed} bytes at offset {offset}, buffer holds {len}")]
    UnexpectedEof { offset: usize, needed: usize, len: usize },

    #[error("Malformed VLQ at offset {offset}")]
    MalformedVlq { offset: usize },

    #[error("Unknown component numeric id: {0}")]
    UnknownComponent(NumericId),

    #[error("Unknown wire entity: {0}")]
    UnknownEntity(WireEntity),

    #[error("Unknown variant index: {0}")]
    UnknownVariant(usize),

    #[error("Unknown component name: {0}")]
    UnknownName(String),

    #[error("Component {0} carries a value but has no serdes or fixed encoding")]
    MissingSerdes(String),

    #[error("Byte span mismatch for {component}: expected {expected}, got {actual}")]
    SpanMismatch { component: String, expected: usize, actual: usize },

    #[error("Value of {component} does not match its encoding (expected {expected})")]
    ValueMismatch { component: String, expected: String },

    #[error("Bitmask capacity mismatch: {left} vs {right}")]
    CapacityMismatch { left: usize, right: usize },

    #[error("Component registered twice: {0}")]
    DuplicateComponent(String),

    #[error("Invalid component declaration: {0}")]
    InvalidDeclaration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MessagePack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    #[error("MessagePack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Connection closed")]
    ConnectionClosed,
}

impl ReplicationError {
    /// True for failures that come from reading a malformed payload.
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            ReplicationError::UnexpectedEof { .. }
                | ReplicationError::MalformedVlq { .. }
                | ReplicationError::UnknownComponent(_)
                | ReplicationError::UnknownVariant(_)
                | ReplicationError::Deserialization(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ReplicationError>;
