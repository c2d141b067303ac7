pub mod protocol;
pub mod cursor;
pub mod bitmask;
pub mod serialization;
pub mod registry;
pub mod world;
pub mod tracker;
pub mod server;
pub mod client;
pub mod transport;
pub mod error;
pub mod sync;
pub mod debug;

pub use protocol::{
    Entity, PlayerId, NumericId, WireEntity, ComponentId,
    Categories, Value, Primitive, PlayerFilter,
    Op, EntityRecord, Payload, PayloadKind, Channel, OutgoingPayload,
    REMOVAL_SENTINEL,
};

pub use cursor::Cursor;

pub use bitmask::BitMask;

pub use serialization::{
    Serdes, FnSerdes, FormatSerdes,
    BinarySerializer, BinaryFormat,
    PayloadWriter, encode_payload, decode_payload,
};

pub use registry::{
    ComponentDecl, ComponentInfo, Encoding, Registry, RegistryBuilder,
    create_shared_lookup,
};

pub use world::{
    EntityStore, MemoryWorld, MutationEvent,
};

pub use tracker::{
    ChangeTracker, EntityStorage, TrackInfo,
};

pub use server::{Outgoing, Server};

pub use client::Client;

pub use transport::{
    Envelope, Transport, MemoryTransport,
};

#[cfg(feature = "async")]
pub use transport::{AsyncTransport, ChannelTransport};

pub use error::{
    ReplicationError, Result,
};

pub use sync::{
    Replecs, ReplicationConfig, ReplicationCallback,
    ServerStats, ClientStats,
    create, create_server, create_client,
};

pub use debug::{
    init_debug_mode, is_debug_enabled, is_trace_enabled,
    log_payload, trace_collect, trace_apply,
    format_bytes, describe_component, PayloadSummary,
};
