use ahash::AHashMap;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Entity handle as issued by the entity store.
pub type Entity = u64;
pub type PlayerId = u64;
/// Dense wire id standing in for a [`ComponentId`].
pub type NumericId = u32;
/// Server-assigned wire id of a replicated entity.
pub type WireEntity = u32;

/// Allow-list of players. A player sees the guarded item iff it maps to `true`.
pub type PlayerFilter = AHashMap<PlayerId, bool>;

/// Numeric id reserved on the wire to introduce removals.
pub const REMOVAL_SENTINEL: NumericId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentId(pub(crate) u32);

impl ComponentId {
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub fn filter_allows(filter: Option<&PlayerFilter>, player: PlayerId) -> bool {
    match filter {
        None => true,
        Some(filter) => filter.get(&player).copied().unwrap_or(false),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Categories(u8);

impl Categories {
    pub const NONE: Categories = Categories(0);
    pub const NETWORKED: Categories = Categories(1);
    pub const RELIABLE: Categories = Categories(1 << 1);
    pub const UNRELIABLE: Categories = Categories(1 << 2);
    pub const PAIR: Categories = Categories(1 << 3);

    pub fn contains(self, other: Categories) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn union(self, other: Categories) -> Categories {
        Categories(self.0 | other.0)
    }

    /// Value changes travel on the unreliable channel.
    pub fn is_unreliable(self) -> bool {
        self.contains(Categories::UNRELIABLE)
    }

    pub fn is_pair(self) -> bool {
        self.contains(Categories::PAIR)
    }
}

impl std::ops::BitOr for Categories {
    type Output = Categories;

    fn bitor(self, rhs: Categories) -> Categories {
        self.union(rhs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    I8(i8),
    I16(i16),
    I32(i32),
    F32(f32),
    F64(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::U8(_) => "u8",
            Value::U16(_) => "u16",
            Value::U32(_) => "u32",
            Value::I8(_) => "i8",
            Value::I16(_) => "i16",
            Value::I32(_) => "i32",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
        }
    }
}

/// Fixed-width value kinds that are written straight into the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Primitive {
    Bool = 0,
    U8 = 1,
    U16 = 2,
    U24 = 3,
    U32 = 4,
    I8 = 5,
    I16 = 6,
    I32 = 7,
    F32 = 8,
    F64 = 9,
}

impl Primitive {
    pub fn span(self) -> usize {
        match self {
            Primitive::Bool | Primitive::U8 | Primitive::I8 => 1,
            Primitive::U16 | Primitive::I16 => 2,
            Primitive::U24 => 3,
            Primitive::U32 | Primitive::I32 | Primitive::F32 => 4,
            Primitive::F64 => 8,
        }
    }

    pub fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (Primitive::Bool, Value::Bool(_)) => true,
            (Primitive::U8, Value::U8(_)) => true,
            (Primitive::U16, Value::U16(_)) => true,
            (Primitive::U24, Value::U32(v)) => *v <= 0xFF_FFFF,
            (Primitive::U32, Value::U32(_)) => true,
            (Primitive::I8, Value::I8(_)) => true,
            (Primitive::I16, Value::I16(_)) => true,
            (Primitive::I32, Value::I32(_)) => true,
            (Primitive::F32, Value::F32(_)) => true,
            (Primitive::F64, Value::F64(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Primitive::Bool => "bool",
            Primitive::U8 => "u8",
            Primitive::U16 => "u16",
            Primitive::U24 => "u24",
            Primitive::U32 => "u32",
            Primitive::I8 => "i8",
            Primitive::I16 => "i16",
            Primitive::I32 => "i32",
            Primitive::F32 => "f32",
            Primitive::F64 => "f64",
        };
        f.write_str(name)
    }
}

/// One change carried by an entity record.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Set { component: ComponentId, value: Value },
    Add { component: ComponentId },
    Remove { component: ComponentId },
    AddPair { relation: ComponentId, target: WireEntity },
    RemovePair { relation: ComponentId, target: WireEntity },
    Destroy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub entity: WireEntity,
    pub ops: Vec<Op>,
}

impl EntityRecord {
    pub fn new(entity: WireEntity) -> Self {
        Self { entity, ops: Vec::new() }
    }

    pub fn destroy(entity: WireEntity) -> Self {
        Self { entity, ops: vec![Op::Destroy] }
    }

    pub fn is_destroy(&self) -> bool {
        self.ops.iter().any(|op| matches!(op, Op::Destroy))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PayloadKind {
    Full = 0,
    Updates = 1,
    Unreliable = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Reliable,
    Unreliable,
}

impl PayloadKind {
    pub fn channel(self) -> Channel {
        match self {
            PayloadKind::Full | PayloadKind::Updates => Channel::Reliable,
            PayloadKind::Unreliable => Channel::Unreliable,
        }
    }
}

/// Encoded wire bytes plus the side list of values the buffer references by index.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Payload {
    pub bytes: Bytes,
    pub variants: Vec<Value>,
}

impl Payload {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A payload addressed to one ready player.
#[derive(Debug, Clone)]
pub struct OutgoingPayload {
    pub player: PlayerId,
    pub kind: PayloadKind,
    pub payload: Payload,
}
