use crate::cursor::Cursor;
use crate::error::{ReplicationError, Result};
use crate::protocol::*;
use crate::registry::{ComponentInfo, Encoding, Registry};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Converts component values that have no fixed-width encoding to and from bytes.
pub trait Serdes: Send + Sync {
    fn serialize(&self, value: &Value) -> Result<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> Result<Value>;
}

type SerializeFn = Arc<dyn Fn(&Value) -> Result<Vec<u8>> + Send + Sync>;
type DeserializeFn = Arc<dyn Fn(&[u8]) -> Result<Value> + Send + Sync>;

/// Serdes built from a pair of closures.
#[derive(Clone)]
pub struct FnSerdes {
    serialize: SerializeFn,
    deserialize: DeserializeFn,
}

impl FnSerdes {
    pub fn new<S, D>(serialize: S, deserialize: D) -> Self
    where
        S: Fn(&Value) -> Result<Vec<u8>> + Send + Sync + 'static,
        D: Fn(&[u8]) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            serialize: Arc::new(serialize),
            deserialize: Arc::new(deserialize),
        }
    }
}

impl Serdes for FnSerdes {
    fn serialize(&self, value: &Value) -> Result<Vec<u8>> {
        (self.serialize)(value)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value> {
        (self.deserialize)(bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryFormat {
    Json,
    MessagePack,
    Bincode,
}

pub struct BinarySerializer {
    format: BinaryFormat,
}

impl BinarySerializer {
    pub fn new(format: BinaryFormat) -> Self {
        Self { format }
    }

    pub fn json() -> Self {
        Self::new(BinaryFormat::Json)
    }

    pub fn messagepack() -> Self {
        Self::new(BinaryFormat::MessagePack)
    }

    pub fn bincode() -> Self {
        Self::new(BinaryFormat::Bincode)
    }

    pub fn serialize<T: Serialize>(&self, value: &T) -> Result<Bytes> {
        let data = match self.format {
            BinaryFormat::Json => serde_json::to_vec(value)?,
            BinaryFormat::MessagePack => rmp_serde::to_vec(value)?,
            BinaryFormat::Bincode => bincode::serialize(value)?,
        };
        Ok(Bytes::from(data))
    }

    pub fn deserialize<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        match self.format {
            BinaryFormat::Json => Ok(serde_json::from_slice(data)?),
            BinaryFormat::MessagePack => Ok(rmp_serde::from_slice(data)?),
            BinaryFormat::Bincode => Ok(bincode::deserialize(data)?),
        }
    }

    pub fn get_format(&self) -> BinaryFormat {
        self.format
    }
}

/// Serdes that encodes the whole [`Value`] with one of the serde formats.
pub struct FormatSerdes {
    serializer: BinarySerializer,
}

impl FormatSerdes {
    pub fn new(format: BinaryFormat) -> Self {
        Self {
            serializer: BinarySerializer::new(format),
        }
    }
}

impl Serdes for FormatSerdes {
    fn serialize(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(self.serializer.serialize(value)?.to_vec())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value> {
        self.serializer.deserialize(bytes)
    }
}

fn mismatch(info: &ComponentInfo) -> ReplicationError {
    ReplicationError::ValueMismatch {
        component: info.name.clone(),
        expected: format!("{:?}", info.encoding),
    }
}

fn lookup_numeric(registry: &Registry, numeric: NumericId) -> Result<&ComponentInfo> {
    registry
        .info_by_numeric(numeric)
        .ok_or(ReplicationError::UnknownComponent(numeric))
}

fn lookup_component(registry: &Registry, component: ComponentId) -> Result<&ComponentInfo> {
    registry
        .info(component)
        .ok_or_else(|| ReplicationError::UnknownName(component.to_string()))
}

pub fn write_value(
    cursor: &mut Cursor,
    info: &ComponentInfo,
    value: &Value,
    variants: &mut Vec<Value>,
) -> Result<()> {
    match &info.encoding {
        Encoding::Tag => Err(mismatch(info)),
        Encoding::Primitive(primitive) => {
            if !cursor.write_primitive(*primitive, value) {
                return Err(mismatch(info));
            }
            Ok(())
        }
        Encoding::Serdes(serdes) => {
            let bytes = serdes.serialize(value)?;
            match info.bytespan {
                Some(span) if span != bytes.len() => Err(ReplicationError::SpanMismatch {
                    component: info.name.clone(),
                    expected: span,
                    actual: bytes.len(),
                }),
                Some(_) => {
                    cursor.write_buffer(&bytes);
                    Ok(())
                }
                None => {
                    cursor.write_vlq(bytes.len() as u32);
                    cursor.write_buffer(&bytes);
                    Ok(())
                }
            }
        }
        Encoding::Variant => {
            cursor.write_vlq(variants.len() as u32);
            variants.push(value.clone());
            Ok(())
        }
    }
}

pub fn read_value(cursor: &mut Cursor, info: &ComponentInfo, variants: &[Value]) -> Result<Value> {
    match &info.encoding {
        Encoding::Tag => Err(mismatch(info)),
        Encoding::Primitive(primitive) => cursor.read_primitive(*primitive),
        Encoding::Serdes(serdes) => {
            let len = match info.bytespan {
                Some(span) => span,
                None => cursor.read_vlq()? as usize,
            };
            let bytes = cursor.read_buffer(len)?;
            serdes.deserialize(&bytes)
        }
        Encoding::Variant => {
            let index = cursor.read_vlq()? as usize;
            variants
                .get(index)
                .cloned()
                .ok_or(ReplicationError::UnknownVariant(index))
        }
    }
}

fn write_op(registry: &Registry, cursor: &mut Cursor, op: &Op, variants: &mut Vec<Value>) -> Result<()> {
    match op {
        Op::Destroy => {
            cursor.write_vlq(REMOVAL_SENTINEL);
            cursor.write_vlq(0);
        }
        Op::Set { component, value } => {
            let info = lookup_component(registry, *component)?;
            if info.categories.is_pair() {
                return Err(mismatch(info));
            }
            cursor.write_vlq(info.numeric);
            write_value(cursor, info, value, variants)?;
        }
        Op::Add { component } => {
            let info = lookup_component(registry, *component)?;
            if !info.is_tag() || info.categories.is_pair() {
                return Err(mismatch(info));
            }
            cursor.write_vlq(info.numeric);
        }
        Op::Remove { component } => {
            let info = lookup_component(registry, *component)?;
            if info.categories.is_pair() {
                return Err(mismatch(info));
            }
            cursor.write_vlq(REMOVAL_SENTINEL);
            cursor.write_vlq(info.numeric);
        }
        Op::AddPair { relation, target } => {
            let info = lookup_component(registry, *relation)?;
            if !info.categories.is_pair() {
                return Err(mismatch(info));
            }
            cursor.write_vlq(info.numeric);
            cursor.write_vlq(*target);
        }
        Op::RemovePair { relation, target } => {
            let info = lookup_component(registry, *relation)?;
            if !info.categories.is_pair() {
                return Err(mismatch(info));
            }
            cursor.write_vlq(REMOVAL_SENTINEL);
            cursor.write_vlq(info.numeric);
            cursor.write_vlq(*target);
        }
    }
    Ok(())
}

fn read_op(registry: &Registry, cursor: &mut Cursor, variants: &[Value]) -> Result<Op> {
    let numeric = cursor.read_vlq()?;

    if numeric == REMOVAL_SENTINEL {
        let removed = cursor.read_vlq()?;
        if removed == 0 {
            return Ok(Op::Destroy);
        }

        let info = lookup_numeric(registry, removed)?;
        if info.categories.is_pair() {
            let target = cursor.read_vlq()?;
            return Ok(Op::RemovePair { relation: info.id, target });
        }
        return Ok(Op::Remove { component: info.id });
    }

    let info = lookup_numeric(registry, numeric)?;
    if info.categories.is_pair() {
        let target = cursor.read_vlq()?;
        return Ok(Op::AddPair { relation: info.id, target });
    }
    if info.is_tag() {
        return Ok(Op::Add { component: info.id });
    }

    let value = read_value(cursor, info, variants)?;
    Ok(Op::Set { component: info.id, value })
}

/// Incremental payload encoder.
///
/// An op that fails to encode is logged and left out. The record itself is
/// always written, so an entity still reaches the receiver even when none of
/// its ops could be encoded.
pub struct PayloadWriter<'a> {
    registry: &'a Registry,
    body: Cursor,
    variants: Vec<Value>,
    records: u32,
    dropped: usize,
}

impl<'a> PayloadWriter<'a> {
    pub fn new(registry: &'a Registry, capacity: usize) -> Self {
        Self {
            registry,
            body: Cursor::with_capacity(capacity),
            variants: Vec::new(),
            records: 0,
            dropped: 0,
        }
    }

    pub fn write_record(&mut self, record: &EntityRecord) {
        let mut ops = Cursor::with_capacity(16);
        let mut written = 0u32;

        for op in &record.ops {
            let mut scratch = Cursor::with_capacity(8);
            match write_op(self.registry, &mut scratch, op, &mut self.variants) {
                Ok(()) => {
                    ops.write_buffer(&scratch.close());
                    written += 1;
                }
                Err(e) => {
                    log::error!("dropping {:?} for wire entity {}: {}", op, record.entity, e);
                    self.dropped += 1;
                }
            }
        }

        self.body.write_vlq(record.entity);
        self.body.write_vlq(written);
        self.body.write_buffer(&ops.close());
        self.records += 1;
    }

    pub fn records(&self) -> u32 {
        self.records
    }

    /// Ops that could not be encoded.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn finish(self) -> Payload {
        let body = self.body.close();
        let mut cursor = Cursor::with_capacity(body.len() + 5);
        cursor.write_vlq(self.records);
        cursor.write_buffer(&body);

        Payload {
            bytes: cursor.close(),
            variants: self.variants,
        }
    }
}

/// Encodes `records`, failing on the first op that cannot be encoded.
pub fn encode_payload(registry: &Registry, records: &[EntityRecord]) -> Result<Payload> {
    let mut cursor = Cursor::new();
    let mut variants = Vec::new();

    cursor.write_vlq(records.len() as u32);
    for record in records {
        cursor.write_vlq(record.entity);
        cursor.write_vlq(record.ops.len() as u32);
        for op in &record.ops {
            write_op(registry, &mut cursor, op, &mut variants)?;
        }
    }

    Ok(Payload {
        bytes: cursor.close(),
        variants,
    })
}

/// Decodes a whole payload. Any malformed entry fails the entire payload.
pub fn decode_payload(registry: &Registry, bytes: &[u8], variants: &[Value]) -> Result<Vec<EntityRecord>> {
    let mut cursor = Cursor::from(bytes);
    let count = cursor.read_vlq()?;
    let mut records = Vec::with_capacity(count.min(1024) as usize);

    for _ in 0..count {
        let entity = cursor.read_vlq()?;
        let op_count = cursor.read_vlq()?;
        let mut record = EntityRecord::new(entity);
        for _ in 0..op_count {
            record.ops.push(read_op(registry, &mut cursor, variants)?);
        }
        records.push(record);
    }

    if cursor.remaining() > 0 {
        return Err(ReplicationError::Deserialization(format!(
            "{} trailing bytes after payload",
            cursor.remaining()
        )));
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ComponentDecl;

    struct Fixture {
        registry: Registry,
        health: ComponentId,
        position: ComponentId,
        name: ComponentId,
        token: ComponentId,
        hash: ComponentId,
        frozen: ComponentId,
        child_of: ComponentId,
    }

    fn fixture() -> Fixture {
        let mut builder = Registry::builder();
        let health = builder.register(ComponentDecl::new("Health").reliable().primitive(Primitive::U16));
        let position = builder.register(ComponentDecl::new("Position").unreliable().primitive(Primitive::F64));
        let name = builder.register(
            ComponentDecl::new("Name").serdes(FormatSerdes::new(BinaryFormat::MessagePack)),
        );
        let token = builder.register(ComponentDecl::new("Token").variant());
        let hash = builder.register(
            ComponentDecl::new("Hash")
                .serdes(FnSerdes::new(
                    |value| match value {
                        Value::U32(v) => Ok(v.to_be_bytes().to_vec()),
                        other => Err(ReplicationError::Serialization(other.kind().to_string())),
                    },
                    |bytes| {
                        let mut raw = [0u8; 4];
                        raw.copy_from_slice(bytes);
                        Ok(Value::U32(u32::from_be_bytes(raw)))
                    },
                ))
                .bytespan(4),
        );
        let frozen = builder.register(ComponentDecl::new("Frozen").tag());
        let child_of = builder.register(ComponentDecl::new("ChildOf").pair());

        Fixture {
            registry: builder.build().unwrap(),
            health,
            position,
            name,
            token,
            hash,
            frozen,
            child_of,
        }
    }

    #[test]
    fn test_payload_round_trip_covers_every_op() {
        let f = fixture();
        let records = vec![
            EntityRecord {
                entity: 1,
                ops: vec![
                    Op::Set { component: f.health, value: Value::U16(65535) },
                    Op::Set { component: f.position, value: Value::F64(-3.5) },
                    Op::Set { component: f.name, value: Value::String("crate".into()) },
                    Op::Set { component: f.token, value: Value::Array(vec![Value::Null]) },
                    Op::Set { component: f.hash, value: Value::U32(0xDEAD_BEEF) },
                    Op::Add { component: f.frozen },
                    Op::AddPair { relation: f.child_of, target: 300 },
                ],
            },
            EntityRecord {
                entity: 200,
                ops: vec![
                    Op::Remove { component: f.frozen },
                    Op::RemovePair { relation: f.child_of, target: 1 },
                ],
            },
            EntityRecord::new(3),
            EntityRecord::destroy(4),
        ];

        let payload = encode_payload(&f.registry, &records).unwrap();
        assert_eq!(payload.variants.len(), 1);

        let decoded = decode_payload(&f.registry, &payload.bytes, &payload.variants).unwrap();
        assert_eq!(decoded, records);
    }

    #[test]
    fn test_removal_sentinel_layout() {
        let f = fixture();
        let payload = encode_payload(&f.registry, &[EntityRecord::destroy(5)]).unwrap();
        assert_eq!(payload.bytes.as_ref(), &[1, 5, 1, 0, 0]);

        let payload = encode_payload(
            &f.registry,
            &[EntityRecord {
                entity: 5,
                ops: vec![Op::Remove { component: f.health }],
            }],
        )
        .unwrap();
        assert_eq!(payload.bytes.as_ref(), &[1, 5, 1, 0, 1]);
    }

    #[test]
    fn test_bytespan_skips_length_prefix() {
        let f = fixture();
        let payload = encode_payload(
            &f.registry,
            &[EntityRecord {
                entity: 1,
                ops: vec![Op::Set { component: f.hash, value: Value::U32(1) }],
            }],
        )
        .unwrap();
        // count, entity, ops, numeric id 5, then 4 raw bytes
        assert_eq!(payload.bytes.len(), 4 + 4);
    }

    #[test]
    fn test_unknown_component_fails_decode() {
        let f = fixture();
        let bytes = [1u8, 1, 1, 42];
        assert!(matches!(
            decode_payload(&f.registry, &bytes, &[]),
            Err(ReplicationError::UnknownComponent(42))
        ));
    }

    #[test]
    fn test_truncated_payload_fails_decode() {
        let f = fixture();
        let records = vec![EntityRecord {
            entity: 1,
            ops: vec![Op::Set { component: f.health, value: Value::U16(7) }],
        }];
        let payload = encode_payload(&f.registry, &records).unwrap();
        let truncated = &payload.bytes[..payload.bytes.len() - 1];

        let err = decode_payload(&f.registry, truncated, &[]).unwrap_err();
        assert!(err.is_decode_error());
    }

    #[test]
    fn test_missing_variant_fails_decode() {
        let f = fixture();
        let records = vec![EntityRecord {
            entity: 1,
            ops: vec![Op::Set { component: f.token, value: Value::Bool(true) }],
        }];
        let payload = encode_payload(&f.registry, &records).unwrap();
        assert!(matches!(
            decode_payload(&f.registry, &payload.bytes, &[]),
            Err(ReplicationError::UnknownVariant(0))
        ));
    }

    #[test]
    fn test_writer_drops_bad_ops() {
        let f = fixture();
        let mut writer = PayloadWriter::new(&f.registry, 8);
        writer.write_record(&EntityRecord {
            entity: 1,
            ops: vec![
                Op::Set { component: f.health, value: Value::String("wrong".into()) },
                Op::Set { component: f.health, value: Value::U16(3) },
            ],
        });
        writer.write_record(&EntityRecord {
            entity: 2,
            ops: vec![Op::Set { component: f.hash, value: Value::Bool(false) }],
        });
        assert_eq!(writer.dropped(), 2);
        assert_eq!(writer.records(), 2);

        let payload = writer.finish();
        let decoded = decode_payload(&f.registry, &payload.bytes, &payload.variants).unwrap();
        assert_eq!(
            decoded,
            vec![
                EntityRecord {
                    entity: 1,
                    ops: vec![Op::Set { component: f.health, value: Value::U16(3) }],
                },
                EntityRecord::new(2),
            ]
        );
    }

    #[test]
    fn test_format_serdes_round_trip() {
        let value = Value::Array(vec![Value::I32(-1), Value::String("x".into()), Value::Bytes(vec![1, 2])]);
        for format in [BinaryFormat::Json, BinaryFormat::MessagePack, BinaryFormat::Bincode] {
            let serdes = FormatSerdes::new(format);
            let bytes = serdes.serialize(&value).unwrap();
            assert_eq!(serdes.deserialize(&bytes).unwrap(), value);
        }
    }
}
