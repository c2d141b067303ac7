use crate::bitmask::BitMask;
use crate::error::{ReplicationError, Result};
use crate::protocol::{Categories, ComponentId, NumericId, PlayerFilter, Primitive, Value};
use crate::serialization::Serdes;
use ahash::AHashMap;
use std::fmt;
use std::sync::Arc;

/// Derives a stable application key from a decoded value.
pub type CustomIdFn = Arc<dyn Fn(&Value) -> Option<u64> + Send + Sync>;

#[derive(Clone)]
pub enum Encoding {
    /// Presence only, no value on the wire.
    Tag,
    Primitive(Primitive),
    Serdes(Arc<dyn Serdes>),
    /// Value travels in the payload's variant list; the buffer holds its index.
    Variant,
}

impl fmt::Debug for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Tag => f.write_str("Tag"),
            Encoding::Primitive(p) => write!(f, "Primitive({})", p),
            Encoding::Serdes(_) => f.write_str("Serdes"),
            Encoding::Variant => f.write_str("Variant"),
        }
    }
}

#[derive(Clone)]
pub struct ComponentDecl {
    pub name: String,
    pub categories: Categories,
    pub encoding: Option<Encoding>,
    pub bytespan: Option<usize>,
    pub filter: Option<PlayerFilter>,
    pub custom_id: Option<CustomIdFn>,
}

impl ComponentDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            categories: Categories::NONE,
            encoding: None,
            bytespan: None,
            filter: None,
            custom_id: None,
        }
    }

    pub fn networked(mut self) -> Self {
        self.categories = self.categories | Categories::NETWORKED;
        self
    }

    pub fn reliable(mut self) -> Self {
        self.categories = self.categories | Categories::RELIABLE;
        self
    }

    pub fn unreliable(mut self) -> Self {
        self.categories = self.categories | Categories::UNRELIABLE;
        self
    }

    pub fn pair(mut self) -> Self {
        self.categories = self.categories | Categories::PAIR;
        self
    }

    pub fn tag(mut self) -> Self {
        self.encoding = Some(Encoding::Tag);
        self
    }

    pub fn primitive(mut self, primitive: Primitive) -> Self {
        self.encoding = Some(Encoding::Primitive(primitive));
        self
    }

    pub fn serdes(mut self, serdes: impl Serdes + 'static) -> Self {
        self.encoding = Some(Encoding::Serdes(Arc::new(serdes)));
        self
    }

    pub fn variant(mut self) -> Self {
        self.encoding = Some(Encoding::Variant);
        self
    }

    pub fn bytespan(mut self, span: usize) -> Self {
        self.bytespan = Some(span);
        self
    }

    pub fn filter(mut self, filter: PlayerFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn custom_id<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Option<u64> + Send + Sync + 'static,
    {
        self.custom_id = Some(Arc::new(f));
        self
    }
}

#[derive(Clone)]
pub struct ComponentInfo {
    pub id: ComponentId,
    pub numeric: NumericId,
    pub name: String,
    pub categories: Categories,
    pub encoding: Encoding,
    pub bytespan: Option<usize>,
    pub filter: Option<PlayerFilter>,
    pub custom_id: Option<CustomIdFn>,
}

impl ComponentInfo {
    pub fn is_tag(&self) -> bool {
        matches!(self.encoding, Encoding::Tag)
    }
}

impl fmt::Debug for ComponentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentInfo")
            .field("id", &self.id)
            .field("numeric", &self.numeric)
            .field("name", &self.name)
            .field("categories", &self.categories)
            .field("encoding", &self.encoding)
            .field("bytespan", &self.bytespan)
            .finish()
    }
}

/// Mints component ids and collects declarations.
pub struct RegistryBuilder {
    decls: Vec<(ComponentId, ComponentDecl)>,
    next_id: u32,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self {
            decls: Vec::new(),
            next_id: 1,
        }
    }

    pub fn register(&mut self, decl: ComponentDecl) -> ComponentId {
        let id = ComponentId(self.next_id);
        self.next_id += 1;
        self.decls.push((id, decl));
        id
    }

    pub fn build(self) -> Result<Registry> {
        create_shared_lookup(self.decls)
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn validate(id: ComponentId, decl: ComponentDecl, numeric: NumericId) -> Result<ComponentInfo> {
    let mut categories = decl.categories;
    if categories.is_empty() {
        categories = Categories::NETWORKED;
    }

    let encoding = match (decl.encoding, categories.is_pair()) {
        (None, true) | (Some(Encoding::Tag), true) => Encoding::Tag,
        (Some(_), true) => {
            return Err(ReplicationError::InvalidDeclaration(format!(
                "relation {} cannot carry a value",
                decl.name
            )))
        }
        (None, false) => return Err(ReplicationError::MissingSerdes(decl.name)),
        (Some(encoding), false) => encoding,
    };

    if let Some(span) = decl.bytespan {
        match &encoding {
            Encoding::Primitive(p) if p.span() != span => {
                return Err(ReplicationError::SpanMismatch {
                    component: decl.name,
                    expected: p.span(),
                    actual: span,
                })
            }
            Encoding::Tag | Encoding::Variant => {
                return Err(ReplicationError::InvalidDeclaration(format!(
                    "{} declares a byte span but has no fixed-width encoding",
                    decl.name
                )))
            }
            _ => {}
        }
    }

    if decl.custom_id.is_some() && matches!(encoding, Encoding::Tag) {
        return Err(ReplicationError::InvalidDeclaration(format!(
            "{} derives a custom id but carries no value",
            decl.name
        )));
    }

    Ok(ComponentInfo {
        id,
        numeric,
        name: decl.name,
        categories,
        encoding,
        bytespan: decl.bytespan,
        filter: decl.filter,
        custom_id: decl.custom_id,
    })
}

/// Builds the shared lookup from declarations, assigning numeric ids in order from 1.
pub fn create_shared_lookup(
    decls: impl IntoIterator<Item = (ComponentId, ComponentDecl)>,
) -> Result<Registry> {
    let mut components = Vec::new();
    let mut ids = AHashMap::new();
    let mut lookup = AHashMap::new();

    for (id, decl) in decls {
        if lookup.contains_key(&decl.name) || ids.contains_key(&id) {
            return Err(ReplicationError::DuplicateComponent(decl.name));
        }

        let numeric = components.len() as NumericId + 1;
        let info = validate(id, decl, numeric)?;

        ids.insert(id, numeric);
        lookup.insert(info.name.clone(), id);
        components.push(info);
    }

    let capacity = components.len() + 1;
    let mut reliable_mask = BitMask::create(capacity);
    let mut unreliable_mask = BitMask::create(capacity);
    let mut pair_mask = BitMask::create(capacity);

    for info in &components {
        let bit = info.numeric as usize;
        if info.categories.is_pair() {
            pair_mask.set(bit);
        } else if info.categories.is_unreliable() {
            unreliable_mask.set(bit);
        } else {
            reliable_mask.set(bit);
        }
    }

    Ok(Registry {
        components,
        ids,
        lookup,
        reliable_mask,
        unreliable_mask,
        pair_mask,
    })
}

/// Read-only component lookup shared by a server and its clients.
///
/// Component and numeric ids are stable for the registry's lifetime.
pub struct Registry {
    components: Vec<ComponentInfo>,
    ids: AHashMap<ComponentId, NumericId>,
    lookup: AHashMap<String, ComponentId>,
    reliable_mask: BitMask,
    unreliable_mask: BitMask,
    pair_mask: BitMask,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Bit capacity of masks indexed by numeric id.
    pub fn capacity(&self) -> usize {
        self.components.len() + 1
    }

    pub fn numeric(&self, id: ComponentId) -> Option<NumericId> {
        self.ids.get(&id).copied()
    }

    pub fn component(&self, numeric: NumericId) -> Option<ComponentId> {
        self.info_by_numeric(numeric).map(|info| info.id)
    }

    pub fn info(&self, id: ComponentId) -> Option<&ComponentInfo> {
        self.numeric(id).and_then(|numeric| self.info_by_numeric(numeric))
    }

    pub fn info_by_numeric(&self, numeric: NumericId) -> Option<&ComponentInfo> {
        if numeric == 0 {
            return None;
        }
        self.components.get(numeric as usize - 1)
    }

    pub fn lookup(&self, name: &str) -> Option<ComponentId> {
        self.lookup.get(name).copied()
    }

    pub fn require(&self, name: &str) -> Result<ComponentId> {
        self.lookup(name)
            .ok_or_else(|| ReplicationError::UnknownName(name.to_string()))
    }

    pub fn bytespan(&self, id: ComponentId) -> Option<usize> {
        self.info(id).and_then(|info| info.bytespan)
    }

    pub fn serdes(&self, id: ComponentId) -> Option<&Arc<dyn Serdes>> {
        match self.info(id).map(|info| &info.encoding) {
            Some(Encoding::Serdes(serdes)) => Some(serdes),
            _ => None,
        }
    }

    /// ComponentId to numeric id, for mask construction and remapping.
    pub fn ids(&self) -> &AHashMap<ComponentId, NumericId> {
        &self.ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &ComponentInfo> {
        self.components.iter()
    }

    /// Components whose value changes travel reliably.
    pub fn reliable_mask(&self) -> &BitMask {
        &self.reliable_mask
    }

    pub fn unreliable_mask(&self) -> &BitMask {
        &self.unreliable_mask
    }

    pub fn pair_mask(&self) -> &BitMask {
        &self.pair_mask
    }

    /// Copy of this registry without `id`; the remaining numeric ids are recompacted.
    pub fn without(&self, id: ComponentId) -> Result<Registry> {
        let decls = self
            .components
            .iter()
            .filter(|info| info.id != id)
            .map(|info| {
                (
                    info.id,
                    ComponentDecl {
                        name: info.name.clone(),
                        categories: info.categories,
                        encoding: Some(info.encoding.clone()),
                        bytespan: info.bytespan,
                        filter: info.filter.clone(),
                        custom_id: info.custom_id.clone(),
                    },
                )
            });
        create_shared_lookup(decls)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.components.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::{BinaryFormat, FormatSerdes};

    #[test]
    fn test_numeric_ids_follow_declaration_order() {
        let mut builder = Registry::builder();
        let health = builder.register(ComponentDecl::new("Health").primitive(Primitive::U16));
        let name = builder.register(
            ComponentDecl::new("Name").serdes(FormatSerdes::new(BinaryFormat::MessagePack)),
        );
        let child_of = builder.register(ComponentDecl::new("ChildOf").pair());
        let registry = builder.build().unwrap();

        assert_eq!(registry.numeric(health), Some(1));
        assert_eq!(registry.numeric(name), Some(2));
        assert_eq!(registry.numeric(child_of), Some(3));
        assert_eq!(registry.component(2), Some(name));
        assert_eq!(registry.component(0), None);
        assert_eq!(registry.lookup("ChildOf"), Some(child_of));
        assert!(registry.serdes(name).is_some());
        assert_eq!(registry.capacity(), 4);
    }

    #[test]
    fn test_default_category_is_networked() {
        let mut builder = Registry::builder();
        let marker = builder.register(ComponentDecl::new("Marker").tag());
        let registry = builder.build().unwrap();

        let info = registry.info(marker).unwrap();
        assert!(info.categories.contains(Categories::NETWORKED));
        assert!(registry.reliable_mask().get(1));
    }

    #[test]
    fn test_category_masks() {
        let mut builder = Registry::builder();
        builder.register(ComponentDecl::new("Health").reliable().primitive(Primitive::U8));
        builder.register(ComponentDecl::new("Position").unreliable().primitive(Primitive::F32));
        builder.register(ComponentDecl::new("Likes").pair());
        let registry = builder.build().unwrap();

        assert!(registry.reliable_mask().get(1));
        assert!(registry.unreliable_mask().get(2));
        assert!(registry.pair_mask().get(3));
        assert_eq!(registry.reliable_mask().entries(), 1);
    }

    #[test]
    fn test_missing_serdes_is_rejected() {
        let mut builder = Registry::builder();
        builder.register(ComponentDecl::new("Inventory").reliable());
        assert!(matches!(
            builder.build(),
            Err(ReplicationError::MissingSerdes(name)) if name == "Inventory"
        ));
    }

    #[test]
    fn test_bytespan_validation() {
        let mut builder = Registry::builder();
        builder.register(ComponentDecl::new("Level").primitive(Primitive::U16).bytespan(4));
        assert!(matches!(
            builder.build(),
            Err(ReplicationError::SpanMismatch { expected: 2, actual: 4, .. })
        ));

        let mut builder = Registry::builder();
        builder.register(ComponentDecl::new("Flag").tag().bytespan(1));
        assert!(matches!(builder.build(), Err(ReplicationError::InvalidDeclaration(_))));
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let mut builder = Registry::builder();
        builder.register(ComponentDecl::new("Health").primitive(Primitive::U8));
        builder.register(ComponentDecl::new("Health").primitive(Primitive::U16));
        assert!(matches!(
            builder.build(),
            Err(ReplicationError::DuplicateComponent(_))
        ));
    }

    #[test]
    fn test_without_recompacts() {
        let mut builder = Registry::builder();
        let a = builder.register(ComponentDecl::new("A").tag());
        let b = builder.register(ComponentDecl::new("B").tag());
        let c = builder.register(ComponentDecl::new("C").tag());
        let registry = builder.build().unwrap();

        let smaller = registry.without(b).unwrap();
        assert_eq!(smaller.numeric(a), Some(1));
        assert_eq!(smaller.numeric(b), None);
        assert_eq!(smaller.numeric(c), Some(2));
        assert_eq!(smaller.capacity(), 3);
    }
}
