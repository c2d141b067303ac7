use crate::protocol::{ComponentId, Entity, PlayerFilter, Value};
use crate::registry::Registry;
use crate::world::MutationEvent;
use ahash::{AHashMap, AHashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Became networked this tick.
    Created,
    /// Was already networked and its entity filter changed.
    Refiltered,
    /// Left replication: despawned or unnetworked.
    Removed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Set(Value),
    Added,
    Removed,
}

/// Reliable changes accumulated since the last reliable flush.
#[derive(Debug, Default)]
pub struct TrackInfo {
    pub entities: AHashMap<Entity, Liveness>,
    pub components: AHashMap<Entity, AHashMap<ComponentId, Change>>,
    /// `(relation, target) -> present` after the last event.
    pub pairs: AHashMap<Entity, AHashMap<(ComponentId, Entity), bool>>,
}

impl TrackInfo {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.components.is_empty() && self.pairs.is_empty()
    }

    /// Every entity with at least one tracked change.
    pub fn touched(&self) -> AHashSet<Entity> {
        self.entities
            .keys()
            .chain(self.components.keys())
            .chain(self.pairs.keys())
            .copied()
            .collect()
    }
}

/// Last state sent for one entity; the baseline reliable diffs compare against.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct EntityStorage {
    pub tags: AHashSet<ComponentId>,
    pub values: AHashMap<ComponentId, Value>,
    pub pairs: AHashMap<ComponentId, AHashSet<Entity>>,
}

impl EntityStorage {
    pub fn has(&self, component: ComponentId) -> bool {
        self.tags.contains(&component) || self.values.contains_key(&component)
    }

    pub fn has_pair(&self, relation: ComponentId, target: Entity) -> bool {
        self.pairs
            .get(&relation)
            .map(|targets| targets.contains(&target))
            .unwrap_or(false)
    }

    pub fn apply(&mut self, component: ComponentId, change: &Change) {
        match change {
            Change::Set(value) => {
                self.values.insert(component, value.clone());
            }
            Change::Added => {
                self.tags.insert(component);
            }
            Change::Removed => {
                self.values.remove(&component);
                self.tags.remove(&component);
            }
        }
    }

    pub fn apply_pair(&mut self, relation: ComponentId, target: Entity, present: bool) {
        if present {
            self.pairs.entry(relation).or_default().insert(target);
        } else if let Some(targets) = self.pairs.get_mut(&relation) {
            targets.remove(&target);
            if targets.is_empty() {
                self.pairs.remove(&relation);
            }
        }
    }

    pub fn forget_target(&mut self, target: Entity) {
        for targets in self.pairs.values_mut() {
            targets.remove(&target);
        }
        self.pairs.retain(|_, targets| !targets.is_empty());
    }
}

/// Folds store mutations into per-tick change sets.
///
/// Events for entities that are not networked, and for components the
/// registry does not know, are ignored.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    networked: AHashMap<Entity, Option<PlayerFilter>>,
    info: TrackInfo,
    unreliable: AHashMap<Entity, AHashMap<ComponentId, Value>>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_networked(&self, entity: Entity) -> bool {
        self.networked.contains_key(&entity)
    }

    /// `None` when the entity is not networked; `Some(None)` when it has no filter.
    pub fn filter(&self, entity: Entity) -> Option<Option<&PlayerFilter>> {
        self.networked.get(&entity).map(|filter| filter.as_ref())
    }

    pub fn networked(&self) -> impl Iterator<Item = Entity> + '_ {
        self.networked.keys().copied()
    }

    pub fn info(&self) -> &TrackInfo {
        &self.info
    }

    pub fn observe(&mut self, registry: &Registry, event: MutationEvent) {
        match event {
            MutationEvent::Networked { entity, filter } => {
                let was_networked = self.networked.insert(entity, filter).is_some();
                let liveness = match self.info.entities.get(&entity) {
                    Some(Liveness::Created) => Liveness::Created,
                    _ if was_networked => Liveness::Refiltered,
                    _ => Liveness::Created,
                };
                self.info.entities.insert(entity, liveness);
            }
            MutationEvent::Unnetworked { entity } | MutationEvent::Despawned { entity } => {
                if self.networked.remove(&entity).is_none() {
                    return;
                }
                self.info.entities.insert(entity, Liveness::Removed);
                self.info.components.remove(&entity);
                self.info.pairs.remove(&entity);
                self.unreliable.remove(&entity);
            }
            MutationEvent::Set { entity, component, value } => {
                if !self.networked.contains_key(&entity) {
                    return;
                }
                let Some(info) = registry.info(component) else {
                    return;
                };
                if info.categories.is_pair() {
                    log::warn!("ignoring value set on relation {}", info.name);
                    return;
                }
                if info.categories.is_unreliable() {
                    if let Some(changes) = self.info.components.get_mut(&entity) {
                        if changes.get(&component) == Some(&Change::Removed) {
                            changes.remove(&component);
                        }
                    }
                    self.unreliable.entry(entity).or_default().insert(component, value);
                } else {
                    self.info
                        .components
                        .entry(entity)
                        .or_default()
                        .insert(component, Change::Set(value));
                }
            }
            MutationEvent::Added { entity, component } => {
                if !self.networked.contains_key(&entity) || registry.info(component).is_none() {
                    return;
                }
                self.info
                    .components
                    .entry(entity)
                    .or_default()
                    .insert(component, Change::Added);
            }
            MutationEvent::Removed { entity, component } => {
                if !self.networked.contains_key(&entity) || registry.info(component).is_none() {
                    return;
                }
                if let Some(values) = self.unreliable.get_mut(&entity) {
                    values.remove(&component);
                }
                self.info
                    .components
                    .entry(entity)
                    .or_default()
                    .insert(component, Change::Removed);
            }
            MutationEvent::PairAdded { entity, relation, target } => {
                self.observe_pair(registry, entity, relation, target, true);
            }
            MutationEvent::PairRemoved { entity, relation, target } => {
                self.observe_pair(registry, entity, relation, target, false);
            }
        }
    }

    fn observe_pair(
        &mut self,
        registry: &Registry,
        entity: Entity,
        relation: ComponentId,
        target: Entity,
        present: bool,
    ) {
        if !self.networked.contains_key(&entity) {
            return;
        }
        match registry.info(relation) {
            Some(info) if info.categories.is_pair() => {}
            _ => return,
        }
        self.info
            .pairs
            .entry(entity)
            .or_default()
            .insert((relation, target), present);
    }

    /// Hands over the reliable change set and starts a new one.
    pub fn take_reliable(&mut self) -> TrackInfo {
        std::mem::take(&mut self.info)
    }

    /// Latest unreliable values per entity, cleared on take.
    pub fn take_unreliable(&mut self) -> AHashMap<Entity, AHashMap<ComponentId, Value>> {
        std::mem::take(&mut self.unreliable)
    }

    pub fn clear(&mut self) {
        self.networked.clear();
        self.info = TrackInfo::default();
        self.unreliable.clear();
    }
}
