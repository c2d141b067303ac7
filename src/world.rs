//! Entity store seam.
//!
//! The replicators never own entity storage. They read and write it through
//! [`EntityStore`], and the server learns about mutations by draining the
//! store's [`MutationEvent`] queue once per collection.

use crate::protocol::{ComponentId, Entity, PlayerFilter, Value};
use ahash::AHashMap;
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq)]
pub enum MutationEvent {
    /// A value component was added or changed.
    Set { entity: Entity, component: ComponentId, value: Value },
    /// A tag component was added.
    Added { entity: Entity, component: ComponentId },
    Removed { entity: Entity, component: ComponentId },
    PairAdded { entity: Entity, relation: ComponentId, target: Entity },
    PairRemoved { entity: Entity, relation: ComponentId, target: Entity },
    /// The entity was marked for replication, or its filter changed.
    Networked { entity: Entity, filter: Option<PlayerFilter> },
    Unnetworked { entity: Entity },
    Despawned { entity: Entity },
}

impl MutationEvent {
    pub fn entity(&self) -> Entity {
        match self {
            MutationEvent::Set { entity, .. }
            | MutationEvent::Added { entity, .. }
            | MutationEvent::Removed { entity, .. }
            | MutationEvent::PairAdded { entity, .. }
            | MutationEvent::PairRemoved { entity, .. }
            | MutationEvent::Networked { entity, .. }
            | MutationEvent::Unnetworked { entity }
            | MutationEvent::Despawned { entity } => *entity,
        }
    }
}

pub trait EntityStore {
    fn spawn(&mut self) -> Entity;
    fn despawn(&mut self, entity: Entity);
    fn contains(&self, entity: Entity) -> bool;

    fn set(&mut self, entity: Entity, component: ComponentId, value: Value);
    fn add(&mut self, entity: Entity, component: ComponentId);
    fn remove(&mut self, entity: Entity, component: ComponentId);
    fn has(&self, entity: Entity, component: ComponentId) -> bool;
    /// `None` for tags and missing components.
    fn get(&self, entity: Entity, component: ComponentId) -> Option<Value>;
    /// Non-relation components present on `entity`.
    fn components(&self, entity: Entity) -> Vec<ComponentId>;

    fn add_pair(&mut self, entity: Entity, relation: ComponentId, target: Entity);
    fn remove_pair(&mut self, entity: Entity, relation: ComponentId, target: Entity);
    fn targets(&self, entity: Entity, relation: ComponentId) -> Vec<Entity>;
    fn relations(&self, entity: Entity) -> Vec<ComponentId>;

    fn set_networked(&mut self, entity: Entity, filter: Option<PlayerFilter>);
    fn clear_networked(&mut self, entity: Entity);
    fn networked(&self) -> Vec<(Entity, Option<PlayerFilter>)>;

    fn drain_events(&mut self) -> Vec<MutationEvent>;

    fn remove_all_relations(&mut self, entity: Entity, relation: ComponentId) {
        for target in self.targets(entity, relation) {
            self.remove_pair(entity, relation, target);
        }
    }
}

#[derive(Debug, Default)]
struct EntityData {
    components: AHashMap<ComponentId, Option<Value>>,
    pairs: AHashMap<ComponentId, BTreeSet<Entity>>,
    networked: Option<Option<PlayerFilter>>,
}

/// In-memory [`EntityStore`] that records its own mutations.
pub struct MemoryWorld {
    entities: AHashMap<Entity, EntityData>,
    next_entity: Entity,
    events: Vec<MutationEvent>,
    recording: bool,
}

impl MemoryWorld {
    pub fn new() -> Self {
        Self {
            entities: AHashMap::new(),
            next_entity: 1,
            events: Vec::new(),
            recording: true,
        }
    }

    /// A store that keeps no event queue, for the receiving side.
    pub fn untracked() -> Self {
        Self {
            recording: false,
            ..Self::new()
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn entities(&self) -> Vec<Entity> {
        let mut entities: Vec<Entity> = self.entities.keys().copied().collect();
        entities.sort_unstable();
        entities
    }

    fn record(&mut self, event: MutationEvent) {
        if self.recording {
            self.events.push(event);
        }
    }
}

impl Default for MemoryWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore for MemoryWorld {
    fn spawn(&mut self) -> Entity {
        let entity = self.next_entity;
        self.next_entity += 1;
        self.entities.insert(entity, EntityData::default());
        entity
    }

    fn despawn(&mut self, entity: Entity) {
        if self.entities.remove(&entity).is_none() {
            return;
        }

        for data in self.entities.values_mut() {
            for targets in data.pairs.values_mut() {
                targets.remove(&entity);
            }
            data.pairs.retain(|_, targets| !targets.is_empty());
        }

        self.record(MutationEvent::Despawned { entity });
    }

    fn contains(&self, entity: Entity) -> bool {
        self.entities.contains_key(&entity)
    }

    fn set(&mut self, entity: Entity, component: ComponentId, value: Value) {
        let Some(data) = self.entities.get_mut(&entity) else {
            return;
        };
        data.components.insert(component, Some(value.clone()));
        self.record(MutationEvent::Set { entity, component, value });
    }

    fn add(&mut self, entity: Entity, component: ComponentId) {
        let Some(data) = self.entities.get_mut(&entity) else {
            return;
        };
        if data.components.contains_key(&component) {
            return;
        }
        data.components.insert(component, None);
        self.record(MutationEvent::Added { entity, component });
    }

    fn remove(&mut self, entity: Entity, component: ComponentId) {
        let Some(data) = self.entities.get_mut(&entity) else {
            return;
        };
        if data.components.remove(&component).is_some() {
            self.record(MutationEvent::Removed { entity, component });
        }
    }

    fn has(&self, entity: Entity, component: ComponentId) -> bool {
        self.entities
            .get(&entity)
            .map(|data| data.components.contains_key(&component))
            .unwrap_or(false)
    }

    fn get(&self, entity: Entity, component: ComponentId) -> Option<Value> {
        self.entities
            .get(&entity)
            .and_then(|data| data.components.get(&component))
            .and_then(|value| value.clone())
    }

    fn components(&self, entity: Entity) -> Vec<ComponentId> {
        let mut components: Vec<ComponentId> = self
            .entities
            .get(&entity)
            .map(|data| data.components.keys().copied().collect())
            .unwrap_or_default();
        components.sort_unstable();
        components
    }

    fn add_pair(&mut self, entity: Entity, relation: ComponentId, target: Entity) {
        let Some(data) = self.entities.get_mut(&entity) else {
            return;
        };
        if data.pairs.entry(relation).or_default().insert(target) {
            self.record(MutationEvent::PairAdded { entity, relation, target });
        }
    }

    fn remove_pair(&mut self, entity: Entity, relation: ComponentId, target: Entity) {
        let Some(data) = self.entities.get_mut(&entity) else {
            return;
        };
        let Some(targets) = data.pairs.get_mut(&relation) else {
            return;
        };
        if targets.remove(&target) {
            if targets.is_empty() {
                data.pairs.remove(&relation);
            }
            self.record(MutationEvent::PairRemoved { entity, relation, target });
        }
    }

    fn targets(&self, entity: Entity, relation: ComponentId) -> Vec<Entity> {
        self.entities
            .get(&entity)
            .and_then(|data| data.pairs.get(&relation))
            .map(|targets| targets.iter().copied().collect())
            .unwrap_or_default()
    }

    fn relations(&self, entity: Entity) -> Vec<ComponentId> {
        let mut relations: Vec<ComponentId> = self
            .entities
            .get(&entity)
            .map(|data| data.pairs.keys().copied().collect())
            .unwrap_or_default();
        relations.sort_unstable();
        relations
    }

    fn set_networked(&mut self, entity: Entity, filter: Option<PlayerFilter>) {
        let Some(data) = self.entities.get_mut(&entity) else {
            return;
        };
        data.networked = Some(filter.clone());
        self.record(MutationEvent::Networked { entity, filter });
    }

    fn clear_networked(&mut self, entity: Entity) {
        let Some(data) = self.entities.get_mut(&entity) else {
            return;
        };
        if data.networked.take().is_some() {
            self.record(MutationEvent::Unnetworked { entity });
        }
    }

    fn networked(&self) -> Vec<(Entity, Option<PlayerFilter>)> {
        let mut out: Vec<(Entity, Option<PlayerFilter>)> = self
            .entities
            .iter()
            .filter_map(|(entity, data)| data.networked.clone().map(|filter| (*entity, filter)))
            .collect();
        out.sort_unstable_by_key(|(entity, _)| *entity);
        out
    }

    fn drain_events(&mut self) -> Vec<MutationEvent> {
        std::mem::take(&mut self.events)
    }
}
