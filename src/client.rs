//! Client replicator.
//!
//! Payloads are decoded in full before the store is touched, so a malformed
//! payload applies nothing. Server entity ids are translated to local entities
//! through `server_ids`/`client_ids`, with custom ids used to reuse an existing
//! local entity instead of spawning a new one.

use crate::debug;
use crate::error::{ReplicationError, Result};
use crate::protocol::{ComponentId, Entity, EntityRecord, Op, PayloadKind, Value, WireEntity};
use crate::registry::Registry;
use crate::serialization::decode_payload;
use crate::sync::{ClientStats, ReplicationCallback, ReplicationConfig};
use crate::world::EntityStore;
use ahash::{AHashMap, AHashSet};
use std::sync::Arc;

/// True when the record can bring an unknown entity into existence.
fn introduces(record: &EntityRecord) -> bool {
    if record.is_destroy() {
        return false;
    }
    record.ops.is_empty()
        || record
            .ops
            .iter()
            .any(|op| !matches!(op, Op::Remove { .. } | Op::RemovePair { .. }))
}

pub struct Client {
    registry: Arc<Registry>,
    config: ReplicationConfig,
    server_ids: AHashMap<WireEntity, Entity>,
    client_ids: AHashMap<Entity, WireEntity>,
    custom_entities: AHashMap<(ComponentId, u64), Entity>,
    replicating: bool,
    callbacks: Vec<ReplicationCallback>,
    stats: ClientStats,
}

impl Client {
    pub fn new(registry: Arc<Registry>, config: ReplicationConfig) -> Self {
        Self {
            registry,
            config,
            server_ids: AHashMap::new(),
            client_ids: AHashMap::new(),
            custom_entities: AHashMap::new(),
            replicating: false,
            callbacks: Vec::new(),
            stats: ClientStats::default(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Drops mappings whose local entity no longer exists in `world`.
    pub fn init<W: EntityStore + ?Sized>(&mut self, world: &W) {
        self.server_ids.retain(|_, local| world.contains(*local));
        self.client_ids.retain(|local, _| world.contains(*local));
        self.custom_entities.retain(|_, local| world.contains(*local));
    }

    pub fn destroy(&mut self) {
        self.server_ids.clear();
        self.client_ids.clear();
        self.custom_entities.clear();
    }

    /// Local entity replicating server entity `wire`.
    pub fn entity(&self, wire: WireEntity) -> Option<Entity> {
        self.server_ids.get(&wire).copied()
    }

    pub fn wire_id(&self, entity: Entity) -> Option<WireEntity> {
        self.client_ids.get(&entity).copied()
    }

    /// Lets a record carrying `key` for `component` reuse `entity` instead of spawning.
    pub fn claim(&mut self, component: ComponentId, key: u64, entity: Entity) {
        self.custom_entities.insert((component, key), entity);
    }

    /// True while a payload is being applied.
    pub fn is_replicating(&self) -> bool {
        self.replicating
    }

    pub fn rebind_registry(&mut self, registry: Arc<Registry>) {
        self.custom_entities
            .retain(|(component, _), _| registry.numeric(*component).is_some());
        self.registry = registry;
    }

    pub fn after_replication<F>(&mut self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callbacks.push(Arc::new(callback));
    }

    pub(crate) fn push_callback(&mut self, callback: ReplicationCallback) {
        self.callbacks.push(callback);
    }

    pub fn stats(&self) -> ClientStats {
        self.stats.clone()
    }

    pub fn apply_full<W: EntityStore + ?Sized>(
        &mut self,
        world: &mut W,
        bytes: &[u8],
        variants: &[Value],
    ) -> Result<()> {
        self.apply(PayloadKind::Full, world, bytes, variants)
    }

    pub fn apply_updates<W: EntityStore + ?Sized>(
        &mut self,
        world: &mut W,
        bytes: &[u8],
        variants: &[Value],
    ) -> Result<()> {
        self.apply(PayloadKind::Updates, world, bytes, variants)
    }

    /// Unreliable values for entities not yet known are dropped.
    pub fn apply_unreliable<W: EntityStore + ?Sized>(
        &mut self,
        world: &mut W,
        bytes: &[u8],
        variants: &[Value],
    ) -> Result<()> {
        self.apply(PayloadKind::Unreliable, world, bytes, variants)
    }

    pub fn apply<W: EntityStore + ?Sized>(
        &mut self,
        kind: PayloadKind,
        world: &mut W,
        bytes: &[u8],
        variants: &[Value],
    ) -> Result<()> {
        let records = match decode_payload(&self.registry, bytes, variants) {
            Ok(records) => records,
            Err(e) => {
                log::error!("dropping {:?} payload of {} bytes: {}", kind, bytes.len(), e);
                self.stats.errors += 1;
                return Err(e);
            }
        };
        debug::trace_apply(kind, &records, bytes.len());

        if self.config.strict && kind != PayloadKind::Unreliable {
            if let Err(e) = self.validate(&records, kind == PayloadKind::Full) {
                log::error!("rejecting {:?} payload: {}", kind, e);
                self.stats.errors += 1;
                return Err(e);
            }
        }

        self.replicating = true;
        match kind {
            PayloadKind::Full => self.apply_snapshot(world, &records),
            PayloadKind::Updates => self.apply_records(world, &records),
            PayloadKind::Unreliable => self.apply_values(world, &records),
        }
        self.replicating = false;

        self.stats.applied += 1;
        self.stats.bytes += bytes.len() as u64;
        for callback in &self.callbacks {
            callback();
        }
        Ok(())
    }

    /// Checks that every destroy and removal names an entity that will exist
    /// when it is applied.
    fn validate(&self, records: &[EntityRecord], full: bool) -> Result<()> {
        let mut known: AHashSet<WireEntity> = if full {
            AHashSet::new()
        } else {
            self.server_ids.keys().copied().collect()
        };

        if self.config.ordered_creation {
            known.extend(records.iter().filter(|r| introduces(r)).map(|r| r.entity));
        }

        for record in records {
            if !self.config.ordered_creation && introduces(record) {
                known.insert(record.entity);
            }
            if !known.contains(&record.entity) {
                return Err(ReplicationError::UnknownEntity(record.entity));
            }
            for op in &record.ops {
                match op {
                    Op::AddPair { target, .. } => {
                        known.insert(*target);
                    }
                    Op::RemovePair { target, .. } if !known.contains(target) => {
                        return Err(ReplicationError::UnknownEntity(*target));
                    }
                    _ => {}
                }
            }
            if record.is_destroy() {
                known.remove(&record.entity);
            }
        }

        Ok(())
    }

    fn bind(&mut self, wire: WireEntity, local: Entity) {
        self.server_ids.insert(wire, local);
        self.client_ids.insert(local, wire);
    }

    fn spawn_for<W: EntityStore + ?Sized>(&mut self, world: &mut W, wire: WireEntity) -> Entity {
        let local = world.spawn();
        self.bind(wire, local);
        self.stats.entities_created += 1;
        local
    }

    /// Local entity previously claimed for one of the record's custom ids.
    fn reclaim<W: EntityStore + ?Sized>(&self, world: &W, record: &EntityRecord) -> Option<Entity> {
        record.ops.iter().find_map(|op| {
            let Op::Set { component, value } = op else {
                return None;
            };
            let custom_id = self.registry.info(*component)?.custom_id.as_ref()?;
            let key = custom_id(value)?;
            let local = *self.custom_entities.get(&(*component, key))?;
            (world.contains(local) && !self.client_ids.contains_key(&local)).then_some(local)
        })
    }

    fn resolve<W: EntityStore + ?Sized>(&mut self, world: &mut W, record: &EntityRecord) -> Option<Entity> {
        if let Some(local) = self.server_ids.get(&record.entity) {
            return Some(*local);
        }
        if !introduces(record) {
            log::debug!("skipping record for unknown wire entity {}", record.entity);
            return None;
        }
        if let Some(local) = self.reclaim(world, record) {
            self.bind(record.entity, local);
            return Some(local);
        }
        Some(self.spawn_for(world, record.entity))
    }

    /// Local entity for a relation target, spawned the first time it is seen.
    fn target<W: EntityStore + ?Sized>(&mut self, world: &mut W, wire: WireEntity) -> Entity {
        match self.server_ids.get(&wire) {
            Some(local) => *local,
            None => self.spawn_for(world, wire),
        }
    }

    fn destroy_entity<W: EntityStore + ?Sized>(&mut self, world: &mut W, wire: WireEntity) {
        let Some(local) = self.server_ids.remove(&wire) else {
            log::debug!("destroy for unknown wire entity {}", wire);
            return;
        };
        self.client_ids.remove(&local);
        self.custom_entities.retain(|_, entity| *entity != local);
        world.despawn(local);
        self.stats.entities_removed += 1;
    }

    fn apply_ops<W: EntityStore + ?Sized>(&mut self, world: &mut W, local: Entity, ops: &[Op]) {
        for op in ops {
            match op {
                Op::Set { component, value } => {
                    let key = self
                        .registry
                        .info(*component)
                        .and_then(|info| info.custom_id.as_ref())
                        .and_then(|custom_id| custom_id(value));
                    if let Some(key) = key {
                        self.custom_entities.insert((*component, key), local);
                    }
                    world.set(local, *component, value.clone());
                }
                Op::Add { component } => world.add(local, *component),
                Op::Remove { component } => world.remove(local, *component),
                Op::AddPair { relation, target } => {
                    let target = self.target(world, *target);
                    world.add_pair(local, *relation, target);
                }
                Op::RemovePair { relation, target } => match self.server_ids.get(target) {
                    Some(target) => world.remove_pair(local, *relation, *target),
                    None => log::debug!("relation removal for unknown target {}", target),
                },
                Op::Destroy => {}
            }
        }
    }

    fn apply_record<W: EntityStore + ?Sized>(&mut self, world: &mut W, record: &EntityRecord) {
        if record.is_destroy() {
            self.destroy_entity(world, record.entity);
            return;
        }
        if let Some(local) = self.resolve(world, record) {
            self.apply_ops(world, local, &record.ops);
        }
    }

    fn apply_records<W: EntityStore + ?Sized>(&mut self, world: &mut W, records: &[EntityRecord]) {
        if !self.config.ordered_creation {
            for record in records {
                self.apply_record(world, record);
            }
            return;
        }

        for record in records.iter().filter(|record| !record.is_destroy()) {
            self.resolve(world, record);
        }
        for record in records {
            self.apply_record(world, record);
        }
    }

    /// Replaces all replicated state. Previously replicated entities that the
    /// snapshot does not reclaim through a custom id are despawned.
    fn apply_snapshot<W: EntityStore + ?Sized>(&mut self, world: &mut W, records: &[EntityRecord]) {
        let previous: Vec<Entity> = self.client_ids.keys().copied().collect();
        self.server_ids.clear();
        self.client_ids.clear();

        self.apply_records(world, records);

        for local in previous {
            if self.client_ids.contains_key(&local) || !world.contains(local) {
                continue;
            }
            self.custom_entities.retain(|_, entity| *entity != local);
            world.despawn(local);
            self.stats.entities_removed += 1;
        }
    }

    fn apply_values<W: EntityStore + ?Sized>(&mut self, world: &mut W, records: &[EntityRecord]) {
        for record in records {
            let Some(local) = self.server_ids.get(&record.entity).copied() else {
                log::debug!("unreliable values for unknown wire entity {}", record.entity);
                continue;
            };
            self.apply_ops(world, local, &record.ops);
        }
    }
}
