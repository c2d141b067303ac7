//! Server replicator.
//!
//! The server never owns the entity store. Each collection drains the store's
//! mutation queue into the [`ChangeTracker`], diffs the tracked changes against
//! the last-sent [`EntityStorage`] baseline, and encodes one payload per ready
//! player that has something to receive.

use crate::bitmask::BitMask;
use crate::debug;
use crate::error::{ReplicationError, Result};
use crate::protocol::{
    filter_allows, ComponentId, Entity, EntityRecord, Op, OutgoingPayload, Payload, PayloadKind,
    PlayerFilter, PlayerId, WireEntity,
};
use crate::registry::{ComponentInfo, Registry};
use crate::serialization::PayloadWriter;
use crate::sync::{ReplicationCallback, ReplicationConfig, ServerStats};
use crate::tracker::{Change, ChangeTracker, EntityStorage, Liveness, TrackInfo};
use crate::world::{EntityStore, MutationEvent};
use ahash::{AHashMap, AHashSet};
use std::collections::BTreeMap;
use std::sync::Arc;

struct PlayerState {
    ready: bool,
    visibility: BitMask,
    /// Entities this player has been told about and not told to destroy.
    known: AHashSet<Entity>,
    /// Components that became visible since the last reliable flush.
    gained: BitMask,
    lost: BitMask,
}

impl PlayerState {
    fn new(visibility: BitMask) -> Self {
        let capacity = visibility.capacity();
        Self {
            ready: false,
            visibility,
            known: AHashSet::new(),
            gained: BitMask::create(capacity),
            lost: BitMask::create(capacity),
        }
    }

    fn reset_pending(&mut self) {
        let capacity = self.visibility.capacity();
        self.gained = BitMask::create(capacity);
        self.lost = BitMask::create(capacity);
    }
}

#[derive(Default)]
struct PlayerDiff {
    records: Vec<EntityRecord>,
    learned: Vec<Entity>,
    forgotten: Vec<Entity>,
}

/// Payloads produced by one collection, one per ready player with something to send.
pub struct Outgoing {
    inner: std::vec::IntoIter<OutgoingPayload>,
}

impl Outgoing {
    fn new(payloads: Vec<OutgoingPayload>) -> Self {
        Self {
            inner: payloads.into_iter(),
        }
    }
}

impl Iterator for Outgoing {
    type Item = OutgoingPayload;

    fn next(&mut self) -> Option<OutgoingPayload> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Outgoing {}

fn and_not(mask: &BitMask, other: &BitMask) -> BitMask {
    match mask.band(&other.bnot()) {
        Ok(out) => out,
        Err(e) => {
            log::error!("visibility mask mismatch: {}", e);
            mask.clone()
        }
    }
}

pub struct Server {
    registry: Arc<Registry>,
    config: ReplicationConfig,
    tracker: ChangeTracker,
    storage: AHashMap<Entity, EntityStorage>,
    server_ids: AHashMap<Entity, WireEntity>,
    next_wire: WireEntity,
    players: AHashMap<PlayerId, PlayerState>,
    component_filters: AHashMap<ComponentId, Option<PlayerFilter>>,
    callbacks: Vec<ReplicationCallback>,
    stats: ServerStats,
}

impl Server {
    pub fn new(registry: Arc<Registry>, config: ReplicationConfig) -> Self {
        Self {
            registry,
            config,
            tracker: ChangeTracker::new(),
            storage: AHashMap::new(),
            server_ids: AHashMap::new(),
            next_wire: 1,
            players: AHashMap::new(),
            component_filters: AHashMap::new(),
            callbacks: Vec::new(),
            stats: ServerStats::default(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Starts tracking every entity already networked in `world`.
    pub fn init<W: EntityStore + ?Sized>(&mut self, world: &mut W) {
        for (entity, filter) in world.networked() {
            self.tracker
                .observe(&self.registry, MutationEvent::Networked { entity, filter });
        }
        self.ingest(world);
        log::debug!("server tracking {} networked entities", self.server_ids.len());
    }

    /// Drops all replication state. Wire ids are still never reused.
    pub fn destroy(&mut self) {
        self.tracker.clear();
        self.storage.clear();
        self.server_ids.clear();
        self.players.clear();
        self.component_filters.clear();
    }

    /// Feeds one mutation to the tracker directly, for stores without an event queue.
    pub fn track(&mut self, event: MutationEvent) {
        let entity = event.entity();
        let networked = matches!(event, MutationEvent::Networked { .. });
        self.tracker.observe(&self.registry, event);
        if networked {
            self.assign_wire(entity);
        }
    }

    fn ingest<W: EntityStore + ?Sized>(&mut self, world: &mut W) {
        for event in world.drain_events() {
            self.tracker.observe(&self.registry, event);
        }

        let live: Vec<Entity> = self
            .tracker
            .info()
            .entities
            .iter()
            .filter(|(_, liveness)| **liveness != Liveness::Removed)
            .map(|(entity, _)| *entity)
            .collect();
        for entity in live {
            self.assign_wire(entity);
        }
    }

    fn assign_wire(&mut self, entity: Entity) -> WireEntity {
        if let Some(wire) = self.server_ids.get(&entity) {
            return *wire;
        }
        let wire = self.next_wire;
        self.next_wire += 1;
        self.server_ids.insert(entity, wire);
        wire
    }

    pub fn wire_id(&self, entity: Entity) -> Option<WireEntity> {
        self.server_ids.get(&entity).copied()
    }

    /// Last state sent for `entity`.
    pub fn storage(&self, entity: Entity) -> Option<&EntityStorage> {
        self.storage.get(&entity)
    }

    pub fn mark_player_ready(&mut self, player: PlayerId) {
        let visibility = self.visibility_for(player);
        self.players
            .entry(player)
            .or_insert_with(|| PlayerState::new(visibility))
            .ready = true;
        log::debug!("player {} ready", player);
    }

    pub fn is_player_ready(&self, player: PlayerId) -> bool {
        self.players.get(&player).map(|state| state.ready).unwrap_or(false)
    }

    /// Ends a player's session. Returns false if the player was unknown.
    pub fn remove_player(&mut self, player: PlayerId) -> bool {
        self.players.remove(&player).is_some()
    }

    pub fn ready_players(&self) -> Vec<PlayerId> {
        let mut players: Vec<PlayerId> = self
            .players
            .iter()
            .filter(|(_, state)| state.ready)
            .map(|(player, _)| *player)
            .collect();
        players.sort_unstable();
        players
    }

    pub fn visibility(&self, player: PlayerId) -> Option<&BitMask> {
        self.players.get(&player).map(|state| &state.visibility)
    }

    /// True once `player` has been sent `entity` and not told to destroy it.
    pub fn knows(&self, player: PlayerId, entity: Entity) -> bool {
        self.players
            .get(&player)
            .map(|state| state.known.contains(&entity))
            .unwrap_or(false)
    }

    /// Overrides a component's declared player filter. `None` makes it visible to all.
    pub fn set_component_filter(
        &mut self,
        component: ComponentId,
        filter: Option<PlayerFilter>,
    ) -> Result<()> {
        if self.registry.numeric(component).is_none() {
            return Err(ReplicationError::UnknownName(component.to_string()));
        }
        self.component_filters.insert(component, filter);

        let players: Vec<PlayerId> = self.players.keys().copied().collect();
        for player in players {
            let fresh = self.visibility_for(player);
            let Some(state) = self.players.get_mut(&player) else {
                continue;
            };
            let gained = fresh.band(&state.visibility.bnot())?;
            let lost = state.visibility.band(&fresh.bnot())?;
            state.gained = state.gained.bor(&gained)?.band(&lost.bnot())?;
            state.lost = state.lost.bor(&lost)?.band(&gained.bnot())?;
            state.visibility = fresh;
        }
        Ok(())
    }

    /// Swaps in a recompacted registry and translates every player mask into it.
    pub fn rebind_registry(&mut self, registry: Arc<Registry>) {
        let old = std::mem::replace(&mut self.registry, registry);
        let capacity = self.registry.capacity();
        self.component_filters
            .retain(|id, _| self.registry.numeric(*id).is_some());

        let players: Vec<PlayerId> = self.players.keys().copied().collect();
        for player in players {
            let fresh = self.visibility_for(player);
            let Some(state) = self.players.get_mut(&player) else {
                continue;
            };
            let mut visibility = state.visibility.remap(old.ids(), self.registry.ids(), capacity);
            for (id, numeric) in self.registry.ids().iter() {
                if !old.ids().contains_key(id) && fresh.get(*numeric as usize) {
                    visibility.set(*numeric as usize);
                }
            }
            state.visibility = visibility;
            state.gained = state.gained.remap(old.ids(), self.registry.ids(), capacity);
            state.lost = state.lost.remap(old.ids(), self.registry.ids(), capacity);
        }
    }

    /// Registers a callback run after every collection.
    pub fn after_replication<F>(&mut self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callbacks.push(Arc::new(callback));
    }

    pub(crate) fn push_callback(&mut self, callback: ReplicationCallback) {
        self.callbacks.push(callback);
    }

    fn run_callbacks(&self) {
        for callback in &self.callbacks {
            callback();
        }
    }

    pub fn stats(&self) -> ServerStats {
        self.stats.clone()
    }

    fn component_filter<'a>(&'a self, info: &'a ComponentInfo) -> Option<&'a PlayerFilter> {
        match self.component_filters.get(&info.id) {
            Some(filter) => filter.as_ref(),
            None => info.filter.as_ref(),
        }
    }

    fn visibility_for(&self, player: PlayerId) -> BitMask {
        let allowed: AHashMap<ComponentId, bool> = self
            .registry
            .iter()
            .map(|info| (info.id, filter_allows(self.component_filter(info), player)))
            .collect();
        BitMask::from_set(self.registry.ids(), &allowed, self.registry.capacity())
    }

    fn entity_visible(&self, entity: Entity, player: PlayerId) -> bool {
        self.tracker
            .filter(entity)
            .map(|filter| filter_allows(filter, player))
            .unwrap_or(false)
    }

    /// Wire id of a relation target, if `player` is allowed to see it.
    fn target_wire(&self, target: Entity, player: PlayerId) -> Option<WireEntity> {
        if !self.entity_visible(target, player) {
            return None;
        }
        self.server_ids.get(&target).copied()
    }

    /// Live state of `entity` restricted to registered components.
    fn snapshot<W: EntityStore + ?Sized>(&self, world: &W, entity: Entity) -> EntityStorage {
        let mut storage = EntityStorage::default();

        for component in world.components(entity) {
            let Some(info) = self.registry.info(component) else {
                continue;
            };
            if info.categories.is_pair() {
                continue;
            }
            if info.is_tag() {
                storage.tags.insert(component);
            } else if let Some(value) = world.get(entity, component) {
                storage.values.insert(component, value);
            } else {
                log::warn!("{} on entity {} has no value", info.name, entity);
            }
        }

        for relation in world.relations(entity) {
            match self.registry.info(relation) {
                Some(info) if info.categories.is_pair() => {}
                _ => continue,
            }
            for target in world.targets(entity, relation) {
                storage.apply_pair(relation, target, true);
            }
        }

        storage
    }

    fn pair_ops(
        &self,
        relation: ComponentId,
        targets: impl Iterator<Item = Entity>,
        player: PlayerId,
        add: bool,
    ) -> Vec<Op> {
        let mut wires: Vec<WireEntity> = targets
            .filter_map(|target| self.target_wire(target, player))
            .collect();
        wires.sort_unstable();
        wires
            .into_iter()
            .map(|target| {
                if add {
                    Op::AddPair { relation, target }
                } else {
                    Op::RemovePair { relation, target }
                }
            })
            .collect()
    }

    /// Every component of `storage` allowed by `mask`, in numeric order.
    fn storage_ops(&self, storage: &EntityStorage, mask: &BitMask, player: PlayerId) -> Vec<Op> {
        let mut ops = Vec::new();

        for info in self.registry.iter() {
            if !mask.get(info.numeric as usize) {
                continue;
            }
            if info.categories.is_pair() {
                if let Some(targets) = storage.pairs.get(&info.id) {
                    ops.extend(self.pair_ops(info.id, targets.iter().copied(), player, true));
                }
            } else if storage.tags.contains(&info.id) {
                ops.push(Op::Add { component: info.id });
            } else if let Some(value) = storage.values.get(&info.id) {
                ops.push(Op::Set {
                    component: info.id,
                    value: value.clone(),
                });
            }
        }

        ops
    }

    /// Removals for every component of `storage` in `lost`.
    fn lost_ops(&self, storage: Option<&EntityStorage>, lost: &BitMask, player: PlayerId) -> Vec<Op> {
        let Some(storage) = storage else {
            return Vec::new();
        };
        let mut ops = Vec::new();

        for info in self.registry.iter() {
            if !lost.get(info.numeric as usize) {
                continue;
            }
            if info.categories.is_pair() {
                if let Some(targets) = storage.pairs.get(&info.id) {
                    ops.extend(self.pair_ops(info.id, targets.iter().copied(), player, false));
                }
            } else if storage.has(info.id) {
                ops.push(Op::Remove { component: info.id });
            }
        }

        ops
    }

    /// Ops that turn `old` into `new` for the components in `mask`.
    fn diff_ops(
        &self,
        old: &EntityStorage,
        new: &EntityStorage,
        mask: &BitMask,
        player: PlayerId,
    ) -> Vec<Op> {
        let mut ops = Vec::new();

        for info in self.registry.iter() {
            if !mask.get(info.numeric as usize) {
                continue;
            }
            let id = info.id;

            if info.categories.is_pair() {
                let empty = AHashSet::new();
                let before = old.pairs.get(&id).unwrap_or(&empty);
                let after = new.pairs.get(&id).unwrap_or(&empty);
                ops.extend(self.pair_ops(id, after.difference(before).copied(), player, true));
                ops.extend(self.pair_ops(id, before.difference(after).copied(), player, false));
                continue;
            }

            let was = old.has(id);
            if info.is_tag() {
                let now = new.tags.contains(&id);
                if now && !was {
                    ops.push(Op::Add { component: id });
                } else if was && !now {
                    ops.push(Op::Remove { component: id });
                }
                continue;
            }

            match new.values.get(&id) {
                Some(value) if old.values.get(&id) != Some(value) => ops.push(Op::Set {
                    component: id,
                    value: value.clone(),
                }),
                Some(_) => {}
                None if was => ops.push(Op::Remove { component: id }),
                None => {}
            }
        }

        ops
    }

    /// Ops for the tracked changes of a known entity.
    fn change_ops(
        &self,
        entity: Entity,
        info: &TrackInfo,
        storage: Option<&EntityStorage>,
        mask: &BitMask,
        player: PlayerId,
    ) -> Vec<Op> {
        let empty = EntityStorage::default();
        let storage = storage.unwrap_or(&empty);
        let mut ops = Vec::new();

        if let Some(changes) = info.components.get(&entity) {
            let mut changes: Vec<(u32, ComponentId, &Change)> = changes
                .iter()
                .filter_map(|(id, change)| {
                    self.registry
                        .numeric(*id)
                        .map(|numeric| (numeric, *id, change))
                })
                .filter(|(numeric, _, _)| mask.get(*numeric as usize))
                .collect();
            changes.sort_unstable_by_key(|(numeric, _, _)| *numeric);

            for (_, component, change) in changes {
                match change {
                    Change::Set(value) => {
                        if self.config.suppress_unchanged && storage.values.get(&component) == Some(value) {
                            continue;
                        }
                        ops.push(Op::Set {
                            component,
                            value: value.clone(),
                        });
                    }
                    Change::Added => {
                        if !storage.tags.contains(&component) {
                            ops.push(Op::Add { component });
                        }
                    }
                    Change::Removed => {
                        if storage.has(component) {
                            ops.push(Op::Remove { component });
                        }
                    }
                }
            }
        }

        if let Some(pairs) = info.pairs.get(&entity) {
            let mut pair_ops: Vec<(u32, WireEntity, Op)> = Vec::new();
            for ((relation, target), present) in pairs {
                let Some(numeric) = self.registry.numeric(*relation) else {
                    continue;
                };
                if !mask.get(numeric as usize) {
                    continue;
                }
                let Some(wire) = self.target_wire(*target, player) else {
                    continue;
                };
                let had = storage.has_pair(*relation, *target);
                if *present && !had {
                    pair_ops.push((numeric, wire, Op::AddPair { relation: *relation, target: wire }));
                } else if !*present && had {
                    pair_ops.push((numeric, wire, Op::RemovePair { relation: *relation, target: wire }));
                }
            }
            pair_ops.sort_unstable_by_key(|(numeric, wire, _)| (*numeric, *wire));
            ops.extend(pair_ops.into_iter().map(|(_, _, op)| op));
        }

        ops
    }

    fn player_updates<W: EntityStore + ?Sized>(
        &self,
        player: PlayerId,
        state: &PlayerState,
        info: &TrackInfo,
        touched: &[(WireEntity, Entity)],
        snapshots: &AHashMap<Entity, EntityStorage>,
        world: &W,
    ) -> PlayerDiff {
        let mut diff = PlayerDiff::default();
        let mut records: BTreeMap<WireEntity, EntityRecord> = BTreeMap::new();
        let change_mask = and_not(&state.visibility, &state.gained);

        if !state.gained.is_empty() || !state.lost.is_empty() {
            for entity in &state.known {
                if info.entities.get(entity) == Some(&Liveness::Removed)
                    || !self.entity_visible(*entity, player)
                {
                    continue;
                }
                let Some(wire) = self.server_ids.get(entity).copied() else {
                    continue;
                };

                let mut ops = Vec::new();
                if !state.gained.is_empty() {
                    let live = self.snapshot(world, *entity);
                    ops.extend(self.storage_ops(&live, &state.gained, player));
                }
                ops.extend(self.lost_ops(self.storage.get(entity), &state.lost, player));

                if !ops.is_empty() {
                    records
                        .entry(wire)
                        .or_insert_with(|| EntityRecord::new(wire))
                        .ops
                        .extend(ops);
                }
            }
        }

        for (wire, entity) in touched {
            let (wire, entity) = (*wire, *entity);
            let known = state.known.contains(&entity);
            let liveness = info.entities.get(&entity);

            if liveness == Some(&Liveness::Removed) || !self.entity_visible(entity, player) {
                if known {
                    records.insert(wire, EntityRecord::destroy(wire));
                    diff.forgotten.push(entity);
                }
                continue;
            }

            if !known {
                let ops = match snapshots.get(&entity) {
                    Some(snapshot) => self.storage_ops(snapshot, &state.visibility, player),
                    None => self.storage_ops(&self.snapshot(world, entity), &state.visibility, player),
                };
                records
                    .entry(wire)
                    .or_insert_with(|| EntityRecord::new(wire))
                    .ops
                    .extend(ops);
                diff.learned.push(entity);
                continue;
            }

            // A known entity that was re-networked this tick is diffed against
            // its old baseline; one only seen through a full snapshot has none.
            let rebased = match (liveness, self.storage.get(&entity), snapshots.get(&entity)) {
                (Some(Liveness::Created), Some(old), Some(snapshot)) => {
                    Some(self.diff_ops(old, snapshot, &change_mask, player))
                }
                _ => None,
            };
            let ops = if let Some(ops) = rebased {
                ops
            } else {
                self.change_ops(entity, info, self.storage.get(&entity), &change_mask, player)
            };

            if !ops.is_empty() {
                records
                    .entry(wire)
                    .or_insert_with(|| EntityRecord::new(wire))
                    .ops
                    .extend(ops);
            }
        }

        if !diff.learned.is_empty() {
            let learned: AHashSet<Entity> = diff.learned.iter().copied().collect();
            for (wire, op) in self.inbound_pairs(player, state, &learned, info, world) {
                let record = records.entry(wire).or_insert_with(|| EntityRecord::new(wire));
                if !record.is_destroy() && !record.ops.contains(&op) {
                    record.ops.push(op);
                }
            }
        }

        diff.records = records.into_values().collect();
        diff
    }

    /// Relations held by entities `player` already knows that point at an
    /// entity it learns this tick. The baseline records them even while the
    /// target was hidden, so they are sent here.
    fn inbound_pairs<W: EntityStore + ?Sized>(
        &self,
        player: PlayerId,
        state: &PlayerState,
        learned: &AHashSet<Entity>,
        info: &TrackInfo,
        world: &W,
    ) -> Vec<(WireEntity, Op)> {
        let mut sources: Vec<(WireEntity, Entity)> = state
            .known
            .iter()
            .filter(|source| !learned.contains(*source))
            .filter(|source| info.entities.get(*source) != Some(&Liveness::Removed))
            .filter(|source| self.entity_visible(**source, player))
            .filter_map(|source| self.server_ids.get(source).map(|wire| (*wire, *source)))
            .collect();
        sources.sort_unstable();

        let mut ops = Vec::new();
        for (wire, source) in sources {
            let mut relations: Vec<(u32, ComponentId)> = world
                .relations(source)
                .into_iter()
                .filter_map(|relation| {
                    let component = self.registry.info(relation)?;
                    (component.categories.is_pair()
                        && state.visibility.get(component.numeric as usize))
                    .then_some((component.numeric, relation))
                })
                .collect();
            relations.sort_unstable();

            for (_, relation) in relations {
                let targets = world
                    .targets(source, relation)
                    .into_iter()
                    .filter(|target| learned.contains(target));
                ops.extend(
                    self.pair_ops(relation, targets, player, true)
                        .into_iter()
                        .map(|op| (wire, op)),
                );
            }
        }
        ops
    }

    fn commit(&mut self, info: TrackInfo, mut snapshots: AHashMap<Entity, EntityStorage>) {
        for (entity, liveness) in &info.entities {
            match liveness {
                Liveness::Removed => {
                    self.storage.remove(entity);
                    self.server_ids.remove(entity);
                    for storage in self.storage.values_mut() {
                        storage.forget_target(*entity);
                    }
                    for state in self.players.values_mut() {
                        state.known.remove(entity);
                    }
                }
                Liveness::Created => {
                    let snapshot = snapshots.remove(entity).unwrap_or_default();
                    self.storage.insert(*entity, snapshot);
                }
                Liveness::Refiltered => {}
            }
        }

        let settled = |entity: &Entity| {
            !matches!(
                info.entities.get(entity),
                Some(Liveness::Created) | Some(Liveness::Removed)
            )
        };

        for (entity, changes) in &info.components {
            if !settled(entity) {
                continue;
            }
            let storage = self.storage.entry(*entity).or_default();
            for (component, change) in changes {
                storage.apply(*component, change);
            }
        }

        for (entity, pairs) in &info.pairs {
            if !settled(entity) {
                continue;
            }
            let storage = self.storage.entry(*entity).or_default();
            for ((relation, target), present) in pairs {
                storage.apply_pair(*relation, *target, *present);
            }
        }
    }

    fn encode(&mut self, records: &[EntityRecord]) -> Payload {
        let mut writer = PayloadWriter::new(&self.registry, self.config.initial_buffer_capacity);
        for record in records {
            writer.write_record(record);
        }
        let dropped = writer.dropped();
        let payload = writer.finish();

        self.stats.encode_errors += dropped as u64;
        self.stats.payloads += 1;
        self.stats.bytes += payload.len() as u64;
        payload
    }

    /// Reliable flush: creations, removals and reliable component changes.
    pub fn collect_updates<W: EntityStore + ?Sized>(&mut self, world: &mut W) -> Outgoing {
        self.ingest(world);
        let info = self.tracker.take_reliable();
        let world: &W = world;

        let mut touched: Vec<(WireEntity, Entity)> = info
            .touched()
            .into_iter()
            .filter_map(|entity| self.server_ids.get(&entity).map(|wire| (*wire, entity)))
            .collect();
        touched.sort_unstable();

        let players = self.ready_players();
        let mut snapshots = AHashMap::new();
        for (_, entity) in &touched {
            let needs_snapshot = match info.entities.get(entity) {
                Some(Liveness::Removed) => false,
                Some(_) => true,
                None => players.iter().any(|player| {
                    self.entity_visible(*entity, *player) && !self.knows(*player, *entity)
                }),
            };
            if needs_snapshot {
                snapshots.insert(*entity, self.snapshot(world, *entity));
            }
        }

        let mut diffs = Vec::with_capacity(players.len());
        for player in &players {
            let Some(state) = self.players.get(player) else {
                continue;
            };
            let diff = self.player_updates(*player, state, &info, &touched, &snapshots, world);
            diffs.push((*player, diff));
        }

        let mut out = Vec::new();
        for (player, diff) in diffs {
            if let Some(state) = self.players.get_mut(&player) {
                state.known.extend(diff.learned.iter().copied());
                for entity in &diff.forgotten {
                    state.known.remove(entity);
                }
                state.reset_pending();
            }

            if diff.records.is_empty() {
                continue;
            }
            let payload = self.encode(&diff.records);
            debug::trace_collect(PayloadKind::Updates, player, &diff.records, &payload);
            out.push(OutgoingPayload {
                player,
                kind: PayloadKind::Updates,
                payload,
            });
        }

        for liveness in info.entities.values() {
            match liveness {
                Liveness::Created => self.stats.entities_created += 1,
                Liveness::Removed => self.stats.entities_removed += 1,
                Liveness::Refiltered => {}
            }
        }
        self.commit(info, snapshots);
        self.stats.ticks += 1;
        self.run_callbacks();

        Outgoing::new(out)
    }

    /// Unreliable flush: the latest value of every unreliable component changed
    /// since the previous call, for entities the player already knows.
    pub fn collect_unreliable<W: EntityStore + ?Sized>(&mut self, world: &mut W) -> Outgoing {
        self.ingest(world);
        let values = self.tracker.take_unreliable();

        let mut entities: Vec<(WireEntity, Entity)> = values
            .keys()
            .filter_map(|entity| self.server_ids.get(entity).map(|wire| (*wire, *entity)))
            .collect();
        entities.sort_unstable();

        let mut out = Vec::new();
        for player in self.ready_players() {
            let Some(state) = self.players.get(&player) else {
                continue;
            };
            let mask = match state.visibility.band(self.registry.unreliable_mask()) {
                Ok(mask) => mask,
                Err(e) => {
                    log::error!("unreliable mask for player {}: {}", player, e);
                    continue;
                }
            };

            let mut records = Vec::new();
            for (wire, entity) in &entities {
                if !state.known.contains(entity) || !self.entity_visible(*entity, player) {
                    continue;
                }
                let Some(components) = values.get(entity) else {
                    continue;
                };
                let mut sets: Vec<(u32, Op)> = components
                    .iter()
                    .filter_map(|(component, value)| {
                        let numeric = self.registry.numeric(*component)?;
                        mask.get(numeric as usize).then(|| {
                            (
                                numeric,
                                Op::Set {
                                    component: *component,
                                    value: value.clone(),
                                },
                            )
                        })
                    })
                    .collect();
                if sets.is_empty() {
                    continue;
                }
                sets.sort_unstable_by_key(|(numeric, _)| *numeric);
                records.push(EntityRecord {
                    entity: *wire,
                    ops: sets.into_iter().map(|(_, op)| op).collect(),
                });
            }

            if records.is_empty() {
                continue;
            }
            let payload = self.encode(&records);
            debug::trace_collect(PayloadKind::Unreliable, player, &records, &payload);
            out.push(OutgoingPayload {
                player,
                kind: PayloadKind::Unreliable,
                payload,
            });
        }

        for (entity, components) in values {
            if let Some(storage) = self.storage.get_mut(&entity) {
                storage.values.extend(components);
            }
        }
        self.run_callbacks();

        Outgoing::new(out)
    }

    /// Every live networked entity visible to `player`, unconditionally.
    ///
    /// Afterwards the player counts as knowing exactly those entities, so the
    /// next reliable flush only carries diffs.
    pub fn get_full<W: EntityStore + ?Sized>(&mut self, player: PlayerId, world: &mut W) -> Payload {
        self.ingest(world);
        let world: &W = world;

        let visibility = self.visibility_for(player);
        let state = self
            .players
            .entry(player)
            .or_insert_with(|| PlayerState::new(visibility));
        if !state.ready && self.config.warn_unready {
            log::warn!("full snapshot requested for unready player {}", player);
        }
        let mask = state.visibility.clone();

        let mut entities: Vec<(WireEntity, Entity)> = self
            .tracker
            .networked()
            .filter(|entity| self.entity_visible(*entity, player))
            .filter_map(|entity| self.server_ids.get(&entity).map(|wire| (*wire, entity)))
            .collect();
        entities.sort_unstable();

        let records: Vec<EntityRecord> = entities
            .iter()
            .map(|(wire, entity)| EntityRecord {
                entity: *wire,
                ops: self.storage_ops(&self.snapshot(world, *entity), &mask, player),
            })
            .collect();

        if let Some(state) = self.players.get_mut(&player) {
            state.known = entities.iter().map(|(_, entity)| *entity).collect();
            state.reset_pending();
        }

        let payload = self.encode(&records);
        debug::trace_collect(PayloadKind::Full, player, &records, &payload);
        self.run_callbacks();
        payload
    }
}
