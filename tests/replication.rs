use replecs::{
    create, BinaryFormat, ComponentDecl, ComponentId, Entity, EntityStore, Envelope, FormatSerdes,
    MemoryTransport, MemoryWorld, OutgoingPayload, PayloadKind, PlayerFilter, Primitive, Registry,
    Replecs, ReplicationConfig, Transport, Value,
};
use std::sync::Arc;

struct Components {
    health: ComponentId,
    position: ComponentId,
    name: ComponentId,
    handle: ComponentId,
    frozen: ComponentId,
    secret: ComponentId,
    owner_id: ComponentId,
    child_of: ComponentId,
}

fn registry() -> (Arc<Registry>, Components) {
    let mut builder = Registry::builder();
    let health = builder.register(ComponentDecl::new("Health").reliable().primitive(Primitive::U16));
    let position = builder.register(ComponentDecl::new("Position").unreliable().primitive(Primitive::F32));
    let name = builder.register(
        ComponentDecl::new("Name").serdes(FormatSerdes::new(BinaryFormat::MessagePack)),
    );
    let handle = builder.register(ComponentDecl::new("Handle").variant());
    let frozen = builder.register(ComponentDecl::new("Frozen").tag());

    let mut only_two = PlayerFilter::new();
    only_two.insert(2, true);
    let secret = builder.register(
        ComponentDecl::new("Secret").primitive(Primitive::I32).filter(only_two),
    );
    let owner_id = builder.register(
        ComponentDecl::new("OwnerId")
            .primitive(Primitive::U32)
            .custom_id(|value| match value {
                Value::U32(id) => Some(*id as u64),
                _ => None,
            }),
    );
    let child_of = builder.register(ComponentDecl::new("ChildOf").pair());

    let components = Components {
        health,
        position,
        name,
        handle,
        frozen,
        secret,
        owner_id,
        child_of,
    };
    (Arc::new(builder.build().unwrap()), components)
}

fn apply(replecs: &mut Replecs, world: &mut MemoryWorld, out: &OutgoingPayload) {
    replecs
        .deliver(&Envelope::from_outgoing(out), world)
        .unwrap();
}

fn for_player(out: &[OutgoingPayload], player: u64) -> Option<&OutgoingPayload> {
    out.iter().find(|o| o.player == player)
}

#[test]
fn test_create_then_change_sends_only_the_change() {
    let (registry, c) = registry();
    let mut replecs = create(registry, ReplicationConfig::default());
    let mut server_world = MemoryWorld::new();
    let mut client_world = MemoryWorld::untracked();
    replecs.server.mark_player_ready(1);

    let e = server_world.spawn();
    server_world.set(e, c.health, Value::U16(5));
    server_world.set(e, c.name, Value::String("orc".to_string()));
    server_world.set_networked(e, None);

    let out: Vec<_> = replecs.server.collect_updates(&mut server_world).collect();
    assert_eq!(out.len(), 1);
    apply(&mut replecs, &mut client_world, &out[0]);

    let wire = replecs.server.wire_id(e).unwrap();
    let local = replecs.client.entity(wire).unwrap();
    assert_eq!(client_world.get(local, c.health), Some(Value::U16(5)));
    assert_eq!(client_world.get(local, c.name), Some(Value::String("orc".to_string())));

    server_world.set(e, c.health, Value::U16(7));
    let out: Vec<_> = replecs.server.collect_updates(&mut server_world).collect();
    let full_size = out[0].payload.len();
    // count, entity, op count, nid, two value bytes
    assert_eq!(full_size, 6);
    apply(&mut replecs, &mut client_world, &out[0]);

    assert_eq!(client_world.get(local, c.health), Some(Value::U16(7)));
    assert_eq!(client_world.get(local, c.name), Some(Value::String("orc".to_string())));
    assert_eq!(client_world.len(), 1);
}

#[test]
fn test_untouched_entities_produce_nothing() {
    let (registry, c) = registry();
    let mut replecs = create(registry, ReplicationConfig::default());
    let mut server_world = MemoryWorld::new();
    replecs.server.mark_player_ready(1);
    replecs.server.mark_player_ready(2);

    let a = server_world.spawn();
    let b = server_world.spawn();
    server_world.set(a, c.health, Value::U16(1));
    server_world.set(b, c.health, Value::U16(2));
    server_world.set_networked(a, None);
    server_world.set_networked(b, None);
    replecs.server.collect_updates(&mut server_world).for_each(drop);

    server_world.set(a, c.health, Value::U16(3));
    let wire_b = replecs.server.wire_id(b).unwrap();
    for out in replecs.server.collect_updates(&mut server_world) {
        let records = replecs::decode_payload(
            replecs.server.registry(),
            &out.payload.bytes,
            &out.payload.variants,
        )
        .unwrap();
        assert!(records.iter().all(|r| r.entity != wire_b));
    }
}

#[test]
fn test_filtered_component_never_reaches_excluded_player() {
    let (registry, c) = registry();
    let mut replecs = create(registry, ReplicationConfig::default());
    let mut server_world = MemoryWorld::new();
    let mut one = MemoryWorld::untracked();
    let mut two = MemoryWorld::untracked();
    let mut client_two = replecs::create_client(replecs.server.registry().clone(), ReplicationConfig::default());
    replecs.server.mark_player_ready(1);
    replecs.server.mark_player_ready(2);

    let e = server_world.spawn();
    server_world.set(e, c.secret, Value::I32(-9));
    server_world.set(e, c.health, Value::U16(10));
    server_world.set_networked(e, None);

    let out: Vec<_> = replecs.server.collect_updates(&mut server_world).collect();
    apply(&mut replecs, &mut one, for_player(&out, 1).unwrap());
    let to_two = for_player(&out, 2).unwrap();
    client_two
        .apply_updates(&mut two, &to_two.payload.bytes, &to_two.payload.variants)
        .unwrap();

    let wire = replecs.server.wire_id(e).unwrap();
    let local_one = replecs.client.entity(wire).unwrap();
    let local_two = client_two.entity(wire).unwrap();
    assert!(!one.has(local_one, c.secret));
    assert_eq!(two.get(local_two, c.secret), Some(Value::I32(-9)));

    server_world.set(e, c.secret, Value::I32(4));
    let out: Vec<_> = replecs.server.collect_updates(&mut server_world).collect();
    assert!(for_player(&out, 1).is_none());
    assert!(for_player(&out, 2).is_some());
}

#[test]
fn test_unreliable_latest_value_wins() {
    let (registry, c) = registry();
    let mut replecs = create(registry, ReplicationConfig::default());
    let mut server_world = MemoryWorld::new();
    let mut client_world = MemoryWorld::untracked();
    replecs.server.mark_player_ready(1);

    let e = server_world.spawn();
    server_world.set_networked(e, None);
    let out: Vec<_> = replecs.server.collect_updates(&mut server_world).collect();
    apply(&mut replecs, &mut client_world, &out[0]);

    server_world.set(e, c.position, Value::F32(1.0));
    server_world.set(e, c.position, Value::F32(2.5));
    let out: Vec<_> = replecs.server.collect_unreliable(&mut server_world).collect();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].kind, PayloadKind::Unreliable);
    // count, entity, op count, nid, four value bytes
    assert_eq!(out[0].payload.len(), 8);
    apply(&mut replecs, &mut client_world, &out[0]);

    let local = replecs.client.entity(replecs.server.wire_id(e).unwrap()).unwrap();
    assert_eq!(client_world.get(local, c.position), Some(Value::F32(2.5)));
}

#[test]
fn test_full_snapshot_reconstructs_visible_state() {
    let (registry, c) = registry();
    let mut replecs = create(registry, ReplicationConfig::default());
    let mut server_world = MemoryWorld::new();
    let mut client_world = MemoryWorld::untracked();

    let parent = server_world.spawn();
    server_world.set(parent, c.health, Value::U16(100));
    server_world.set(parent, c.handle, Value::Array(vec![Value::U8(1), Value::U8(2)]));
    server_world.add(parent, c.frozen);
    server_world.set_networked(parent, None);

    let child = server_world.spawn();
    server_world.set(child, c.position, Value::F32(-1.5));
    server_world.set(child, c.secret, Value::I32(3));
    server_world.add_pair(child, c.child_of, parent);
    server_world.set_networked(child, None);

    let mut nobody = PlayerFilter::new();
    nobody.insert(1, false);
    let hidden = server_world.spawn();
    server_world.set(hidden, c.health, Value::U16(1));
    server_world.set_networked(hidden, Some(nobody));

    let unnetworked = server_world.spawn();
    server_world.set(unnetworked, c.health, Value::U16(2));

    let full = replecs.server.get_full(1, &mut server_world);
    replecs
        .client
        .apply_full(&mut client_world, &full.bytes, &full.variants)
        .unwrap();

    assert_eq!(client_world.len(), 2);
    let local = |entity: Entity| {
        replecs
            .client
            .entity(replecs.server.wire_id(entity).unwrap())
            .unwrap()
    };
    let (p, ch) = (local(parent), local(child));

    assert_eq!(client_world.get(p, c.health), Some(Value::U16(100)));
    assert_eq!(
        client_world.get(p, c.handle),
        Some(Value::Array(vec![Value::U8(1), Value::U8(2)]))
    );
    assert!(client_world.has(p, c.frozen));
    assert_eq!(client_world.get(ch, c.position), Some(Value::F32(-1.5)));
    assert!(!client_world.has(ch, c.secret));
    assert_eq!(client_world.targets(ch, c.child_of), vec![p]);
}

#[test]
fn test_removals_and_destroys() {
    let (registry, c) = registry();
    let mut replecs = create(registry, ReplicationConfig::default());
    let mut server_world = MemoryWorld::new();
    let mut client_world = MemoryWorld::untracked();
    replecs.server.mark_player_ready(1);

    let parent = server_world.spawn();
    let child = server_world.spawn();
    server_world.add(child, c.frozen);
    server_world.set(child, c.health, Value::U16(3));
    server_world.set_networked(parent, None);
    server_world.set_networked(child, None);
    server_world.add_pair(child, c.child_of, parent);

    let out: Vec<_> = replecs.server.collect_updates(&mut server_world).collect();
    apply(&mut replecs, &mut client_world, &out[0]);
    let p = replecs.client.entity(replecs.server.wire_id(parent).unwrap()).unwrap();
    let ch = replecs.client.entity(replecs.server.wire_id(child).unwrap()).unwrap();
    assert_eq!(client_world.targets(ch, c.child_of), vec![p]);

    server_world.remove(child, c.frozen);
    server_world.remove_pair(child, c.child_of, parent);
    let out: Vec<_> = replecs.server.collect_updates(&mut server_world).collect();
    apply(&mut replecs, &mut client_world, &out[0]);
    assert!(!client_world.has(ch, c.frozen));
    assert!(client_world.targets(ch, c.child_of).is_empty());
    assert_eq!(client_world.get(ch, c.health), Some(Value::U16(3)));

    server_world.despawn(parent);
    let out: Vec<_> = replecs.server.collect_updates(&mut server_world).collect();
    apply(&mut replecs, &mut client_world, &out[0]);
    assert!(!client_world.contains(p));
    assert!(client_world.contains(ch));
    assert_eq!(replecs.client.stats().entities_removed, 1);
}

#[test]
fn test_relation_follows_target_that_becomes_visible() {
    let (registry, c) = registry();
    let mut replecs = create(registry, ReplicationConfig::default());
    let mut server_world = MemoryWorld::new();
    let mut client_world = MemoryWorld::untracked();
    replecs.server.mark_player_ready(1);

    let mut only_two = PlayerFilter::new();
    only_two.insert(2, true);
    let parent = server_world.spawn();
    server_world.set(parent, c.health, Value::U16(9));
    server_world.set_networked(parent, Some(only_two));

    let child = server_world.spawn();
    server_world.set(child, c.health, Value::U16(1));
    server_world.set_networked(child, None);
    server_world.add_pair(child, c.child_of, parent);

    let out: Vec<_> = replecs.server.collect_updates(&mut server_world).collect();
    apply(&mut replecs, &mut client_world, &out[0]);
    let ch = replecs.client.entity(replecs.server.wire_id(child).unwrap()).unwrap();
    assert_eq!(client_world.len(), 1);
    assert!(client_world.targets(ch, c.child_of).is_empty());

    server_world.set_networked(parent, None);
    let out: Vec<_> = replecs.server.collect_updates(&mut server_world).collect();
    apply(&mut replecs, &mut client_world, &out[0]);

    let p = replecs.client.entity(replecs.server.wire_id(parent).unwrap()).unwrap();
    assert_eq!(client_world.get(p, c.health), Some(Value::U16(9)));
    assert_eq!(client_world.targets(ch, c.child_of), vec![p]);

    // Nothing changed, so the relation is not announced twice.
    assert_eq!(replecs.server.collect_updates(&mut server_world).count(), 0);
}

#[test]
fn test_relation_follows_target_networked_later() {
    let (registry, c) = registry();
    let mut replecs = create(registry, ReplicationConfig::default());
    let mut server_world = MemoryWorld::new();
    let mut client_world = MemoryWorld::untracked();
    replecs.server.mark_player_ready(1);
    replecs.server.mark_player_ready(2);

    let child = server_world.spawn();
    server_world.set(child, c.health, Value::U16(1));
    server_world.set_networked(child, None);
    let out: Vec<_> = replecs.server.collect_updates(&mut server_world).collect();
    apply(&mut replecs, &mut client_world, for_player(&out, 1).unwrap());

    let parent = server_world.spawn();
    server_world.set(parent, c.health, Value::U16(4));
    server_world.add_pair(child, c.child_of, parent);
    assert_eq!(replecs.server.collect_updates(&mut server_world).count(), 0);

    let mut only_one = PlayerFilter::new();
    only_one.insert(1, true);
    server_world.set_networked(parent, Some(only_one));
    let out: Vec<_> = replecs.server.collect_updates(&mut server_world).collect();
    assert!(for_player(&out, 2).is_none());
    apply(&mut replecs, &mut client_world, for_player(&out, 1).unwrap());

    let ch = replecs.client.entity(replecs.server.wire_id(child).unwrap()).unwrap();
    let p = replecs.client.entity(replecs.server.wire_id(parent).unwrap()).unwrap();
    assert_eq!(client_world.targets(ch, c.child_of), vec![p]);

    let mut fresh = MemoryWorld::untracked();
    let mut rejoined = create(replecs.server.registry().clone(), ReplicationConfig::default());
    let full = replecs.server.get_full(1, &mut server_world);
    rejoined
        .client
        .apply_full(&mut fresh, &full.bytes, &full.variants)
        .unwrap();
    let fresh_child = rejoined.client.entity(replecs.server.wire_id(child).unwrap()).unwrap();
    let fresh_parent = rejoined.client.entity(replecs.server.wire_id(parent).unwrap()).unwrap();
    assert_eq!(fresh.targets(fresh_child, c.child_of), vec![fresh_parent]);
}

#[test]
fn test_custom_id_matches_existing_local_entity() {
    let (registry, c) = registry();
    let mut replecs = create(registry, ReplicationConfig::default());
    let mut server_world = MemoryWorld::new();
    let mut client_world = MemoryWorld::untracked();
    replecs.server.mark_player_ready(1);

    let me = client_world.spawn();
    client_world.set(me, c.owner_id, Value::U32(77));
    replecs.client.claim(c.owner_id, 77, me);

    let avatar = server_world.spawn();
    server_world.set(avatar, c.owner_id, Value::U32(77));
    server_world.set(avatar, c.health, Value::U16(50));
    server_world.set_networked(avatar, None);

    let out: Vec<_> = replecs.server.collect_updates(&mut server_world).collect();
    apply(&mut replecs, &mut client_world, &out[0]);

    assert_eq!(client_world.len(), 1);
    assert_eq!(client_world.get(me, c.health), Some(Value::U16(50)));
}

#[test]
fn test_envelopes_over_memory_transport() {
    let (registry, c) = registry();
    let mut replecs = create(registry, ReplicationConfig::default());
    let mut server_world = MemoryWorld::new();
    let mut client_world = MemoryWorld::untracked();
    let (mut server_end, mut client_end) = MemoryTransport::create_pair(BinaryFormat::Bincode).unwrap();
    replecs.server.mark_player_ready(1);

    let e = server_world.spawn();
    server_world.set(e, c.handle, Value::String("texture://grass".to_string()));
    server_world.set(e, c.position, Value::F32(0.5));
    server_world.set_networked(e, None);

    for out in replecs.server.collect_updates(&mut server_world) {
        server_end.send(&Envelope::from_outgoing(&out)).unwrap();
    }
    server_world.set(e, c.position, Value::F32(0.75));
    for out in replecs.server.collect_unreliable(&mut server_world) {
        server_end.send(&Envelope::from_outgoing(&out)).unwrap();
    }

    while let Some(envelope) = client_end.receive().unwrap() {
        replecs.deliver(&envelope, &mut client_world).unwrap();
    }

    let local = replecs.client.entity(replecs.server.wire_id(e).unwrap()).unwrap();
    assert_eq!(
        client_world.get(local, c.handle),
        Some(Value::String("texture://grass".to_string()))
    );
    assert_eq!(client_world.get(local, c.position), Some(Value::F32(0.75)));
}

#[test]
fn test_rebound_registry_keeps_both_sides_in_step() {
    let (registry, c) = registry();
    let mut replecs = create(registry.clone(), ReplicationConfig::default());
    let mut server_world = MemoryWorld::new();
    let mut client_world = MemoryWorld::untracked();
    replecs.server.mark_player_ready(1);

    let e = server_world.spawn();
    server_world.set(e, c.health, Value::U16(1));
    server_world.set_networked(e, None);
    let out: Vec<_> = replecs.server.collect_updates(&mut server_world).collect();
    apply(&mut replecs, &mut client_world, &out[0]);

    let smaller = Arc::new(registry.without(c.name).unwrap());
    replecs.server.rebind_registry(smaller.clone());
    replecs.client.rebind_registry(smaller);

    server_world.set(e, c.health, Value::U16(2));
    server_world.add(e, c.frozen);
    let out: Vec<_> = replecs.server.collect_updates(&mut server_world).collect();
    apply(&mut replecs, &mut client_world, &out[0]);

    let local = replecs.client.entity(replecs.server.wire_id(e).unwrap()).unwrap();
    assert_eq!(client_world.get(local, c.health), Some(Value::U16(2)));
    assert!(client_world.has(local, c.frozen));
}
