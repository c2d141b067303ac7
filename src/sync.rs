use crate::client::Client;
use crate::error::Result;
use crate::protocol::{PayloadKind, Value};
use crate::registry::Registry;
use crate::server::Server;
use crate::transport::Envelope;
use crate::world::EntityStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Post-replication hook, shared between a server and a client.
pub type ReplicationCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Destroys and removals naming unknown entities fail the payload.
    pub strict: bool,
    /// Resolve every created entity before applying any op of a payload.
    pub ordered_creation: bool,
    pub initial_buffer_capacity: usize,
    /// Reliable diffs skip values equal to the last sent one.
    pub suppress_unchanged: bool,
    pub warn_unready: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            strict: true,
            ordered_creation: true,
            initial_buffer_capacity: 64,
            suppress_unchanged: true,
            warn_unready: true,
        }
    }
}

impl ReplicationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_ordered_creation(mut self, enabled: bool) -> Self {
        self.ordered_creation = enabled;
        self
    }

    pub fn with_initial_buffer_capacity(mut self, capacity: usize) -> Self {
        self.initial_buffer_capacity = capacity;
        self
    }

    pub fn with_suppress_unchanged(mut self, enabled: bool) -> Self {
        self.suppress_unchanged = enabled;
        self
    }

    pub fn with_warn_unready(mut self, enabled: bool) -> Self {
        self.warn_unready = enabled;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServerStats {
    /// Reliable collections run.
    pub ticks: u64,
    pub payloads: u64,
    pub bytes: u64,
    pub entities_created: u64,
    pub entities_removed: u64,
    /// Component entries dropped because they failed to encode.
    pub encode_errors: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClientStats {
    pub applied: u64,
    pub bytes: u64,
    pub errors: u64,
    pub entities_created: u64,
    pub entities_removed: u64,
}

/// A server and a client built over the same registry, with shared hooks.
pub struct Replecs {
    pub server: Server,
    pub client: Client,
}

impl Replecs {
    /// Registers `callback` on both sides.
    pub fn after_replication<F>(&mut self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let callback: ReplicationCallback = Arc::new(callback);
        self.server.push_callback(callback.clone());
        self.client.push_callback(callback);
    }

    /// Applies a received envelope with the matching client entry point.
    pub fn deliver<W: EntityStore + ?Sized>(&mut self, envelope: &Envelope, world: &mut W) -> Result<()> {
        deliver(&mut self.client, envelope, world)
    }
}

pub fn deliver<W: EntityStore + ?Sized>(
    client: &mut Client,
    envelope: &Envelope,
    world: &mut W,
) -> Result<()> {
    let variants: &[Value] = &envelope.variants;
    match envelope.kind {
        PayloadKind::Full => client.apply_full(world, &envelope.bytes, variants),
        PayloadKind::Updates => client.apply_updates(world, &envelope.bytes, variants),
        PayloadKind::Unreliable => client.apply_unreliable(world, &envelope.bytes, variants),
    }
}

pub fn create(registry: Arc<Registry>, config: ReplicationConfig) -> Replecs {
    Replecs {
        server: Server::new(registry.clone(), config.clone()),
        client: Client::new(registry, config),
    }
}

pub fn create_server(registry: Arc<Registry>, config: ReplicationConfig) -> Server {
    Server::new(registry, config)
}

pub fn create_client(registry: Arc<Registry>, config: ReplicationConfig) -> Client {
    Client::new(registry, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Primitive, Value};
    use crate::registry::ComponentDecl;
    use crate::world::MemoryWorld;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_config_builders() {
        let config = ReplicationConfig::new()
            .with_strict(false)
            .with_ordered_creation(false)
            .with_initial_buffer_capacity(256)
            .with_suppress_unchanged(false)
            .with_warn_unready(false);

        assert!(!config.strict);
        assert!(!config.ordered_creation);
        assert_eq!(config.initial_buffer_capacity, 256);
        assert!(!config.suppress_unchanged);
        assert!(!config.warn_unready);

        let defaults = ReplicationConfig::default();
        assert!(defaults.strict && defaults.ordered_creation);
    }

    #[test]
    fn test_shared_callback_runs_on_both_sides() {
        let mut builder = Registry::builder();
        let health = builder.register(ComponentDecl::new("Health").primitive(Primitive::U8));
        let registry = Arc::new(builder.build().unwrap());

        let mut replecs = create(registry, ReplicationConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        replecs.after_replication(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut server_world = MemoryWorld::new();
        let mut client_world = MemoryWorld::untracked();
        let e = server_world.spawn();
        server_world.set(e, health, Value::U8(5));
        server_world.set_networked(e, None);

        replecs.server.mark_player_ready(1);
        let out: Vec<_> = replecs.server.collect_updates(&mut server_world).collect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let envelope = Envelope::from_outgoing(&out[0]);
        replecs.deliver(&envelope, &mut client_world).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(client_world.len(), 1);
    }
}
