use crate::error::{ReplicationError, Result};
use crate::protocol::{Channel, OutgoingPayload, Payload, PayloadKind, Value};
use crate::serialization::{BinaryFormat, BinarySerializer};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[cfg(feature = "async")]
use async_trait::async_trait;

/// A payload framed for a host transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: PayloadKind,
    pub bytes: Vec<u8>,
    pub variants: Vec<Value>,
}

impl Envelope {
    pub fn new(kind: PayloadKind, payload: &Payload) -> Self {
        Self {
            kind,
            bytes: payload.bytes.to_vec(),
            variants: payload.variants.clone(),
        }
    }

    pub fn from_outgoing(outgoing: &OutgoingPayload) -> Self {
        Self::new(outgoing.kind, &outgoing.payload)
    }

    pub fn channel(&self) -> Channel {
        self.kind.channel()
    }

    pub fn into_payload(self) -> Payload {
        Payload {
            bytes: Bytes::from(self.bytes),
            variants: self.variants,
        }
    }
}

pub trait Transport {
    fn send(&mut self, envelope: &Envelope) -> Result<()>;
    fn receive(&mut self) -> Result<Option<Envelope>>;
    fn close(&mut self) -> Result<()>;
    fn is_connected(&self) -> bool;
}

#[cfg(feature = "async")]
#[async_trait]
pub trait AsyncTransport: Send + Sync {
    async fn send(&mut self, envelope: &Envelope) -> Result<()>;
    async fn receive(&mut self) -> Result<Option<Envelope>>;
    async fn close(&mut self) -> Result<()>;
    fn is_connected(&self) -> bool;
}

type Queue = Arc<Mutex<VecDeque<Bytes>>>;

fn lock(queue: &Queue) -> Result<std::sync::MutexGuard<'_, VecDeque<Bytes>>> {
    queue
        .lock()
        .map_err(|_| ReplicationError::Transport("memory queue poisoned".to_string()))
}

/// In-process transport. Unconnected, it buffers what it sends; connected, its
/// outbox is the peer's inbox.
pub struct MemoryTransport {
    serializer: BinarySerializer,
    outbox: Queue,
    inbox: Queue,
    connected: bool,
}

impl MemoryTransport {
    pub fn new(format: BinaryFormat) -> Self {
        Self {
            serializer: BinarySerializer::new(format),
            outbox: Queue::default(),
            inbox: Queue::default(),
            connected: true,
        }
    }

    pub fn create_pair(format: BinaryFormat) -> Result<(Self, Self)> {
        let mut t1 = Self::new(format);
        let mut t2 = Self::new(format);
        t1.connect_to(&mut t2)?;
        Ok((t1, t2))
    }

    /// Wires both ends together. Frames already sent are handed to the peer.
    pub fn connect_to(&mut self, other: &mut Self) -> Result<()> {
        let pending: Vec<Bytes> = lock(&self.outbox)?.drain(..).collect();
        lock(&other.inbox)?.extend(pending);
        let pending: Vec<Bytes> = lock(&other.outbox)?.drain(..).collect();
        lock(&self.inbox)?.extend(pending);

        self.outbox = other.inbox.clone();
        other.outbox = self.inbox.clone();
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.inbox.lock().map(|queue| queue.len()).unwrap_or(0)
    }
}

impl Transport for MemoryTransport {
    fn send(&mut self, envelope: &Envelope) -> Result<()> {
        if !self.connected {
            return Err(ReplicationError::ConnectionClosed);
        }

        let data = self.serializer.serialize(envelope)?;
        lock(&self.outbox)?.push_back(data);
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<Envelope>> {
        if !self.connected {
            return Err(ReplicationError::ConnectionClosed);
        }

        let Some(data) = lock(&self.inbox)?.pop_front() else {
            return Ok(None);
        };
        Ok(Some(self.serializer.deserialize(&data)?))
    }

    fn close(&mut self) -> Result<()> {
        self.connected = false;
        lock(&self.inbox)?.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[cfg(feature = "async")]
pub mod channel {
    use super::*;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

    /// Async transport over a pair of tokio channels.
    pub struct ChannelTransport {
        serializer: BinarySerializer,
        sender: Option<UnboundedSender<Bytes>>,
        receiver: UnboundedReceiver<Bytes>,
    }

    impl ChannelTransport {
        pub fn pair(format: BinaryFormat) -> (Self, Self) {
            let (to_b, from_a) = unbounded_channel();
            let (to_a, from_b) = unbounded_channel();
            (
                Self {
                    serializer: BinarySerializer::new(format),
                    sender: Some(to_b),
                    receiver: from_b,
                },
                Self {
                    serializer: BinarySerializer::new(format),
                    sender: Some(to_a),
                    receiver: from_a,
                },
            )
        }
    }

    #[async_trait]
    impl AsyncTransport for ChannelTransport {
        async fn send(&mut self, envelope: &Envelope) -> Result<()> {
            let sender = self.sender.as_ref().ok_or(ReplicationError::ConnectionClosed)?;
            let data = self.serializer.serialize(envelope)?;
            sender
                .send(data)
                .map_err(|_| ReplicationError::ConnectionClosed)
        }

        async fn receive(&mut self) -> Result<Option<Envelope>> {
            match self.receiver.recv().await {
                Some(data) => Ok(Some(self.serializer.deserialize(&data)?)),
                None => {
                    self.sender = None;
                    Err(ReplicationError::ConnectionClosed)
                }
            }
        }

        async fn close(&mut self) -> Result<()> {
            self.sender = None;
            self.receiver.close();
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.sender.as_ref().map(|s| !s.is_closed()).unwrap_or(false)
        }
    }
}

#[cfg(feature = "async")]
pub use channel::ChannelTransport;
