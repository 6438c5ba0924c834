// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Routing of received packets to one-shot nonce watchers and persistent handlers.

use std::{
  collections::HashMap,
  net::SocketAddr,
  sync::{Arc, Mutex, MutexGuard, RwLock},
  time::Instant,
};

use futures::future::BoxFuture;
use rand::Rng;
use tokio::{net::UdpSocket, sync::oneshot};

use super::{
  connection::Connection,
  protocol::{PackType, Packet, Transport},
};

/// Where a packet came from, and therefore how to answer it
#[derive(Clone, Debug)]
pub enum Origin {
  Tcp(Arc<Connection>),
  Udp {
    peer: SocketAddr,
    socket: Arc<UdpSocket>,
  },
}

impl Origin {
  pub fn transport(&self) -> Transport {
    match self {
      Origin::Tcp(_) => Transport::Tcp,
      Origin::Udp { .. } => Transport::Udp,
    }
  }

  pub fn connection(&self) -> Option<&Arc<Connection>> {
    match self {
      Origin::Tcp(connection) => Some(connection),
      Origin::Udp { .. } => None,
    }
  }
}

#[derive(Debug)]
pub struct ReceivedPacket {
  pub packet: Packet,
  pub origin: Origin,
}

impl ReceivedPacket {
  pub fn new(packet: Packet, origin: Origin) -> Self {
    Self { packet, origin }
  }
}

pub type PacketHandler = Arc<dyn Fn(Arc<ReceivedPacket>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Runs inline on the reading task, before any later packet is dispatched
pub type NonceWatcher = Box<dyn FnOnce(Arc<ReceivedPacket>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
  /// Consumed by a nonce watcher; persistent handlers were skipped
  Correlated,
  Handled { handlers: usize },
  NoHandlerDefined,
  TransportMismatch { required: Transport, actual: Transport },
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Reply watcher was discarded before a reply arrived")]
pub struct NonceWatchDropped;

pub struct NonceReply(oneshot::Receiver<Arc<ReceivedPacket>>);

impl NonceReply {
  pub async fn recv(self) -> Result<Arc<ReceivedPacket>, NonceWatchDropped> {
    self.0.await.map_err(|_| NonceWatchDropped)
  }
}

/// Per-process routing table.
///
/// Nonce watchers take precedence over persistent handlers, so a correlated
/// reply is consumed exactly once and never reaches the general handlers for
/// its type. Persistent handlers run sequentially in registration order.
pub struct Dispatcher {
  handlers: RwLock<HashMap<PackType, Vec<PacketHandler>>>,
  watchers: Mutex<HashMap<u32, NonceWatcher>>,
}

impl Default for Dispatcher {
  fn default() -> Self {
    Self::new()
  }
}

impl Dispatcher {
  pub fn new() -> Self {
    Self {
      handlers: RwLock::new(HashMap::new()),
      watchers: Mutex::new(HashMap::new()),
    }
  }

  pub fn register_handler<F>(&self, pack_type: PackType, handler: F)
  where
    F: Fn(Arc<ReceivedPacket>) -> BoxFuture<'static, ()> + Send + Sync + 'static,
  {
    let mut handlers = match self.handlers.write() {
      Ok(handlers) => handlers,
      Err(poisoned) => poisoned.into_inner(),
    };
    handlers
      .entry(pack_type)
      .or_insert_with(Vec::new)
      .push(Arc::new(handler));
  }

  pub fn handler_count(&self, pack_type: PackType) -> usize {
    self
      .handlers_for(pack_type)
      .map(|handlers| handlers.len())
      .unwrap_or(0)
  }

  fn handlers_for(&self, pack_type: PackType) -> Option<Vec<PacketHandler>> {
    let handlers = match self.handlers.read() {
      Ok(handlers) => handlers,
      Err(poisoned) => poisoned.into_inner(),
    };
    handlers.get(&pack_type).cloned()
  }

  /// A fresh random nonce in `1..=i32::MAX`; zero is reserved for unsolicited packets
  pub fn generate_nonce() -> u32 {
    rand::thread_rng().gen_range(1..=i32::MAX as u32)
  }

  /// Registers a one-shot watcher for `nonce`, replacing any earlier one
  pub fn watch_nonce_with<F>(&self, nonce: u32, watcher: F)
  where
    F: FnOnce(Arc<ReceivedPacket>) + Send + 'static,
  {
    if self.watchers().insert(nonce, Box::new(watcher)).is_some() {
      tracing::debug!(nonce, "Replaced an existing nonce watcher");
    }
  }

  /// Registers a watcher on a fresh nonce that forwards the reply to the returned receiver
  pub fn watch_nonce(&self) -> (u32, NonceReply) {
    let nonce = Self::generate_nonce();
    let (sender, receiver) = oneshot::channel();
    self.watch_nonce_with(nonce, move |received| {
      let _ = sender.send(received);
    });
    (nonce, NonceReply(receiver))
  }

  pub fn forget_nonce(&self, nonce: u32) -> bool {
    self.watchers().remove(&nonce).is_some()
  }

  pub fn pending_watchers(&self) -> usize {
    self.watchers().len()
  }

  /// Discards all outstanding watchers, failing anyone waiting on them
  pub fn clear_watchers(&self) {
    let drained: Vec<NonceWatcher> = self.watchers().drain().map(|(_, w)| w).collect();
    if !drained.is_empty() {
      tracing::debug!(count = drained.len(), "Discarded pending nonce watchers");
    }
  }

  fn watchers(&self) -> MutexGuard<'_, HashMap<u32, NonceWatcher>> {
    match self.watchers.lock() {
      Ok(watchers) => watchers,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  pub async fn dispatch(&self, received: ReceivedPacket) -> DispatchOutcome {
    let pack_type = received.packet.pack_type();
    let nonce = received.packet.nonce();
    let received = Arc::new(received);
    tracing::trace!(?pack_type, nonce, "Working on packet");

    if nonce != 0 {
      let watcher = self.watchers().remove(&nonce);
      if let Some(watcher) = watcher {
        watcher(received);
        tracing::trace!(?pack_type, nonce, "Delivered packet to nonce watcher");
        return DispatchOutcome::Correlated;
      }
      tracing::trace!(nonce, "Nonce not being looked for");
    }

    let actual = received.origin.transport();
    if let Some(required) = pack_type.restriction() {
      if required != actual {
        tracing::error!(
          ?pack_type,
          %required,
          %actual,
          "Packet arrived over a transport its type does not permit"
        );
        return DispatchOutcome::TransportMismatch { required, actual };
      }
    }

    let handlers = match self.handlers_for(pack_type) {
      Some(handlers) if !handlers.is_empty() => handlers,
      _ => {
        tracing::error!(?pack_type, "No handler defined for packet type");
        return DispatchOutcome::NoHandlerDefined;
      }
    };
    for handler in handlers.iter() {
      let start = Instant::now();
      handler(received.clone()).await;
      tracing::trace!(?pack_type, elapsed = ?start.elapsed(), "Handler completed");
    }
    DispatchOutcome::Handled {
      handlers: handlers.len(),
    }
  }
}
