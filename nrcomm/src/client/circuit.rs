// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Endpoint-side circuit bookkeeping, keyed by broker-assigned socket id.

use std::sync::{
  atomic::{AtomicBool, AtomicUsize, Ordering},
  Arc, Mutex, MutexGuard, Weak,
};

use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::{mpsc, oneshot};

use super::SessionError;
use crate::common::{
  connection::Connection,
  protocol::{ControlFlags, InstanceId, SocketControl, SocketData, SocketId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
  /// Requested here, waiting for the app to decide
  Connecting,
  /// Offered to a local publication, waiting for accept or refuse
  AwaitingDecision,
  Open,
  Closed,
}

pub(crate) type Inbox = mpsc::UnboundedReceiver<Vec<u8>>;
pub(crate) type Decision = oneshot::Receiver<Result<(), SessionError>>;

struct CircuitInner {
  state: EndpointState,
  /// One per stream bound to this circuit; loopback circuits have two
  inboxes: Vec<mpsc::UnboundedSender<Vec<u8>>>,
  decision: Option<oneshot::Sender<Result<(), SessionError>>>,
}

pub struct EndpointCircuit {
  socket_id: SocketId,
  instance_id: InstanceId,
  requestor: bool,
  loopback: AtomicBool,
  views: AtomicUsize,
  inner: Mutex<CircuitInner>,
  connection: Arc<Connection>,
  table: Weak<CircuitTable>,
}

impl std::fmt::Debug for EndpointCircuit {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("EndpointCircuit")
      .field("socket_id", &self.socket_id)
      .field("instance_id", &self.instance_id)
      .field("requestor", &self.requestor)
      .field("loopback", &self.is_loopback())
      .field("state", &self.state())
      .finish()
  }
}

impl EndpointCircuit {
  fn inner(&self) -> MutexGuard<'_, CircuitInner> {
    match self.inner.lock() {
      Ok(inner) => inner,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  pub fn socket_id(&self) -> SocketId {
    self.socket_id
  }

  pub fn instance_id(&self) -> InstanceId {
    self.instance_id
  }

  /// Whether this endpoint asked for the circuit, as opposed to being offered it
  pub fn is_requestor(&self) -> bool {
    self.requestor
  }

  /// Whether both ends of the circuit live on this endpoint's connection
  pub fn is_loopback(&self) -> bool {
    self.loopback.load(Ordering::Acquire)
  }

  pub fn state(&self) -> EndpointState {
    self.inner().state
  }

  pub fn is_closed(&self) -> bool {
    self.state() == EndpointState::Closed
  }

  /// Registers a new stream view; a closed circuit yields an inbox that is already at its end
  pub(crate) fn bind_inbox(&self) -> Inbox {
    let (sender, receiver) = mpsc::unbounded_channel();
    let mut inner = self.inner();
    if inner.state != EndpointState::Closed {
      inner.inboxes.push(sender);
    }
    self.views.fetch_add(1, Ordering::AcqRel);
    receiver
  }

  /// Returns true once the last stream view has been released
  pub(crate) fn release_view(&self) -> bool {
    self.views.fetch_sub(1, Ordering::AcqRel) == 1
  }

  pub(crate) fn deliver(&self, data: Vec<u8>) {
    let mut inner = self.inner();
    if inner.state != EndpointState::Open {
      tracing::debug!(socket_id = %self.socket_id, state = ?inner.state, "Dropping data for a circuit that is not open");
      return;
    }
    inner.inboxes.retain(|inbox| inbox.send(data.clone()).is_ok());
  }

  /// Marks the circuit open without resolving a pending connect
  pub(crate) fn set_open(&self) -> bool {
    let mut inner = self.inner();
    if inner.state == EndpointState::Closed {
      return false;
    }
    inner.state = EndpointState::Open;
    true
  }

  /// The app accepted; wakes the pending connect, if any
  pub(crate) fn ready(&self) {
    let decision = {
      let mut inner = self.inner();
      if inner.state == EndpointState::Closed {
        return;
      }
      inner.state = EndpointState::Open;
      inner.decision.take()
    };
    tracing::info!(socket_id = %self.socket_id, "Circuit ready");
    if let Some(decision) = decision {
      let _ = decision.send(Ok(()));
    }
  }

  /// Closes locally without notifying the broker; returns false if already closed
  pub(crate) fn shut(&self, reason: SessionError) -> bool {
    let decision = {
      let mut inner = self.inner();
      if inner.state == EndpointState::Closed {
        return false;
      }
      inner.state = EndpointState::Closed;
      inner.inboxes.clear();
      inner.decision.take()
    };
    if let Some(decision) = decision {
      let _ = decision.send(Err(reason));
    }
    if let Some(table) = self.table.upgrade() {
      table.forget(self);
    }
    true
  }

  /// Closes the circuit and tells the broker, which closes the far side
  pub async fn close(&self) -> Result<(), SessionError> {
    if !self.shut(SessionError::ConnectionClosed) {
      return Ok(());
    }
    tracing::debug!(socket_id = %self.socket_id, "Closing circuit");
    self.send_control(ControlFlags::CLOSE).await
  }

  pub(crate) async fn send_control(&self, flags: ControlFlags) -> Result<(), SessionError> {
    self
      .connection
      .send_message(&SocketControl::new(self.socket_id, flags), 0)
      .await?;
    Ok(())
  }

  pub async fn send_data(&self, data: Vec<u8>) -> Result<(), SessionError> {
    match self.state() {
      EndpointState::Open => {}
      EndpointState::Closed => return Err(SessionError::ConnectionClosed),
      EndpointState::Connecting | EndpointState::AwaitingDecision => {
        return Err(SessionError::NotReady)
      }
    }
    let message = SocketData {
      socket_id: self.socket_id,
      data,
    };
    self.connection.send_message(&message, 0).await?;
    Ok(())
  }
}

/// Live circuits of one session
#[derive(Default)]
pub(crate) struct CircuitTable {
  circuits: DashMap<SocketId, Arc<EndpointCircuit>>,
}

impl CircuitTable {
  fn create(
    self: &Arc<Self>,
    socket_id: SocketId,
    instance_id: InstanceId,
    requestor: bool,
    state: EndpointState,
    decision: Option<oneshot::Sender<Result<(), SessionError>>>,
    connection: &Arc<Connection>,
  ) -> Arc<EndpointCircuit> {
    Arc::new(EndpointCircuit {
      socket_id,
      instance_id,
      requestor,
      loopback: AtomicBool::new(false),
      views: AtomicUsize::new(0),
      inner: Mutex::new(CircuitInner {
        state,
        inboxes: Vec::new(),
        decision,
      }),
      connection: connection.clone(),
      table: Arc::downgrade(self),
    })
  }

  /// Records a circuit the broker acknowledged for a local connect.
  ///
  /// The inbox is bound immediately so data relayed right after Ready is never missed.
  pub(crate) fn register_outbound(
    self: &Arc<Self>,
    socket_id: SocketId,
    instance_id: InstanceId,
    connection: &Arc<Connection>,
  ) -> (Arc<EndpointCircuit>, Inbox, Decision) {
    let (decide, decision) = oneshot::channel();
    let circuit = self.create(
      socket_id,
      instance_id,
      true,
      EndpointState::Connecting,
      Some(decide),
      connection,
    );
    let inbox = circuit.bind_inbox();
    if let Some(previous) = self.circuits.insert(socket_id, circuit.clone()) {
      tracing::warn!(%socket_id, "Broker reused a live socket id; dropping the older circuit");
      previous.shut(SessionError::ConnectionClosed);
    }
    (circuit, inbox, decision)
  }

  /// Records a circuit offered to a local publication.
  ///
  /// An offer for a circuit this endpoint requested itself marks that circuit as loopback.
  pub(crate) fn register_inbound(
    self: &Arc<Self>,
    socket_id: SocketId,
    instance_id: InstanceId,
    connection: &Arc<Connection>,
  ) -> Arc<EndpointCircuit> {
    match self.circuits.entry(socket_id) {
      Entry::Occupied(existing) => {
        let circuit = existing.get().clone();
        circuit.loopback.store(true, Ordering::Release);
        tracing::debug!(%socket_id, "Circuit loops back to this endpoint");
        circuit
      }
      Entry::Vacant(slot) => {
        let circuit = self.create(
          socket_id,
          instance_id,
          false,
          EndpointState::AwaitingDecision,
          None,
          connection,
        );
        slot.insert(circuit.clone());
        circuit
      }
    }
  }

  pub(crate) fn get(&self, socket_id: &SocketId) -> Option<Arc<EndpointCircuit>> {
    self.circuits.get(socket_id).map(|entry| entry.value().clone())
  }

  fn forget(&self, circuit: &EndpointCircuit) {
    self
      .circuits
      .remove_if(&circuit.socket_id, |_, live| std::ptr::eq(live.as_ref(), circuit));
  }

  pub(crate) fn len(&self) -> usize {
    self.circuits.len()
  }

  /// Closes every circuit locally, ending their streams
  pub(crate) fn abort_all(&self) {
    let all: Vec<Arc<EndpointCircuit>> = self
      .circuits
      .iter()
      .map(|entry| entry.value().clone())
      .collect();
    for circuit in all {
      circuit.shut(SessionError::ConnectionClosed);
    }
  }
}
