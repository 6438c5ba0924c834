// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Broker-side virtual circuit table and its open/accept/refuse/close state machine.
//!
//! Transitions are decided under the table lock and return the frames to send;
//! sending happens afterwards so no lock is held across network writes.

use std::{
  collections::HashMap,
  sync::{Arc, Mutex, MutexGuard},
};

use super::apps::PublishedApp;
use crate::common::{
  connection::Connection,
  protocol::{ConnectionId, ControlFlags, InstanceId, SocketId, SocketIdGenerator},
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CircuitState {
  /// Waiting for the app to accept or refuse
  Pending,
  /// Data is relayed in both directions
  Accepted,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CircuitSide {
  Requestor,
  App,
}

#[derive(Debug, Clone)]
pub struct VirtualCircuit {
  pub socket_id: SocketId,
  pub instance_id: InstanceId,
  pub requestor: Arc<Connection>,
  pub app: Arc<Connection>,
  pub state: CircuitState,
}

impl VirtualCircuit {
  /// Which side `connection` is on; the app side wins when both sides share a connection
  pub fn side_of(&self, connection: ConnectionId) -> Option<CircuitSide> {
    if self.app.id() == connection {
      Some(CircuitSide::App)
    } else if self.requestor.id() == connection {
      Some(CircuitSide::Requestor)
    } else {
      None
    }
  }

  fn opposite(&self, side: CircuitSide) -> &Arc<Connection> {
    match side {
      CircuitSide::App => &self.requestor,
      CircuitSide::Requestor => &self.app,
    }
  }

  pub fn is_loopback(&self) -> bool {
    self.app.id() == self.requestor.id()
  }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CircuitRegistrationError {
  #[error("Socket id {0} is already in use by another circuit")]
  IdOccupied(SocketId),
}

/// Result of applying a control frame to the table
#[derive(Debug, Default)]
pub struct ControlOutcome {
  pub notify: Option<(Arc<Connection>, ControlFlags)>,
  pub removed: bool,
}

#[derive(Debug)]
pub enum DataRoute {
  Forward(Arc<Connection>),
  NotAccepted,
  UnknownCircuit,
  ForeignConnection,
}

pub struct CircuitRegistry {
  circuits: Mutex<HashMap<SocketId, VirtualCircuit>>,
  socket_ids: Arc<dyn SocketIdGenerator>,
}

impl CircuitRegistry {
  pub fn new(socket_ids: Arc<dyn SocketIdGenerator>) -> Self {
    Self {
      circuits: Mutex::new(HashMap::new()),
      socket_ids,
    }
  }

  fn circuits(&self) -> MutexGuard<'_, HashMap<SocketId, VirtualCircuit>> {
    match self.circuits.lock() {
      Ok(circuits) => circuits,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  /// Creates a pending circuit from `requestor` to `app`, never replacing an existing one
  pub fn open(
    &self,
    requestor: &Arc<Connection>,
    app: &PublishedApp,
  ) -> Result<SocketId, CircuitRegistrationError> {
    let socket_id = self.socket_ids.next(requestor.peer(), &app.description);
    let mut circuits = self.circuits();
    if circuits.contains_key(&socket_id) {
      return Err(CircuitRegistrationError::IdOccupied(socket_id));
    }
    circuits.insert(
      socket_id,
      VirtualCircuit {
        socket_id,
        instance_id: app.instance_id,
        requestor: requestor.clone(),
        app: app.owner.clone(),
        state: CircuitState::Pending,
      },
    );
    Ok(socket_id)
  }

  pub fn get(&self, socket_id: &SocketId) -> Option<VirtualCircuit> {
    self.circuits().get(socket_id).cloned()
  }

  pub fn remove(&self, socket_id: &SocketId) -> Option<VirtualCircuit> {
    self.circuits().remove(socket_id)
  }

  pub fn len(&self) -> usize {
    self.circuits().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Applies `flags` sent by connection `from` for circuit `socket_id`.
  ///
  /// Unknown circuits and flags that are meaningless for the sending side are
  /// ignored, so a repeated Close is a no-op.
  pub fn apply_control(
    &self,
    socket_id: &SocketId,
    from: ConnectionId,
    flags: ControlFlags,
  ) -> ControlOutcome {
    let mut circuits = self.circuits();
    let circuit = match circuits.get_mut(socket_id) {
      Some(circuit) => circuit,
      None => {
        tracing::debug!(%socket_id, %flags, "Control frame for unknown circuit ignored");
        return ControlOutcome::default();
      }
    };
    let side = match circuit.side_of(from) {
      Some(side) => side,
      None => {
        tracing::warn!(%socket_id, connection = %from, "Control frame from a connection outside the circuit");
        return ControlOutcome::default();
      }
    };

    let mut forward = ControlFlags::empty();
    let mut close = false;
    if side == CircuitSide::App && circuit.state == CircuitState::Pending {
      if flags.contains(ControlFlags::ACCEPT_CONNECTION) {
        circuit.state = CircuitState::Accepted;
        forward |= ControlFlags::READY;
        tracing::info!(%socket_id, "Circuit accepted");
      } else if flags.contains(ControlFlags::REFUSE_CONNECTION) {
        forward |= ControlFlags::CLOSE;
        close = true;
        tracing::info!(%socket_id, "Circuit refused");
      }
    }
    if flags.contains(ControlFlags::CLOSE) {
      forward |= ControlFlags::CLOSE;
      close = true;
    }

    let notify = if forward.is_empty() {
      tracing::debug!(%socket_id, ?side, %flags, "Control flags had no effect");
      None
    } else {
      Some((circuit.opposite(side).clone(), forward))
    };
    if close {
      circuits.remove(socket_id);
      tracing::info!(%socket_id, ?side, "Circuit closed");
    }
    ControlOutcome {
      notify,
      removed: close,
    }
  }

  pub fn route_data(&self, socket_id: &SocketId, from: ConnectionId) -> DataRoute {
    let circuits = self.circuits();
    let circuit = match circuits.get(socket_id) {
      Some(circuit) => circuit,
      None => return DataRoute::UnknownCircuit,
    };
    if circuit.state != CircuitState::Accepted {
      return DataRoute::NotAccepted;
    }
    match circuit.side_of(from) {
      Some(side) => DataRoute::Forward(circuit.opposite(side).clone()),
      None => DataRoute::ForeignConnection,
    }
  }

  /// Removes every circuit touching `connection`, returning each with the
  /// surviving side to notify, if there is one.
  pub fn remove_connection(
    &self,
    connection: ConnectionId,
  ) -> Vec<(SocketId, Option<Arc<Connection>>)> {
    let mut circuits = self.circuits();
    let affected: Vec<SocketId> = circuits
      .values()
      .filter(|c| c.side_of(connection).is_some())
      .map(|c| c.socket_id)
      .collect();
    affected
      .into_iter()
      .filter_map(|socket_id| circuits.remove(&socket_id))
      .map(|circuit| {
        let survivor = if circuit.is_loopback() {
          None
        } else if circuit.app.id() == connection {
          Some(circuit.requestor.clone())
        } else {
          Some(circuit.app.clone())
        };
        (circuit.socket_id, survivor)
      })
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
  };

  use tokio_util::sync::CancellationToken;

  use super::*;
  use crate::{
    common::{connection::PeerAddress, protocol::ids::ID_LENGTH},
    server::apps::AppRegistry,
  };

  /// Hands out a fixed sequence, repeating the last id once exhausted
  struct ScriptedIds(AtomicU8);

  impl SocketIdGenerator for ScriptedIds {
    fn next(&self, _requestor: &PeerAddress, _description: &str) -> SocketId {
      let n = self.0.load(Ordering::SeqCst);
      if n < 1 {
        self.0.fetch_add(1, Ordering::SeqCst);
      }
      SocketId::new([n + 1; ID_LENGTH])
    }
  }

  fn connection(id: u64) -> Arc<Connection> {
    let id = ConnectionId::new(id);
    Connection::new(
      id,
      PeerAddress::Memory(id),
      tokio::io::sink(),
      CancellationToken::new(),
    )
  }

  fn fixture() -> (CircuitRegistry, Arc<Connection>, Arc<Connection>, PublishedApp) {
    let registry = CircuitRegistry::new(Arc::new(ScriptedIds(AtomicU8::new(0))));
    let requestor = connection(1);
    let app_owner = connection(2);
    let app = AppRegistry::new().publish(&app_owner, "svc");
    (registry, requestor, app_owner, app)
  }

  #[tokio::test]
  async fn accept_then_relay_then_close() {
    let (registry, requestor, app_owner, app) = fixture();
    let socket_id = registry.open(&requestor, &app).unwrap();
    assert!(matches!(
      registry.route_data(&socket_id, requestor.id()),
      DataRoute::NotAccepted
    ));

    let outcome = registry.apply_control(&socket_id, app_owner.id(), ControlFlags::ACCEPT_CONNECTION);
    let (target, flags) = outcome.notify.unwrap();
    assert_eq!(target.id(), requestor.id());
    assert_eq!(flags, ControlFlags::READY);
    assert_eq!(registry.get(&socket_id).unwrap().state, CircuitState::Accepted);

    match registry.route_data(&socket_id, requestor.id()) {
      DataRoute::Forward(target) => assert_eq!(target.id(), app_owner.id()),
      other => panic!("Unexpected route {:?}", other),
    }
    match registry.route_data(&socket_id, app_owner.id()) {
      DataRoute::Forward(target) => assert_eq!(target.id(), requestor.id()),
      other => panic!("Unexpected route {:?}", other),
    }

    // A second accept changes nothing
    let outcome = registry.apply_control(&socket_id, app_owner.id(), ControlFlags::ACCEPT_CONNECTION);
    assert!(outcome.notify.is_none());

    let outcome = registry.apply_control(&socket_id, requestor.id(), ControlFlags::CLOSE);
    let (target, flags) = outcome.notify.unwrap();
    assert_eq!(target.id(), app_owner.id());
    assert_eq!(flags, ControlFlags::CLOSE);
    assert!(outcome.removed);
    assert!(registry.is_empty());

    let again = registry.apply_control(&socket_id, requestor.id(), ControlFlags::CLOSE);
    assert!(again.notify.is_none() && !again.removed);
  }

  #[tokio::test]
  async fn refusal_removes_circuit() {
    let (registry, requestor, app_owner, app) = fixture();
    let socket_id = registry.open(&requestor, &app).unwrap();
    let outcome = registry.apply_control(&socket_id, app_owner.id(), ControlFlags::REFUSE_CONNECTION);
    let (target, flags) = outcome.notify.unwrap();
    assert_eq!(target.id(), requestor.id());
    assert_eq!(flags, ControlFlags::CLOSE);
    assert!(registry.get(&socket_id).is_none());
    assert!(matches!(
      registry.route_data(&socket_id, app_owner.id()),
      DataRoute::UnknownCircuit
    ));
  }

  #[tokio::test]
  async fn requestor_cannot_accept() {
    let (registry, requestor, _app_owner, app) = fixture();
    let socket_id = registry.open(&requestor, &app).unwrap();
    let outcome = registry.apply_control(&socket_id, requestor.id(), ControlFlags::ACCEPT_CONNECTION);
    assert!(outcome.notify.is_none());
    assert_eq!(registry.get(&socket_id).unwrap().state, CircuitState::Pending);
    let outsider = connection(9);
    let outcome = registry.apply_control(&socket_id, outsider.id(), ControlFlags::CLOSE);
    assert!(!outcome.removed);
  }

  #[tokio::test]
  async fn occupied_ids_are_not_overwritten() {
    let (registry, requestor, _app_owner, app) = fixture();
    let first = registry.open(&requestor, &app).unwrap();
    let second = registry.open(&requestor, &app).unwrap();
    assert_ne!(first, second);
    assert_eq!(
      registry.open(&requestor, &app),
      Err(CircuitRegistrationError::IdOccupied(second))
    );
    assert_eq!(registry.len(), 2);
  }

  #[tokio::test]
  async fn connection_removal_reports_survivors() {
    let (registry, requestor, app_owner, app) = fixture();
    let pending = registry.open(&requestor, &app).unwrap();
    let loopback = registry.open(&app_owner, &app).unwrap();
    let mut removed = registry.remove_connection(app_owner.id());
    removed.sort_by_key(|(socket_id, _)| *socket_id);
    assert_eq!(removed.len(), 2);
    assert!(registry.is_empty());
    for (socket_id, survivor) in removed {
      if socket_id == pending {
        assert_eq!(survivor.unwrap().id(), requestor.id());
      } else {
        assert_eq!(socket_id, loopback);
        assert!(survivor.is_none());
      }
    }
  }
}
