// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Packet handlers the broker registers at startup.

use std::sync::Arc;

use futures::{future::BoxFuture, FutureExt};

use super::{circuits::DataRoute, BrokerState};
use crate::{
  common::{
    connection::Connection,
    dispatch::{Dispatcher, Origin, ReceivedPacket},
    protocol::{
      AppInstanceReply, ControlFlags, DiscoverAppInstances, DiscoverReply, Message, OpenSocket,
      PackType, Publish, PublishReply, SocketControl, SocketData, SocketId,
    },
  },
  util::framed::encode_packet,
};

/// Registers every packet type the broker answers, with the routine that answers it
pub(super) fn register_routines(dispatcher: &Dispatcher, state: &Arc<BrokerState>) {
  register(dispatcher, state, PackType::UdpDiscover, |state, received| {
    async move { state.reply_to_discovery(&received).await }.boxed()
  });
  register(dispatcher, state, PackType::TcpPublish, |state, received| {
    async move { state.publish(&received).await }.boxed()
  });
  register(dispatcher, state, PackType::TcpDiscoverAppInstances, |state, received| {
    async move { state.discover_app_instances(&received).await }.boxed()
  });
  register(dispatcher, state, PackType::TcpOpenSocket, |state, received| {
    async move { state.open_socket(&received).await }.boxed()
  });
  register(dispatcher, state, PackType::TcpSocketControl, |state, received| {
    async move { state.socket_control(&received).await }.boxed()
  });
  register(dispatcher, state, PackType::TcpSocketData, |state, received| {
    async move { state.socket_data(&received).await }.boxed()
  });
}

fn register<F>(dispatcher: &Dispatcher, state: &Arc<BrokerState>, pack_type: PackType, routine: F)
where
  F: Fn(Arc<BrokerState>, Arc<ReceivedPacket>) -> BoxFuture<'static, ()> + Send + Sync + 'static,
{
  let state = Arc::clone(state);
  dispatcher.register_handler(pack_type, move |received| {
    routine(Arc::clone(&state), received)
  });
}

fn require_connection<'a>(received: &'a ReceivedPacket) -> Option<&'a Arc<Connection>> {
  let connection = received.origin.connection();
  if connection.is_none() {
    tracing::warn!(
      pack_type = ?received.packet.pack_type(),
      "Request needs an established connection but arrived as a datagram"
    );
  }
  connection
}

async fn reply(connection: &Connection, message: &impl Message, nonce: u32) {
  if let Err(error) = connection.send_message(message, nonce).await {
    tracing::warn!(connection = %connection.id(), ?error, "Failed sending reply");
  }
}

impl BrokerState {
  async fn reply_to_discovery(&self, received: &ReceivedPacket) {
    let (peer, socket) = match &received.origin {
      Origin::Udp { peer, socket } => (peer, socket),
      Origin::Tcp(_) => return,
    };
    let reply = DiscoverReply {
      port: self.advertised_port(),
      certificate: self.certificate.clone(),
    };
    let frame = encode_packet(&reply.to_packet(received.packet.nonce()));
    match socket.send_to(&frame, peer).await {
      Ok(_) => tracing::info!(%peer, port = reply.port, "Answered discovery request"),
      Err(error) => tracing::warn!(%peer, ?error, "Failed answering discovery request"),
    }
  }

  async fn publish(&self, received: &ReceivedPacket) {
    let connection = match require_connection(received) {
      Some(connection) => connection,
      None => return,
    };
    let response = match Publish::from_packet(&received.packet) {
      Ok(_) if connection.is_closed() => PublishReply::failure(),
      Ok(request) => {
        let app = self.apps.publish(connection, &request.description);
        tracing::info!(
          description = %app.description,
          app_id = %app.app_id,
          instance_id = %app.instance_id,
          owner = %connection.id(),
          "Published app"
        );
        PublishReply {
          success: true,
          app_id: app.app_id,
          instance_id: app.instance_id,
        }
      }
      Err(error) => {
        tracing::warn!(%error, "Rejected malformed publish request");
        PublishReply::failure()
      }
    };
    reply(connection, &response, received.packet.nonce()).await;
  }

  async fn discover_app_instances(&self, received: &ReceivedPacket) {
    let connection = match require_connection(received) {
      Some(connection) => connection,
      None => return,
    };
    let instances = match DiscoverAppInstances::from_packet(&received.packet) {
      Ok(request) => self.apps.instances_of(&request.app_id),
      Err(error) => {
        tracing::warn!(%error, "Malformed instance discovery request; answering with no instances");
        Vec::new()
      }
    };
    if instances.len() > AppInstanceReply::MAX_INSTANCES {
      tracing::warn!(
        found = instances.len(),
        "More instances than one reply can carry; the excess is omitted"
      );
    }
    tracing::debug!(count = instances.len(), "Answering instance discovery");
    reply(
      connection,
      &AppInstanceReply { instances },
      received.packet.nonce(),
    )
    .await;
  }

  async fn open_socket(&self, received: &ReceivedPacket) {
    let requestor = match require_connection(received) {
      Some(connection) => connection,
      None => return,
    };
    let nonce = received.packet.nonce();
    let refusal = SocketControl::new(SocketId::ZERO, ControlFlags::OPEN_ACK | ControlFlags::CLOSE);
    let request = match OpenSocket::from_packet(&received.packet) {
      Ok(request) => request,
      Err(error) => {
        tracing::warn!(%error, "Refusing malformed open request");
        return reply(requestor, &refusal, nonce).await;
      }
    };
    let app = match self.apps.lookup(&request.instance_id) {
      Some(app) => app,
      None => {
        tracing::info!(instance_id = %request.instance_id, "Open request for unknown instance refused");
        return reply(requestor, &refusal, nonce).await;
      }
    };
    let socket_id = match self.circuits.open(requestor, &app) {
      Ok(socket_id) => socket_id,
      Err(error) => {
        tracing::warn!(%error, "Refusing open request");
        return reply(requestor, &refusal, nonce).await;
      }
    };
    tracing::info!(
      %socket_id,
      instance_id = %app.instance_id,
      requestor = %requestor.id(),
      app = %app.owner.id(),
      "Circuit pending"
    );
    reply(
      requestor,
      &SocketControl::new(socket_id, ControlFlags::OPEN_ACK),
      nonce,
    )
    .await;
    let notification = SocketControl::open_request(socket_id, app.instance_id);
    if let Err(error) = app.owner.send_message(&notification, 0).await {
      tracing::warn!(%socket_id, ?error, "App unreachable; closing circuit");
      if self.circuits.remove(&socket_id).is_some() {
        reply(
          requestor,
          &SocketControl::new(socket_id, ControlFlags::CLOSE),
          0,
        )
        .await;
      }
    }
  }

  async fn socket_control(&self, received: &ReceivedPacket) {
    let connection = match require_connection(received) {
      Some(connection) => connection,
      None => return,
    };
    let control = match SocketControl::from_packet(&received.packet) {
      Ok(control) => control,
      Err(error) => {
        tracing::warn!(%error, "Dropping malformed socket control frame");
        return;
      }
    };
    tracing::debug!(
      socket_id = %control.socket_id,
      flags = %control.flags,
      from = %connection.id(),
      "Socket control"
    );
    let outcome = self
      .circuits
      .apply_control(&control.socket_id, connection.id(), control.flags);
    if let Some((target, flags)) = outcome.notify {
      if let Err(error) = target
        .send_message(&SocketControl::new(control.socket_id, flags), 0)
        .await
      {
        tracing::warn!(socket_id = %control.socket_id, ?error, "Failed forwarding socket control");
      }
    }
  }

  async fn socket_data(&self, received: &ReceivedPacket) {
    let connection = match require_connection(received) {
      Some(connection) => connection,
      None => return,
    };
    let data = match SocketData::from_packet(&received.packet) {
      Ok(data) => data,
      Err(error) => {
        tracing::warn!(%error, "Dropping malformed socket data frame");
        return;
      }
    };
    match self.circuits.route_data(&data.socket_id, connection.id()) {
      DataRoute::Forward(target) => {
        if let Err(error) = target.send_message(&data, 0).await {
          tracing::warn!(socket_id = %data.socket_id, ?error, "Failed relaying socket data");
        }
      }
      DataRoute::NotAccepted => {
        tracing::debug!(socket_id = %data.socket_id, "Dropped data for a circuit that is not accepted")
      }
      DataRoute::UnknownCircuit => {
        tracing::debug!(socket_id = %data.socket_id, "Dropped data for an unknown circuit")
      }
      DataRoute::ForeignConnection => {
        tracing::warn!(socket_id = %data.socket_id, from = %connection.id(), "Dropped data from a connection outside the circuit")
      }
    }
  }
}
