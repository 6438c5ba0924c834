// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! The rendezvous broker: publication registry, circuit relay, and discovery responder.

use std::{
  net::SocketAddr,
  sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
  },
};

use futures::{Stream, StreamExt, TryStreamExt};
use tokio::{
  io::{AsyncRead, AsyncWrite},
  net::{TcpListener, TcpStream, UdpSocket},
  sync::broadcast::{channel as event_channel, Sender as Broadcaster},
};
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
  common::{
    connection::{run_read_loop, Connection, PeerAddress},
    dispatch::{Dispatcher, Origin, ReceivedPacket},
    protocol::{
      ids::{MonotonicConnectionIds, TimestampSocketIdGenerator},
      ConnectionId, ControlFlags, Hello, SocketControl, SocketIdGenerator, Transport,
    },
    tls::{self, ClientAuthority, TlsIdentity, TlsSetupError},
  },
  util::framed::{decode_packet, ReadError, WriteError},
};

pub mod apps;
pub mod circuits;
pub mod config;
mod routines;

use apps::AppRegistry;
use circuits::CircuitRegistry;

/// Largest datagram the discovery responder accepts
const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
  #[error("Failed to bind {transport} listener on {address}")]
  Bind {
    transport: Transport,
    address: SocketAddr,
    #[source]
    error: std::io::Error,
  },
  #[error("Failed accepting a connection")]
  Accept(#[source] std::io::Error),
  #[error("Discovery socket failed")]
  Discovery(#[source] std::io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
  #[error("TLS handshake failed")]
  Handshake(#[source] std::io::Error),
  #[error("Failed greeting the peer")]
  Greeting(#[source] WriteError),
  #[error("Connection read failed")]
  Read(#[from] ReadError),
}

/// Server certificate settings, plus the certificate advertised in discovery replies
#[derive(Clone)]
pub struct BrokerTls {
  config: Arc<rustls::ServerConfig>,
  certificate: Vec<u8>,
}

impl BrokerTls {
  pub fn new(
    identity: &TlsIdentity,
    authority: Option<&ClientAuthority>,
  ) -> Result<Self, TlsSetupError> {
    Ok(Self {
      config: tls::server_config(identity, authority)?,
      certificate: identity.certificate_der().to_vec(),
    })
  }
}

/// State shared by every connection the broker serves
pub(crate) struct BrokerState {
  pub(crate) apps: AppRegistry,
  pub(crate) circuits: CircuitRegistry,
  advertised_port: AtomicU32,
  certificate: Vec<u8>,
}

impl BrokerState {
  fn advertised_port(&self) -> u32 {
    self.advertised_port.load(Ordering::Relaxed)
  }

  /// Cascades the loss of `connection` to its publications and circuits
  async fn teardown(&self, connection: &Connection) {
    let id = connection.id();
    for app in self.apps.remove_owned_by(id) {
      tracing::info!(instance_id = %app.instance_id, description = %app.description, "Publication withdrawn");
    }
    for (socket_id, survivor) in self.circuits.remove_connection(id) {
      tracing::info!(%socket_id, "Circuit closed by connection teardown");
      let survivor = match survivor {
        Some(survivor) if !survivor.is_closed() => survivor,
        _ => continue,
      };
      if let Err(error) = survivor
        .send_message(&SocketControl::new(socket_id, ControlFlags::CLOSE), 0)
        .await
      {
        tracing::debug!(%socket_id, ?error, "Surviving side could not be notified");
      }
    }
  }
}

pub struct Broker {
  state: Arc<BrokerState>,
  dispatcher: Arc<Dispatcher>,
  connection_ids: MonotonicConnectionIds,
  acceptor: Option<TlsAcceptor>,
  max_frame_length: Option<usize>,

  // event hooks
  pub connection_opened: Broadcaster<(ConnectionId, PeerAddress)>,
  pub connection_closed: Broadcaster<ConnectionId>,
}

impl Broker {
  pub fn new(tls: Option<BrokerTls>, max_frame_length: Option<usize>) -> Arc<Self> {
    Self::with_socket_ids(tls, max_frame_length, Arc::new(TimestampSocketIdGenerator::new()))
  }

  pub fn with_socket_ids(
    tls: Option<BrokerTls>,
    max_frame_length: Option<usize>,
    socket_ids: Arc<dyn SocketIdGenerator>,
  ) -> Arc<Self> {
    let (acceptor, certificate) = match tls {
      Some(tls) => (Some(TlsAcceptor::from(tls.config)), tls.certificate),
      None => (None, Vec::new()),
    };
    let state = Arc::new(BrokerState {
      apps: AppRegistry::new(),
      circuits: CircuitRegistry::new(socket_ids),
      advertised_port: AtomicU32::new(0),
      certificate,
    });
    let dispatcher = Arc::new(Dispatcher::new());
    routines::register_routines(&dispatcher, &state);
    Arc::new(Self {
      state,
      dispatcher,
      connection_ids: MonotonicConnectionIds::default(),
      acceptor,
      max_frame_length,
      // Receivers are created on demand through Sender::subscribe
      connection_opened: event_channel(32).0,
      connection_closed: event_channel(32).0,
    })
  }

  pub fn apps(&self) -> &AppRegistry {
    &self.state.apps
  }

  pub fn circuits(&self) -> &CircuitRegistry {
    &self.state.circuits
  }

  pub fn dispatcher(&self) -> &Arc<Dispatcher> {
    &self.dispatcher
  }

  /// The TCP port announced to discovering endpoints
  pub fn set_advertised_port(&self, port: u16) {
    self
      .state
      .advertised_port
      .store(port as u32, Ordering::Relaxed);
  }

  pub fn uses_tls(&self) -> bool {
    self.acceptor.is_some()
  }

  /// Serves one physical connection until it closes, then tears down everything it owned.
  ///
  /// `peer` is absent for in-process transports.
  pub async fn serve_connection<S>(
    self: Arc<Self>,
    stream: S,
    peer: Option<SocketAddr>,
    shutdown: CancellationToken,
  ) -> Result<(), ConnectionError>
  where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
  {
    let id = self.connection_ids.next();
    let peer = peer.map(PeerAddress::Socket).unwrap_or(PeerAddress::Memory(id));
    let span = tracing::info_span!("broker_connection", %id, %peer);
    async move {
      type Reader = Box<dyn AsyncRead + Send + Unpin>;
      type Writer = Box<dyn AsyncWrite + Send + Unpin>;
      let (reader, writer) = match &self.acceptor {
        Some(acceptor) => {
          let stream = acceptor
            .accept(stream)
            .await
            .map_err(|error| {
              tracing::warn!(?error, "TLS handshake failed");
              ConnectionError::Handshake(error)
            })?;
          let (reader, writer) = tokio::io::split(stream);
          (Box::new(reader) as Reader, Box::new(writer) as Writer)
        }
        None => {
          let (reader, writer) = tokio::io::split(stream);
          (Box::new(reader) as Reader, Box::new(writer) as Writer)
        }
      };
      let connection = Connection::new(id, peer, writer, shutdown.child_token());
      tracing::info!("Connection established");
      let _ = self.connection_opened.send((id, peer));

      let result = match connection.send_message(&Hello, 0).await {
        Ok(()) => run_read_loop(
          connection.clone(),
          reader,
          self.dispatcher.clone(),
          self.max_frame_length,
        )
        .await
        .map_err(ConnectionError::from),
        Err(error) => Err(ConnectionError::Greeting(error)),
      };
      connection.close();
      self.state.teardown(&connection).await;
      match &result {
        Ok(()) => tracing::info!("Connection closed"),
        Err(error) => tracing::warn!(%error, "Connection closed abnormally"),
      }
      let _ = self.connection_closed.send(id);
      result
    }
    .instrument(span)
    .await
  }

  /// Serves every connection from `source` until shutdown is requested.
  ///
  /// A failure of the source itself is fatal and ends the run.
  pub async fn run<Source, S>(
    self: Arc<Self>,
    source: Source,
    shutdown: CancellationToken,
  ) -> Result<(), BrokerError>
  where
    Source: Stream<Item = std::io::Result<(S, SocketAddr)>> + Send,
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
  {
    source
      .take_until({
        let shutdown = shutdown.clone();
        async move { shutdown.cancelled().await }
      })
      .map_err(BrokerError::Accept)
      .try_for_each_concurrent(None, |(stream, peer)| {
        let broker = self.clone();
        let shutdown = shutdown.clone();
        async move {
          let served = tokio::task::spawn(async move {
            // Per-connection failures are logged by serve_connection itself
            let _ = broker.serve_connection(stream, Some(peer), shutdown).await;
          });
          if let Err(error) = served.await {
            tracing::error!(%peer, ?error, "Connection task failed");
          }
          Ok(())
        }
      })
      .instrument(tracing::info_span!("broker"))
      .await
  }

  /// Answers discovery datagrams on `socket` until shutdown is requested
  pub async fn run_discovery(
    self: Arc<Self>,
    socket: UdpSocket,
    shutdown: CancellationToken,
  ) -> Result<(), BrokerError> {
    let socket = Arc::new(socket);
    let mut buffer = vec![0u8; MAX_DATAGRAM];
    loop {
      let (length, peer) = tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        received = socket.recv_from(&mut buffer) => match received {
          Ok(received) => received,
          // Resets from earlier unreachable replies surface here on some platforms
          Err(error) if error.kind() == std::io::ErrorKind::ConnectionReset => {
            tracing::debug!(?error, "Ignoring reset on discovery socket");
            continue;
          }
          Err(error) => return Err(BrokerError::Discovery(error)),
        },
      };
      let packet = match decode_packet(&buffer[..length], self.max_frame_length) {
        Ok(packet) => packet,
        Err(error) => {
          tracing::warn!(%peer, %error, "Ignoring malformed datagram");
          continue;
        }
      };
      let origin = Origin::Udp {
        peer,
        socket: socket.clone(),
      };
      self
        .dispatcher
        .dispatch(ReceivedPacket::new(packet, origin))
        .await;
    }
  }
}

pub async fn bind_tcp(address: SocketAddr) -> Result<TcpListener, BrokerError> {
  TcpListener::bind(address)
    .await
    .map_err(|error| BrokerError::Bind {
      transport: Transport::Tcp,
      address,
      error,
    })
}

pub async fn bind_discovery(address: SocketAddr) -> Result<UdpSocket, BrokerError> {
  UdpSocket::bind(address)
    .await
    .map_err(|error| BrokerError::Bind {
      transport: Transport::Udp,
      address,
      error,
    })
}

/// Accepted TCP connections paired with their remote addresses
pub fn tcp_connection_source(
  listener: TcpListener,
) -> impl Stream<Item = std::io::Result<(TcpStream, SocketAddr)>> + Send {
  TcpListenerStream::new(listener).map(|accepted: std::io::Result<TcpStream>| {
    let stream = accepted?;
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr()?;
    Ok((stream, peer))
  })
}

#[cfg(test)]
pub(crate) mod tests {
  use std::{sync::Arc, time::Duration};

  use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
  use tokio_util::sync::CancellationToken;

  use super::Broker;
  use crate::{
    common::protocol::{
      AppId, AppInstanceReply, ControlFlags, DiscoverAppInstances, InstanceId, Message,
      OpenSocket, PackType, Packet, Publish, PublishReply, SocketControl, SocketData, SocketId,
    },
    util::framed::{read_packet, write_packet},
  };

  const TIMEOUT: Duration = Duration::from_secs(5);

  /// Speaks raw frames to a broker over an in-memory stream
  pub(crate) struct RawPeer {
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
  }

  impl RawPeer {
    pub(crate) async fn attach(broker: &Arc<Broker>, shutdown: &CancellationToken) -> Self {
      let (near, far) = tokio::io::duplex(64 * 1024);
      tokio::spawn(broker.clone().serve_connection(near, None, shutdown.clone()));
      let (reader, writer) = tokio::io::split(far);
      let mut peer = Self { reader, writer };
      assert_eq!(peer.recv().await.pack_type(), PackType::TcpHello);
      peer
    }

    pub(crate) async fn send(&mut self, message: &impl Message, nonce: u32) {
      write_packet(&mut self.writer, &message.to_packet(nonce))
        .await
        .expect("Write to broker must succeed");
    }

    pub(crate) async fn recv(&mut self) -> Packet {
      tokio::time::timeout(TIMEOUT, read_packet(&mut self.reader, None))
        .await
        .expect("Broker must answer in time")
        .expect("Frame must be well formed")
        .expect("Broker must not close the connection")
    }

    pub(crate) async fn expect_silence(&mut self) {
      let waited =
        tokio::time::timeout(Duration::from_millis(100), read_packet(&mut self.reader, None)).await;
      assert!(waited.is_err(), "Expected no frame, received {:?}", waited);
    }

    pub(crate) async fn publish(&mut self, description: &str) -> PublishReply {
      self
        .send(
          &Publish {
            description: description.into(),
          },
          11,
        )
        .await;
      let packet = self.recv().await;
      assert_eq!(packet.nonce(), 11);
      PublishReply::from_packet(&packet).unwrap()
    }

    pub(crate) async fn recv_control(&mut self) -> (SocketControl, u32) {
      let packet = self.recv().await;
      (SocketControl::from_packet(&packet).unwrap(), packet.nonce())
    }
  }

  async fn open_pending(
    broker: &Arc<Broker>,
    shutdown: &CancellationToken,
  ) -> (RawPeer, RawPeer, InstanceId, SocketId) {
    let mut app = RawPeer::attach(broker, shutdown).await;
    let mut requestor = RawPeer::attach(broker, shutdown).await;
    let published = app.publish("echo").await;
    assert!(published.success);

    requestor
      .send(
        &OpenSocket {
          instance_id: published.instance_id,
        },
        77,
      )
      .await;
    let (ack, nonce) = requestor.recv_control().await;
    assert_eq!(nonce, 77);
    assert_eq!(ack.flags, ControlFlags::OPEN_ACK);
    assert!(!ack.socket_id.is_zero());

    let (request, nonce) = app.recv_control().await;
    assert_eq!(nonce, 0);
    assert_eq!(request.flags, ControlFlags::OPEN_REQUEST);
    assert_eq!(request.socket_id, ack.socket_id);
    assert_eq!(request.instance_id, Some(published.instance_id));
    (app, requestor, published.instance_id, ack.socket_id)
  }

  #[tokio::test]
  async fn publish_and_list_instances() {
    let broker = Broker::new(None, None);
    let shutdown = CancellationToken::new();
    let mut first = RawPeer::attach(&broker, &shutdown).await;
    let mut second = RawPeer::attach(&broker, &shutdown).await;
    let a = first.publish("chat").await;
    let b = second.publish("chat").await;
    assert!(a.success && b.success);
    assert_eq!(a.app_id, AppId::for_description("chat"));
    assert_ne!(a.instance_id, b.instance_id);

    first
      .send(
        &DiscoverAppInstances {
          app_id: AppId::for_description("chat"),
        },
        5,
      )
      .await;
    let packet = first.recv().await;
    assert_eq!(packet.nonce(), 5);
    let reply = AppInstanceReply::from_packet(&packet).unwrap();
    assert_eq!(reply.instances, vec![a.instance_id, b.instance_id]);

    first
      .send(
        &DiscoverAppInstances {
          app_id: AppId::for_description("nothing"),
        },
        6,
      )
      .await;
    let reply = AppInstanceReply::from_packet(&first.recv().await).unwrap();
    assert!(reply.instances.is_empty());
    shutdown.cancel();
  }

  #[tokio::test]
  async fn open_accept_and_relay() {
    let broker = Broker::new(None, None);
    let shutdown = CancellationToken::new();
    let (mut app, mut requestor, _, socket_id) = open_pending(&broker, &shutdown).await;

    // Data before acceptance is dropped
    requestor
      .send(
        &SocketData {
          socket_id,
          data: b"early".to_vec(),
        },
        0,
      )
      .await;
    app
      .send(
        &SocketControl::new(socket_id, ControlFlags::ACCEPT_CONNECTION),
        0,
      )
      .await;
    let (ready, _) = requestor.recv_control().await;
    assert_eq!(ready.socket_id, socket_id);
    assert_eq!(ready.flags, ControlFlags::READY);
    app.expect_silence().await;

    let payload: Vec<u8> = (0..=255u8).collect();
    requestor
      .send(
        &SocketData {
          socket_id,
          data: payload.clone(),
        },
        0,
      )
      .await;
    let relayed = SocketData::from_packet(&app.recv().await).unwrap();
    assert_eq!(relayed.socket_id, socket_id);
    assert_eq!(relayed.data, payload);

    app
      .send(
        &SocketData {
          socket_id,
          data: b"pong".to_vec(),
        },
        0,
      )
      .await;
    let relayed = SocketData::from_packet(&requestor.recv().await).unwrap();
    assert_eq!(relayed.data, b"pong");

    requestor
      .send(&SocketControl::new(socket_id, ControlFlags::CLOSE), 0)
      .await;
    let (closed, _) = app.recv_control().await;
    assert_eq!(closed.flags, ControlFlags::CLOSE);
    tokio::time::timeout(TIMEOUT, async {
      while !broker.circuits().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .unwrap();
    shutdown.cancel();
  }

  #[tokio::test]
  async fn refusal_closes_requestor() {
    let broker = Broker::new(None, None);
    let shutdown = CancellationToken::new();
    let (mut app, mut requestor, _, socket_id) = open_pending(&broker, &shutdown).await;
    app
      .send(
        &SocketControl::new(socket_id, ControlFlags::REFUSE_CONNECTION),
        0,
      )
      .await;
    let (closed, _) = requestor.recv_control().await;
    assert_eq!(closed.socket_id, socket_id);
    assert_eq!(closed.flags, ControlFlags::CLOSE);
    assert!(broker.circuits().get(&socket_id).is_none());

    // Later traffic for the removed circuit is ignored
    requestor
      .send(&SocketControl::new(socket_id, ControlFlags::CLOSE), 0)
      .await;
    requestor
      .send(
        &SocketData {
          socket_id,
          data: vec![1],
        },
        0,
      )
      .await;
    app.expect_silence().await;
    shutdown.cancel();
  }

  #[tokio::test]
  async fn unknown_instance_is_refused() {
    let broker = Broker::new(None, None);
    let shutdown = CancellationToken::new();
    let mut requestor = RawPeer::attach(&broker, &shutdown).await;
    requestor
      .send(
        &OpenSocket {
          instance_id: InstanceId::new([9u8; 10]),
        },
        31,
      )
      .await;
    let (refusal, nonce) = requestor.recv_control().await;
    assert_eq!(nonce, 31);
    assert_eq!(refusal.socket_id, SocketId::ZERO);
    assert_eq!(refusal.flags, ControlFlags::OPEN_ACK | ControlFlags::CLOSE);
    assert!(broker.circuits().is_empty());
    shutdown.cancel();
  }

  #[tokio::test]
  async fn teardown_cascades() {
    let broker = Broker::new(None, None);
    let shutdown = CancellationToken::new();
    let (mut app, mut requestor, instance_id, pending) = open_pending(&broker, &shutdown).await;
    let mut second = RawPeer::attach(&broker, &shutdown).await;
    assert!(app.publish("other").await.success);

    second.send(&OpenSocket { instance_id }, 3).await;
    let (ack, _) = second.recv_control().await;
    let (request, _) = app.recv_control().await;
    assert_eq!(request.socket_id, ack.socket_id);
    app
      .send(
        &SocketControl::new(ack.socket_id, ControlFlags::ACCEPT_CONNECTION),
        0,
      )
      .await;
    let (ready, _) = second.recv_control().await;
    assert_eq!(ready.flags, ControlFlags::READY);
    assert_eq!(broker.apps().len(), 2);
    assert_eq!(broker.circuits().len(), 2);

    let mut closed = broker.connection_closed.subscribe();
    drop(app);
    tokio::time::timeout(TIMEOUT, closed.recv())
      .await
      .unwrap()
      .unwrap();
    assert!(broker.apps().is_empty());
    assert!(broker.circuits().is_empty());

    let (notice, _) = requestor.recv_control().await;
    assert_eq!(notice.socket_id, pending);
    assert_eq!(notice.flags, ControlFlags::CLOSE);
    let (notice, _) = second.recv_control().await;
    assert_eq!(notice.socket_id, ack.socket_id);
    assert_eq!(notice.flags, ControlFlags::CLOSE);
    shutdown.cancel();
  }

  #[tokio::test]
  async fn discovery_reply_echoes_nonce() {
    use crate::{
      common::protocol::{Discover, DiscoverReply},
      util::framed::{decode_packet, encode_packet},
    };
    let broker = Broker::new(None, None);
    broker.set_advertised_port(6444);
    let shutdown = CancellationToken::new();
    let socket = super::bind_discovery("127.0.0.1:0".parse().unwrap())
      .await
      .unwrap();
    let address = socket.local_addr().unwrap();
    tokio::spawn(broker.clone().run_discovery(socket, shutdown.clone()));

    let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
      .send_to(&encode_packet(&Discover.to_packet(1234)), address)
      .await
      .unwrap();
    let mut buffer = vec![0u8; 1024];
    let (length, _) = tokio::time::timeout(TIMEOUT, client.recv_from(&mut buffer))
      .await
      .unwrap()
      .unwrap();
    let packet = decode_packet(&buffer[..length], None).unwrap();
    assert_eq!(packet.nonce(), 1234);
    let reply = DiscoverReply::from_packet(&packet).unwrap();
    assert_eq!(reply.port, 6444);
    assert!(reply.certificate.is_empty());
    shutdown.cancel();
  }
}
