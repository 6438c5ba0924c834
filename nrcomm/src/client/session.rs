// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! An endpoint's connection to one broker.

use std::{
  sync::{Arc, Mutex},
  time::Duration,
};

use dashmap::DashMap;
use futures::{future, FutureExt};
use tokio::{
  io::{AsyncRead, AsyncWrite},
  sync::{mpsc, oneshot},
  time::Instant,
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use super::{
  circuit::{CircuitTable, EndpointCircuit, EndpointState},
  stream::CircuitStream,
  EndpointConfig, SessionError,
};
use crate::common::{
  connection::{run_read_loop, Connection, PeerAddress},
  dispatch::{Dispatcher, ReceivedPacket},
  protocol::{
    ids::MonotonicConnectionIds, AppId, AppInstanceReply, ControlFlags, DiscoverAppInstances,
    InstanceId, Message, OpenSocket, PackType, Publish, PublishReply, SocketControl, SocketData,
    SocketId,
  },
};

static SESSION_IDS: MonotonicConnectionIds = MonotonicConnectionIds::new(1);

type Reply<T> = oneshot::Receiver<Result<T, SessionError>>;

/// State reachable from the session's packet handlers
struct SessionCore {
  connection: Arc<Connection>,
  circuits: Arc<CircuitTable>,
  publications: DashMap<InstanceId, mpsc::UnboundedSender<IncomingCircuit>>,
}

struct SessionShared {
  core: Arc<SessionCore>,
  dispatcher: Arc<Dispatcher>,
  reply_timeout: Option<Duration>,
}

impl Drop for SessionShared {
  fn drop(&mut self) {
    self.core.connection.close();
  }
}

/// A live connection to a broker.
///
/// Clones share the connection, which closes when the last clone is dropped or
/// [`Session::close`] is called. Circuits and publications end with it.
#[derive(Clone)]
pub struct Session {
  shared: Arc<SessionShared>,
}

impl std::fmt::Debug for Session {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Session")
      .field("connection", &self.shared.core.connection)
      .field("circuits", &self.shared.core.circuits.len())
      .field("publications", &self.shared.core.publications.len())
      .finish()
  }
}

impl Session {
  /// Runs the session over an already connected stream, returning once the broker has greeted us
  pub async fn establish<S>(
    stream: S,
    peer: PeerAddress,
    config: &EndpointConfig,
  ) -> Result<Session, SessionError>
  where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
  {
    let (reader, writer) = tokio::io::split(stream);
    let id = SESSION_IDS.next();
    let connection = Connection::new(id, peer, writer, CancellationToken::new());
    let core = Arc::new(SessionCore {
      connection: connection.clone(),
      circuits: Arc::new(CircuitTable::default()),
      publications: DashMap::new(),
    });
    let dispatcher = Arc::new(Dispatcher::new());
    let greeted = core.register_handlers(&dispatcher);

    let span = tracing::info_span!("session", %id, %peer);
    tokio::spawn(
      {
        let core = core.clone();
        let dispatcher = dispatcher.clone();
        let max_frame_length = config.max_frame_length;
        async move {
          let result =
            run_read_loop(core.connection.clone(), reader, dispatcher.clone(), max_frame_length)
              .await;
          match result {
            Ok(()) => tracing::info!("Broker connection closed"),
            Err(error) => tracing::warn!(%error, "Broker connection failed"),
          }
          core.teardown(&dispatcher);
        }
      }
      .instrument(span),
    );

    tokio::select! {
      greeting = greeted => greeting.map_err(|_| SessionError::ConnectionClosed)?,
      _ = connection.closed() => return Err(SessionError::ConnectionClosed),
      _ = tokio::time::sleep(config.hello_timeout) => {
        tracing::warn!(%peer, "Broker did not greet us in time");
        connection.close();
        return Err(SessionError::TimedOut("broker greeting"));
      }
    }
    tracing::info!(%peer, "Session established");

    Ok(Session {
      shared: Arc::new(SessionShared {
        core,
        dispatcher,
        reply_timeout: config.reply_timeout,
      }),
    })
  }

  pub fn peer(&self) -> &PeerAddress {
    self.shared.core.connection.peer()
  }

  pub fn is_closed(&self) -> bool {
    self.shared.core.connection.is_closed()
  }

  /// Completes once the broker connection has gone away
  pub async fn closed(&self) {
    self.shared.core.connection.closed().await
  }

  /// Closes the broker connection; every circuit and publication ends with it
  pub fn close(&self) {
    self.shared.core.connection.close();
  }

  fn deadline(&self) -> Option<Instant> {
    self.shared.reply_timeout.map(|timeout| Instant::now() + timeout)
  }

  /// Sends `message` under `nonce`, then waits for the watcher registered on that nonce to report
  async fn request<M: Message, T>(
    &self,
    message: &M,
    nonce: u32,
    reply: Reply<T>,
    deadline: Option<Instant>,
  ) -> Result<T, SessionError> {
    let core = &self.shared.core;
    if let Err(error) = core.connection.send_message(message, nonce).await {
      self.shared.dispatcher.forget_nonce(nonce);
      return Err(error.into());
    }
    let waiting = async {
      tokio::select! {
        reply = reply => reply.unwrap_or(Err(SessionError::ConnectionClosed)),
        _ = core.connection.closed() => Err(SessionError::ConnectionClosed),
      }
    };
    match until(deadline, waiting).await {
      Ok(result) => result,
      Err(elapsed) => {
        self.shared.dispatcher.forget_nonce(nonce);
        Err(elapsed)
      }
    }
  }

  /// Publishes an app under `description`; incoming circuits arrive on the returned publication.
  ///
  /// The broker hands out one instance per description and connection, so publishing a
  /// description again fails with [`SessionError::AlreadyPublished`] while an earlier
  /// [`Publication`] for it is still held. Once that publication is dropped, publishing
  /// again resumes delivery of circuits to the new one.
  pub async fn publish(&self, description: &str) -> Result<Publication, SessionError> {
    let nonce = Dispatcher::generate_nonce();
    let (sender, reply) = oneshot::channel();
    let core = self.shared.core.clone();
    let owned = description.to_owned();
    // Registered inline so no open request can race ahead of the publication
    self.shared.dispatcher.watch_nonce_with(nonce, move |received| {
      let outcome = match PublishReply::from_packet(&received.packet) {
        Ok(reply) if reply.success && core.is_listening(&reply.instance_id) => {
          tracing::warn!(description = %owned, instance_id = %reply.instance_id, "Already published here");
          Err(SessionError::AlreadyPublished(reply.instance_id))
        }
        Ok(reply) if reply.success => {
          let (offers, incoming) = mpsc::unbounded_channel();
          core.publications.insert(reply.instance_id, offers);
          tracing::info!(description = %owned, instance_id = %reply.instance_id, "Published");
          Ok(Publication {
            app_id: reply.app_id,
            instance_id: reply.instance_id,
            description: owned,
            incoming,
          })
        }
        Ok(_) => Err(SessionError::PublishFailed),
        Err(error) => Err(error.into()),
      };
      let _ = sender.send(outcome);
    });
    let request = Publish {
      description: description.to_owned(),
    };
    self.request(&request, nonce, reply, self.deadline()).await
  }

  /// Instance ids currently published under `description`, in publication order
  pub async fn discover_app_instances(
    &self,
    description: &str,
  ) -> Result<Vec<InstanceId>, SessionError> {
    let nonce = Dispatcher::generate_nonce();
    let (sender, reply) = oneshot::channel();
    self.shared.dispatcher.watch_nonce_with(nonce, move |received| {
      let outcome = AppInstanceReply::from_packet(&received.packet)
        .map(|reply| reply.instances)
        .map_err(SessionError::from);
      let _ = sender.send(outcome);
    });
    let request = DiscoverAppInstances {
      app_id: AppId::for_description(description),
    };
    self.request(&request, nonce, reply, self.deadline()).await
  }

  /// Opens a circuit to `instance_id`, resolving once the app has accepted
  pub async fn connect(&self, instance_id: InstanceId) -> Result<CircuitStream, SessionError> {
    let deadline = self.deadline();
    let nonce = Dispatcher::generate_nonce();
    let (sender, reply) = oneshot::channel();
    let core = self.shared.core.clone();
    self.shared.dispatcher.watch_nonce_with(nonce, move |received| {
      let outcome = match SocketControl::from_packet(&received.packet) {
        Ok(control) if control.flags.contains(ControlFlags::CLOSE) => {
          Err(SessionError::ConnectionRefused)
        }
        Ok(control) if control.flags.contains(ControlFlags::OPEN_ACK) => {
          let (circuit, inbox, decision) = core.circuits.register_outbound(
            control.socket_id,
            instance_id,
            &core.connection,
          );
          // Dropping this stream unanswered closes the circuit
          Ok((CircuitStream::new(circuit, inbox), decision))
        }
        Ok(control) => {
          tracing::warn!(flags = %control.flags, "Unexpected answer to an open request");
          Err(SessionError::ConnectionRefused)
        }
        Err(error) => Err(error.into()),
      };
      let _ = sender.send(outcome);
    });
    let (mut stream, decision) = self
      .request(&OpenSocket { instance_id }, nonce, reply, deadline)
      .await?;
    tracing::debug!(socket_id = %stream.socket_id(), %instance_id, "Circuit pending");

    let connection = &self.shared.core.connection;
    let decided = async {
      tokio::select! {
        decision = decision => decision.unwrap_or(Err(SessionError::ConnectionClosed)),
        _ = connection.closed() => Err(SessionError::ConnectionClosed),
      }
    };
    match until(deadline, decided).await {
      Ok(Ok(())) => Ok(stream),
      Ok(Err(error)) => Err(error),
      Err(elapsed) => {
        if let Err(error) = stream.close().await {
          tracing::debug!(%error, "Failed closing timed out circuit");
        }
        Err(elapsed)
      }
    }
  }

  /// A handle that connects to `instance_id` on first use
  pub fn outbound(&self, instance_id: InstanceId) -> OutboundCircuit {
    OutboundCircuit {
      session: self.clone(),
      instance_id,
      stream: None,
    }
  }

  pub fn circuit_count(&self) -> usize {
    self.shared.core.circuits.len()
  }
}

async fn until<F, T>(deadline: Option<Instant>, future: F) -> Result<T, SessionError>
where
  F: std::future::Future<Output = T>,
{
  match deadline {
    Some(deadline) => tokio::time::timeout_at(deadline, future)
      .await
      .map_err(|_| SessionError::TimedOut("broker reply")),
    None => Ok(future.await),
  }
}

impl SessionCore {
  /// Installs the persistent handlers; the returned receiver fires on the broker's greeting
  fn register_handlers(self: &Arc<Self>, dispatcher: &Dispatcher) -> oneshot::Receiver<()> {
    let (greet, greeted) = oneshot::channel();
    let greet = Mutex::new(Some(greet));
    dispatcher.register_handler(PackType::TcpHello, move |_| {
      let sender = match greet.lock() {
        Ok(mut greet) => greet.take(),
        Err(poisoned) => poisoned.into_inner().take(),
      };
      match sender {
        Some(sender) => {
          let _ = sender.send(());
        }
        None => tracing::debug!("Ignoring repeated greeting"),
      }
      future::ready(()).boxed()
    });

    dispatcher.register_handler(PackType::TcpSocketControl, |received| {
      if let Ok(control) = SocketControl::from_packet(&received.packet) {
        tracing::debug!(
          socket_id = %control.socket_id,
          flags = %control.flags,
          instance_id = ?control.instance_id,
          "Socket control"
        );
      }
      future::ready(()).boxed()
    });
    let core = self.clone();
    dispatcher.register_handler(PackType::TcpSocketControl, move |received| {
      let core = core.clone();
      async move { core.on_socket_control(&received).await }.boxed()
    });
    let core = self.clone();
    dispatcher.register_handler(PackType::TcpSocketData, move |received| {
      core.on_socket_data(&received);
      future::ready(()).boxed()
    });
    greeted
  }

  /// Whether a publication is still taking circuits offered to `instance_id`
  fn is_listening(&self, instance_id: &InstanceId) -> bool {
    self
      .publications
      .get(instance_id)
      .map_or(false, |offers| !offers.is_closed())
  }

  async fn on_socket_control(&self, received: &ReceivedPacket) {
    let control = match SocketControl::from_packet(&received.packet) {
      Ok(control) => control,
      Err(error) => {
        tracing::warn!(%error, "Dropping malformed socket control frame");
        return;
      }
    };
    if control.flags.contains(ControlFlags::OPEN_REQUEST) {
      return self.on_open_request(control).await;
    }
    let circuit = match self.circuits.get(&control.socket_id) {
      Some(circuit) => circuit,
      None => {
        tracing::debug!(socket_id = %control.socket_id, flags = %control.flags, "Control frame for unknown circuit");
        return;
      }
    };
    if control.flags.contains(ControlFlags::READY) {
      circuit.ready();
    }
    if control.flags.contains(ControlFlags::CLOSE) && circuit.shut(SessionError::ConnectionRefused) {
      tracing::info!(socket_id = %control.socket_id, "Circuit closed by the far side");
    }
  }

  async fn on_open_request(&self, control: SocketControl) {
    let socket_id = control.socket_id;
    let instance_id = control.instance_id.unwrap_or_default();
    let offers = self
      .publications
      .get(&instance_id)
      .map(|entry| entry.value().clone());
    let offers = match offers {
      Some(offers) => offers,
      None => {
        tracing::warn!(%socket_id, %instance_id, "Open request for an instance not published here");
        let refusal = SocketControl::new(socket_id, ControlFlags::REFUSE_CONNECTION);
        if let Err(error) = self.connection.send_message(&refusal, 0).await {
          tracing::debug!(%socket_id, ?error, "Failed refusing circuit");
        }
        return;
      }
    };
    let circuit = self
      .circuits
      .register_inbound(socket_id, instance_id, &self.connection);
    tracing::info!(%socket_id, %instance_id, loopback = circuit.is_loopback(), "Circuit offered");
    if let Err(mpsc::error::SendError(unwanted)) = offers.send(IncomingCircuit::new(circuit)) {
      tracing::info!(%socket_id, "Publication no longer listening; refusing circuit");
      self.publications.remove(&instance_id);
      if let Err(error) = unwanted.refuse().await {
        tracing::debug!(%socket_id, %error, "Failed refusing circuit");
      }
    }
  }

  fn on_socket_data(&self, received: &ReceivedPacket) {
    let data = match SocketData::from_packet(&received.packet) {
      Ok(data) => data,
      Err(error) => {
        tracing::warn!(%error, "Dropping malformed socket data frame");
        return;
      }
    };
    match self.circuits.get(&data.socket_id) {
      Some(circuit) => circuit.deliver(data.data),
      None => tracing::debug!(socket_id = %data.socket_id, "Data for unknown circuit dropped"),
    }
  }

  fn teardown(&self, dispatcher: &Dispatcher) {
    self.connection.close();
    dispatcher.clear_watchers();
    self.circuits.abort_all();
    self.publications.clear();
  }
}

/// A successful publication and the circuits offered to it
#[derive(Debug)]
pub struct Publication {
  app_id: AppId,
  instance_id: InstanceId,
  description: String,
  incoming: mpsc::UnboundedReceiver<IncomingCircuit>,
}

impl Publication {
  pub fn app_id(&self) -> AppId {
    self.app_id
  }

  pub fn instance_id(&self) -> InstanceId {
    self.instance_id
  }

  pub fn description(&self) -> &str {
    &self.description
  }

  /// Next offered circuit, or `None` once the session has ended
  pub async fn next_circuit(&mut self) -> Option<IncomingCircuit> {
    self.incoming.recv().await
  }

  pub fn into_stream(self) -> UnboundedReceiverStream<IncomingCircuit> {
    UnboundedReceiverStream::new(self.incoming)
  }
}

/// A circuit offered to a local publication, awaiting a decision.
///
/// Dropping it undecided refuses the circuit.
#[derive(Debug)]
pub struct IncomingCircuit {
  circuit: Arc<EndpointCircuit>,
  decided: bool,
}

impl IncomingCircuit {
  fn new(circuit: Arc<EndpointCircuit>) -> Self {
    Self {
      circuit,
      decided: false,
    }
  }

  pub fn socket_id(&self) -> SocketId {
    self.circuit.socket_id()
  }

  pub fn instance_id(&self) -> InstanceId {
    self.circuit.instance_id()
  }

  pub fn is_loopback(&self) -> bool {
    self.circuit.is_loopback()
  }

  pub async fn accept(mut self) -> Result<CircuitStream, SessionError> {
    self.decided = true;
    if self.circuit.state() == EndpointState::Closed {
      return Err(SessionError::ConnectionClosed);
    }
    let inbox = self.circuit.bind_inbox();
    let stream = CircuitStream::new(self.circuit.clone(), inbox);
    if !self.circuit.set_open() {
      return Err(SessionError::ConnectionClosed);
    }
    self
      .circuit
      .send_control(ControlFlags::ACCEPT_CONNECTION)
      .await?;
    tracing::info!(socket_id = %self.circuit.socket_id(), "Circuit accepted");
    Ok(stream)
  }

  pub async fn refuse(mut self) -> Result<(), SessionError> {
    self.decided = true;
    refuse(&self.circuit).await
  }
}

async fn refuse(circuit: &EndpointCircuit) -> Result<(), SessionError> {
  // A loopback circuit learns of the refusal from the Close the broker sends back
  if !circuit.is_loopback() {
    circuit.shut(SessionError::ConnectionRefused);
  }
  circuit.send_control(ControlFlags::REFUSE_CONNECTION).await
}

impl Drop for IncomingCircuit {
  fn drop(&mut self) {
    if self.decided {
      return;
    }
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
      let circuit = self.circuit.clone();
      handle.spawn(async move {
        if let Err(error) = refuse(&circuit).await {
          tracing::debug!(socket_id = %circuit.socket_id(), %error, "Refusal on drop failed");
        }
      });
    }
  }
}

/// A lazily connected circuit to a known instance
#[derive(Debug)]
pub struct OutboundCircuit {
  session: Session,
  instance_id: InstanceId,
  stream: Option<CircuitStream>,
}

impl OutboundCircuit {
  pub fn instance_id(&self) -> InstanceId {
    self.instance_id
  }

  pub fn is_connected(&self) -> bool {
    matches!(&self.stream, Some(stream) if !stream.is_closed())
  }

  /// Connects unless already connected; a closed circuit is reconnected
  pub async fn connect(&mut self) -> Result<&mut CircuitStream, SessionError> {
    if !self.is_connected() {
      self.stream = Some(self.session.connect(self.instance_id).await?);
    }
    self.stream.as_mut().ok_or(SessionError::NotReady)
  }

  pub fn into_stream(self) -> Option<CircuitStream> {
    self.stream
  }
}
