// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::{net::SocketAddr, sync::Arc};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::Instrument;

use super::{
  dispatch::{Dispatcher, Origin, ReceivedPacket},
  protocol::{ConnectionId, Message, Packet},
};
use crate::util::framed::{read_packet, write_packet, ReadError, WriteError};

/// Remote identity of a connection, also used as input when deriving instance ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerAddress {
  Socket(SocketAddr),
  /// In-process transports with no socket address of their own
  Memory(ConnectionId),
}

impl std::fmt::Display for PeerAddress {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      PeerAddress::Socket(addr) => write!(f, "{}", addr),
      PeerAddress::Memory(id) => write!(f, "memory{}", id),
    }
  }
}

impl From<SocketAddr> for PeerAddress {
  fn from(addr: SocketAddr) -> Self {
    PeerAddress::Socket(addr)
  }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One physical stream connection, shared by everything that writes to it.
///
/// Writes are serialized so that frames from concurrent senders never interleave.
pub struct Connection {
  id: ConnectionId,
  peer: PeerAddress,
  writer: tokio::sync::Mutex<Option<BoxedWriter>>,
  closed: CancellationToken,
}

impl std::fmt::Debug for Connection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connection")
      .field("id", &self.id)
      .field("peer", &self.peer)
      .field("closed", &self.closed.is_cancelled())
      .finish_non_exhaustive()
  }
}

impl Connection {
  pub fn new<W>(id: ConnectionId, peer: PeerAddress, writer: W, closed: CancellationToken) -> Arc<Self>
  where
    W: AsyncWrite + Send + Unpin + 'static,
  {
    Arc::new(Self {
      id,
      peer,
      writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
      closed,
    })
  }

  pub fn id(&self) -> ConnectionId {
    self.id
  }

  pub fn peer(&self) -> &PeerAddress {
    &self.peer
  }

  pub fn is_closed(&self) -> bool {
    self.closed.is_cancelled()
  }

  /// Completes once the connection has been closed by either side
  pub fn closed(&self) -> WaitForCancellationFuture<'_> {
    self.closed.cancelled()
  }

  /// Requests closure; the read loop observes this and tears the connection down
  pub fn close(&self) {
    self.closed.cancel();
  }

  pub async fn send(&self, packet: &Packet) -> Result<(), WriteError> {
    if self.is_closed() {
      return Err(WriteError::Closed);
    }
    let mut writer = self.writer.lock().await;
    let writer = writer.as_mut().ok_or(WriteError::Closed)?;
    tracing::trace!(
      connection = %self.id,
      pack_type = ?packet.pack_type(),
      nonce = packet.nonce(),
      "Sending packet"
    );
    write_packet(writer, packet).await
  }

  pub async fn send_message<M: Message>(&self, message: &M, nonce: u32) -> Result<(), WriteError> {
    self.send(&message.to_packet(nonce)).await
  }

  async fn shutdown_writer(&self) {
    let writer = self.writer.lock().await.take();
    if let Some(mut writer) = writer {
      if let Err(error) = writer.shutdown().await {
        tracing::trace!(connection = %self.id, ?error, "Writer shutdown failed");
      }
    }
  }
}

/// Reads frames until the stream ends, fails, or the connection is closed,
/// dispatching each one in arrival order.
///
/// Any frame that cannot be read or parsed ends the connection, since the
/// stream position can no longer be trusted.
pub async fn run_read_loop<R>(
  connection: Arc<Connection>,
  mut reader: R,
  dispatcher: Arc<Dispatcher>,
  max_length: Option<usize>,
) -> Result<(), ReadError>
where
  R: AsyncRead + Send + Unpin,
{
  let span = tracing::debug_span!("connection", id = %connection.id(), peer = %connection.peer());
  let result = async {
    loop {
      let next = tokio::select! {
        _ = connection.closed() => break Ok(()),
        next = read_packet(&mut reader, max_length) => next,
      };
      match next {
        Ok(Some(packet)) => {
          dispatcher
            .dispatch(ReceivedPacket::new(packet, Origin::Tcp(connection.clone())))
            .await;
        }
        Ok(None) => {
          tracing::debug!("Peer closed the connection");
          break Ok(());
        }
        Err(error) => break Err(error),
      }
    }
  }
  .instrument(span)
  .await;
  connection.close();
  connection.shutdown_writer().await;
  result
}

#[cfg(test)]
mod tests {
  use std::{sync::Arc, time::Duration};

  use tokio_util::sync::CancellationToken;

  use super::{run_read_loop, Connection, PeerAddress};
  use crate::{
    common::{
      dispatch::Dispatcher,
      protocol::{ConnectionId, Hello, Message, PackType, Packet},
    },
    util::framed::{read_packet, ReadError, WriteError},
  };

  #[tokio::test]
  async fn send_writes_frames_and_fails_after_close() {
    let (near, mut far) = tokio::io::duplex(1024);
    let id = ConnectionId::new(1);
    let connection = Connection::new(id, PeerAddress::Memory(id), near, CancellationToken::new());
    connection.send_message(&Hello, 0).await.unwrap();
    let read = read_packet(&mut far, None).await.unwrap();
    assert_eq!(read, Some(Packet::empty(PackType::TcpHello, 0)));

    connection.close();
    assert!(matches!(
      connection.send(&Hello.to_packet(0)).await,
      Err(WriteError::Closed)
    ));
  }

  #[tokio::test]
  async fn read_loop_stops_on_garbage_and_closes() {
    use tokio::io::AsyncWriteExt;
    let (near, mut far) = tokio::io::duplex(1024);
    let (reader, writer) = tokio::io::split(near);
    let id = ConnectionId::new(2);
    let connection = Connection::new(id, PeerAddress::Memory(id), writer, CancellationToken::new());
    let dispatcher = Arc::new(Dispatcher::new());
    let reading = tokio::spawn(run_read_loop(connection.clone(), reader, dispatcher, None));
    far.write_all(&[9u8; 12]).await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), reading)
      .await
      .unwrap()
      .unwrap();
    assert!(matches!(result, Err(ReadError::Malformed(_))));
    assert!(connection.is_closed());
  }

  #[tokio::test]
  async fn read_loop_exits_when_closed_locally() {
    let (near, _far) = tokio::io::duplex(1024);
    let (reader, writer) = tokio::io::split(near);
    let id = ConnectionId::new(3);
    let connection = Connection::new(id, PeerAddress::Memory(id), writer, CancellationToken::new());
    let reading = tokio::spawn(run_read_loop(
      connection.clone(),
      reader,
      Arc::new(Dispatcher::new()),
      None,
    ));
    connection.close();
    let result = tokio::time::timeout(Duration::from_secs(5), reading)
      .await
      .unwrap()
      .unwrap();
    assert!(result.is_ok());
  }
}
