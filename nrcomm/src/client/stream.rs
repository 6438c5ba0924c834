// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::{
  pin::Pin,
  sync::Arc,
  task::{Context, Poll},
};

use futures::{future::BoxFuture, FutureExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::{
  circuit::{EndpointCircuit, Inbox},
  SessionError,
};
use crate::common::protocol::{InstanceId, SocketId};

/// Byte stream over one open circuit.
///
/// Each write becomes one data frame. Reads yield relayed bytes in arrival order
/// and reach end-of-stream once the circuit closes. Dropping the last stream of a
/// circuit closes it.
pub struct CircuitStream {
  circuit: Arc<EndpointCircuit>,
  inbox: Inbox,
  buffered: Vec<u8>,
  offset: usize,
  pending_write: Option<BoxFuture<'static, Result<usize, SessionError>>>,
  pending_close: Option<BoxFuture<'static, Result<(), SessionError>>>,
}

impl std::fmt::Debug for CircuitStream {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CircuitStream")
      .field("circuit", &self.circuit)
      .field("buffered", &(self.buffered.len() - self.offset))
      .finish_non_exhaustive()
  }
}

impl CircuitStream {
  pub(crate) fn new(circuit: Arc<EndpointCircuit>, inbox: Inbox) -> Self {
    Self {
      circuit,
      inbox,
      buffered: Vec::new(),
      offset: 0,
      pending_write: None,
      pending_close: None,
    }
  }

  pub fn socket_id(&self) -> SocketId {
    self.circuit.socket_id()
  }

  pub fn instance_id(&self) -> InstanceId {
    self.circuit.instance_id()
  }

  pub fn is_requestor(&self) -> bool {
    self.circuit.is_requestor()
  }

  pub fn is_loopback(&self) -> bool {
    self.circuit.is_loopback()
  }

  pub fn is_closed(&self) -> bool {
    self.circuit.is_closed()
  }

  /// Sends `data` as a single frame
  pub async fn send(&self, data: &[u8]) -> Result<(), SessionError> {
    self.circuit.send_data(data.to_vec()).await
  }

  /// Next relayed chunk, or `None` once the circuit has closed
  pub async fn recv(&mut self) -> Option<Vec<u8>> {
    if self.offset < self.buffered.len() {
      let rest = self.buffered.split_off(self.offset);
      self.buffered.clear();
      self.offset = 0;
      return Some(rest);
    }
    self.inbox.recv().await
  }

  /// Closes the circuit, notifying the far side through the broker
  pub async fn close(&mut self) -> Result<(), SessionError> {
    self.circuit.close().await
  }
}

impl AsyncRead for CircuitStream {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    let this = &mut *self;
    loop {
      if this.offset < this.buffered.len() {
        let available = &this.buffered[this.offset..];
        let count = available.len().min(buf.remaining());
        buf.put_slice(&available[..count]);
        this.offset += count;
        return Poll::Ready(Ok(()));
      }
      match this.inbox.poll_recv(cx) {
        Poll::Ready(Some(chunk)) => {
          this.buffered = chunk;
          this.offset = 0;
        }
        // End of stream
        Poll::Ready(None) => return Poll::Ready(Ok(())),
        Poll::Pending => return Poll::Pending,
      }
    }
  }
}

impl CircuitStream {
  fn poll_pending_write(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<usize>> {
    let pending = match self.pending_write.as_mut() {
      Some(pending) => pending,
      None => return Poll::Ready(Ok(0)),
    };
    let result = futures::ready!(pending.poll_unpin(cx));
    self.pending_write = None;
    Poll::Ready(result.map_err(std::io::Error::from))
  }
}

impl AsyncWrite for CircuitStream {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    if self.pending_write.is_none() {
      if buf.is_empty() {
        return Poll::Ready(Ok(0));
      }
      let circuit = self.circuit.clone();
      let data = buf.to_vec();
      self.pending_write = Some(
        async move {
          let length = data.len();
          circuit.send_data(data).await.map(|()| length)
        }
        .boxed(),
      );
    }
    self.poll_pending_write(cx)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    self.poll_pending_write(cx).map_ok(|_| ())
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    futures::ready!(self.poll_pending_write(cx))?;
    if self.pending_close.is_none() {
      let circuit = self.circuit.clone();
      self.pending_close = Some(async move { circuit.close().await }.boxed());
    }
    let pending = match self.pending_close.as_mut() {
      Some(pending) => pending,
      None => return Poll::Ready(Ok(())),
    };
    let result = futures::ready!(pending.poll_unpin(cx));
    self.pending_close = None;
    Poll::Ready(result.map_err(std::io::Error::from))
  }
}

impl Drop for CircuitStream {
  fn drop(&mut self) {
    if !self.circuit.release_view() || self.circuit.is_closed() {
      return;
    }
    match tokio::runtime::Handle::try_current() {
      Ok(handle) => {
        let circuit = self.circuit.clone();
        handle.spawn(async move {
          if let Err(error) = circuit.close().await {
            tracing::debug!(socket_id = %circuit.socket_id(), %error, "Close on drop failed");
          }
        });
      }
      Err(_) => {
        // Without a runtime the broker cannot be told; its teardown will clean up
        self.circuit.shut(SessionError::ConnectionClosed);
      }
    }
  }
}
