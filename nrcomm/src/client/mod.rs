// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Endpoint library: locate brokers, publish apps, and open relayed circuits.

use std::{
  net::{Ipv4Addr, SocketAddr},
  time::Duration,
};

use crate::{
  common::{
    protocol::{InstanceId, PayloadError},
    tls::TlsIdentity,
    tls::TlsSetupError,
  },
  server::config::DEFAULT_DISCOVERY_PORT,
  util::framed::{WriteError, DEFAULT_MAX_FRAME_LENGTH},
};

pub mod circuit;
pub mod discovery;
pub mod session;
pub mod stream;

pub use circuit::{EndpointCircuit, EndpointState};
pub use discovery::{discover, discover_with, EntryPoint};
pub use session::{IncomingCircuit, OutboundCircuit, Publication, Session};
pub use stream::CircuitStream;

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
  #[error("Connection refused by the broker or the remote app")]
  ConnectionRefused,
  #[error("Broker connection is closed")]
  ConnectionClosed,
  #[error("Broker rejected the publication")]
  PublishFailed,
  #[error("Instance {0} is already published by a live publication on this session")]
  AlreadyPublished(InstanceId),
  #[error("Timed out waiting for {0}")]
  TimedOut(&'static str),
  #[error("Circuit is not open")]
  NotReady,
  #[error("Broker sent a malformed reply")]
  Payload(#[from] PayloadError),
  #[error("TLS setup failed")]
  Tls(#[from] TlsSetupError),
  #[error("Frame write failed")]
  Write(#[source] WriteError),
  #[error("I/O failure")]
  Io(#[from] std::io::Error),
}

impl From<WriteError> for SessionError {
  fn from(error: WriteError) -> Self {
    match error {
      WriteError::Closed => SessionError::ConnectionClosed,
      other => SessionError::Write(other),
    }
  }
}

impl From<SessionError> for std::io::Error {
  fn from(error: SessionError) -> Self {
    use std::io::ErrorKind;
    match error {
      SessionError::Io(io) => io,
      SessionError::ConnectionClosed => std::io::Error::new(ErrorKind::BrokenPipe, error),
      SessionError::NotReady => std::io::Error::new(ErrorKind::NotConnected, error),
      SessionError::ConnectionRefused => std::io::Error::new(ErrorKind::ConnectionRefused, error),
      SessionError::TimedOut(_) => std::io::Error::new(ErrorKind::TimedOut, error),
      other => std::io::Error::new(ErrorKind::Other, other),
    }
  }
}

#[derive(Debug, Clone)]
pub struct EndpointConfig {
  /// Where discovery requests are sent; the limited broadcast address by default
  pub discovery_target: SocketAddr,
  /// How long each discovery receive waits; collection stops at the first silent window
  pub discovery_window: Duration,
  /// Upper bound on the whole collection, however busy the network is
  pub discovery_limit: Duration,
  /// Deadline for the broker's greeting after connecting
  pub hello_timeout: Duration,
  /// Deadline for broker replies to publish, instance discovery, and connect.
  /// `None` waits for as long as the connection stays up.
  pub reply_timeout: Option<Duration>,
  pub max_frame_length: Option<usize>,
  /// Presented to brokers that require client certificates
  pub client_identity: Option<TlsIdentity>,
}

impl Default for EndpointConfig {
  fn default() -> Self {
    Self {
      discovery_target: SocketAddr::new(Ipv4Addr::BROADCAST.into(), DEFAULT_DISCOVERY_PORT),
      discovery_window: Duration::from_millis(500),
      discovery_limit: Duration::from_secs(5),
      hello_timeout: Duration::from_secs(10),
      reply_timeout: None,
      max_frame_length: Some(DEFAULT_MAX_FRAME_LENGTH),
      client_identity: None,
    }
  }
}
