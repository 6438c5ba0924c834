// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Locating brokers by broadcast, and connecting to what was found.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::{
  net::{TcpStream, UdpSocket},
  time::Instant,
};
use tokio_rustls::TlsConnector;

use super::{session::Session, EndpointConfig, SessionError};
use crate::{
  common::{
    connection::PeerAddress,
    dispatch::Dispatcher,
    protocol::{Discover, DiscoverReply, Message, PackType},
    tls,
  },
  util::framed::{decode_packet, encode_packet},
};

const MAX_DATAGRAM: usize = 64 * 1024;

/// A broker that answered discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
  pub address: SocketAddr,
  /// DER certificate the broker serves TLS with; `None` for plain TCP
  pub certificate: Option<Vec<u8>>,
}

impl EntryPoint {
  pub fn plain(address: SocketAddr) -> Self {
    Self {
      address,
      certificate: None,
    }
  }

  pub fn uses_tls(&self) -> bool {
    self.certificate.is_some()
  }

  /// Connects and waits for the broker's greeting.
  ///
  /// With a certificate, the broker must present exactly that certificate.
  pub async fn connect(&self, config: &EndpointConfig) -> Result<Session, SessionError> {
    let tcp = TcpStream::connect(self.address).await?;
    tcp.set_nodelay(true)?;
    let peer = PeerAddress::Socket(self.address);
    match &self.certificate {
      Some(certificate) => {
        let client_config =
          tls::pinned_client_config(certificate, config.client_identity.as_ref())?;
        let stream = TlsConnector::from(client_config)
          .connect(rustls::ServerName::IpAddress(self.address.ip()), tcp)
          .await?;
        tracing::debug!(address = %self.address, "TLS established");
        Session::establish(stream, peer, config).await
      }
      None => Session::establish(tcp, peer, config).await,
    }
  }
}

impl std::fmt::Display for EntryPoint {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self.certificate {
      Some(_) => write!(f, "{} (tls)", self.address),
      None => write!(f, "{}", self.address),
    }
  }
}

/// Broadcasts one discovery request and collects replies until a receive window passes in silence.
///
/// Collection never outlasts `discovery_limit`, even while unrelated datagrams keep arriving.
pub async fn discover(config: &EndpointConfig) -> Result<Vec<EntryPoint>, SessionError> {
  discover_with(config, |_| {}).await
}

/// As [`discover`], reporting each entry point to `on_found` as it arrives
pub async fn discover_with<F>(
  config: &EndpointConfig,
  mut on_found: F,
) -> Result<Vec<EntryPoint>, SessionError>
where
  F: FnMut(&EntryPoint),
{
  let target = config.discovery_target;
  let local: SocketAddr = match target {
    SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
    SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
  };
  let socket = UdpSocket::bind(local).await?;
  if target.is_ipv4() {
    socket.set_broadcast(true)?;
  }
  let nonce = Dispatcher::generate_nonce();
  socket
    .send_to(&encode_packet(&Discover.to_packet(nonce)), target)
    .await?;
  tracing::debug!(%target, nonce, "Sent discovery request");

  let mut found = Vec::new();
  let mut buffer = vec![0u8; MAX_DATAGRAM];
  let give_up = Instant::now() + config.discovery_limit;
  loop {
    let window_end = (Instant::now() + config.discovery_window).min(give_up);
    let (length, from) =
      match tokio::time::timeout_at(window_end, socket.recv_from(&mut buffer)).await {
        Err(_) => {
          if window_end == give_up {
            tracing::debug!(found = found.len(), "Discovery limit reached");
          }
          break;
        }
        Ok(Ok(received)) => received,
        Ok(Err(error)) => {
          tracing::warn!(?error, "Discovery receive failed; ending collection");
          break;
        }
      };
    let reply = match decode_packet(&buffer[..length], config.max_frame_length) {
      Ok(packet) if packet.pack_type() != PackType::UdpDiscoverReply || packet.nonce() != nonce => {
        tracing::debug!(%from, pack_type = ?packet.pack_type(), "Ignoring unrelated datagram");
        continue;
      }
      Ok(packet) => DiscoverReply::from_packet(&packet).map_err(|error| error.to_string()),
      Err(error) => Err(error.to_string()),
    };
    let reply = match reply {
      Ok(reply) => reply,
      Err(error) => {
        tracing::warn!(%from, %error, "Malformed discovery reply; ending collection");
        break;
      }
    };
    let port = match u16::try_from(reply.port) {
      Ok(port) if port != 0 => port,
      _ => {
        tracing::warn!(%from, port = reply.port, "Discovery reply names no usable port");
        continue;
      }
    };
    let entry = EntryPoint {
      address: SocketAddr::new(from.ip(), port),
      certificate: Some(reply.certificate).filter(|certificate| !certificate.is_empty()),
    };
    tracing::info!(%entry, "Found broker");
    on_found(&entry);
    found.push(entry);
  }
  Ok(found)
}
