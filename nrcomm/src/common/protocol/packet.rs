// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

/// The physical carrier a packet arrived on or must travel over
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Transport {
  Tcp,
  Udp,
}

impl std::fmt::Display for Transport {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Transport::Tcp => f.write_str("TCP"),
      Transport::Udp => f.write_str("UDP"),
    }
  }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum PackType {
  UdpDiscover = 1,
  UdpDiscoverReply = 2,
  TcpHello = 3,
  TcpPublish = 4,
  TcpPublishReply = 5,
  TcpDiscoverAppInstances = 6,
  TcpAppInstanceReply = 7,
  TcpOpenSocket = 8,
  TcpSocketControl = 9,
  TcpSocketData = 10,
}

impl PackType {
  pub const ALL: [PackType; 10] = [
    PackType::UdpDiscover,
    PackType::UdpDiscoverReply,
    PackType::TcpHello,
    PackType::TcpPublish,
    PackType::TcpPublishReply,
    PackType::TcpDiscoverAppInstances,
    PackType::TcpAppInstanceReply,
    PackType::TcpOpenSocket,
    PackType::TcpSocketControl,
    PackType::TcpSocketData,
  ];

  pub fn from_u8(value: u8) -> Option<PackType> {
    Self::ALL.iter().copied().find(|t| t.as_u8() == value)
  }

  pub fn as_u8(self) -> u8 {
    self as u8
  }

  /// The only transport a packet of this type may arrive over, if any.
  ///
  /// Discovery is broadcast-only, while session greetings and reply types
  /// only make sense on an established connection.
  pub fn restriction(self) -> Option<Transport> {
    match self {
      PackType::UdpDiscover | PackType::UdpDiscoverReply => Some(Transport::Udp),
      PackType::TcpHello | PackType::TcpPublishReply | PackType::TcpAppInstanceReply => {
        Some(Transport::Tcp)
      }
      PackType::TcpPublish
      | PackType::TcpDiscoverAppInstances
      | PackType::TcpOpenSocket
      | PackType::TcpSocketControl
      | PackType::TcpSocketData => None,
    }
  }
}

impl TryFrom<u8> for PackType {
  type Error = u8;

  fn try_from(value: u8) -> Result<Self, Self::Error> {
    PackType::from_u8(value).ok_or(value)
  }
}

impl From<PackType> for u8 {
  fn from(pack_type: PackType) -> Self {
    pack_type.as_u8()
  }
}

/// A single protocol message; `nonce` is zero for unsolicited packets
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
  pack_type: PackType,
  nonce: u32,
  payload: Vec<u8>,
}

impl Packet {
  pub fn new(pack_type: PackType, nonce: u32, payload: Vec<u8>) -> Self {
    Self {
      pack_type,
      nonce,
      payload,
    }
  }

  pub fn empty(pack_type: PackType, nonce: u32) -> Self {
    Self::new(pack_type, nonce, Vec::new())
  }

  pub fn pack_type(&self) -> PackType {
    self.pack_type
  }

  pub fn nonce(&self) -> u32 {
    self.nonce
  }

  pub fn payload(&self) -> &[u8] {
    &self.payload
  }

  pub fn into_payload(self) -> Vec<u8> {
    self.payload
  }
}

impl std::fmt::Debug for Packet {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Packet")
      .field("pack_type", &self.pack_type)
      .field("nonce", &self.nonce)
      .field("payload_length", &self.payload.len())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::{PackType, Transport};

  #[test]
  fn type_codes_are_stable() {
    for (index, pack_type) in PackType::ALL.iter().enumerate() {
      assert_eq!(pack_type.as_u8() as usize, index + 1);
      assert_eq!(PackType::from_u8(pack_type.as_u8()), Some(*pack_type));
    }
    assert_eq!(PackType::from_u8(0), None);
    assert_eq!(PackType::try_from(11u8), Err(11u8));
  }

  #[test]
  fn restrictions() {
    assert_eq!(PackType::UdpDiscover.restriction(), Some(Transport::Udp));
    assert_eq!(PackType::UdpDiscoverReply.restriction(), Some(Transport::Udp));
    assert_eq!(PackType::TcpHello.restriction(), Some(Transport::Tcp));
    assert_eq!(PackType::TcpPublishReply.restriction(), Some(Transport::Tcp));
    assert_eq!(PackType::TcpAppInstanceReply.restriction(), Some(Transport::Tcp));
    assert_eq!(PackType::TcpPublish.restriction(), None);
    assert_eq!(PackType::TcpSocketData.restriction(), None);
  }
}
