// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Typed payloads for each [PackType], encoded little-endian.

use super::{
  ids::{AppId, InstanceId, SocketId, ID_LENGTH},
  packet::{PackType, Packet},
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
  #[error("{pack_type:?} payload ended early; needed {needed} more bytes but {remaining} remained")]
  Truncated {
    pack_type: PackType,
    needed: usize,
    remaining: usize,
  },
  #[error("Expected a {expected:?} payload but received {received:?}")]
  WrongType {
    expected: PackType,
    received: PackType,
  },
  #[error("Description was not valid UTF-8")]
  InvalidUtf8,
}

/// Flags carried by [SocketControl]; combinations are permitted
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct ControlFlags(u8);

impl ControlFlags {
  pub const OPEN_ACK: ControlFlags = ControlFlags(1 << 7);
  pub const OPEN_REQUEST: ControlFlags = ControlFlags(1 << 6);
  pub const ACCEPT_CONNECTION: ControlFlags = ControlFlags(1 << 5);
  pub const REFUSE_CONNECTION: ControlFlags = ControlFlags(1 << 4);
  pub const READY: ControlFlags = ControlFlags(1 << 3);
  pub const CLOSE: ControlFlags = ControlFlags(1 << 2);

  const NAMES: [(ControlFlags, &'static str); 6] = [
    (ControlFlags::OPEN_ACK, "OA"),
    (ControlFlags::OPEN_REQUEST, "OR"),
    (ControlFlags::ACCEPT_CONNECTION, "A"),
    (ControlFlags::REFUSE_CONNECTION, "REF"),
    (ControlFlags::READY, "REA"),
    (ControlFlags::CLOSE, "C"),
  ];

  pub const fn empty() -> Self {
    Self(0)
  }

  pub const fn from_bits(bits: u8) -> Self {
    Self(bits)
  }

  pub const fn bits(self) -> u8 {
    self.0
  }

  pub const fn is_empty(self) -> bool {
    self.0 == 0
  }

  pub const fn contains(self, other: ControlFlags) -> bool {
    self.0 & other.0 == other.0 && other.0 != 0
  }
}

impl std::ops::BitOr for ControlFlags {
  type Output = ControlFlags;

  fn bitor(self, rhs: Self) -> Self::Output {
    ControlFlags(self.0 | rhs.0)
  }
}

impl std::ops::BitOrAssign for ControlFlags {
  fn bitor_assign(&mut self, rhs: Self) {
    self.0 |= rhs.0
  }
}

/// Comma-separated short names, as seen in logs: `OA,C`
impl std::fmt::Display for ControlFlags {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let mut first = true;
    for (flag, name) in Self::NAMES.iter() {
      if self.contains(*flag) {
        if !first {
          f.write_str(",")?;
        }
        f.write_str(name)?;
        first = false;
      }
    }
    Ok(())
  }
}

impl std::fmt::Debug for ControlFlags {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "ControlFlags({:#04x}: {})", self.0, self)
  }
}

struct PayloadReader<'a> {
  pack_type: PackType,
  remaining: &'a [u8],
}

impl<'a> PayloadReader<'a> {
  fn new(pack_type: PackType, payload: &'a [u8]) -> Self {
    Self {
      pack_type,
      remaining: payload,
    }
  }

  fn take(&mut self, needed: usize) -> Result<&'a [u8], PayloadError> {
    if self.remaining.len() < needed {
      return Err(PayloadError::Truncated {
        pack_type: self.pack_type,
        needed,
        remaining: self.remaining.len(),
      });
    }
    let (taken, rest) = self.remaining.split_at(needed);
    self.remaining = rest;
    Ok(taken)
  }

  fn u8(&mut self) -> Result<u8, PayloadError> {
    Ok(self.take(1)?[0])
  }

  fn u32(&mut self) -> Result<u32, PayloadError> {
    let bytes = self.take(4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
  }

  fn id(&mut self) -> Result<[u8; ID_LENGTH], PayloadError> {
    let mut id = [0u8; ID_LENGTH];
    id.copy_from_slice(self.take(ID_LENGTH)?);
    Ok(id)
  }

  fn length_prefixed(&mut self) -> Result<&'a [u8], PayloadError> {
    let length = self.u32()? as usize;
    self.take(length)
  }
}

fn put_length_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
  out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
  out.extend_from_slice(bytes);
}

pub trait Message: Sized {
  const PACK_TYPE: PackType;

  fn encode_payload(&self, out: &mut Vec<u8>);

  fn decode_payload(payload: &[u8]) -> Result<Self, PayloadError>;

  fn to_packet(&self, nonce: u32) -> Packet {
    let mut payload = Vec::new();
    self.encode_payload(&mut payload);
    Packet::new(Self::PACK_TYPE, nonce, payload)
  }

  fn from_packet(packet: &Packet) -> Result<Self, PayloadError> {
    if packet.pack_type() != Self::PACK_TYPE {
      return Err(PayloadError::WrongType {
        expected: Self::PACK_TYPE,
        received: packet.pack_type(),
      });
    }
    Self::decode_payload(packet.payload())
  }
}

macro_rules! empty_message {
  ($name:ident, $pack_type:expr) => {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct $name;

    impl Message for $name {
      const PACK_TYPE: PackType = $pack_type;

      fn encode_payload(&self, _out: &mut Vec<u8>) {}

      fn decode_payload(_payload: &[u8]) -> Result<Self, PayloadError> {
        Ok($name)
      }
    }
  };
}

empty_message!(Discover, PackType::UdpDiscover);
empty_message!(Hello, PackType::TcpHello);

/// Broker answer to a broadcast; an empty certificate means plain TCP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverReply {
  pub port: u32,
  pub certificate: Vec<u8>,
}

impl Message for DiscoverReply {
  const PACK_TYPE: PackType = PackType::UdpDiscoverReply;

  fn encode_payload(&self, out: &mut Vec<u8>) {
    out.extend_from_slice(&self.port.to_le_bytes());
    put_length_prefixed(out, &self.certificate);
  }

  fn decode_payload(payload: &[u8]) -> Result<Self, PayloadError> {
    let mut reader = PayloadReader::new(Self::PACK_TYPE, payload);
    let port = reader.u32()?;
    let certificate = reader.length_prefixed()?.to_vec();
    Ok(Self { port, certificate })
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
  pub description: String,
}

impl Message for Publish {
  const PACK_TYPE: PackType = PackType::TcpPublish;

  fn encode_payload(&self, out: &mut Vec<u8>) {
    put_length_prefixed(out, self.description.as_bytes());
  }

  fn decode_payload(payload: &[u8]) -> Result<Self, PayloadError> {
    let mut reader = PayloadReader::new(Self::PACK_TYPE, payload);
    let description = std::str::from_utf8(reader.length_prefixed()?)
      .map_err(|_| PayloadError::InvalidUtf8)?
      .to_owned();
    Ok(Self { description })
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReply {
  pub success: bool,
  pub app_id: AppId,
  pub instance_id: InstanceId,
}

impl PublishReply {
  pub fn failure() -> Self {
    Self {
      success: false,
      app_id: AppId::ZERO,
      instance_id: InstanceId::ZERO,
    }
  }
}

impl Message for PublishReply {
  const PACK_TYPE: PackType = PackType::TcpPublishReply;

  fn encode_payload(&self, out: &mut Vec<u8>) {
    out.push(if self.success { 1 } else { 0 });
    out.extend_from_slice(self.app_id.as_bytes());
    out.extend_from_slice(self.instance_id.as_bytes());
  }

  fn decode_payload(payload: &[u8]) -> Result<Self, PayloadError> {
    let mut reader = PayloadReader::new(Self::PACK_TYPE, payload);
    let success = reader.u8()? != 0;
    let app_id = AppId::new(reader.id()?);
    let instance_id = InstanceId::new(reader.id()?);
    Ok(Self {
      success,
      app_id,
      instance_id,
    })
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverAppInstances {
  pub app_id: AppId,
}

impl Message for DiscoverAppInstances {
  const PACK_TYPE: PackType = PackType::TcpDiscoverAppInstances;

  fn encode_payload(&self, out: &mut Vec<u8>) {
    out.extend_from_slice(self.app_id.as_bytes());
  }

  fn decode_payload(payload: &[u8]) -> Result<Self, PayloadError> {
    let mut reader = PayloadReader::new(Self::PACK_TYPE, payload);
    Ok(Self {
      app_id: AppId::new(reader.id()?),
    })
  }
}

/// List of instances for an app; the wire count is a single byte, so at most
/// 255 entries are carried and any beyond that are omitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInstanceReply {
  pub instances: Vec<InstanceId>,
}

impl AppInstanceReply {
  pub const MAX_INSTANCES: usize = u8::MAX as usize;
}

impl Message for AppInstanceReply {
  const PACK_TYPE: PackType = PackType::TcpAppInstanceReply;

  fn encode_payload(&self, out: &mut Vec<u8>) {
    let count = self.instances.len().min(Self::MAX_INSTANCES);
    out.push(count as u8);
    for instance in self.instances.iter().take(count) {
      out.extend_from_slice(instance.as_bytes());
    }
  }

  fn decode_payload(payload: &[u8]) -> Result<Self, PayloadError> {
    let mut reader = PayloadReader::new(Self::PACK_TYPE, payload);
    let count = reader.u8()? as usize;
    let instances = (0..count)
      .map(|_| reader.id().map(InstanceId::new))
      .collect::<Result<Vec<_>, _>>()?;
    Ok(Self { instances })
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenSocket {
  pub instance_id: InstanceId,
}

impl Message for OpenSocket {
  const PACK_TYPE: PackType = PackType::TcpOpenSocket;

  fn encode_payload(&self, out: &mut Vec<u8>) {
    out.extend_from_slice(self.instance_id.as_bytes());
  }

  fn decode_payload(payload: &[u8]) -> Result<Self, PayloadError> {
    let mut reader = PayloadReader::new(Self::PACK_TYPE, payload);
    Ok(Self {
      instance_id: InstanceId::new(reader.id()?),
    })
  }
}

/// Circuit lifecycle signal; `instance_id` travels only alongside OPEN_REQUEST
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketControl {
  pub socket_id: SocketId,
  pub flags: ControlFlags,
  pub instance_id: Option<InstanceId>,
}

impl SocketControl {
  pub fn new(socket_id: SocketId, flags: ControlFlags) -> Self {
    Self {
      socket_id,
      flags,
      instance_id: None,
    }
  }

  pub fn open_request(socket_id: SocketId, instance_id: InstanceId) -> Self {
    Self {
      socket_id,
      flags: ControlFlags::OPEN_REQUEST,
      instance_id: Some(instance_id),
    }
  }
}

impl Message for SocketControl {
  const PACK_TYPE: PackType = PackType::TcpSocketControl;

  fn encode_payload(&self, out: &mut Vec<u8>) {
    out.extend_from_slice(self.socket_id.as_bytes());
    out.push(self.flags.bits());
    if self.flags.contains(ControlFlags::OPEN_REQUEST) {
      out.extend_from_slice(self.instance_id.unwrap_or_default().as_bytes());
    }
  }

  fn decode_payload(payload: &[u8]) -> Result<Self, PayloadError> {
    let mut reader = PayloadReader::new(Self::PACK_TYPE, payload);
    let socket_id = SocketId::new(reader.id()?);
    let flags = ControlFlags::from_bits(reader.u8()?);
    let instance_id = if flags.contains(ControlFlags::OPEN_REQUEST) {
      Some(InstanceId::new(reader.id()?))
    } else {
      None
    };
    Ok(Self {
      socket_id,
      flags,
      instance_id,
    })
  }
}

#[derive(Clone, PartialEq, Eq)]
pub struct SocketData {
  pub socket_id: SocketId,
  pub data: Vec<u8>,
}

impl Message for SocketData {
  const PACK_TYPE: PackType = PackType::TcpSocketData;

  fn encode_payload(&self, out: &mut Vec<u8>) {
    out.extend_from_slice(self.socket_id.as_bytes());
    put_length_prefixed(out, &self.data);
  }

  fn decode_payload(payload: &[u8]) -> Result<Self, PayloadError> {
    let mut reader = PayloadReader::new(Self::PACK_TYPE, payload);
    let socket_id = SocketId::new(reader.id()?);
    let data = reader.length_prefixed()?.to_vec();
    Ok(Self { socket_id, data })
  }
}

impl std::fmt::Debug for SocketData {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SocketData")
      .field("socket_id", &self.socket_id)
      .field("length", &self.data.len())
      .finish()
  }
}
