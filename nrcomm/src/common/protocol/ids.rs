// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::sync::atomic::{AtomicU64, Ordering};

use sha1::{Digest, Sha1};

use crate::common::connection::PeerAddress;

/// Length in bytes of every wire identifier
pub const ID_LENGTH: usize = 10;

/// First [ID_LENGTH] bytes of the SHA-1 digest of `input`
pub fn truncated_sha1(input: &[u8]) -> [u8; ID_LENGTH] {
  let digest = Sha1::digest(input);
  let mut id = [0u8; ID_LENGTH];
  id.copy_from_slice(&digest[..ID_LENGTH]);
  id
}

macro_rules! wire_id {
  ($(#[$meta:meta])* $name:ident) => {
    $(#[$meta])*
    #[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
    #[repr(transparent)]
    pub struct $name([u8; ID_LENGTH]);

    impl $name {
      pub const ZERO: $name = $name([0u8; ID_LENGTH]);

      pub const fn new(bytes: [u8; ID_LENGTH]) -> Self {
        Self(bytes)
      }

      /// Reads an identifier from the start of `bytes`, if enough are present
      pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; ID_LENGTH] = bytes.get(..ID_LENGTH)?.try_into().ok()?;
        Some(Self(bytes))
      }

      pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
        &self.0
      }

      pub fn is_zero(&self) -> bool {
        self.0 == [0u8; ID_LENGTH]
      }
    }

    impl From<[u8; ID_LENGTH]> for $name {
      fn from(bytes: [u8; ID_LENGTH]) -> Self {
        Self(bytes)
      }
    }

    impl std::fmt::Display for $name {
      fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
      }
    }

    impl std::fmt::Debug for $name {
      fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", stringify!($name), self)
      }
    }
  };
}

wire_id!(
  /// Identifies an application kind; the same description always yields the same id
  AppId
);
wire_id!(
  /// Identifies one published instance of an application on one broker connection
  InstanceId
);
wire_id!(
  /// Identifies a virtual circuit relayed by the broker
  SocketId
);

impl AppId {
  pub fn for_description(description: &str) -> Self {
    Self(truncated_sha1(description.as_bytes()))
  }
}

impl InstanceId {
  pub fn for_publication(publisher: &PeerAddress, description: &str) -> Self {
    Self(truncated_sha1(
      format!("{}-{}", publisher, description).as_bytes(),
    ))
  }
}

pub trait SocketIdGenerator: Send + Sync {
  fn next(&self, requestor: &PeerAddress, description: &str) -> SocketId;
}

/// Derives socket ids from the wall clock, the requestor, and the target description.
///
/// A sequence counter is mixed in so that two requests within one clock tick
/// still produce distinct identifiers.
#[derive(Default)]
pub struct TimestampSocketIdGenerator {
  sequence: AtomicU64,
}

impl TimestampSocketIdGenerator {
  pub fn new() -> Self {
    Self::default()
  }
}

impl SocketIdGenerator for TimestampSocketIdGenerator {
  fn next(&self, requestor: &PeerAddress, description: &str) -> SocketId {
    let timestamp = std::time::SystemTime::now()
      .duration_since(std::time::UNIX_EPOCH)
      .map(|d| d.as_nanos())
      .unwrap_or_default();
    let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
    SocketId(truncated_sha1(
      format!("{}.{}-{}-{}", timestamp, sequence, requestor, description).as_bytes(),
    ))
  }
}

/// Locally-unique identity of one physical connection within a process
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
  pub fn new(inner: u64) -> ConnectionId {
    Self(inner)
  }

  pub fn inner(&self) -> u64 {
    self.0
  }
}

impl std::fmt::Debug for ConnectionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "ConnectionId({})", self.0)
  }
}

impl std::fmt::Display for ConnectionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "#{}", self.0)
  }
}

pub struct MonotonicConnectionIds {
  next: AtomicU64,
}

impl MonotonicConnectionIds {
  pub const fn new(next: u64) -> Self {
    Self {
      next: AtomicU64::new(next),
    }
  }

  pub fn next(&self) -> ConnectionId {
    ConnectionId::new(self.next.fetch_add(1, Ordering::Relaxed))
  }
}

impl Default for MonotonicConnectionIds {
  fn default() -> Self {
    Self::new(1)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn app_id_is_truncated_sha1_of_description() {
    // SHA-1("abc") = a9993e364706816aba3e25717850c26c9cd0d89d
    let id = AppId::for_description("abc");
    assert_eq!(id.to_string(), "A9993E364706816ABA3E");
    assert_eq!(id, AppId::for_description("abc"));
    assert_ne!(id, AppId::for_description("abd"));
  }

  #[test]
  fn instance_ids_depend_on_publisher() {
    let a = PeerAddress::Socket("127.0.0.1:5000".parse().unwrap());
    let b = PeerAddress::Socket("127.0.0.1:5001".parse().unwrap());
    assert_eq!(
      InstanceId::for_publication(&a, "svc"),
      InstanceId::for_publication(&a, "svc")
    );
    assert_ne!(
      InstanceId::for_publication(&a, "svc"),
      InstanceId::for_publication(&b, "svc")
    );
  }

  #[test]
  fn socket_ids_are_distinct_per_request() {
    let generator = TimestampSocketIdGenerator::new();
    let requestor = PeerAddress::Memory(ConnectionId::new(3));
    let first = generator.next(&requestor, "svc");
    let second = generator.next(&requestor, "svc");
    assert_ne!(first, second);
    assert!(!first.is_zero());
  }

  #[test]
  fn from_slice_requires_full_length() {
    assert_eq!(SocketId::from_slice(&[1u8; 9]), None);
    assert_eq!(
      SocketId::from_slice(&[7u8; 12]),
      Some(SocketId::new([7u8; ID_LENGTH]))
    );
    assert!(InstanceId::ZERO.is_zero());
  }
}
