// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Packet framing: `[reserved=0][type][nonce u32][length u32][payload]`,
//! with all integers little-endian.

use sha1::{Digest, Sha1};

use crate::common::protocol::{PackType, Packet};

pub const HEADER_LENGTH: usize = 10;

/// Frame size limit used by brokers and endpoints unless configured otherwise
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Payload buffers start at most this large and grow as bytes actually arrive
const INITIAL_PAYLOAD_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NextExpected {
  Header,
  Payload { length: usize },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedFrame {
  #[error("Frame of {0} bytes is shorter than the {HEADER_LENGTH}-byte header")]
  Truncated(usize),
  #[error("Reserved byte must be zero but was {0:#04x}")]
  NonZeroReserved(u8),
  #[error("Packet type {0:#04x} is not recognized")]
  UnknownPackType(u8),
  #[error("Declared payload length {declared} exceeds the {remaining} bytes available")]
  LengthExceedsRemaining { declared: usize, remaining: usize },
  #[error("Frame length exceeded expectation of {expected} bytes with {received}")]
  MaxLengthExceeded { expected: usize, received: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum ReadError {
  #[error("Malformed frame: {0}")]
  Malformed(#[from] MalformedFrame),
  #[error("Unexpected end of frame; expected {expected:?}")]
  UnexpectedEnd {
    expected: NextExpected,
    error: ::std::io::Error,
  },
}

#[derive(thiserror::Error, Debug)]
pub enum WriteError {
  #[error("Frame write failure: {0:?}")]
  UnexpectedEnd(#[from] ::std::io::Error),
  #[error("Connection is closed")]
  Closed,
}

/// Short hex fingerprint of a built frame, used to correlate log lines
pub fn frame_id(frame: &[u8]) -> String {
  hex::encode_upper(&Sha1::digest(frame)[..5])
}

fn build_frame(packet: &Packet) -> Vec<u8> {
  let payload = packet.payload();
  let mut frame = Vec::with_capacity(HEADER_LENGTH + payload.len());
  frame.push(0u8);
  frame.push(packet.pack_type().as_u8());
  frame.extend_from_slice(&packet.nonce().to_le_bytes());
  frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
  frame.extend_from_slice(payload);
  frame
}

pub fn encode_packet(packet: &Packet) -> Vec<u8> {
  let frame = build_frame(packet);
  if tracing::enabled!(tracing::Level::DEBUG) {
    tracing::debug!(
      frame = %frame_id(&frame),
      pack_type = ?packet.pack_type(),
      nonce = packet.nonce(),
      length = frame.len(),
      "Built packet"
    );
  }
  frame
}

fn log_parsed(packet: &Packet) {
  if tracing::enabled!(tracing::Level::DEBUG) {
    tracing::debug!(
      frame = %frame_id(&build_frame(packet)),
      pack_type = ?packet.pack_type(),
      nonce = packet.nonce(),
      length = HEADER_LENGTH + packet.payload().len(),
      "Finished parsing packet"
    );
  }
}

fn check_header(
  reserved: u8,
  pack_type: u8,
  length: usize,
  max_length: Option<usize>,
) -> Result<PackType, MalformedFrame> {
  if reserved != 0 {
    return Err(MalformedFrame::NonZeroReserved(reserved));
  }
  let pack_type = PackType::from_u8(pack_type).ok_or(MalformedFrame::UnknownPackType(pack_type))?;
  if let Some(max_length) = max_length {
    if length > max_length {
      return Err(MalformedFrame::MaxLengthExceeded {
        expected: max_length,
        received: length,
      });
    }
  }
  Ok(pack_type)
}

/// Parses one complete frame held in memory, as received in a datagram.
///
/// Trailing bytes beyond the declared payload length are ignored.
pub fn decode_packet(buffer: &[u8], max_length: Option<usize>) -> Result<Packet, MalformedFrame> {
  if buffer.len() < HEADER_LENGTH {
    return Err(MalformedFrame::Truncated(buffer.len()));
  }
  let nonce = u32::from_le_bytes([buffer[2], buffer[3], buffer[4], buffer[5]]);
  let length = u32::from_le_bytes([buffer[6], buffer[7], buffer[8], buffer[9]]) as usize;
  let pack_type = check_header(buffer[0], buffer[1], length, max_length)?;
  let remaining = buffer.len() - HEADER_LENGTH;
  if length > remaining {
    return Err(MalformedFrame::LengthExceedsRemaining {
      declared: length,
      remaining,
    });
  }
  let payload = buffer[HEADER_LENGTH..HEADER_LENGTH + length].to_vec();
  let packet = Packet::new(pack_type, nonce, payload);
  log_parsed(&packet);
  Ok(packet)
}

/// Reads the next frame from a stream, waiting until it has fully arrived.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
pub async fn read_packet<T: tokio::io::AsyncRead + Unpin>(
  mut s: T,
  max_length: Option<usize>,
) -> Result<Option<Packet>, ReadError> {
  use tokio::io::AsyncReadExt;
  let header_end = |error: std::io::Error| ReadError::UnexpectedEnd {
    expected: NextExpected::Header,
    error,
  };
  let reserved = match s.read_u8().await {
    Ok(reserved) => reserved,
    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
    Err(e) => return Err(header_end(e)),
  };
  if reserved != 0 {
    return Err(MalformedFrame::NonZeroReserved(reserved).into());
  }
  let mut rest = [0u8; HEADER_LENGTH - 1];
  s.read_exact(&mut rest).await.map_err(header_end)?;
  let nonce = u32::from_le_bytes([rest[1], rest[2], rest[3], rest[4]]);
  let length = u32::from_le_bytes([rest[5], rest[6], rest[7], rest[8]]) as usize;
  let pack_type = check_header(reserved, rest[0], length, max_length)?;
  let payload_end = |error: std::io::Error| ReadError::UnexpectedEnd {
    expected: NextExpected::Payload { length },
    error,
  };
  let mut payload = Vec::with_capacity(length.min(INITIAL_PAYLOAD_CAPACITY));
  (&mut s)
    .take(length as u64)
    .read_to_end(&mut payload)
    .await
    .map_err(payload_end)?;
  if payload.len() != length {
    return Err(payload_end(std::io::ErrorKind::UnexpectedEof.into()));
  }
  let packet = Packet::new(pack_type, nonce, payload);
  log_parsed(&packet);
  Ok(Some(packet))
}

pub async fn write_packet<T: tokio::io::AsyncWrite + Unpin>(
  mut s: T,
  packet: &Packet,
) -> Result<(), WriteError> {
  use tokio::io::AsyncWriteExt;
  let frame = encode_packet(packet);
  s.write_all(&frame).await?;
  Ok(s.flush().await?)
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use tokio::io::AsyncWriteExt;

  use super::*;

  #[tokio::test]
  async fn stream_framed_roundtrip() {
    const TEST_BLOB_LENGTH: usize = 1234;
    let test_data: Vec<u8> = (0..TEST_BLOB_LENGTH).map(|x| (x % 251) as u8).collect();
    let packet = Packet::new(PackType::TcpSocketData, 0xDEADBEEF, test_data.clone());
    let mut buffer = Vec::new();
    write_packet(&mut buffer, &packet)
      .await
      .expect("Writing frame to buffer must succeed");
    assert_eq!(buffer.len(), HEADER_LENGTH + TEST_BLOB_LENGTH);
    assert_eq!(&buffer[..6], &[0, 10, 0xEF, 0xBE, 0xAD, 0xDE]);
    assert_eq!(&buffer[6..10], &(TEST_BLOB_LENGTH as u32).to_le_bytes());

    let mut cursor = std::io::Cursor::new(buffer);
    let read = read_packet(&mut cursor, None)
      .await
      .expect("Reading frame must succeed")
      .expect("A frame must be present");
    assert_eq!(read, packet);
    // Stream is now exhausted on a frame boundary
    assert!(read_packet(&mut cursor, None).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn zero_length_payload() {
    let packet = Packet::empty(PackType::TcpHello, 0);
    let frame = encode_packet(&packet);
    assert_eq!(frame, vec![0, 3, 0, 0, 0, 0, 0, 0, 0, 0]);
    let mut cursor = std::io::Cursor::new(frame);
    assert_eq!(read_packet(&mut cursor, None).await.unwrap(), Some(packet));
  }

  #[test]
  fn decode_rejects_malformed_headers() {
    let mut frame = encode_packet(&Packet::new(PackType::TcpPublish, 4, vec![1, 2, 3]));
    assert!(decode_packet(&frame, None).is_ok());
    assert_eq!(
      decode_packet(&frame[..9], None),
      Err(MalformedFrame::Truncated(9))
    );
    assert_eq!(
      decode_packet(&frame[..12], None),
      Err(MalformedFrame::LengthExceedsRemaining {
        declared: 3,
        remaining: 2
      })
    );
    assert_eq!(
      decode_packet(&frame, Some(2)),
      Err(MalformedFrame::MaxLengthExceeded {
        expected: 2,
        received: 3
      })
    );
    frame[1] = 0;
    assert_eq!(
      decode_packet(&frame, None),
      Err(MalformedFrame::UnknownPackType(0))
    );
    frame[1] = 4;
    frame[0] = 1;
    assert_eq!(
      decode_packet(&frame, None),
      Err(MalformedFrame::NonZeroReserved(1))
    );
  }

  #[tokio::test]
  async fn stream_rejects_nonzero_reserved() {
    let mut frame = encode_packet(&Packet::empty(PackType::TcpHello, 0));
    frame[0] = 0x7f;
    let result = read_packet(std::io::Cursor::new(frame), None).await;
    assert!(matches!(
      result,
      Err(ReadError::Malformed(MalformedFrame::NonZeroReserved(0x7f)))
    ));
  }

  #[tokio::test]
  async fn partial_frames_wait_for_completion() {
    let packet = Packet::new(PackType::TcpSocketData, 12, b"split across writes".to_vec());
    let frame = encode_packet(&packet);
    let (mut writer, mut reader) = tokio::io::duplex(64);
    let reading = tokio::task::spawn(async move { read_packet(&mut reader, None).await });
    for chunk in frame.chunks(3) {
      writer.write_all(chunk).await.unwrap();
      writer.flush().await.unwrap();
      tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let read = tokio::time::timeout(Duration::from_secs(5), reading)
      .await
      .expect("Read must complete once the frame is whole")
      .unwrap()
      .unwrap();
    assert_eq!(read, Some(packet));
  }

  #[tokio::test]
  async fn close_mid_frame_is_unexpected_end() {
    let frame = encode_packet(&Packet::new(PackType::TcpPublish, 1, vec![0u8; 8]));
    let result = read_packet(std::io::Cursor::new(&frame[..14]), None).await;
    assert!(matches!(
      result,
      Err(ReadError::UnexpectedEnd {
        expected: NextExpected::Payload { length: 8 },
        ..
      })
    ));
    let result = read_packet(std::io::Cursor::new(&frame[..4]), None).await;
    assert!(matches!(
      result,
      Err(ReadError::UnexpectedEnd {
        expected: NextExpected::Header,
        ..
      })
    ));
  }

  #[tokio::test]
  async fn oversized_declaration_needs_the_bytes_to_exist() {
    let mut frame = encode_packet(&Packet::new(PackType::TcpSocketData, 1, vec![7u8; 3]));
    frame[6..10].copy_from_slice(&u32::MAX.to_le_bytes());
    let result = read_packet(std::io::Cursor::new(frame), None).await;
    assert!(matches!(
      result,
      Err(ReadError::UnexpectedEnd {
        expected: NextExpected::Payload { length },
        ..
      }) if length == u32::MAX as usize
    ));
  }

  #[tokio::test]
  async fn default_limit_rejects_huge_headers() {
    let mut frame = encode_packet(&Packet::empty(PackType::TcpSocketData, 1));
    frame[6..10].copy_from_slice(&((DEFAULT_MAX_FRAME_LENGTH + 1) as u32).to_le_bytes());
    let result = read_packet(std::io::Cursor::new(frame), Some(DEFAULT_MAX_FRAME_LENGTH)).await;
    assert!(matches!(
      result,
      Err(ReadError::Malformed(MalformedFrame::MaxLengthExceeded { .. }))
    ));
  }

  #[test]
  fn frame_ids_are_short_hex() {
    let frame = encode_packet(&Packet::empty(PackType::TcpHello, 0));
    let id = frame_id(&frame);
    assert_eq!(id.len(), 10);
    assert_eq!(id, frame_id(&frame));
  }
}
