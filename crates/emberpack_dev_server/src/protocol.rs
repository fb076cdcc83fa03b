use emberpack_core::diagnostic::Diagnostic;
use thiserror::Error;

/// Wire protocol version carried in the handshake ack.
pub const PROTOCOL_VERSION: u8 = 1;

mod tag {
  pub const HANDSHAKE_ACK: u8 = b'V';
  pub const BATCH_START: u8 = b'H';
  pub const SUBSCRIBE: u8 = b's';
  pub const SYNC_EVENT: u8 = b'r';
  pub const CHUNK: u8 = b'(';
  pub const ERROR_OVERLAY: u8 = b'E';
  pub const RELOAD: u8 = b'R';
  pub const ACK: u8 = b'a';
}

/// Synchronization event codes, sent as the second byte of a sync frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum SyncEvent {
  /// A synchronized batch has begun.
  Started = 0,
  /// Files were seen during a still-running batch.
  SeenFiles = 1,
  /// The batch finished without a compiled-graph change.
  ResultDidNotBundle = 2,
  /// A build finished; clients need not be waited on.
  AnyBuildFinished = 3,
  /// A build finished and the batch is complete only once clients have
  /// applied it.
  AnyBuildFinishedWaitForWebSockets = 4,
}

impl SyncEvent {
  fn from_code(code: u8) -> Option<Self> {
    Some(match code {
      0 => SyncEvent::Started,
      1 => SyncEvent::SeenFiles,
      2 => SyncEvent::ResultDidNotBundle,
      3 => SyncEvent::AnyBuildFinished,
      4 => SyncEvent::AnyBuildFinishedWaitForWebSockets,
      _ => return None,
    })
  }
}

/// Frames pushed from the server to a client runtime.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerMessage {
  /// Ready marker sent once after connect.
  HandshakeAck { version: u8 },
  Sync(SyncEvent),
  /// An HMR chunk, tagged with the generation it was computed against.
  Chunk { generation: u64, code: Vec<u8> },
  ErrorOverlay { diagnostics: Vec<Diagnostic> },
  /// Instruct the client to perform a full reload.
  Reload,
}

/// Frames received from a client runtime.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientMessage {
  /// Begin a synchronized batch; doubles as a heartbeat.
  BatchStart,
  Subscribe { route: String },
  /// The client applied the patch for the given batch.
  Ack { batch: u32 },
}

#[derive(Error, Debug, PartialEq)]
pub enum ProtocolError {
  #[error("empty frame")]
  Empty,
  #[error("unknown frame tag {0:#04x}")]
  UnknownTag(u8),
  #[error("truncated frame for tag {tag:#04x}: expected at least {expected} bytes, got {actual}")]
  Truncated { tag: u8, expected: usize, actual: usize },
  #[error("unknown sync event code {0}")]
  UnknownSyncEvent(u8),
  #[error("malformed frame payload: {0}")]
  MalformedPayload(String),
}

impl ServerMessage {
  pub fn encode(&self) -> Vec<u8> {
    match self {
      ServerMessage::HandshakeAck { version } => vec![tag::HANDSHAKE_ACK, *version],
      ServerMessage::Sync(event) => vec![tag::SYNC_EVENT, *event as u8],
      ServerMessage::Chunk { generation, code } => {
        let mut frame = Vec::with_capacity(9 + code.len());
        frame.push(tag::CHUNK);
        frame.extend_from_slice(&generation.to_le_bytes());
        frame.extend_from_slice(code);
        frame
      }
      ServerMessage::ErrorOverlay { diagnostics } => {
        let mut frame = vec![tag::ERROR_OVERLAY];
        // Diagnostics are plain data; serialization cannot fail.
        if let Ok(payload) = serde_json::to_vec(diagnostics) {
          frame.extend_from_slice(&payload);
        }
        frame
      }
      ServerMessage::Reload => vec![tag::RELOAD],
    }
  }

  pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
    let (&first, rest) = frame.split_first().ok_or(ProtocolError::Empty)?;
    match first {
      tag::HANDSHAKE_ACK => {
        let version = *rest.first().ok_or(ProtocolError::Truncated {
          tag: first,
          expected: 2,
          actual: frame.len(),
        })?;
        Ok(ServerMessage::HandshakeAck { version })
      }
      tag::SYNC_EVENT => {
        let code = *rest.first().ok_or(ProtocolError::Truncated {
          tag: first,
          expected: 2,
          actual: frame.len(),
        })?;
        let event = SyncEvent::from_code(code).ok_or(ProtocolError::UnknownSyncEvent(code))?;
        Ok(ServerMessage::Sync(event))
      }
      tag::CHUNK => {
        if rest.len() < 8 {
          return Err(ProtocolError::Truncated {
            tag: first,
            expected: 9,
            actual: frame.len(),
          });
        }
        let mut generation_bytes = [0u8; 8];
        generation_bytes.copy_from_slice(&rest[..8]);
        Ok(ServerMessage::Chunk {
          generation: u64::from_le_bytes(generation_bytes),
          code: rest[8..].to_vec(),
        })
      }
      tag::ERROR_OVERLAY => {
        let diagnostics = serde_json::from_slice(rest)
          .map_err(|error| ProtocolError::MalformedPayload(error.to_string()))?;
        Ok(ServerMessage::ErrorOverlay { diagnostics })
      }
      tag::RELOAD => Ok(ServerMessage::Reload),
      other => Err(ProtocolError::UnknownTag(other)),
    }
  }
}

impl ClientMessage {
  pub fn encode(&self) -> Vec<u8> {
    match self {
      ClientMessage::BatchStart => vec![tag::BATCH_START],
      ClientMessage::Subscribe { route } => {
        let mut frame = vec![tag::SUBSCRIBE];
        frame.extend_from_slice(route.as_bytes());
        frame
      }
      ClientMessage::Ack { batch } => {
        let mut frame = vec![tag::ACK];
        frame.extend_from_slice(&batch.to_le_bytes());
        frame
      }
    }
  }

  pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
    let (&first, rest) = frame.split_first().ok_or(ProtocolError::Empty)?;
    match first {
      tag::BATCH_START => Ok(ClientMessage::BatchStart),
      tag::SUBSCRIBE => {
        let route = std::str::from_utf8(rest)
          .map_err(|error| ProtocolError::MalformedPayload(error.to_string()))?;
        Ok(ClientMessage::Subscribe {
          route: route.to_string(),
        })
      }
      tag::ACK => {
        if rest.len() < 4 {
          return Err(ProtocolError::Truncated {
            tag: first,
            expected: 5,
            actual: frame.len(),
          });
        }
        let mut batch_bytes = [0u8; 4];
        batch_bytes.copy_from_slice(&rest[..4]);
        Ok(ClientMessage::Ack {
          batch: u32::from_le_bytes(batch_bytes),
        })
      }
      other => Err(ProtocolError::UnknownTag(other)),
    }
  }
}
