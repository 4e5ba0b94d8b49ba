//! Protocol messages.

use crate::envelope::Envelope;
use crate::error::{ProtocolError, ProtocolResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use snapsync_core::SequenceNumber;
use std::fmt;

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u16 = 1;

/// Username and password presented in the handshake.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Account name.
    pub username: String,
    /// Secret.
    pub password: String,
}

impl Credentials {
    /// Creates credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Handshake sent by a device right after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Protocol version the device speaks.
    pub protocol_version: u16,
    /// Stable identifier of the device.
    pub device_id: String,
    /// Credentials checked by the authority.
    pub credentials: Credentials,
    /// Last local sequence number the authority acknowledged.
    pub resume_cursor: SequenceNumber,
    /// Last authority sequence number the device ingested.
    pub remote_cursor: u64,
}

impl Hello {
    /// Creates a handshake for the current protocol version.
    pub fn new(
        device_id: impl Into<String>,
        credentials: Credentials,
        resume_cursor: SequenceNumber,
        remote_cursor: u64,
    ) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            device_id: device_id.into(),
            credentials,
            resume_cursor,
            remote_cursor,
        }
    }

    /// Checks the protocol version.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnsupportedVersion`] on mismatch.
    pub fn check_version(&self) -> ProtocolResult<()> {
        if self.protocol_version == PROTOCOL_VERSION {
            Ok(())
        } else {
            Err(ProtocolError::UnsupportedVersion {
                expected: PROTOCOL_VERSION,
                actual: self.protocol_version,
            })
        }
    }
}

/// Messages from a device to the authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Handshake.
    Hello(Hello),
    /// The envelopes of the local log entry `seq`, acknowledged as a unit.
    Mutation {
        /// Local sequence number the envelopes came from.
        seq: SequenceNumber,
        /// The envelopes, in batch order.
        envelopes: Vec<Envelope>,
    },
}

impl ClientMessage {
    /// Short name for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::Mutation { .. } => "mutation",
        }
    }

    /// Encodes to one CBOR frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode_frame(self)
    }

    /// Decodes one CBOR frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a client message.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        decode_frame(bytes)
    }
}

/// Messages from the authority to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake accepted.
    Welcome {
        /// Latest authority sequence number.
        remote_cursor: u64,
    },
    /// Handshake refused.
    Rejected {
        /// Human-readable reason.
        reason: String,
    },
    /// A mutation accepted from some device.
    ///
    /// Mutations on one connection form a chain: `after` is the `remote_seq`
    /// of the previous mutation sent on the connection, or the handshake's
    /// remote cursor for the first one. A device whose cursor is behind
    /// `after` has missed something and must resync.
    Mutation {
        /// Authority-assigned sequence number.
        remote_seq: u64,
        /// Sequence number this mutation follows on the connection.
        after: u64,
        /// The envelope.
        envelope: Envelope,
    },
    /// Every local entry up to and including `up_to` is accepted.
    Ack {
        /// Highest acknowledged local sequence number.
        up_to: SequenceNumber,
    },
}

impl ServerMessage {
    /// Short name for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::Rejected { .. } => "rejected",
            Self::Mutation { .. } => "mutation",
            Self::Ack { .. } => "ack",
        }
    }

    /// Encodes to one CBOR frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode_frame(self)
    }

    /// Decodes one CBOR frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a server message.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        decode_frame(bytes)
    }
}

fn encode_frame<T: Serialize>(message: &T) -> ProtocolResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(message, &mut buf).map_err(|e| ProtocolError::encode(e.to_string()))?;
    Ok(buf)
}

fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    if bytes.is_empty() {
        return Err(ProtocolError::decode("empty frame"));
    }
    ciborium::from_reader(bytes).map_err(|e| ProtocolError::decode(e.to_string()))
}
