//! Frame encoding and decoding for the multiplexer wire protocol.
//!
//! Each frame travels as exactly one secure-channel message:
//!
//! ```text
//! +------+-----------+----------+-----------+-----------------+
//! | type | namespace | name_len |   name    |     payload     |
//! |  u8  |    u8     |  u16 BE  | name_len  |   remainder     |
//! +------+-----------+----------+-----------+-----------------+
//! ```
//!
//! The namespace is written from the sender's point of view, so the receiver
//! maps [`Namespace::Sender`] to a stream the remote opened and
//! [`Namespace::Receiver`] to a stream it opened itself.

use crate::error::FrameError;
use crate::{FRAME_HEADER_SIZE, MAX_NAME_LEN, MAX_PAYLOAD_SIZE};

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// New stream initiation
    Open = 0x01,
    /// Stream data payload
    Data = 0x02,
    /// Sender finished writing
    End = 0x03,
    /// Abort stream in both directions
    Reset = 0x04,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Open),
            0x02 => Ok(Self::Data),
            0x03 => Ok(Self::End),
            0x04 => Ok(Self::Reset),
            _ => Err(FrameError::InvalidFrameType(value)),
        }
    }
}

/// Which side owns the stream name, as seen by the frame's sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Namespace {
    /// Stream opened by the sender
    Sender = 0x00,
    /// Stream opened by the receiver
    Receiver = 0x01,
    /// Stream shared by both sides regardless of who opened it
    Shared = 0x02,
}

impl TryFrom<u8> for Namespace {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Sender),
            0x01 => Ok(Self::Receiver),
            0x02 => Ok(Self::Shared),
            _ => Err(FrameError::InvalidNamespace(value)),
        }
    }
}

/// An owned multiplexer frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Namespace of the stream name
    pub namespace: Namespace,
    /// Stream name
    pub name: String,
    /// Payload (only meaningful for `Data`)
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame without payload
    pub fn control(frame_type: FrameType, namespace: Namespace, name: impl Into<String>) -> Self {
        Self {
            frame_type,
            namespace,
            name: name.into(),
            payload: Vec::new(),
        }
    }

    /// Create a data frame
    pub fn data(namespace: Namespace, name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            frame_type: FrameType::Data,
            namespace,
            name: name.into(),
            payload,
        }
    }

    /// Serialize to wire format
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::NameTooLong`] or [`FrameError::PayloadOverflow`]
    /// when the frame exceeds protocol limits.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let name = self.name.as_bytes();
        if name.len() > MAX_NAME_LEN {
            return Err(FrameError::NameTooLong(name.len()));
        }
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadOverflow);
        }

        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + name.len() + self.payload.len());
        buf.push(self.frame_type as u8);
        buf.push(self.namespace as u8);
        #[allow(clippy::cast_possible_truncation)]
        buf.extend_from_slice(&(name.len() as u16).to_be_bytes());
        buf.extend_from_slice(name);
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Parse from wire format
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] describing the first malformed field.
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::TooShort {
                expected: FRAME_HEADER_SIZE,
                actual: data.len(),
            });
        }

        let frame_type = FrameType::try_from(data[0])?;
        let namespace = Namespace::try_from(data[1])?;
        let name_len = usize::from(u16::from_be_bytes([data[2], data[3]]));
        if name_len > MAX_NAME_LEN {
            return Err(FrameError::NameTooLong(name_len));
        }

        let name_end = FRAME_HEADER_SIZE + name_len;
        if data.len() < name_end {
            return Err(FrameError::TooShort {
                expected: name_end,
                actual: data.len(),
            });
        }

        let name = std::str::from_utf8(&data[FRAME_HEADER_SIZE..name_end])
            .map_err(|_| FrameError::InvalidName)?
            .to_string();

        let payload = &data[name_end..];
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadOverflow);
        }
        if frame_type != FrameType::Data && !payload.is_empty() {
            return Err(FrameError::UnexpectedPayload(frame_type as u8));
        }

        Ok(Self {
            frame_type,
            namespace,
            name,
            payload: payload.to_vec(),
        })
    }
}
