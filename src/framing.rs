//! Two-phase transfer framing
//!
//! A control message (READY from the server, or SIZE_INFO) is always paired
//! with exactly one binary frame of the declared length. The transport's own
//! text/binary tag is the only discriminator: payloads carry no in-band
//! header. Integrity is exact length equality and nothing more.

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio_tungstenite::tungstenite::Message;

use crate::error::{StoreError, TransferError};
use crate::protocol::Response;

/// Inbound unit as seen by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    /// Map a transport message onto a session frame. Control frames
    /// (ping/pong/close) yield `None`.
    pub fn from_message(msg: Message) -> Option<Frame> {
        match msg {
            Message::Text(t) => Some(Frame::Text(t.as_str().to_owned())),
            Message::Binary(b) => Some(Frame::Binary(b)),
            Message::Ping(_) | Message::Pong(_) | Message::Close(_) | Message::Frame(_) => None,
        }
    }
}

/// Unit of work for a session's writer task. A `Transfer` is written
/// back-to-back so nothing else can be interleaved between header and payload.
/// It carries the session's transfer slot until the writer has sent it.
#[derive(Debug)]
pub enum Outbound {
    Text(String),
    Transfer {
        header: String,
        payload: Bytes,
        slot: Option<OwnedSemaphorePermit>,
    },
    Close,
}

impl Outbound {
    pub fn json<T: Serialize>(value: &T) -> Outbound {
        // Serialization of our own protocol types cannot fail
        Outbound::Text(serde_json::to_string(value).unwrap_or_default())
    }

    pub fn transfer(header: &Response, payload: Bytes, slot: OwnedSemaphorePermit) -> Outbound {
        Outbound::Transfer {
            header: serde_json::to_string(header).unwrap_or_default(),
            payload,
            slot: Some(slot),
        }
    }

    /// Detach the transfer slot so the writer can hold it across the send.
    pub fn take_slot(&mut self) -> Option<OwnedSemaphorePermit> {
        match self {
            Outbound::Transfer { slot, .. } => slot.take(),
            _ => None,
        }
    }

    pub fn into_messages(self) -> Vec<Message> {
        match self {
            Outbound::Text(t) => vec![Message::Text(t.into())],
            Outbound::Transfer { header, payload, .. } => {
                vec![Message::Text(header.into()), Message::Binary(payload)]
            }
            Outbound::Close => vec![Message::Close(None)],
        }
    }
}

/// Sending half of a session's outbound queue
pub type Outbox = mpsc::Sender<Outbound>;

/// An upload announced by UPLOAD whose binary frame has not arrived yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpload {
    pub filename: String,
    pub size: u64,
}

impl PendingUpload {
    /// Check the frame that follows READY. Only a binary frame of exactly
    /// the declared size completes the transfer.
    pub fn accept(&self, frame: Frame) -> Result<Bytes, TransferError> {
        match frame {
            Frame::Binary(data) => {
                let actual = data.len() as u64;
                if actual != self.size {
                    return Err(TransferError::SizeMismatch {
                        expected: self.size,
                        actual,
                    });
                }
                Ok(data)
            }
            Frame::Text(_) => Err(TransferError::NotBinary),
        }
    }
}

/// Validate a client-supplied filename before it becomes part of a storage
/// path. Rejects empty names, NUL bytes, separators and dot components.
pub fn validate_filename(name: &str) -> Result<&str, StoreError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('\0')
        || name.contains('/')
        || name.contains('\\');
    // Windows drive/ADS syntax
    #[cfg(windows)]
    let invalid = invalid || name.contains(':');
    if invalid {
        return Err(StoreError::InvalidFilename(name.to_string()));
    }
    Ok(name)
}

/// Check a declared upload size against the configured limit
pub fn validate_declared_size(size: u64, max: u64) -> Result<(), String> {
    if size > max {
        return Err(format!("file too large: {size} bytes (max: {max} bytes)"));
    }
    Ok(())
}
