//! Envelopes — opaque payloads addressed to a peer.

use bytes::Bytes;

use crate::peer::PeerId;

/// The unit the transport queues and delivers.
///
/// Only `recipient` is used for routing. `kind` and `payload` are carried
/// untouched; interpreting them is the receiving application's concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub sender: PeerId,
    pub recipient: PeerId,
    pub kind: u16,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(sender: PeerId, recipient: PeerId, kind: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            sender,
            recipient,
            kind,
            payload: payload.into(),
        }
    }
}
