/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use crate::wire::Nid;

/// The type of error that can occur on driver operations.
#[derive(thiserror::Error, Debug)]
pub enum RaError {
    /// The magic number is neither ours nor ours byte-swapped.
    #[error("protocol mismatch: bad magic {0:#010x}")]
    ProtocolMismatch(u32),

    /// The protocol version differs from ours; there is no negotiation.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),

    /// A connection attempt carried stamps no newer than an existing
    /// connection to the same peer.
    #[error("stale connection from {nid:#x} (peerstamp {peerstamp:#x}, connstamp {connstamp:#x})")]
    StaleConnection {
        nid: Nid,
        peerstamp: u64,
        connstamp: u64,
    },

    /// The connection handshake did not complete in time.
    #[error("handshake with {0:#x} timed out")]
    HandshakeTimeout(Nid),

    /// The handshake exchanged well-formed records that do not describe
    /// the expected endpoints.
    #[error("handshake with {nid:#x} rejected: {reason}")]
    HandshakeRejected { nid: Nid, reason: String },

    /// The remote side had no buffer matching the request (PUT_NAK/GET_NAK).
    #[error("no matching buffer at {0:#x}")]
    NoMatchingBuffer(Nid),

    /// Repeated handshake failures at the maximum backoff interval.
    #[error("peer {0:#x} unreachable")]
    PeerUnreachable(Nid),

    /// The connection is closing; the operation was failed back.
    #[error("connection to {0:#x} closing")]
    ConnectionClosing(Nid),

    /// The reserved descriptor pool is empty.
    #[error("no reserved tx descriptors available")]
    NoDescriptors,

    /// A wire buffer was shorter than the record it should hold.
    #[error("truncated message: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    /// A message type or flag combination that is not part of the protocol.
    #[error("bad message: {0}")]
    BadMessage(String),

    /// A payload buffer that cannot be described to the RDMA primitive.
    #[error("invalid buffer: {0}")]
    InvalidBuffer(String),

    /// The driver is shutting down.
    #[error("driver shutting down")]
    Shutdown,

    /// An I/O error on the bootstrap socket.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// An error reported by the RDMA primitive.
    #[error(transparent)]
    Fabric(#[from] anyhow::Error),
}

impl RaError {
    /// Whether this error, observed while forming a connection, should be
    /// retried through the peer's reconnect backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RaError::HandshakeTimeout(_) | RaError::Io(_) | RaError::Fabric(_)
        )
    }

    /// An equivalent error, for failing several operations with one cause.
    /// Wrapped I/O and fabric errors keep only their message.
    pub fn replicate(&self) -> RaError {
        match self {
            RaError::ProtocolMismatch(magic) => RaError::ProtocolMismatch(*magic),
            RaError::UnsupportedVersion(v) => RaError::UnsupportedVersion(*v),
            RaError::StaleConnection {
                nid,
                peerstamp,
                connstamp,
            } => RaError::StaleConnection {
                nid: *nid,
                peerstamp: *peerstamp,
                connstamp: *connstamp,
            },
            RaError::HandshakeTimeout(nid) => RaError::HandshakeTimeout(*nid),
            RaError::HandshakeRejected { nid, reason } => RaError::HandshakeRejected {
                nid: *nid,
                reason: reason.clone(),
            },
            RaError::NoMatchingBuffer(nid) => RaError::NoMatchingBuffer(*nid),
            RaError::PeerUnreachable(nid) => RaError::PeerUnreachable(*nid),
            RaError::ConnectionClosing(nid) => RaError::ConnectionClosing(*nid),
            RaError::NoDescriptors => RaError::NoDescriptors,
            RaError::Truncated { need, got } => RaError::Truncated {
                need: *need,
                got: *got,
            },
            RaError::BadMessage(msg) => RaError::BadMessage(msg.clone()),
            RaError::InvalidBuffer(msg) => RaError::InvalidBuffer(msg.clone()),
            RaError::Shutdown => RaError::Shutdown,
            RaError::Io(e) => RaError::Io(std::io::Error::new(e.kind(), e.to_string())),
            RaError::Fabric(e) => RaError::Fabric(anyhow::anyhow!("{:#}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(RaError::HandshakeTimeout(1).is_retryable());
        assert!(
            RaError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused))
                .is_retryable()
        );
        assert!(!RaError::ProtocolMismatch(0).is_retryable());
        assert!(!RaError::UnsupportedVersion(2).is_retryable());
        assert!(
            !RaError::StaleConnection {
                nid: 1,
                peerstamp: 2,
                connstamp: 3
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_replicate() {
        let err = RaError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        ));
        match err.replicate() {
            RaError::Io(e) => {
                assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset);
                assert_eq!(e.to_string(), "reset by peer");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            RaError::PeerUnreachable(0x10).replicate().to_string(),
            "peer 0x10 unreachable"
        );
    }
}

/// Completion status delivered to the initiator of a descriptor.
pub type Completion = Result<(), RaError>;
