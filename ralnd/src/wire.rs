/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Wire protocol.
//!
//! Two records cross the wire:
//!
//! - [`Msg`]: the fixed-size protocol message carried in the FMA prefix of
//!   every short message on an established connection.
//! - [`ConnReq`]: the connection request/response exchanged over the
//!   bootstrap socket while a connection is forming.
//!
//! Both are sent in the sender's byte order. The receiver checks the magic
//! and flips every multi-byte field if the magic arrives byte-swapped; that
//! is the only automatic recovery. Opaque fields (the portals header and
//! the RDMA endpoint parameters) are carried verbatim.
//!
//! Message layout:
//!
//! ```text
//! Offset  Size  Field
//! 0       4     magic
//! 4       2     version
//! 6       2     type (low 7 bits) | fence (0x80)
//! 8       8     sender NID
//! 16      8     sender connection stamp
//! 24      100   type-tagged union, zero padded
//! 124     4     sequence number
//! ```

use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::config::FMA_MAX_PREFIX;
use crate::error::RaError;

/// Network identifier of a node.
pub type Nid = u64;

/// "I'm an ranal message".
pub const MSG_MAGIC: u32 = 0x0be9_1b92;
/// Current protocol version.
pub const MSG_VERSION: u16 = 1;
/// Fence RDMA: preceding RDMA writes must be visible before this message
/// is processed.
pub const MSG_FENCE: u16 = 0x80;

/// Size of the opaque portals header.
pub const PTL_HDR_SIZE: usize = 72;
/// Size of the opaque RDMA endpoint parameters.
pub const RI_PARAMS_SIZE: usize = 32;

const HDR_SIZE: usize = 24;
const RDMA_DESC_SIZE: usize = 20;
/// Largest union variant: GET_REQ (header + cookie + descriptor).
const UNION_SIZE: usize = PTL_HDR_SIZE + 8 + RDMA_DESC_SIZE;
/// Encoded size of a [`Msg`].
pub const MSG_SIZE: usize = HDR_SIZE + UNION_SIZE + 4;
/// Encoded size of a [`ConnReq`].
pub const CONNREQ_SIZE: usize = 4 + 2 + 2 + 8 * 4 + 4 + RI_PARAMS_SIZE;

const _: () = assert!(MSG_SIZE <= FMA_MAX_PREFIX);

/// Byte order a record was (or will be) encoded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            Endian::Big
        } else {
            Endian::Little
        }
    }

    /// Determine the sender's byte order from a magic read little-endian.
    fn detect(raw: [u8; 4], magic: u32) -> Result<Self, RaError> {
        if u32::from_le_bytes(raw) == magic {
            Ok(Endian::Little)
        } else if u32::from_be_bytes(raw) == magic {
            Ok(Endian::Big)
        } else {
            Err(RaError::ProtocolMismatch(u32::from_le_bytes(raw)))
        }
    }
}

/// Opaque portals header, interpreted only by the upper layer.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PortalsHeader(pub [u8; PTL_HDR_SIZE]);

impl Default for PortalsHeader {
    fn default() -> Self {
        Self([0; PTL_HDR_SIZE])
    }
}

impl std::fmt::Debug for PortalsHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PortalsHeader({:02x?}..)", &self.0[..8])
    }
}

/// Opaque RDMA endpoint parameters exchanged during the handshake.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RiParams(pub [u8; RI_PARAMS_SIZE]);

impl Default for RiParams {
    fn default() -> Self {
        Self([0; RI_PARAMS_SIZE])
    }
}

impl std::fmt::Debug for RiParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RiParams({:02x?}..)", &self.0[..8])
    }
}

/// Key naming a registered memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MemKey(pub u64);

/// Remote-access descriptor: where a peer may RDMA to or from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RdmaDesc {
    pub key: MemKey,
    pub addr: u64,
    pub nob: u32,
}

/// Message types. The fence bit is carried separately in [`Msg::fence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    /// Empty payload (keepalive).
    Noop = 0x01,
    Immediate = 0x02,
    /// src -> sink
    PutReq = 0x03,
    /// No PUT match: sink -> src.
    PutNak = 0x04,
    /// PUT matched: sink -> src.
    PutAck = 0x05,
    /// src -> sink
    PutDone = 0x06,
    /// sink -> src
    GetReq = 0x07,
    /// No GET match: src -> sink.
    GetNak = 0x08,
    /// src -> sink
    GetDone = 0x09,
    Close = 0x0a,
}

impl MsgType {
    /// Types that may carry the fence flag.
    pub fn fenceable(self) -> bool {
        matches!(self, MsgType::PutDone | MsgType::GetDone | MsgType::Close)
    }
}

impl TryFrom<u8> for MsgType {
    type Error = RaError;

    fn try_from(value: u8) -> Result<Self, RaError> {
        match value {
            0x01 => Ok(MsgType::Noop),
            0x02 => Ok(MsgType::Immediate),
            0x03 => Ok(MsgType::PutReq),
            0x04 => Ok(MsgType::PutNak),
            0x05 => Ok(MsgType::PutAck),
            0x06 => Ok(MsgType::PutDone),
            0x07 => Ok(MsgType::GetReq),
            0x08 => Ok(MsgType::GetNak),
            0x09 => Ok(MsgType::GetDone),
            0x0a => Ok(MsgType::Close),
            _ => Err(RaError::BadMessage(format!("unknown type {:#04x}", value))),
        }
    }
}

/// The type-tagged union following the message header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsgBody {
    Noop,
    /// Portals payload travels in the FMA data, not here.
    Immediate { hdr: PortalsHeader },
    PutReq { hdr: PortalsHeader, cookie: u64 },
    PutNak { cookie: u64 },
    PutAck {
        /// Reflected completion cookie.
        src_cookie: u64,
        /// Opaque completion cookie.
        dst_cookie: u64,
        /// Sender's sink buffer.
        desc: RdmaDesc,
    },
    PutDone { cookie: u64 },
    GetReq {
        hdr: PortalsHeader,
        cookie: u64,
        /// Sender's sink buffer.
        desc: RdmaDesc,
    },
    GetNak { cookie: u64 },
    GetDone { cookie: u64 },
    Close,
}

impl MsgBody {
    pub fn msg_type(&self) -> MsgType {
        match self {
            MsgBody::Noop => MsgType::Noop,
            MsgBody::Immediate { .. } => MsgType::Immediate,
            MsgBody::PutReq { .. } => MsgType::PutReq,
            MsgBody::PutNak { .. } => MsgType::PutNak,
            MsgBody::PutAck { .. } => MsgType::PutAck,
            MsgBody::PutDone { .. } => MsgType::PutDone,
            MsgBody::GetReq { .. } => MsgType::GetReq,
            MsgBody::GetNak { .. } => MsgType::GetNak,
            MsgBody::GetDone { .. } => MsgType::GetDone,
            MsgBody::Close => MsgType::Close,
        }
    }
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msg {
    /// Sender's NID.
    pub srcnid: Nid,
    /// Sender's connection stamp.
    pub connstamp: u64,
    pub fence: bool,
    /// Incrementing sequence number.
    pub seq: u32,
    pub body: MsgBody,
}

impl Msg {
    /// A message with the header fields left for the sender to fill in
    /// when it is posted.
    pub fn new(body: MsgBody) -> Self {
        Self {
            srcnid: 0,
            connstamp: 0,
            fence: false,
            seq: 0,
            body,
        }
    }

    pub fn fenced(mut self) -> Self {
        self.fence = true;
        self
    }

    pub fn msg_type(&self) -> MsgType {
        self.body.msg_type()
    }

    /// Encode in this host's byte order.
    pub fn encode(&self) -> Bytes {
        self.encode_with(Endian::native())
    }

    pub fn encode_with(&self, order: Endian) -> Bytes {
        let mut w = Writer::new(order, MSG_SIZE);
        let msg_type = self.msg_type();
        let mut raw_type = msg_type as u16;
        if self.fence {
            debug_assert!(msg_type.fenceable(), "{:?} cannot be fenced", msg_type);
            raw_type |= MSG_FENCE;
        }

        w.u32(MSG_MAGIC);
        w.u16(MSG_VERSION);
        w.u16(raw_type);
        w.u64(self.srcnid);
        w.u64(self.connstamp);

        let union_start = w.len();
        match &self.body {
            MsgBody::Noop | MsgBody::Close => {}
            MsgBody::Immediate { hdr } => w.bytes(&hdr.0),
            MsgBody::PutReq { hdr, cookie } => {
                w.bytes(&hdr.0);
                w.u64(*cookie);
            }
            MsgBody::PutAck {
                src_cookie,
                dst_cookie,
                desc,
            } => {
                w.u64(*src_cookie);
                w.u64(*dst_cookie);
                w.desc(desc);
            }
            MsgBody::GetReq { hdr, cookie, desc } => {
                w.bytes(&hdr.0);
                w.u64(*cookie);
                w.desc(desc);
            }
            MsgBody::PutNak { cookie }
            | MsgBody::PutDone { cookie }
            | MsgBody::GetNak { cookie }
            | MsgBody::GetDone { cookie } => w.u64(*cookie),
        }
        w.zeros(UNION_SIZE - (w.len() - union_start));
        w.u32(self.seq);

        debug_assert_eq!(w.len(), MSG_SIZE);
        w.finish()
    }

    /// Decode a message, returning it with the byte order the sender used.
    pub fn decode(buf: &[u8]) -> Result<(Msg, Endian), RaError> {
        let order = read_magic(buf, MSG_MAGIC)?;
        if buf.len() < MSG_SIZE {
            return Err(RaError::Truncated {
                need: MSG_SIZE,
                got: buf.len(),
            });
        }
        let mut r = Reader::new(&buf[4..MSG_SIZE], order);

        let version = r.u16();
        if version != MSG_VERSION {
            return Err(RaError::UnsupportedVersion(version));
        }
        let raw_type = r.u16();
        let fence = raw_type & MSG_FENCE != 0;
        let code = raw_type & !MSG_FENCE;
        let msg_type = u8::try_from(code)
            .map_err(|_| RaError::BadMessage(format!("unknown type {:#06x}", raw_type)))
            .and_then(MsgType::try_from)?;
        if fence && !msg_type.fenceable() {
            return Err(RaError::BadMessage(format!(
                "fence set on {:?}",
                msg_type
            )));
        }
        let srcnid = r.u64();
        let connstamp = r.u64();

        let mut u = Reader::new(r.take(UNION_SIZE), order);
        let body = match msg_type {
            MsgType::Noop => MsgBody::Noop,
            MsgType::Close => MsgBody::Close,
            MsgType::Immediate => MsgBody::Immediate { hdr: u.ptl_hdr() },
            MsgType::PutReq => MsgBody::PutReq {
                hdr: u.ptl_hdr(),
                cookie: u.u64(),
            },
            MsgType::PutAck => MsgBody::PutAck {
                src_cookie: u.u64(),
                dst_cookie: u.u64(),
                desc: u.desc(),
            },
            MsgType::GetReq => MsgBody::GetReq {
                hdr: u.ptl_hdr(),
                cookie: u.u64(),
                desc: u.desc(),
            },
            MsgType::PutNak => MsgBody::PutNak { cookie: u.u64() },
            MsgType::PutDone => MsgBody::PutDone { cookie: u.u64() },
            MsgType::GetNak => MsgBody::GetNak { cookie: u.u64() },
            MsgType::GetDone => MsgBody::GetDone { cookie: u.u64() },
        };
        let seq = r.u32();

        Ok((
            Msg {
                srcnid,
                connstamp,
                fence,
                seq,
                body,
            },
            order,
        ))
    }
}

/// Connection request/response, sent over the bootstrap socket.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnReq {
    /// Sender's device ID.
    pub devid: u16,
    /// Sender's NID.
    pub srcnid: Nid,
    /// Who the sender expects to be listening.
    pub dstnid: Nid,
    /// Sender's instance stamp.
    pub peerstamp: u64,
    /// Sender's connection stamp.
    pub connstamp: u64,
    /// Sender's timeout preference (seconds).
    pub timeout: u32,
    /// Sender's endpoint parameters.
    pub riparams: RiParams,
}

impl ConnReq {
    pub fn encode(&self) -> Bytes {
        self.encode_with(Endian::native())
    }

    pub fn encode_with(&self, order: Endian) -> Bytes {
        let mut w = Writer::new(order, CONNREQ_SIZE);
        w.u32(MSG_MAGIC);
        w.u16(MSG_VERSION);
        w.u16(self.devid);
        w.u64(self.srcnid);
        w.u64(self.dstnid);
        w.u64(self.peerstamp);
        w.u64(self.connstamp);
        w.u32(self.timeout);
        w.bytes(&self.riparams.0);
        debug_assert_eq!(w.len(), CONNREQ_SIZE);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<(ConnReq, Endian), RaError> {
        let order = read_magic(buf, MSG_MAGIC)?;
        if buf.len() < CONNREQ_SIZE {
            return Err(RaError::Truncated {
                need: CONNREQ_SIZE,
                got: buf.len(),
            });
        }
        let mut r = Reader::new(&buf[4..CONNREQ_SIZE], order);
        let version = r.u16();
        if version != MSG_VERSION {
            return Err(RaError::UnsupportedVersion(version));
        }
        let devid = r.u16();
        let srcnid = r.u64();
        let dstnid = r.u64();
        let peerstamp = r.u64();
        let connstamp = r.u64();
        let timeout = r.u32();
        let mut riparams = RiParams::default();
        riparams.0.copy_from_slice(r.take(RI_PARAMS_SIZE));
        Ok((
            ConnReq {
                devid,
                srcnid,
                dstnid,
                peerstamp,
                connstamp,
                timeout,
                riparams,
            },
            order,
        ))
    }
}

fn read_magic(buf: &[u8], magic: u32) -> Result<Endian, RaError> {
    let raw: [u8; 4] = buf
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or(RaError::Truncated {
            need: 4,
            got: buf.len(),
        })?;
    Endian::detect(raw, magic)
}

struct Writer {
    buf: BytesMut,
    order: Endian,
}

impl Writer {
    fn new(order: Endian, capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            order,
        }
    }

    fn len(&self) -> usize {
        self.buf.len()
    }

    fn u16(&mut self, v: u16) {
        match self.order {
            Endian::Little => self.buf.put_u16_le(v),
            Endian::Big => self.buf.put_u16(v),
        }
    }

    fn u32(&mut self, v: u32) {
        match self.order {
            Endian::Little => self.buf.put_u32_le(v),
            Endian::Big => self.buf.put_u32(v),
        }
    }

    fn u64(&mut self, v: u64) {
        match self.order {
            Endian::Little => self.buf.put_u64_le(v),
            Endian::Big => self.buf.put_u64(v),
        }
    }

    fn bytes(&mut self, b: &[u8]) {
        self.buf.put_slice(b);
    }

    fn zeros(&mut self, n: usize) {
        self.buf.put_bytes(0, n);
    }

    fn desc(&mut self, desc: &RdmaDesc) {
        self.u64(desc.key.0);
        self.u64(desc.addr);
        self.u32(desc.nob);
    }

    fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Reads fixed fields from a slice whose length the caller already
/// checked.
struct Reader<'a> {
    buf: &'a [u8],
    order: Endian,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], order: Endian) -> Self {
        Self { buf, order }
    }

    fn take(&mut self, n: usize) -> &'a [u8] {
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        head
    }

    fn array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N));
        out
    }

    fn u16(&mut self) -> u16 {
        let raw = self.array::<2>();
        match self.order {
            Endian::Little => u16::from_le_bytes(raw),
            Endian::Big => u16::from_be_bytes(raw),
        }
    }

    fn u32(&mut self) -> u32 {
        let raw = self.array::<4>();
        match self.order {
            Endian::Little => u32::from_le_bytes(raw),
            Endian::Big => u32::from_be_bytes(raw),
        }
    }

    fn u64(&mut self) -> u64 {
        let raw = self.array::<8>();
        match self.order {
            Endian::Little => u64::from_le_bytes(raw),
            Endian::Big => u64::from_be_bytes(raw),
        }
    }

    fn ptl_hdr(&mut self) -> PortalsHeader {
        PortalsHeader(self.array::<PTL_HDR_SIZE>())
    }

    fn desc(&mut self) -> RdmaDesc {
        RdmaDesc {
            key: MemKey(self.u64()),
            addr: self.u64(),
            nob: self.u32(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hdr(fill: u8) -> PortalsHeader {
        let mut hdr = PortalsHeader::default();
        for (i, b) in hdr.0.iter_mut().enumerate() {
            *b = fill.wrapping_add(i as u8);
        }
        hdr
    }

    fn desc() -> RdmaDesc {
        RdmaDesc {
            key: MemKey(0x1122_3344_5566_7788),
            addr: 0x1000,
            nob: 4096,
        }
    }

    fn all_messages() -> Vec<Msg> {
        let bodies = vec![
            MsgBody::Noop,
            MsgBody::Immediate { hdr: hdr(1) },
            MsgBody::PutReq {
                hdr: hdr(2),
                cookie: 7,
            },
            MsgBody::PutNak { cookie: 8 },
            MsgBody::PutAck {
                src_cookie: 9,
                dst_cookie: 10,
                desc: desc(),
            },
            MsgBody::PutDone { cookie: 11 },
            MsgBody::GetReq {
                hdr: hdr(3),
                cookie: 12,
                desc: desc(),
            },
            MsgBody::GetNak { cookie: 13 },
            MsgBody::GetDone { cookie: 14 },
            MsgBody::Close,
        ];
        bodies
            .into_iter()
            .enumerate()
            .map(|(i, body)| {
                let fence = body.msg_type().fenceable();
                Msg {
                    srcnid: 0xdead_beef_0000_0001,
                    connstamp: 0x0123_4567_89ab_cdef,
                    fence,
                    seq: 1000 + i as u32,
                    body,
                }
            })
            .collect()
    }

    #[test]
    fn test_layout() {
        assert_eq!(MSG_SIZE, 128);
        assert_eq!(CONNREQ_SIZE, 76);
        for msg in all_messages() {
            assert_eq!(msg.encode().len(), MSG_SIZE);
        }
    }

    #[test]
    fn test_msg_round_trip_both_orders() {
        for msg in all_messages() {
            for order in [Endian::Little, Endian::Big] {
                let bytes = msg.encode_with(order);
                let (decoded, detected) = Msg::decode(&bytes).unwrap();
                assert_eq!(detected, order);
                assert_eq!(decoded, msg);
                assert_eq!(decoded.encode_with(detected), bytes);
            }
        }
    }

    #[test]
    fn test_swapped_magic_decodes_identically() {
        for msg in all_messages() {
            let little = msg.encode_with(Endian::Little);
            let big = msg.encode_with(Endian::Big);
            assert_ne!(little, big);
            assert_eq!(&big[..4], &MSG_MAGIC.to_be_bytes());
            let (a, _) = Msg::decode(&little).unwrap();
            let (b, _) = Msg::decode(&big).unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_fence_is_a_separate_bit() {
        let msg = Msg::new(MsgBody::PutDone { cookie: 1 }).fenced();
        let bytes = msg.encode_with(Endian::Little);
        assert_eq!(u16::from_le_bytes([bytes[6], bytes[7]]), 0x86);
        let (decoded, _) = Msg::decode(&bytes).unwrap();
        assert!(decoded.fence);
        assert_eq!(decoded.msg_type(), MsgType::PutDone);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = Msg::new(MsgBody::Noop).encode().to_vec();
        bytes[0] ^= 0xff;
        assert!(matches!(
            Msg::decode(&bytes),
            Err(RaError::ProtocolMismatch(_))
        ));
    }

    #[test]
    fn test_bad_version() {
        let mut bytes = Msg::new(MsgBody::Noop)
            .encode_with(Endian::Little)
            .to_vec();
        bytes[4..6].copy_from_slice(&2u16.to_le_bytes());
        assert!(matches!(
            Msg::decode(&bytes),
            Err(RaError::UnsupportedVersion(2))
        ));

        // The version is flipped along with everything else.
        let mut bytes = Msg::new(MsgBody::Noop).encode_with(Endian::Big).to_vec();
        bytes[4..6].copy_from_slice(&3u16.to_be_bytes());
        assert!(matches!(
            Msg::decode(&bytes),
            Err(RaError::UnsupportedVersion(3))
        ));
    }

    #[test]
    fn test_truncated() {
        let bytes = Msg::new(MsgBody::Noop).encode();
        assert!(matches!(
            Msg::decode(&bytes[..2]),
            Err(RaError::Truncated { need: 4, got: 2 })
        ));
        assert!(matches!(
            Msg::decode(&bytes[..MSG_SIZE - 1]),
            Err(RaError::Truncated { .. })
        ));
    }

    #[test]
    fn test_illegal_type_and_fence() {
        let mut bytes = Msg::new(MsgBody::Noop)
            .encode_with(Endian::Little)
            .to_vec();
        bytes[6..8].copy_from_slice(&0x00u16.to_le_bytes());
        assert!(matches!(Msg::decode(&bytes), Err(RaError::BadMessage(_))));

        bytes[6..8].copy_from_slice(&0x0bu16.to_le_bytes());
        assert!(matches!(Msg::decode(&bytes), Err(RaError::BadMessage(_))));

        // IMMEDIATE | FENCE
        bytes[6..8].copy_from_slice(&0x82u16.to_le_bytes());
        assert!(matches!(Msg::decode(&bytes), Err(RaError::BadMessage(_))));
    }

    #[test]
    fn test_connreq_round_trip() {
        let mut riparams = RiParams::default();
        riparams.0[0] = 0xaa;
        riparams.0[31] = 0x55;
        let req = ConnReq {
            devid: 1,
            srcnid: 0x10,
            dstnid: 0x20,
            peerstamp: 0xfeed,
            connstamp: 0xbeef,
            timeout: 30,
            riparams,
        };
        for order in [Endian::Little, Endian::Big] {
            let bytes = req.encode_with(order);
            assert_eq!(bytes.len(), CONNREQ_SIZE);
            let (decoded, detected) = ConnReq::decode(&bytes).unwrap();
            assert_eq!(decoded, req);
            assert_eq!(detected, order);
            assert_eq!(decoded.encode_with(order), bytes);
        }
    }
}
