/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Transmit descriptors and their pool.
//!
//! A [`Tx`] tracks one outbound protocol message and/or one RDMA
//! operation from the moment it is acquired until its completion is
//! delivered. Descriptors come from a [`TxPool`] split into a general
//! sub-pool, whose acquisition may block, and a reserved sub-pool whose
//! acquisition never blocks. The reserved sub-pool serves the replies a
//! target must be able to send from the scheduler.

use std::sync::Mutex;
use std::sync::MutexGuard;

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::buffer::BufferKind;
use crate::buffer::IoBuffer;
use crate::error::Completion;
use crate::error::RaError;
use crate::wire::MemKey;
use crate::wire::Msg;
use crate::wire::MsgBody;
use crate::wire::MsgType;
use crate::wire::Nid;
use crate::wire::PortalsHeader;

/// Where a descriptor is in its protocol exchange. The state determines
/// which incoming messages it can match and what happens once its own
/// message has been sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxState {
    /// On the free list.
    Idle,
    /// Send, then done: IMMEDIATE and friends.
    Simple,
    /// PUT initiator: PUT_REQ queued.
    PutiReq,
    /// PUT initiator: waiting for PUT_ACK or PUT_NAK.
    PutiWaitAck,
    /// PUT initiator: RDMA write posted.
    PutiRdma,
    /// PUT initiator: RDMA complete, PUT_DONE queued.
    PutiDone,
    /// PUT target: PUT_NAK queued.
    PuttNak,
    /// PUT target: PUT_ACK queued.
    PuttAck,
    /// PUT target: waiting for PUT_DONE.
    PuttWaitDone,
    /// GET initiator: GET_REQ queued.
    GetiReq,
    /// GET initiator: waiting for GET_DONE or GET_NAK.
    GetiWaitDone,
    /// GET target: GET_NAK queued.
    GettNak,
    /// GET target: RDMA write posted.
    GettRdma,
    /// GET target: RDMA complete, GET_DONE queued.
    GettDone,
}

/// What happens to a descriptor once its message has been posted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterSend {
    /// The operation is over; complete and release the descriptor.
    Complete,
    /// Park on the reply queue in the given state.
    AwaitReply(TxState),
}

impl TxState {
    /// Message types a descriptor in this state can match.
    pub fn awaiting(self) -> &'static [MsgType] {
        match self {
            TxState::PutiWaitAck => &[MsgType::PutAck, MsgType::PutNak],
            TxState::PuttWaitDone => &[MsgType::PutDone],
            TxState::GetiWaitDone => &[MsgType::GetDone, MsgType::GetNak],
            _ => &[],
        }
    }

    /// The message a descriptor in this state is queued to send, if it
    /// is fixed by the state.
    pub fn outgoing(self) -> Option<MsgType> {
        match self {
            TxState::PutiReq => Some(MsgType::PutReq),
            TxState::PutiDone => Some(MsgType::PutDone),
            TxState::PuttNak => Some(MsgType::PutNak),
            TxState::PuttAck => Some(MsgType::PutAck),
            TxState::GetiReq => Some(MsgType::GetReq),
            TxState::GettNak => Some(MsgType::GetNak),
            TxState::GettDone => Some(MsgType::GetDone),
            _ => None,
        }
    }

    /// Transition taken when this state's message has been sent.
    pub fn after_send(self) -> AfterSend {
        match self {
            TxState::Simple
            | TxState::PutiDone
            | TxState::PuttNak
            | TxState::GettNak
            | TxState::GettDone => AfterSend::Complete,
            TxState::PutiReq => AfterSend::AwaitReply(TxState::PutiWaitAck),
            TxState::PuttAck => AfterSend::AwaitReply(TxState::PuttWaitDone),
            TxState::GetiReq => AfterSend::AwaitReply(TxState::GetiWaitDone),
            state => panic!("tx in state {:?} was sent", state),
        }
    }
}

/// Payload buffer mapping state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufType {
    None,
    Immediate,
    PhysUnmapped,
    PhysMapped,
    VirtUnmapped,
    VirtMapped,
}

impl BufType {
    fn unmapped(kind: BufferKind) -> Self {
        match kind {
            BufferKind::Virtual => BufType::VirtUnmapped,
            BufferKind::Physical => BufType::PhysUnmapped,
        }
    }

    pub fn is_mapped(self) -> bool {
        matches!(self, BufType::PhysMapped | BufType::VirtMapped)
    }
}

/// A transmit descriptor.
#[derive(Debug)]
pub struct Tx {
    idx: usize,
    reserved: bool,
    pub state: TxState,
    pub buftype: BufType,
    /// RDMA source or sink.
    pub buffer: Option<IoBuffer>,
    /// Immediate payload, carried in the FMA data.
    pub payload: Bytes,
    /// Registration of `buffer`: device index and key.
    mapping: Option<(usize, MemKey)>,
    /// Completion cookie, unique while the descriptor is outstanding.
    pub cookie: u64,
    /// Message to send; header fields are filled in when posted.
    pub msg: Msg,
    /// The remote node.
    pub nid: Nid,
    /// Portals header of the request this descriptor serves (targets).
    pub hdr: PortalsHeader,
    /// Connection this descriptor is attached to.
    pub cqid: Option<u32>,
    /// When the descriptor started waiting.
    pub qtime: Instant,
    /// Delivers the initiator's completion status.
    pub completion: Option<oneshot::Sender<Completion>>,
}

impl Tx {
    fn new(idx: usize, reserved: bool) -> Self {
        Self {
            idx,
            reserved,
            state: TxState::Idle,
            buftype: BufType::None,
            buffer: None,
            payload: Bytes::new(),
            mapping: None,
            cookie: 0,
            msg: Msg::new(MsgBody::Noop),
            nid: 0,
            hdr: PortalsHeader::default(),
            cqid: None,
            qtime: Instant::now(),
            completion: None,
        }
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved
    }

    /// Attach an immediate payload.
    pub fn set_immediate(&mut self, payload: Bytes) {
        self.payload = payload;
        self.buftype = BufType::Immediate;
    }

    /// Attach an RDMA buffer, not yet registered.
    pub fn set_buffer(&mut self, buffer: IoBuffer) {
        self.buftype = BufType::unmapped(buffer.kind());
        self.buffer = Some(buffer);
    }

    /// Record that `buffer` was registered on device `dev` under `key`.
    pub fn set_mapped(&mut self, dev: usize, key: MemKey) {
        assert!(
            !self.buftype.is_mapped(),
            "tx {} mapped twice ({:?})",
            self.idx,
            self.buftype
        );
        self.buftype = match self.buftype {
            BufType::VirtUnmapped => BufType::VirtMapped,
            BufType::PhysUnmapped => BufType::PhysMapped,
            other => panic!("tx {} has no buffer to map ({:?})", self.idx, other),
        };
        self.mapping = Some((dev, key));
    }

    pub fn mapped_key(&self) -> Option<MemKey> {
        self.mapping.map(|(_, key)| key)
    }

    /// Take the registration for deregistration.
    pub fn take_mapping(&mut self) -> Option<(usize, MemKey)> {
        let mapping = self.mapping.take()?;
        self.buftype = match self.buftype {
            BufType::VirtMapped => BufType::VirtUnmapped,
            BufType::PhysMapped => BufType::PhysUnmapped,
            other => other,
        };
        Some(mapping)
    }

    fn reset(&mut self) {
        assert!(
            self.mapping.is_none(),
            "tx {} released while mapped",
            self.idx
        );
        *self = Tx::new(self.idx, self.reserved);
    }
}

struct PoolInner {
    idle: Vec<Box<Tx>>,
    idle_reserved: Vec<Box<Tx>>,
    /// Indexed by descriptor index; general descriptors first.
    outstanding: Vec<bool>,
    next_cookie: u64,
}

impl PoolInner {
    fn take(&mut self, reserved: bool) -> Option<Box<Tx>> {
        let mut tx = if reserved {
            self.idle_reserved.pop()?
        } else {
            self.idle.pop()?
        };
        assert!(!self.outstanding[tx.idx], "tx {} on free list twice", tx.idx);
        self.outstanding[tx.idx] = true;
        tx.cookie = self.next_cookie;
        self.next_cookie += 1;
        tx.qtime = Instant::now();
        Some(tx)
    }
}

/// A fixed set of descriptors.
pub struct TxPool {
    inner: Mutex<PoolInner>,
    available: Notify,
    ntx: usize,
    nreserved: usize,
}

impl TxPool {
    pub fn new(ntx: usize, nreserved: usize) -> Self {
        let idle = (0..ntx).map(|i| Box::new(Tx::new(i, false))).collect();
        let idle_reserved = (ntx..ntx + nreserved)
            .map(|i| Box::new(Tx::new(i, true)))
            .collect();
        Self {
            inner: Mutex::new(PoolInner {
                idle,
                idle_reserved,
                outstanding: vec![false; ntx + nreserved],
                next_cookie: 1,
            }),
            available: Notify::new(),
            ntx,
            nreserved,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Acquire a descriptor. A general descriptor waits until one is
    /// free; a reserved one fails immediately with `NoDescriptors` when
    /// the reserved sub-pool is empty.
    pub async fn acquire(&self, reserved: bool) -> Result<Box<Tx>, RaError> {
        if reserved {
            return self.try_acquire_reserved();
        }
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(tx) = self.lock().take(false) {
                return Ok(tx);
            }
            notified.await;
        }
    }

    /// Take a reserved descriptor without waiting.
    pub fn try_acquire_reserved(&self) -> Result<Box<Tx>, RaError> {
        self.lock().take(true).ok_or(RaError::NoDescriptors)
    }

    /// Reset `tx` and return it to the sub-pool it came from. Releasing a
    /// descriptor that is not outstanding in this pool is a fatal error.
    pub fn release(&self, mut tx: Box<Tx>) {
        let idx = tx.idx;
        let reserved = tx.reserved;
        assert!(
            idx < self.ntx + self.nreserved && reserved == (idx >= self.ntx),
            "tx {} does not belong to this pool",
            idx
        );
        tx.reset();
        {
            let mut inner = self.lock();
            assert!(inner.outstanding[idx], "tx {} released twice", idx);
            inner.outstanding[idx] = false;
            if reserved {
                inner.idle_reserved.push(tx);
            } else {
                inner.idle.push(tx);
            }
        }
        if !reserved {
            self.available.notify_one();
        }
    }

    /// # free general descriptors.
    pub fn idle(&self) -> usize {
        self.lock().idle.len()
    }

    /// # free reserved descriptors.
    pub fn idle_reserved(&self) -> usize {
        self.lock().idle_reserved.len()
    }
}
