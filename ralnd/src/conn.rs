/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Connections.
//!
//! A [`Conn`] is one transport session to a peer, bound to one device.
//! Its identity fields never change after the handshake; everything else
//! lives behind the connection's own lock in [`ConnInner`].
//!
//! State only moves forward: `Established -> Closing -> Closed`.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::MIN_TIMEOUT;
use crate::config::keepalive_interval;
use crate::rdma_components::RaEndpoint;
use crate::tx::Tx;
use crate::tx::TxState;
use crate::wire::MsgType;
use crate::wire::Nid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConnState {
    Established,
    Closing,
    Closed,
}

/// Everything a handshake settles.
pub struct ConnParams {
    pub nid: Nid,
    pub dev: usize,
    pub cqid: u32,
    pub endpoint: Box<dyn RaEndpoint>,
    pub my_connstamp: u64,
    pub peerstamp: u64,
    pub peer_connstamp: u64,
    /// Local timeout preference (seconds).
    pub local_timeout: u64,
    /// Remote timeout preference (seconds).
    pub peer_timeout: u64,
}

/// Mutable connection state.
pub struct ConnInner {
    state: ConnState,
    pub tx_seq: u32,
    pub rx_seq: u32,
    pub last_tx: Instant,
    pub last_rx: Instant,
    closing_since: Option<Instant>,
    /// Queued for sending.
    pub fmaq: VecDeque<Box<Tx>>,
    /// Waiting for RDMA completion, in posting order.
    pub rdmaq: VecDeque<Box<Tx>>,
    /// Waiting for a reply.
    pub replyq: VecDeque<Box<Tx>>,
    pub close_sent: bool,
    pub close_recvd: bool,
    endpoint: Option<Box<dyn RaEndpoint>>,
}

impl ConnInner {
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// The endpoint; gone once the connection is closed.
    pub fn endpoint(&mut self) -> Option<&mut (dyn RaEndpoint + 'static)> {
        self.endpoint.as_deref_mut()
    }

    /// Remove the descriptor waiting for `msg_type` with `cookie`.
    pub fn take_reply(&mut self, msg_type: MsgType, cookie: u64) -> Option<Box<Tx>> {
        let pos = self
            .replyq
            .iter()
            .position(|tx| tx.cookie == cookie && tx.state.awaiting().contains(&msg_type))?;
        self.replyq.remove(pos)
    }

    /// Remove the descriptor whose RDMA write `cookie` identifies.
    pub fn take_rdma(&mut self, cookie: u64) -> Option<Box<Tx>> {
        let pos = self.rdmaq.iter().position(|tx| tx.cookie == cookie)?;
        self.rdmaq.remove(pos)
    }

    /// When the longest-waiting descriptor started waiting.
    pub fn oldest_qtime(&self) -> Option<Instant> {
        self.fmaq
            .iter()
            .chain(self.rdmaq.iter())
            .chain(self.replyq.iter())
            .map(|tx| tx.qtime)
            .min()
    }

    pub fn closing_since(&self) -> Option<Instant> {
        self.closing_since
    }
}

/// A connection to a peer.
pub struct Conn {
    pub nid: Nid,
    pub cqid: u32,
    /// Index of the owning device.
    pub dev: usize,
    pub peerstamp: u64,
    pub peer_connstamp: u64,
    pub my_connstamp: u64,
    pub timeout: Duration,
    pub keepalive: Duration,
    /// On its device's work list.
    scheduled: AtomicBool,
    inner: Mutex<ConnInner>,
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("nid", &format_args!("{:#x}", self.nid))
            .field("cqid", &self.cqid)
            .field("dev", &self.dev)
            .finish()
    }
}

impl Conn {
    pub fn new(params: ConnParams) -> Self {
        let timeout = params
            .local_timeout
            .max(params.peer_timeout)
            .max(MIN_TIMEOUT);
        let now = Instant::now();
        Self {
            nid: params.nid,
            cqid: params.cqid,
            dev: params.dev,
            peerstamp: params.peerstamp,
            peer_connstamp: params.peer_connstamp,
            my_connstamp: params.my_connstamp,
            timeout: Duration::from_secs(timeout),
            keepalive: Duration::from_secs(keepalive_interval(timeout)),
            scheduled: AtomicBool::new(false),
            inner: Mutex::new(ConnInner {
                state: ConnState::Established,
                tx_seq: 0,
                rx_seq: 0,
                last_tx: now,
                last_rx: now,
                closing_since: None,
                fmaq: VecDeque::new(),
                rdmaq: VecDeque::new(),
                replyq: VecDeque::new(),
                close_sent: false,
                close_recvd: false,
                endpoint: Some(params.endpoint),
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ConnInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> ConnState {
        self.lock().state
    }

    /// Mark as needing service. Returns false if it already was.
    pub fn set_scheduled(&self) -> bool {
        !self.scheduled.swap(true, Ordering::AcqRel)
    }

    pub fn clear_scheduled(&self) {
        self.scheduled.store(false, Ordering::Release);
    }

    /// Move to `Closing`. Only the first caller succeeds; it receives the
    /// descriptors that can be failed right away (those queued for send or
    /// waiting for a reply). RDMA writes in flight are left to drain.
    pub fn begin_close(&self, now: Instant) -> Option<Vec<Box<Tx>>> {
        let mut inner = self.lock();
        if inner.state != ConnState::Established {
            return None;
        }
        inner.state = ConnState::Closing;
        inner.closing_since = Some(now);
        let ConnInner { fmaq, replyq, .. } = &mut *inner;
        let failed = fmaq.drain(..).chain(replyq.drain(..)).collect();
        Some(failed)
    }

    /// Move to `Closed` and release the endpoint. Only the first caller
    /// succeeds; it receives every descriptor still attached.
    pub fn terminate(&self) -> Option<Vec<Box<Tx>>> {
        let mut inner = self.lock();
        if inner.state == ConnState::Closed {
            return None;
        }
        inner.state = ConnState::Closed;
        inner.closing_since.get_or_insert_with(Instant::now);
        inner.endpoint = None;
        let ConnInner {
            fmaq,
            rdmaq,
            replyq,
            ..
        } = &mut *inner;
        let remaining = fmaq
            .drain(..)
            .chain(rdmaq.drain(..))
            .chain(replyq.drain(..))
            .collect();
        Some(remaining)
    }

    pub fn info(&self) -> ConnInfo {
        let inner = self.lock();
        ConnInfo {
            nid: self.nid,
            cqid: self.cqid,
            dev: self.dev,
            state: inner.state,
            peerstamp: self.peerstamp,
            peer_connstamp: self.peer_connstamp,
            my_connstamp: self.my_connstamp,
            timeout: self.timeout.as_secs(),
            tx_seq: inner.tx_seq,
            rx_seq: inner.rx_seq,
            fmaq: inner.fmaq.iter().map(|tx| tx.state).collect(),
            rdmaq: inner.rdmaq.iter().map(|tx| tx.state).collect(),
            replyq: inner.replyq.iter().map(|tx| tx.state).collect(),
        }
    }
}

/// Snapshot of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnInfo {
    pub nid: Nid,
    pub cqid: u32,
    pub dev: usize,
    pub state: ConnState,
    pub peerstamp: u64,
    pub peer_connstamp: u64,
    pub my_connstamp: u64,
    /// Seconds.
    pub timeout: u64,
    pub tx_seq: u32,
    pub rx_seq: u32,
    pub fmaq: Vec<TxState>,
    pub rdmaq: Vec<TxState>,
    pub replyq: Vec<TxState>,
}
