/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! # RDMA Components
//!
//! The driver is written against an abstract RapidArray interface rather
//! than a particular hardware API. This module defines that interface.
//!
//! ## Core Components
//!
//! * [`RaDevice`] - One physical RDMA interface: endpoint creation, memory
//!   registration, and its two completion queues.
//! * [`RaEndpoint`] - One end of a connection: short FMA messages in both
//!   directions, and RDMA writes out.
//!
//! ## Completion queues
//!
//! Each device has an FMA completion queue and an RDMA completion queue.
//! Entries carry the completion id (cqid) the endpoint was created with;
//! several endpoints may share a queue, so the driver routes each entry to
//! its connection by cqid. When anything lands on either queue the device
//! invokes the callback installed with [`RaDevice::set_callback`]. The
//! callback may run in a restricted context and must do O(1) work.
//!
//! ## Connection Lifecycle
//!
//! 1. Create an endpoint with [`RaDevice::create_endpoint`]
//! 2. Exchange [`RiParams`] with the remote side out of band
//! 3. [`RaEndpoint::connect`] to the remote parameters
//! 4. Post FMA messages and RDMA writes; poll for completions
//! 5. Resources are released when the endpoint is dropped

use bytes::Bytes;
use enum_as_inner::EnumAsInner;

use crate::buffer::IoBuffer;
use crate::wire::MemKey;
use crate::wire::RdmaDesc;
use crate::wire::RiParams;

/// Hardware completion callback.
pub type Callback = Box<dyn Fn() + Send + Sync>;

/// An entry on a device's FMA completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FmaCqEntry {
    pub cqid: u32,
    /// The queue overflowed and events were lost; `cqid` is meaningless.
    pub overrun: bool,
}

/// Outcome of posting an FMA message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumAsInner)]
pub enum FmaPost {
    Sent,
    /// The remote side has no room; retry once credits return.
    NoCredits,
}

/// A received FMA message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FmaMessage {
    /// Carries the protocol header.
    pub prefix: Bytes,
    /// Immediate payload, if any.
    pub data: Bytes,
}

/// An RDMA write from a registered local buffer into a remote one.
#[derive(Debug, Clone)]
pub struct RdmaRequest {
    /// Reported back by [`RaEndpoint::rdma_done`].
    pub cookie: u64,
    pub local: IoBuffer,
    pub local_key: MemKey,
    pub remote: RdmaDesc,
    /// # bytes to move.
    pub nob: usize,
}

/// A physical RDMA interface.
pub trait RaDevice: Send + Sync {
    /// Device id, exchanged in handshakes.
    fn id(&self) -> u16;

    /// Create an endpoint whose completions carry `cqid`.
    fn create_endpoint(&self, cqid: u32) -> anyhow::Result<Box<dyn RaEndpoint>>;

    /// Register `buf` for remote access.
    fn register(&self, buf: &IoBuffer) -> anyhow::Result<MemKey>;

    fn deregister(&self, key: MemKey) -> anyhow::Result<()>;

    /// Next RDMA completion queue entry.
    fn poll_rdma_cq(&self) -> Option<u32>;

    /// Next FMA completion queue entry.
    fn poll_fma_cq(&self) -> Option<FmaCqEntry>;

    /// Install the completion callback, replacing any previous one.
    fn set_callback(&self, callback: Callback);
}

/// One end of a connection.
pub trait RaEndpoint: Send {
    /// Parameters the remote side needs to connect to this endpoint.
    fn params(&self) -> RiParams;

    fn connect(&mut self, remote: &RiParams) -> anyhow::Result<()>;

    /// Post a short message. `fence` requires every RDMA write posted
    /// before it to be visible at the remote side first.
    fn post_fma(&mut self, prefix: &[u8], data: &[u8], fence: bool) -> anyhow::Result<FmaPost>;

    /// Next received message.
    fn recv_fma(&mut self) -> Option<FmaMessage>;

    fn post_rdma(&mut self, req: RdmaRequest) -> anyhow::Result<()>;

    /// Cookie of the next completed RDMA write, in posting order.
    fn rdma_done(&mut self) -> Option<u64>;
}
