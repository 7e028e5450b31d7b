/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! An in-process RapidArray fabric.
//!
//! Devices created from one [`LoopbackFabric`] can reach each other:
//! endpoints are wired together in memory, FMA messages land directly in
//! the remote endpoint's inbox, and RDMA writes copy between registered
//! buffers. A descriptor's `addr` is a byte offset into the registered
//! buffer its key names.
//!
//! The fabric also gives tests control over timing: RDMA completions can be
//! held back, FMA credits can be withheld, and every operation is recorded
//! in a journal.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use anyhow::Context;
use anyhow::anyhow;
use anyhow::ensure;
use bytes::Bytes;

use crate::buffer::IoBuffer;
use crate::rdma_components::Callback;
use crate::rdma_components::FmaCqEntry;
use crate::rdma_components::FmaMessage;
use crate::rdma_components::FmaPost;
use crate::rdma_components::RaDevice;
use crate::rdma_components::RaEndpoint;
use crate::rdma_components::RdmaRequest;
use crate::wire::MemKey;
use crate::wire::Msg;
use crate::wire::MsgType;
use crate::wire::RiParams;

/// FMA completion queue depth.
const FMA_CQ_SIZE: usize = 1024;

/// Something that happened on the fabric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FabricEvent {
    /// An FMA message was delivered from the endpoint with `cqid`.
    FmaSent {
        cqid: u32,
        msg_type: Option<MsgType>,
        fence: bool,
    },
    RdmaPosted { cqid: u32, cookie: u64 },
    /// The write is visible at the target and its completion queued.
    RdmaCompleted { cqid: u32, cookie: u64 },
}

type SharedCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct DeviceState {
    callback: Option<SharedCallback>,
    rdma_cq: VecDeque<u32>,
    fma_cq: VecDeque<FmaCqEntry>,
    overrun: bool,
}

struct EndpointState {
    dev: u64,
    cqid: u32,
    peer: Option<u64>,
    inbox: VecDeque<FmaMessage>,
    rdma_done: VecDeque<u64>,
    /// Was refused credits since they were last restored.
    starved: bool,
}

#[derive(Default)]
struct Fabric {
    next_handle: u64,
    next_key: u64,
    memory: HashMap<MemKey, IoBuffer>,
    devices: HashMap<u64, DeviceState>,
    endpoints: HashMap<u64, EndpointState>,
    hold_rdma: bool,
    held: VecDeque<(u64, RdmaRequest)>,
    withhold_credits: bool,
    journal: Vec<FabricEvent>,
}

impl Fabric {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    /// Queue an FMA completion for `ep` and return the callback to fire.
    fn fma_event(&mut self, ep: u64) -> Option<SharedCallback> {
        let (dev, cqid) = {
            let ep = self.endpoints.get(&ep)?;
            (ep.dev, ep.cqid)
        };
        let dev = self.devices.get_mut(&dev)?;
        if dev.fma_cq.len() >= FMA_CQ_SIZE {
            dev.overrun = true;
        } else {
            dev.fma_cq.push_back(FmaCqEntry {
                cqid,
                overrun: false,
            });
        }
        dev.callback.clone()
    }

    /// Perform a held or immediate RDMA write and queue its completion.
    fn complete_rdma(&mut self, ep: u64, req: RdmaRequest) -> Option<SharedCallback> {
        let data = req.local.to_bytes();
        match self.memory.get(&req.remote.key) {
            Some(target) => {
                if let Err(e) = target.write_at(req.remote.addr as usize, &data[..req.nob]) {
                    tracing::warn!("loopback rdma write {} failed: {}", req.cookie, e);
                }
            }
            None => tracing::warn!(
                "loopback rdma write {}: key {:?} deregistered",
                req.cookie,
                req.remote.key
            ),
        }
        let state = self.endpoints.get_mut(&ep)?;
        state.rdma_done.push_back(req.cookie);
        let (dev, cqid) = (state.dev, state.cqid);
        self.journal.push(FabricEvent::RdmaCompleted {
            cqid,
            cookie: req.cookie,
        });
        let dev = self.devices.get_mut(&dev)?;
        dev.rdma_cq.push_back(cqid);
        dev.callback.clone()
    }
}

fn fire(callbacks: impl IntoIterator<Item = SharedCallback>) {
    for callback in callbacks {
        callback();
    }
}

/// A set of devices that can reach each other.
#[derive(Clone, Default)]
pub struct LoopbackFabric {
    fabric: Arc<Mutex<Fabric>>,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Fabric> {
        self.fabric.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A new device on this fabric, reporting `id`.
    pub fn device(&self, id: u16) -> Arc<LoopbackDevice> {
        let handle = {
            let mut fabric = self.lock();
            let handle = fabric.handle();
            fabric.devices.insert(handle, DeviceState::default());
            handle
        };
        Arc::new(LoopbackDevice {
            fabric: self.clone(),
            handle,
            id,
        })
    }

    /// Hold RDMA completions (and the writes themselves) until
    /// [`LoopbackFabric::release_rdma_completions`].
    pub fn hold_rdma_completions(&self) {
        self.lock().hold_rdma = true;
    }

    pub fn release_rdma_completions(&self) {
        let callbacks: Vec<_> = {
            let mut fabric = self.lock();
            fabric.hold_rdma = false;
            let held: Vec<_> = fabric.held.drain(..).collect();
            held.into_iter()
                .filter_map(|(ep, req)| fabric.complete_rdma(ep, req))
                .collect()
        };
        fire(callbacks);
    }

    /// Refuse FMA posts with `NoCredits`. Restoring credits raises an FMA
    /// event for every endpoint that was refused.
    pub fn withhold_credits(&self, withhold: bool) {
        let callbacks: Vec<_> = {
            let mut fabric = self.lock();
            fabric.withhold_credits = withhold;
            if withhold {
                return;
            }
            let starved: Vec<u64> = fabric
                .endpoints
                .iter_mut()
                .filter(|(_, ep)| ep.starved)
                .map(|(handle, ep)| {
                    ep.starved = false;
                    *handle
                })
                .collect();
            starved
                .into_iter()
                .filter_map(|ep| fabric.fma_event(ep))
                .collect()
        };
        fire(callbacks);
    }

    /// Everything that happened so far.
    pub fn journal(&self) -> Vec<FabricEvent> {
        self.lock().journal.clone()
    }

    /// # registered memory regions.
    pub fn registered(&self) -> usize {
        self.lock().memory.len()
    }
}

/// A device on a [`LoopbackFabric`].
pub struct LoopbackDevice {
    fabric: LoopbackFabric,
    handle: u64,
    id: u16,
}

impl LoopbackDevice {
    /// Deliver a raw FMA message to this device's endpoint `cqid`, as if
    /// its remote side had sent it.
    pub fn inject(&self, cqid: u32, prefix: Bytes, data: Bytes) -> anyhow::Result<()> {
        let callback = {
            let mut fabric = self.fabric.lock();
            let ep = fabric
                .endpoints
                .iter_mut()
                .find(|(_, ep)| ep.dev == self.handle && ep.cqid == cqid)
                .map(|(handle, ep)| {
                    ep.inbox.push_back(FmaMessage { prefix, data });
                    *handle
                })
                .ok_or_else(|| anyhow!("no endpoint with cqid {}", cqid))?;
            fabric.fma_event(ep)
        };
        fire(callback);
        Ok(())
    }

    /// Lose FMA events, as if the completion queue overflowed.
    pub fn overrun(&self) {
        let callback = {
            let mut fabric = self.fabric.lock();
            fabric.devices.get_mut(&self.handle).and_then(|dev| {
                dev.overrun = true;
                dev.callback.clone()
            })
        };
        fire(callback);
    }
}

impl RaDevice for LoopbackDevice {
    fn id(&self) -> u16 {
        self.id
    }

    fn create_endpoint(&self, cqid: u32) -> anyhow::Result<Box<dyn RaEndpoint>> {
        let mut fabric = self.fabric.lock();
        ensure!(
            fabric.devices.contains_key(&self.handle),
            "device {} is gone",
            self.id
        );
        let handle = fabric.handle();
        fabric.endpoints.insert(
            handle,
            EndpointState {
                dev: self.handle,
                cqid,
                peer: None,
                inbox: VecDeque::new(),
                rdma_done: VecDeque::new(),
                starved: false,
            },
        );
        Ok(Box::new(LoopbackEndpoint {
            fabric: self.fabric.clone(),
            handle,
            cqid,
        }))
    }

    fn register(&self, buf: &IoBuffer) -> anyhow::Result<MemKey> {
        let mut fabric = self.fabric.lock();
        fabric.next_key += 1;
        let key = MemKey(fabric.next_key);
        fabric.memory.insert(key, buf.clone());
        Ok(key)
    }

    fn deregister(&self, key: MemKey) -> anyhow::Result<()> {
        self.fabric
            .lock()
            .memory
            .remove(&key)
            .map(|_| ())
            .with_context(|| format!("key {:?} not registered", key))
    }

    fn poll_rdma_cq(&self) -> Option<u32> {
        self.fabric
            .lock()
            .devices
            .get_mut(&self.handle)?
            .rdma_cq
            .pop_front()
    }

    fn poll_fma_cq(&self) -> Option<FmaCqEntry> {
        let mut fabric = self.fabric.lock();
        let dev = fabric.devices.get_mut(&self.handle)?;
        if dev.overrun {
            dev.overrun = false;
            dev.fma_cq.clear();
            return Some(FmaCqEntry {
                cqid: 0,
                overrun: true,
            });
        }
        dev.fma_cq.pop_front()
    }

    fn set_callback(&self, callback: Callback) {
        if let Some(dev) = self.fabric.lock().devices.get_mut(&self.handle) {
            dev.callback = Some(Arc::from(callback));
        }
    }
}

impl Drop for LoopbackDevice {
    fn drop(&mut self) {
        self.fabric.lock().devices.remove(&self.handle);
    }
}

struct LoopbackEndpoint {
    fabric: LoopbackFabric,
    handle: u64,
    cqid: u32,
}

impl RaEndpoint for LoopbackEndpoint {
    fn params(&self) -> RiParams {
        let mut params = RiParams::default();
        params.0[..8].copy_from_slice(&self.handle.to_le_bytes());
        params
    }

    fn connect(&mut self, remote: &RiParams) -> anyhow::Result<()> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&remote.0[..8]);
        let peer = u64::from_le_bytes(raw);
        let mut fabric = self.fabric.lock();
        ensure!(
            fabric.endpoints.contains_key(&peer),
            "no endpoint {} on this fabric",
            peer
        );
        let ep = fabric
            .endpoints
            .get_mut(&self.handle)
            .context("endpoint destroyed")?;
        ep.peer = Some(peer);
        Ok(())
    }

    fn post_fma(&mut self, prefix: &[u8], data: &[u8], fence: bool) -> anyhow::Result<FmaPost> {
        let callback = {
            let mut fabric = self.fabric.lock();
            let withhold = fabric.withhold_credits;
            let ep = fabric
                .endpoints
                .get_mut(&self.handle)
                .context("endpoint destroyed")?;
            if withhold {
                ep.starved = true;
                return Ok(FmaPost::NoCredits);
            }
            let peer = ep.peer.context("endpoint not connected")?;
            let remote = fabric
                .endpoints
                .get_mut(&peer)
                .context("remote endpoint destroyed")?;
            remote.inbox.push_back(FmaMessage {
                prefix: Bytes::copy_from_slice(prefix),
                data: Bytes::copy_from_slice(data),
            });
            let msg_type = Msg::decode(prefix).ok().map(|(msg, _)| msg.msg_type());
            fabric.journal.push(FabricEvent::FmaSent {
                cqid: self.cqid,
                msg_type,
                fence,
            });
            fabric.fma_event(peer)
        };
        fire(callback);
        Ok(FmaPost::Sent)
    }

    fn recv_fma(&mut self) -> Option<FmaMessage> {
        self.fabric
            .lock()
            .endpoints
            .get_mut(&self.handle)?
            .inbox
            .pop_front()
    }

    fn post_rdma(&mut self, req: RdmaRequest) -> anyhow::Result<()> {
        let callback = {
            let mut fabric = self.fabric.lock();
            ensure!(
                fabric.endpoints.contains_key(&self.handle),
                "endpoint destroyed"
            );
            ensure!(
                fabric.memory.contains_key(&req.local_key),
                "local key {:?} not registered",
                req.local_key
            );
            let target = fabric
                .memory
                .get(&req.remote.key)
                .with_context(|| format!("remote key {:?} not registered", req.remote.key))?;
            ensure!(
                req.nob <= req.local.len() && req.nob <= req.remote.nob as usize,
                "rdma of {} bytes exceeds source {} or sink {}",
                req.nob,
                req.local.len(),
                req.remote.nob
            );
            ensure!(
                req.remote.addr as usize + req.nob <= target.len(),
                "rdma to {}+{} exceeds registered region",
                req.remote.addr,
                req.nob
            );
            fabric.journal.push(FabricEvent::RdmaPosted {
                cqid: self.cqid,
                cookie: req.cookie,
            });
            if fabric.hold_rdma {
                fabric.held.push_back((self.handle, req));
                None
            } else {
                fabric.complete_rdma(self.handle, req)
            }
        };
        fire(callback);
        Ok(())
    }

    fn rdma_done(&mut self) -> Option<u64> {
        self.fabric
            .lock()
            .endpoints
            .get_mut(&self.handle)?
            .rdma_done
            .pop_front()
    }
}

impl Drop for LoopbackEndpoint {
    fn drop(&mut self) {
        self.fabric.lock().endpoints.remove(&self.handle);
    }
}
