/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! # RapidArray network driver
//!
//! [`Ranal`] is the per-process driver instance. It owns:
//!
//! - the peer table (remote nodes, their reconnect backoff and the sends
//!   waiting for a connection) and the connection table (live connections
//!   keyed by completion id), both behind one read/write lock;
//! - the descriptor pool;
//! - one scheduler task per device, a pool of connection daemons, the
//!   listener and the reaper.
//!
//! ## Sending
//!
//! A send acquires a descriptor, finds (or creates) the peer and either
//! queues the descriptor on an established connection or parks it on the
//! peer and hands the peer to the connection daemons. Payloads up to
//! `max_immediate` bytes travel inline (IMMEDIATE); larger ones use the
//! PUT protocol. The returned future resolves with the descriptor's
//! completion status.
//!
//! ## Usage
//!
//! See `ranal_tests.rs`, which runs two drivers over a loopback fabric.

use std::fmt::Display;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use anyhow::anyhow;
use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use crate::buffer::IoBuffer;
use crate::config::CONN_HASH_SIZE;
use crate::config::MAX_DEVS;
use crate::config::PEER_HASH_SIZE;
use crate::config::Tunables;
use crate::conn::Conn;
use crate::conn::ConnInfo;
use crate::conn::ConnParams;
use crate::conn::ConnState;
use crate::connd;
use crate::connd::ConndQueue;
use crate::connd::Job;
use crate::device::Device;
use crate::error::Completion;
use crate::error::RaError;
use crate::hash::HashTable;
use crate::peer::ConnectOutcome;
use crate::peer::Peer;
use crate::peer::PeerInfo;
use crate::rdma_components::RaDevice;
use crate::reaper;
use crate::reaper::Reaper;
use crate::scheduler;
use crate::tx::Tx;
use crate::tx::TxPool;
use crate::tx::TxState;
use crate::wire::MemKey;
use crate::wire::Msg;
use crate::wire::MsgBody;
use crate::wire::Nid;
use crate::wire::PortalsHeader;
use crate::wire::RdmaDesc;

/// The upper layer. Called from scheduler tasks with no driver lock held.
pub trait Receiver: Send + Sync {
    /// An IMMEDIATE message arrived.
    fn immediate(&self, src: Nid, hdr: &PortalsHeader, payload: Bytes);

    /// Where to put the data of an incoming PUT; `None` refuses it.
    fn put_sink(&self, src: Nid, hdr: &PortalsHeader) -> Option<IoBuffer>;

    /// An incoming PUT finished, successfully or not.
    fn put_complete(&self, src: Nid, hdr: &PortalsHeader, result: Result<IoBuffer, RaError>);

    /// The data to return for an incoming GET; `None` refuses it.
    fn get_source(&self, src: Nid, hdr: &PortalsHeader) -> Option<IoBuffer>;
}

pub(crate) struct Tables {
    pub peers: HashTable<Nid, Peer>,
    pub conns: HashTable<u32, Arc<Conn>>,
}

impl Tables {
    /// Drop `nid` from the table if nothing refers to it any more.
    fn reap_peer(&mut self, nid: Nid) {
        if self.peers.get(nid).is_some_and(Peer::is_unreferenced) {
            self.peers.remove(nid);
            tracing::debug!("peer {:#x} unlinked", nid);
        }
    }
}

/// State shared by every driver task.
pub(crate) struct Driver {
    pub nid: Nid,
    /// Instance stamp: distinguishes this incarnation from earlier ones.
    pub peerstamp: u64,
    pub tunables: Tunables,
    pub devices: Vec<Arc<Device>>,
    pub pool: TxPool,
    pub receiver: Arc<dyn Receiver>,
    pub connd: Arc<ConndQueue>,
    pub reaper: Reaper,
    pub listen_addr: SocketAddr,
    tables: RwLock<Tables>,
    next_cqid: AtomicU32,
    next_connstamp: AtomicU64,
    stop: watch::Sender<bool>,
}

impl Driver {
    pub fn tables(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn tables_mut(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_stopping(&self) -> bool {
        *self.stop.borrow()
    }

    /// Resolves once shutdown has begun.
    pub async fn stopped(&self) {
        let mut rx = self.stop.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }

    /// A completion id not used by any live connection.
    pub fn new_cqid(&self) -> u32 {
        loop {
            let cqid = self.next_cqid.fetch_add(1, Ordering::Relaxed);
            if cqid != 0 && !self.tables().conns.contains_key(cqid) {
                return cqid;
            }
        }
    }

    pub fn new_connstamp(&self) -> u64 {
        self.next_connstamp.fetch_add(1, Ordering::Relaxed)
    }

    /// The device connections to `nid` are made on.
    pub fn device_for(&self, nid: Nid) -> &Arc<Device> {
        &self.devices[(nid % self.devices.len() as u64) as usize]
    }

    pub fn device_by_id(&self, devid: u16) -> Option<&Arc<Device>> {
        self.devices.iter().find(|dev| dev.hw.id() == devid)
    }

    pub fn conn_by_cqid(&self, cqid: u32) -> Option<Arc<Conn>> {
        self.tables().conns.get(cqid).cloned()
    }

    pub fn schedule_conn(&self, conn: &Arc<Conn>) {
        self.devices[conn.dev].schedule(conn);
    }

    /// Address of a peer we have not been told about.
    fn default_addr(&self, nid: Nid) -> SocketAddr {
        SocketAddr::new(
            IpAddr::V4(Ipv4Addr::from(nid as u32)),
            self.tunables.port,
        )
    }

    /// Register `tx`'s buffer on device `dev`.
    pub fn map_tx(&self, dev: usize, tx: &mut Tx) -> Result<MemKey, RaError> {
        if let Some(key) = tx.mapped_key() {
            return Ok(key);
        }
        let buffer = tx
            .buffer
            .as_ref()
            .ok_or_else(|| RaError::InvalidBuffer(format!("tx {} has no buffer", tx.cookie)))?;
        let key = self.devices[dev].hw.register(buffer)?;
        tx.set_mapped(dev, key);
        Ok(key)
    }

    fn unmap_tx(&self, tx: &mut Tx) {
        if let Some((dev, key)) = tx.take_mapping() {
            if let Err(e) = self.devices[dev].hw.deregister(key) {
                tracing::warn!("failed to deregister {:?}: {:#}", key, e);
            }
        }
    }

    /// Deliver `result` for `tx` and return it to the pool.
    pub fn finish_tx(&self, mut tx: Box<Tx>, result: Completion) {
        self.unmap_tx(&mut tx);
        if let Err(e) = &result {
            tracing::debug!(
                "tx {} to {:#x} in state {:?} failed: {}",
                tx.cookie,
                tx.nid,
                tx.state,
                e
            );
        }
        match tx.state {
            TxState::PuttAck | TxState::PuttWaitDone => {
                if let Some(buffer) = tx.buffer.take() {
                    self.receiver
                        .put_complete(tx.nid, &tx.hdr, result.map(|()| buffer));
                }
            }
            _ => {
                if let Some(done) = tx.completion.take() {
                    let _ = done.send(result);
                }
            }
        }
        self.pool.release(tx);
    }

    /// Fail each descriptor with a copy of `err`.
    pub fn fail_txs(&self, txs: Vec<Box<Tx>>, err: &RaError) {
        for tx in txs {
            self.finish_tx(tx, Err(err.replicate()));
        }
    }

    /// Route `tx` to its peer: onto a live connection if there is one,
    /// otherwise onto the peer's queue, starting a connection attempt.
    pub fn launch_tx(&self, tx: Box<Tx>) {
        let nid = tx.nid;
        if self.is_stopping() {
            self.finish_tx(tx, Err(RaError::Shutdown));
            return;
        }

        let conn = self
            .tables()
            .peers
            .get(nid)
            .and_then(|peer| peer.conns.first().cloned());
        if let Some(conn) = conn {
            self.post_tx(&conn, tx);
            return;
        }

        let mut tables = self.tables_mut();
        let peer = tables
            .peers
            .get_or_insert_with(nid, || Peer::new(nid, self.default_addr(nid)));
        // A connection may have appeared while the lock was dropped.
        if let Some(conn) = peer.conns.first().cloned() {
            drop(tables);
            self.post_tx(&conn, tx);
            return;
        }
        peer.tx_queue.push_back(tx);
        self.start_connect(peer);
    }

    /// Hand `peer` to the connection daemons, honouring its backoff.
    fn start_connect(&self, peer: &mut Peer) {
        if peer.connecting {
            return;
        }
        peer.connecting = true;
        let delay = peer.reconnect_time.saturating_duration_since(Instant::now());
        tracing::debug!("connecting to {:#x} in {:?}", peer.nid, delay);
        self.connd
            .push_after(Job::Connect(peer.nid), delay, self.stop.subscribe());
    }

    /// Queue `tx` on an established connection.
    pub fn post_tx(&self, conn: &Arc<Conn>, mut tx: Box<Tx>) {
        {
            let mut inner = conn.lock();
            if inner.state() == ConnState::Established {
                tx.cqid = Some(conn.cqid);
                tx.qtime = Instant::now();
                inner.fmaq.push_back(tx);
                drop(inner);
                self.schedule_conn(conn);
                return;
            }
        }
        self.finish_tx(tx, Err(RaError::ConnectionClosing(conn.nid)));
    }

    /// Enter a freshly handshaken connection into the tables. Older
    /// connections to the same peer are closed; an attempt that is not
    /// newer than an existing connection is rejected as stale.
    pub fn install_conn(&self, params: ConnParams, addr: SocketAddr) -> Result<Arc<Conn>, RaError> {
        let nid = params.nid;
        let conn = Arc::new(Conn::new(params));
        let mut tables = self.tables_mut();
        if tables.conns.contains_key(conn.cqid) {
            return Err(RaError::Fabric(anyhow!("cqid {} already in use", conn.cqid)));
        }
        let peer = tables.peers.get_or_insert_with(nid, || Peer::new(nid, addr));

        let mut superseded = Vec::new();
        for existing in &peer.conns {
            if existing.peerstamp != conn.peerstamp {
                // The peer restarted.
                superseded.push(existing.clone());
            } else if conn.peer_connstamp <= existing.peer_connstamp {
                return Err(RaError::StaleConnection {
                    nid,
                    peerstamp: conn.peerstamp,
                    connstamp: conn.peer_connstamp,
                });
            } else {
                superseded.push(existing.clone());
            }
        }

        peer.conns.push(conn.clone());
        peer.backoff.reset();
        peer.connecting = false;
        peer.reconnect_time = Instant::now();
        let queued: Vec<_> = peer.tx_queue.drain(..).collect();
        tables.conns.insert(conn.cqid, conn.clone());
        drop(tables);

        tracing::info!(
            nid = format_args!("{:#x}", nid),
            cqid = conn.cqid,
            dev = conn.dev,
            "connection established, timeout {:?}",
            conn.timeout
        );
        for old in superseded {
            self.close_conn(&old, "superseded by a newer connection");
        }
        self.reaper.report_timeout(conn.timeout);
        for tx in queued {
            self.post_tx(&conn, tx);
        }
        self.schedule_conn(&conn);
        Ok(conn)
    }

    /// A handshake with `nid` failed.
    pub fn connect_failed(&self, nid: Nid, err: RaError) {
        let mut tables = self.tables_mut();
        let Some(peer) = tables.peers.get_mut(nid) else {
            return;
        };
        if let Some(conn) = peer.conns.first().cloned() {
            // Lost a race with an inbound connection; use that one.
            peer.connecting = false;
            let queued: Vec<_> = peer.tx_queue.drain(..).collect();
            drop(tables);
            for tx in queued {
                self.post_tx(&conn, tx);
            }
            return;
        }
        let outcome = peer.connect_failed(err, self.tunables.unreachable_after, Instant::now());
        match outcome {
            ConnectOutcome::Retry(delay) => {
                tracing::warn!("connection to {:#x} failed, retrying in {:?}", nid, delay);
                self.connd
                    .push_after(Job::Connect(nid), delay, self.stop.subscribe());
            }
            ConnectOutcome::GiveUp(txs, err) => {
                tables.reap_peer(nid);
                drop(tables);
                if !txs.is_empty() {
                    tracing::error!(
                        "giving up on {:#x}: {}; failing {} queued sends",
                        nid,
                        err,
                        txs.len()
                    );
                }
                self.fail_txs(txs, &err);
            }
        }
    }

    /// Start closing `conn`. Safe to call any number of times from any
    /// task; only the first call has an effect.
    pub fn close_conn(&self, conn: &Arc<Conn>, reason: impl Display) {
        let Some(failed) = conn.begin_close(Instant::now()) else {
            return;
        };
        tracing::info!(
            nid = format_args!("{:#x}", conn.nid),
            cqid = conn.cqid,
            "closing connection: {}",
            reason
        );
        {
            let mut tables = self.tables_mut();
            if let Some(peer) = tables.peers.get_mut(conn.nid) {
                peer.conns.retain(|c| !Arc::ptr_eq(c, conn));
            }
            tables.reap_peer(conn.nid);
        }
        self.fail_txs(failed, &RaError::ConnectionClosing(conn.nid));
        // The scheduler sends CLOSE and finishes the job.
        self.schedule_conn(conn);
    }

    /// Finish `conn`: mark it closed, drop it from the tables and fail
    /// whatever it still holds.
    pub fn terminate_conn(&self, conn: &Arc<Conn>) {
        self.close_conn(conn, "terminated");
        let Some(remaining) = conn.terminate() else {
            return;
        };
        {
            let mut tables = self.tables_mut();
            if tables
                .conns
                .get(conn.cqid)
                .is_some_and(|c| Arc::ptr_eq(c, conn))
            {
                tables.conns.remove(conn.cqid);
            }
        }
        tracing::debug!("connection to {:#x} (cqid {}) closed", conn.nid, conn.cqid);
        self.fail_txs(remaining, &RaError::ConnectionClosing(conn.nid));
    }

    /// Stop everything: close every connection and fail every queued send.
    fn stop(&self) {
        self.stop.send_replace(true);
        let (conns, queued): (Vec<_>, Vec<_>) = {
            let mut tables = self.tables_mut();
            let conns = tables.conns.values().cloned().collect();
            let queued = tables
                .peers
                .values_mut()
                .flat_map(|peer| {
                    peer.connecting = false;
                    peer.tx_queue.drain(..).collect::<Vec<_>>()
                })
                .collect();
            (conns, queued)
        };
        for conn in conns {
            self.close_conn(&conn, "shutting down");
            self.terminate_conn(&conn);
        }
        self.fail_txs(queued, &RaError::Shutdown);
    }
}

/// A running driver instance.
pub struct Ranal {
    driver: Arc<Driver>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Ranal {
    /// Bring the driver up on `devices`: bind the listener and start the
    /// per-device schedulers, the connection daemons and the reaper.
    pub async fn startup(
        nid: Nid,
        tunables: Tunables,
        devices: Vec<Arc<dyn RaDevice>>,
        receiver: Arc<dyn Receiver>,
    ) -> Result<Self, RaError> {
        let tunables = tunables.sanitize();
        if devices.is_empty() || devices.len() > MAX_DEVS {
            return Err(RaError::Fabric(anyhow!(
                "need 1 to {} devices, got {}",
                MAX_DEVS,
                devices.len()
            )));
        }
        let listener = connd::bind(&tunables)?;
        let listen_addr = listener.local_addr()?;

        let peerstamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or_default();
        let (stop, _) = watch::channel(false);
        let driver = Arc::new(Driver {
            nid,
            peerstamp,
            devices: devices
                .into_iter()
                .enumerate()
                .map(|(idx, hw)| Device::new(idx, hw))
                .collect(),
            pool: TxPool::new(tunables.ntx, tunables.ntx_nblk),
            receiver,
            connd: Arc::new(ConndQueue::new()),
            reaper: Reaper::new(tunables.timeout()),
            listen_addr,
            tables: RwLock::new(Tables {
                peers: HashTable::new(PEER_HASH_SIZE),
                conns: HashTable::new(CONN_HASH_SIZE),
            }),
            next_cqid: AtomicU32::new(1),
            // Connection stamps only need to increase within one instance.
            next_connstamp: AtomicU64::new(peerstamp),
            stop,
            tunables,
        });

        // Tasks log under a span naming this instance, nested in the caller's.
        let span = tracing::info_span!("ralnd", nid = format_args!("{:#x}", nid));
        let mut tasks = Vec::new();
        for dev in &driver.devices {
            tasks.push(tokio::spawn(
                scheduler::run(driver.clone(), dev.clone()).instrument(span.clone()),
            ));
        }
        for id in 0..driver.tunables.n_connd {
            tasks.push(tokio::spawn(
                connd::run(driver.clone(), id).instrument(span.clone()),
            ));
        }
        tasks.push(tokio::spawn(
            connd::listen(driver.clone(), listener).instrument(span.clone()),
        ));
        tasks.push(tokio::spawn(reaper::run(driver.clone()).instrument(span)));

        tracing::info!(
            "ralnd {:#x} up: {} device(s), listening on {}",
            nid,
            driver.devices.len(),
            listen_addr
        );
        Ok(Self {
            driver,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn nid(&self) -> Nid {
        self.driver.nid
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.driver.listen_addr
    }

    pub(crate) fn driver(&self) -> &Arc<Driver> {
        &self.driver
    }

    async fn launch(&self, mut tx: Box<Tx>, nid: Nid) -> Completion {
        let (done, rx) = oneshot::channel();
        tx.nid = nid;
        tx.completion = Some(done);
        self.driver.launch_tx(tx);
        rx.await.unwrap_or(Err(RaError::Shutdown))
    }

    /// Send `payload` to `nid` with portals header `hdr`.
    pub async fn send(&self, nid: Nid, hdr: PortalsHeader, payload: IoBuffer) -> Completion {
        let mut tx = self.driver.pool.acquire(false).await?;
        if payload.len() <= self.driver.tunables.max_immediate {
            tx.state = TxState::Simple;
            tx.set_immediate(payload.to_bytes());
            tx.msg = Msg::new(MsgBody::Immediate { hdr });
        } else {
            tx.state = TxState::PutiReq;
            tx.set_buffer(payload);
            tx.msg = Msg::new(MsgBody::PutReq {
                hdr,
                cookie: tx.cookie,
            });
        }
        self.launch(tx, nid).await
    }

    /// Fetch the data `hdr` names at `nid` into `sink`.
    pub async fn get(&self, nid: Nid, hdr: PortalsHeader, sink: IoBuffer) -> Completion {
        let mut tx = self.driver.pool.acquire(false).await?;
        tx.state = TxState::GetiReq;
        let nob = sink.len() as u32;
        tx.set_buffer(sink);
        tx.msg = Msg::new(MsgBody::GetReq {
            hdr,
            cookie: tx.cookie,
            // Filled in once the sink is registered.
            desc: RdmaDesc {
                nob,
                ..Default::default()
            },
        });
        self.launch(tx, nid).await
    }

    /// Add (or update) a persistent peer.
    pub fn add_peer(&self, nid: Nid, ip: IpAddr, port: u16) {
        let addr = SocketAddr::new(ip, port);
        let mut tables = self.driver.tables_mut();
        match tables.peers.get_mut(nid) {
            Some(peer) => {
                peer.addr = addr;
                peer.persistent = true;
            }
            None => {
                let mut peer = Peer::new(nid, addr);
                peer.persistent = true;
                tables.peers.insert(nid, peer);
            }
        }
        tracing::info!("added peer {:#x} at {}", nid, addr);
    }

    /// Forget `nid`: drop persistence, close its connections and fail its
    /// queued sends. Returns false if the peer was unknown.
    pub fn del_peer(&self, nid: Nid) -> bool {
        let (conns, queued) = {
            let mut tables = self.driver.tables_mut();
            let Some(peer) = tables.peers.get_mut(nid) else {
                return false;
            };
            peer.persistent = false;
            let conns = peer.conns.clone();
            let queued: Vec<_> = peer.tx_queue.drain(..).collect();
            tables.reap_peer(nid);
            (conns, queued)
        };
        for conn in &conns {
            self.driver.close_conn(conn, "peer deleted");
        }
        self.driver
            .fail_txs(queued, &RaError::ConnectionClosing(nid));
        true
    }

    /// Close every connection to `nid`, returning how many there were.
    pub fn close_conns(&self, nid: Nid) -> usize {
        let conns = self
            .driver
            .tables()
            .peers
            .get(nid)
            .map(|peer| peer.conns.clone())
            .unwrap_or_default();
        for conn in &conns {
            self.driver.close_conn(conn, "closed by request");
        }
        conns.len()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<_> = self.driver.tables().peers.values().map(Peer::info).collect();
        peers.sort_by_key(|p| p.nid);
        peers
    }

    pub fn conns(&self) -> Vec<ConnInfo> {
        let conns: Vec<_> = self.driver.tables().conns.values().cloned().collect();
        let mut infos: Vec<_> = conns.iter().map(|c| c.info()).collect();
        infos.sort_by_key(|c| (c.nid, c.cqid));
        infos
    }

    /// The connection in use for `nid`.
    pub fn conn_info(&self, nid: Nid) -> Option<ConnInfo> {
        let conn = self
            .driver
            .tables()
            .peers
            .get(nid)
            .and_then(|peer| peer.conns.first().cloned())?;
        Some(conn.info())
    }

    /// Free (general, reserved) descriptors.
    pub fn idle_txs(&self) -> (usize, usize) {
        (self.driver.pool.idle(), self.driver.pool.idle_reserved())
    }

    /// Close every connection, fail every pending operation and wait for
    /// the driver's tasks to exit.
    pub async fn shutdown(&self) {
        tracing::info!("ralnd {:#x} shutting down", self.driver.nid);
        self.driver.stop();
        let tasks: Vec<_> = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!("driver task failed: {}", e);
            }
        }
    }
}

impl Drop for Ranal {
    fn drop(&mut self) {
        if !self.driver.is_stopping() {
            self.driver.stop();
        }
        let tasks = self.tasks.get_mut().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}
