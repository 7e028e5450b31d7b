/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Device schedulers.
//!
//! Each device has one scheduler task. It sleeps until the device's
//! completion callback fires or a connection is queued for service, then
//! routes completion queue entries to their connections and services the
//! queued connections in turn. Servicing a connection:
//!
//! 1. Moves descriptors whose RDMA writes completed on to their next
//!    message (PUT_DONE or GET_DONE, fenced).
//! 2. Receives and dispatches incoming messages.
//! 3. Sends queued messages in order, or a NOOP if the connection has been
//!    quiet for its keepalive interval; while closing, sends CLOSE and
//!    finishes the connection once both sides have sent one.
//!
//! The upper layer is called with no driver lock held.

use std::sync::Arc;
use std::sync::MutexGuard;

use anyhow::anyhow;
use tokio::time::Instant;

use crate::config::RESCHED;
use crate::conn::Conn;
use crate::conn::ConnInner;
use crate::conn::ConnState;
use crate::device::Device;
use crate::error::Completion;
use crate::error::RaError;
use crate::ranal::Driver;
use crate::rdma_components::FmaMessage;
use crate::rdma_components::FmaPost;
use crate::rdma_components::RdmaRequest;
use crate::tx::AfterSend;
use crate::tx::Tx;
use crate::tx::TxState;
use crate::wire::Msg;
use crate::wire::MsgBody;
use crate::wire::MsgType;
use crate::wire::PortalsHeader;
use crate::wire::RdmaDesc;

/// The scheduler loop for `dev`.
pub(crate) async fn run(driver: Arc<Driver>, dev: Arc<Device>) {
    tracing::debug!("scheduler for device {} running", dev.hw.id());
    loop {
        tokio::select! {
            biased;
            _ = driver.stopped() => break,
            _ = dev.wait() => {}
        }

        if dev.take_ready() {
            poll_cqs(&driver, &dev);
        }

        let mut serviced = 0;
        while let Some(conn) = dev.next_conn() {
            service_conn(&driver, &conn);
            serviced += 1;
            if serviced == RESCHED {
                // Let everyone else run.
                tokio::task::yield_now().await;
                serviced = 0;
            }
        }
    }
    tracing::debug!("scheduler for device {} stopped", dev.hw.id());
}

/// Route completion queue entries to their connections.
fn poll_cqs(driver: &Driver, dev: &Device) {
    while let Some(cqid) = dev.hw.poll_rdma_cq() {
        schedule_cqid(driver, dev, cqid, "rdma");
    }
    while let Some(entry) = dev.hw.poll_fma_cq() {
        if entry.overrun {
            tracing::warn!("fma cq overrun on device {}", dev.hw.id());
            let conns: Vec<_> = driver
                .tables()
                .conns
                .values()
                .filter(|conn| conn.dev == dev.idx)
                .cloned()
                .collect();
            for conn in &conns {
                dev.schedule(conn);
            }
            continue;
        }
        schedule_cqid(driver, dev, entry.cqid, "fma");
    }
}

fn schedule_cqid(driver: &Driver, dev: &Device, cqid: u32, cq: &str) {
    match driver.conn_by_cqid(cqid) {
        Some(conn) if conn.dev == dev.idx => dev.schedule(&conn),
        _ => tracing::warn!(
            "{} completion for unknown cqid {} on device {}",
            cq,
            cqid,
            dev.hw.id()
        ),
    }
}

/// Do everything `conn` is waiting for.
pub(crate) fn service_conn(driver: &Driver, conn: &Arc<Conn>) {
    if conn.state() == ConnState::Closed {
        return;
    }
    check_rdma(driver, conn);
    check_fma_rx(driver, conn);
    check_fma_tx(driver, conn);
}

fn check_rdma(driver: &Driver, conn: &Arc<Conn>) {
    loop {
        let mut inner = conn.lock();
        let Some(cookie) = inner.endpoint().and_then(|ep| ep.rdma_done()) else {
            return;
        };
        let Some(mut tx) = inner.take_rdma(cookie) else {
            drop(inner);
            tracing::warn!(
                "rdma completion {:#x} on {:#x} matches nothing",
                cookie,
                conn.nid
            );
            continue;
        };
        if inner.state() != ConnState::Established {
            drop(inner);
            driver.finish_tx(tx, Err(RaError::ConnectionClosing(conn.nid)));
            continue;
        }
        tx.state = match tx.state {
            TxState::PutiRdma => TxState::PutiDone,
            TxState::GettRdma => TxState::GettDone,
            state => panic!("tx {} completed rdma in state {:?}", tx.cookie, state),
        };
        tx.qtime = Instant::now();
        inner.fmaq.push_back(tx);
    }
}

fn check_fma_rx(driver: &Driver, conn: &Arc<Conn>) {
    for _ in 0..RESCHED {
        let fma = {
            let mut inner = conn.lock();
            if inner.state() == ConnState::Closed {
                return;
            }
            match inner.endpoint().and_then(|ep| ep.recv_fma()) {
                Some(fma) => fma,
                None => return,
            }
        };
        handle_msg(driver, conn, fma);
    }
    // There may be more.
    driver.schedule_conn(conn);
}

fn handle_msg(driver: &Driver, conn: &Arc<Conn>, fma: FmaMessage) {
    let msg = match Msg::decode(&fma.prefix) {
        Ok((msg, _)) => msg,
        Err(e) => {
            tracing::error!("bad message from {:#x}: {}", conn.nid, e);
            driver.close_conn(conn, e);
            return;
        }
    };
    if msg.srcnid != conn.nid {
        tracing::error!(
            "message from {:#x} on connection to {:#x}",
            msg.srcnid,
            conn.nid
        );
        driver.close_conn(conn, "unexpected source");
        return;
    }
    if msg.connstamp != conn.peer_connstamp {
        tracing::error!(
            "stale message from {:#x}: connstamp {:#x}, expected {:#x}",
            conn.nid,
            msg.connstamp,
            conn.peer_connstamp
        );
        driver.close_conn(conn, "stale connstamp");
        return;
    }

    let established = {
        let mut inner = conn.lock();
        if msg.seq != inner.rx_seq {
            // The transport delivers in order; this is a bug somewhere.
            tracing::error!(
                nid = format_args!("{:#x}", conn.nid),
                cqid = conn.cqid,
                "sequence gap: expected {}, got {}",
                inner.rx_seq,
                msg.seq
            );
        }
        inner.rx_seq = msg.seq.wrapping_add(1);
        inner.last_rx = Instant::now();
        if msg.msg_type() == MsgType::Close {
            inner.close_recvd = true;
        }
        inner.state() == ConnState::Established
    };

    match msg.body {
        MsgBody::Close => driver.close_conn(conn, "closed by peer"),
        _ if !established => {
            tracing::debug!(
                "dropping {:?} from {:#x}: connection closing",
                msg.msg_type(),
                conn.nid
            );
        }
        MsgBody::Noop => {}
        MsgBody::Immediate { hdr } => driver.receiver.immediate(conn.nid, &hdr, fma.data),
        MsgBody::PutReq { hdr, cookie } => handle_put_req(driver, conn, hdr, cookie),
        MsgBody::PutNak { cookie } => complete_reply(
            driver,
            conn,
            MsgType::PutNak,
            cookie,
            Err(RaError::NoMatchingBuffer(conn.nid)),
        ),
        MsgBody::PutAck {
            src_cookie,
            dst_cookie,
            desc,
        } => handle_put_ack(driver, conn, src_cookie, dst_cookie, desc),
        MsgBody::PutDone { cookie } => {
            complete_reply(driver, conn, MsgType::PutDone, cookie, Ok(()))
        }
        MsgBody::GetReq { hdr, cookie, desc } => handle_get_req(driver, conn, hdr, cookie, desc),
        MsgBody::GetNak { cookie } => complete_reply(
            driver,
            conn,
            MsgType::GetNak,
            cookie,
            Err(RaError::NoMatchingBuffer(conn.nid)),
        ),
        MsgBody::GetDone { cookie } => {
            complete_reply(driver, conn, MsgType::GetDone, cookie, Ok(()))
        }
    }
}

/// Finish the descriptor waiting for `msg_type` with `cookie`.
fn complete_reply(
    driver: &Driver,
    conn: &Arc<Conn>,
    msg_type: MsgType,
    cookie: u64,
    result: Completion,
) {
    let tx = conn.lock().take_reply(msg_type, cookie);
    match tx {
        Some(tx) => driver.finish_tx(tx, result),
        None => tracing::warn!(
            "{:?} from {:#x} with unmatched cookie {:#x}",
            msg_type,
            conn.nid,
            cookie
        ),
    }
}

/// A reserved descriptor for a reply, or `None` after closing `conn`.
fn reply_tx(driver: &Driver, conn: &Arc<Conn>, hdr: PortalsHeader) -> Option<Box<Tx>> {
    match driver.pool.try_acquire_reserved() {
        Ok(mut tx) => {
            tx.nid = conn.nid;
            tx.hdr = hdr;
            Some(tx)
        }
        Err(e) => {
            tracing::error!("can't reply to {:#x}: {}", conn.nid, e);
            driver.close_conn(conn, e);
            None
        }
    }
}

fn handle_put_req(driver: &Driver, conn: &Arc<Conn>, hdr: PortalsHeader, cookie: u64) {
    let sink = driver.receiver.put_sink(conn.nid, &hdr);
    let Some(mut tx) = reply_tx(driver, conn, hdr) else {
        if sink.is_some() {
            driver
                .receiver
                .put_complete(conn.nid, &hdr, Err(RaError::NoDescriptors));
        }
        return;
    };

    if let Some(sink) = sink {
        let nob = sink.len() as u32;
        tx.state = TxState::PuttAck;
        tx.set_buffer(sink);
        match driver.map_tx(conn.dev, &mut tx) {
            Ok(key) => {
                tx.msg = Msg::new(MsgBody::PutAck {
                    src_cookie: cookie,
                    dst_cookie: tx.cookie,
                    desc: RdmaDesc { key, addr: 0, nob },
                });
                driver.post_tx(conn, tx);
                return;
            }
            Err(e) => {
                tracing::error!("can't map PUT sink from {:#x}: {}", conn.nid, e);
                tx.buffer = None;
                driver.receiver.put_complete(conn.nid, &hdr, Err(e));
            }
        }
    }

    tx.state = TxState::PuttNak;
    tx.msg = Msg::new(MsgBody::PutNak { cookie });
    driver.post_tx(conn, tx);
}

fn handle_put_ack(
    driver: &Driver,
    conn: &Arc<Conn>,
    src_cookie: u64,
    dst_cookie: u64,
    desc: RdmaDesc,
) {
    let mut inner = conn.lock();
    let Some(mut tx) = inner.take_reply(MsgType::PutAck, src_cookie) else {
        drop(inner);
        tracing::warn!(
            "PUT_ACK from {:#x} with unmatched cookie {:#x}",
            conn.nid,
            src_cookie
        );
        return;
    };
    tx.state = TxState::PutiRdma;
    tx.msg = Msg::new(MsgBody::PutDone { cookie: dst_cookie }).fenced();
    start_rdma(driver, conn, inner, tx, desc);
}

fn handle_get_req(
    driver: &Driver,
    conn: &Arc<Conn>,
    hdr: PortalsHeader,
    cookie: u64,
    desc: RdmaDesc,
) {
    let source = driver
        .receiver
        .get_source(conn.nid, &hdr)
        .filter(|source| {
            let fits = source.len() <= desc.nob as usize;
            if !fits {
                tracing::warn!(
                    "GET from {:#x}: {} bytes don't fit sink of {}",
                    conn.nid,
                    source.len(),
                    desc.nob
                );
            }
            fits
        });
    let Some(mut tx) = reply_tx(driver, conn, hdr) else {
        return;
    };
    match source {
        Some(source) => {
            tx.state = TxState::GettRdma;
            tx.set_buffer(source);
            tx.msg = Msg::new(MsgBody::GetDone { cookie }).fenced();
            start_rdma(driver, conn, conn.lock(), tx, desc);
        }
        None => {
            tx.state = TxState::GettNak;
            tx.msg = Msg::new(MsgBody::GetNak { cookie });
            driver.post_tx(conn, tx);
        }
    }
}

/// Register `tx`'s buffer and write it to `desc`, parking `tx` on the
/// RDMA queue until the write completes.
fn start_rdma(
    driver: &Driver,
    conn: &Arc<Conn>,
    mut inner: MutexGuard<'_, ConnInner>,
    mut tx: Box<Tx>,
    desc: RdmaDesc,
) {
    if inner.state() != ConnState::Established {
        drop(inner);
        driver.finish_tx(tx, Err(RaError::ConnectionClosing(conn.nid)));
        return;
    }
    let key = match driver.map_tx(conn.dev, &mut tx) {
        Ok(key) => key,
        Err(e) => {
            drop(inner);
            tracing::error!("can't map RDMA buffer for {:#x}: {}", conn.nid, e);
            driver.finish_tx(tx, Err(e));
            // The other side is waiting for a message it will now never get.
            driver.close_conn(conn, "rdma mapping failed");
            return;
        }
    };
    let Some(local) = tx.buffer.clone() else {
        drop(inner);
        driver.finish_tx(
            tx,
            Err(RaError::InvalidBuffer("rdma without a buffer".to_string())),
        );
        return;
    };
    let req = RdmaRequest {
        cookie: tx.cookie,
        nob: local.len().min(desc.nob as usize),
        local,
        local_key: key,
        remote: desc,
    };
    let posted = match inner.endpoint() {
        Some(ep) => ep.post_rdma(req),
        None => Err(anyhow!("endpoint closed")),
    };
    match posted {
        Ok(()) => {
            tx.cqid = Some(conn.cqid);
            tx.qtime = Instant::now();
            inner.rdmaq.push_back(tx);
        }
        Err(e) => {
            drop(inner);
            tracing::error!("rdma to {:#x} failed: {:#}", conn.nid, e);
            driver.finish_tx(tx, Err(RaError::Fabric(e)));
            driver.close_conn(conn, "rdma post failed");
        }
    }
}

/// Fill in the header of `msg` and post it.
fn send_msg(
    driver: &Driver,
    conn: &Conn,
    inner: &mut ConnInner,
    msg: &mut Msg,
    data: &[u8],
) -> anyhow::Result<FmaPost> {
    msg.srcnid = driver.nid;
    msg.connstamp = conn.my_connstamp;
    msg.seq = inner.tx_seq;
    let prefix = msg.encode();
    let ep = inner
        .endpoint()
        .ok_or_else(|| anyhow!("endpoint closed"))?;
    let post = ep.post_fma(&prefix, data, msg.fence)?;
    if post.is_sent() {
        inner.tx_seq = inner.tx_seq.wrapping_add(1);
        inner.last_tx = Instant::now();
    }
    Ok(post)
}

fn check_fma_tx(driver: &Driver, conn: &Arc<Conn>) {
    let now = Instant::now();
    let mut inner = conn.lock();

    match inner.state() {
        ConnState::Closed => return,
        ConnState::Closing => {
            if !inner.close_sent {
                let mut close = Msg::new(MsgBody::Close).fenced();
                match send_msg(driver, conn, &mut inner, &mut close, &[]) {
                    Ok(FmaPost::Sent) => inner.close_sent = true,
                    Ok(FmaPost::NoCredits) => return,
                    Err(e) => {
                        drop(inner);
                        tracing::debug!("can't send CLOSE to {:#x}: {:#}", conn.nid, e);
                        driver.terminate_conn(conn);
                        return;
                    }
                }
            }
            if inner.close_recvd {
                drop(inner);
                driver.terminate_conn(conn);
            }
            return;
        }
        ConnState::Established => {}
    }

    let mut posted = 0;
    loop {
        if posted == RESCHED && !inner.fmaq.is_empty() {
            // Give other connections a turn.
            drop(inner);
            driver.schedule_conn(conn);
            return;
        }
        let Some(mut tx) = inner.fmaq.pop_front() else {
            if now.saturating_duration_since(inner.last_tx) >= conn.keepalive {
                let mut noop = Msg::new(MsgBody::Noop);
                if let Err(e) = send_msg(driver, conn, &mut inner, &mut noop, &[]) {
                    drop(inner);
                    driver.close_conn(conn, format!("keepalive failed: {:#}", e));
                }
            }
            return;
        };

        if tx.state == TxState::GetiReq {
            match driver.map_tx(conn.dev, &mut tx) {
                Ok(key) => {
                    if let MsgBody::GetReq { desc, .. } = &mut tx.msg.body {
                        desc.key = key;
                        desc.addr = 0;
                    }
                }
                Err(e) => {
                    drop(inner);
                    driver.finish_tx(tx, Err(e));
                    inner = conn.lock();
                    continue;
                }
            }
        }

        let Tx { msg, payload, .. } = &mut *tx;
        match send_msg(driver, conn, &mut inner, msg, payload) {
            Ok(FmaPost::NoCredits) => {
                inner.fmaq.push_front(tx);
                return;
            }
            Err(e) => {
                inner.fmaq.push_front(tx);
                drop(inner);
                driver.close_conn(conn, format!("send failed: {:#}", e));
                return;
            }
            Ok(FmaPost::Sent) => {
                posted += 1;
                match tx.state.after_send() {
                    AfterSend::Complete => {
                        drop(inner);
                        driver.finish_tx(tx, Ok(()));
                        inner = conn.lock();
                        if inner.state() != ConnState::Established {
                            return;
                        }
                    }
                    AfterSend::AwaitReply(state) => {
                        tx.state = state;
                        tx.qtime = now;
                        inner.replyq.push_back(tx);
                    }
                }
            }
        }
    }
}
