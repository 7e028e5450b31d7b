/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Connection daemons and the listener.
//!
//! Handshakes run over TCP: each side sends one fixed-size connection
//! request carrying its identity and endpoint parameters. The active side
//! writes first and reads the passive side's reply; the passive side reads,
//! installs the connection and replies. Both sides bind their RDMA
//! endpoints to the parameters they receive.
//!
//! Every handshake is bounded by the listener timeout. Failed active
//! handshakes go back to the driver, which schedules a retry with backoff.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::TcpSocket;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::sync::watch;

use crate::config::Tunables;
use crate::conn::ConnParams;
use crate::error::RaError;
use crate::ranal::Driver;
use crate::wire::CONNREQ_SIZE;
use crate::wire::ConnReq;
use crate::wire::Nid;

/// Work for the connection daemons.
#[derive(Debug)]
pub(crate) enum Job {
    /// Perform an active handshake with a peer.
    Connect(Nid),
    /// Perform the passive handshake on an accepted socket.
    Accept(TcpStream),
}

/// Jobs waiting for a connection daemon.
#[derive(Debug, Default)]
pub(crate) struct ConndQueue {
    jobs: Mutex<VecDeque<Job>>,
    available: Notify,
}

impl ConndQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> MutexGuard<'_, VecDeque<Job>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, job: Job) {
        self.jobs().push_back(job);
        self.available.notify_one();
    }

    /// Queue `job` once `delay` has passed, unless `stop` fires first.
    pub fn push_after(
        self: &Arc<Self>,
        job: Job,
        delay: Duration,
        mut stop: watch::Receiver<bool>,
    ) {
        if delay.is_zero() {
            self.push(job);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = stop.wait_for(|stop| *stop) => {}
                _ = tokio::time::sleep(delay) => queue.push(job),
            }
        });
    }

    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    /// Wait for the next job.
    pub async fn next(&self) -> Job {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(job) = self.jobs().pop_front() {
                return job;
            }
            notified.await;
        }
    }
}

/// Bind the handshake listener.
pub(crate) fn bind(tunables: &Tunables) -> io::Result<TcpListener> {
    let addr = SocketAddr::new(tunables.listen_addr, tunables.port);
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(tunables.backlog)
}

/// Accept handshake sockets and hand them to the daemons.
pub(crate) async fn listen(driver: Arc<Driver>, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = driver.stopped() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                tracing::debug!("accepted handshake from {}", addr);
                driver.connd.push(Job::Accept(stream));
            }
            Err(e) => {
                tracing::warn!("accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    tracing::debug!("listener stopped");
}

/// A connection daemon.
pub(crate) async fn run(driver: Arc<Driver>, id: usize) {
    loop {
        let job = tokio::select! {
            biased;
            _ = driver.stopped() => break,
            job = driver.connd.next() => job,
        };
        let timeout = driver.tunables.listener_timeout();
        match job {
            Job::Connect(nid) => {
                let result = tokio::time::timeout(timeout, connect(&driver, nid))
                    .await
                    .unwrap_or(Err(RaError::HandshakeTimeout(nid)));
                if let Err(e) = result {
                    tracing::warn!("connd {}: can't connect to {:#x}: {}", id, nid, e);
                    driver.connect_failed(nid, e);
                }
            }
            Job::Accept(stream) => {
                let result = tokio::time::timeout(timeout, accept(&driver, stream))
                    .await
                    .unwrap_or_else(|_| {
                        Err(RaError::Io(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "passive handshake timed out",
                        )))
                    });
                if let Err(e) = result {
                    tracing::warn!("connd {}: passive handshake failed: {}", id, e);
                }
            }
        }
    }
    tracing::debug!("connd {} stopped", id);
}

async fn read_connreq(stream: &mut TcpStream) -> Result<ConnReq, RaError> {
    let mut buf = [0u8; CONNREQ_SIZE];
    stream.read_exact(&mut buf).await?;
    let (req, _) = ConnReq::decode(&buf)?;
    Ok(req)
}

/// The active handshake.
async fn connect(driver: &Arc<Driver>, nid: Nid) -> Result<(), RaError> {
    let Some((addr, connecting)) = driver
        .tables()
        .peers
        .get(nid)
        .map(|peer| (peer.addr, peer.connecting))
    else {
        tracing::debug!("peer {:#x} went away before connecting", nid);
        return Ok(());
    };
    if !connecting {
        // Connected from the other side since this job was queued.
        return Ok(());
    }
    let dev = driver.device_for(nid).clone();
    let cqid = driver.new_cqid();
    let mut endpoint = dev.hw.create_endpoint(cqid)?;
    let connstamp = driver.new_connstamp();
    let req = ConnReq {
        devid: dev.hw.id(),
        srcnid: driver.nid,
        dstnid: nid,
        peerstamp: driver.peerstamp,
        connstamp,
        timeout: driver.tunables.timeout as u32,
        riparams: endpoint.params(),
    };

    tracing::debug!("connecting to {:#x} at {} (cqid {})", nid, addr, cqid);
    let mut stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    stream.write_all(&req.encode()).await?;
    let reply = read_connreq(&mut stream).await?;
    if reply.srcnid != nid || reply.dstnid != driver.nid {
        return Err(RaError::HandshakeRejected {
            nid,
            reason: format!(
                "reply from {:#x} addressed to {:#x}",
                reply.srcnid, reply.dstnid
            ),
        });
    }
    endpoint.connect(&reply.riparams)?;
    driver.install_conn(
        ConnParams {
            nid,
            dev: dev.idx,
            cqid,
            endpoint,
            my_connstamp: connstamp,
            peerstamp: reply.peerstamp,
            peer_connstamp: reply.connstamp,
            local_timeout: driver.tunables.timeout,
            peer_timeout: reply.timeout as u64,
        },
        addr,
    )?;
    Ok(())
}

/// The passive handshake.
async fn accept(driver: &Arc<Driver>, mut stream: TcpStream) -> Result<(), RaError> {
    let peer_addr = stream.peer_addr()?;
    stream.set_nodelay(true)?;
    let req = read_connreq(&mut stream).await?;
    let nid = req.srcnid;
    if req.dstnid != driver.nid {
        return Err(RaError::HandshakeRejected {
            nid,
            reason: format!("addressed to {:#x}", req.dstnid),
        });
    }
    // When both sides connect at once, the lower NID's attempt wins.
    let racing = driver
        .tables()
        .peers
        .get(nid)
        .is_some_and(|peer| peer.connecting);
    if racing && driver.nid < nid {
        return Err(RaError::HandshakeRejected {
            nid,
            reason: "connection race".to_string(),
        });
    }
    let dev = driver
        .device_by_id(req.devid)
        .cloned()
        .ok_or_else(|| RaError::HandshakeRejected {
            nid,
            reason: format!("unknown device {}", req.devid),
        })?;

    let cqid = driver.new_cqid();
    let mut endpoint = dev.hw.create_endpoint(cqid)?;
    endpoint.connect(&req.riparams)?;
    let connstamp = driver.new_connstamp();
    let reply = ConnReq {
        devid: dev.hw.id(),
        srcnid: driver.nid,
        dstnid: nid,
        peerstamp: driver.peerstamp,
        connstamp,
        timeout: driver.tunables.timeout as u32,
        riparams: endpoint.params(),
    };

    // Peers listen on the same port we do.
    let addr = SocketAddr::new(peer_addr.ip(), driver.tunables.port);
    let conn = driver.install_conn(
        ConnParams {
            nid,
            dev: dev.idx,
            cqid,
            endpoint,
            my_connstamp: connstamp,
            peerstamp: req.peerstamp,
            peer_connstamp: req.connstamp,
            local_timeout: driver.tunables.timeout,
            peer_timeout: req.timeout as u64,
        },
        addr,
    )?;
    if let Err(e) = stream.write_all(&reply.encode()).await {
        driver.close_conn(&conn, format!("handshake reply failed: {}", e));
        return Err(e.into());
    }
    tracing::debug!("accepted connection from {:#x} at {}", nid, peer_addr);
    Ok(())
}
