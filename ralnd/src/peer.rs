/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Peers: remote nodes we know about.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::ExponentialBackoffBuilder;
use backoff::backoff::Backoff;
use serde::Deserialize;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::MAX_RECONNECT_INTERVAL;
use crate::config::MIN_RECONNECT_INTERVAL;
use crate::conn::Conn;
use crate::error::RaError;
use crate::tx::Tx;
use crate::wire::Nid;

/// Reconnect delay: starts at [`MIN_RECONNECT_INTERVAL`], doubles on
/// every consecutive failure up to [`MAX_RECONNECT_INTERVAL`], and is
/// reset by a successful connection.
pub struct ReconnectBackoff {
    inner: ExponentialBackoff,
    at_cap: u32,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            inner: ExponentialBackoffBuilder::new()
                .with_initial_interval(MIN_RECONNECT_INTERVAL)
                .with_multiplier(2.0)
                .with_randomization_factor(0.0)
                .with_max_interval(MAX_RECONNECT_INTERVAL)
                .with_max_elapsed_time(None)
                .build(),
            at_cap: 0,
        }
    }
}

impl std::fmt::Debug for ReconnectBackoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectBackoff")
            .field("current", &self.inner.current_interval)
            .field("at_cap", &self.at_cap)
            .finish()
    }
}

impl ReconnectBackoff {
    /// Record a failed attempt and return how long to wait before the
    /// next one.
    pub fn failed(&mut self) -> Duration {
        let delay = self
            .inner
            .next_backoff()
            .unwrap_or(MAX_RECONNECT_INTERVAL);
        // The backoff may add sub-millisecond jitter even without
        // randomization.
        let delay = Duration::from_millis(delay.as_millis() as u64).min(MAX_RECONNECT_INTERVAL);
        if delay == MAX_RECONNECT_INTERVAL {
            self.at_cap += 1;
        }
        delay
    }

    pub fn reset(&mut self) {
        self.inner.reset();
        self.at_cap = 0;
    }

    /// Consecutive failures that waited the maximum interval.
    pub fn failures_at_cap(&self) -> u32 {
        self.at_cap
    }
}

/// What to do after a failed handshake.
#[derive(Debug)]
pub enum ConnectOutcome {
    /// Keep the queued sends and try again after the delay.
    Retry(Duration),
    /// Stop trying; fail the queued sends with the error.
    GiveUp(Vec<Box<Tx>>, RaError),
}

/// A remote node, as held in the peer table.
#[derive(Debug)]
pub struct Peer {
    pub nid: Nid,
    pub addr: SocketAddr,
    /// Explicitly configured; survives having no connections.
    pub persistent: bool,
    /// A handshake is in progress or scheduled.
    pub connecting: bool,
    /// No connection attempt before this.
    pub reconnect_time: Instant,
    pub backoff: ReconnectBackoff,
    /// Sends waiting for a connection.
    pub tx_queue: VecDeque<Box<Tx>>,
    pub conns: Vec<Arc<Conn>>,
}

impl Peer {
    pub fn new(nid: Nid, addr: SocketAddr) -> Self {
        Self {
            nid,
            addr,
            persistent: false,
            connecting: false,
            reconnect_time: Instant::now(),
            backoff: ReconnectBackoff::default(),
            tx_queue: VecDeque::new(),
            conns: Vec::new(),
        }
    }

    /// Account for a failed handshake. Retryable failures keep queued
    /// sends until `unreachable_after` failures have waited the maximum
    /// interval; anything else fails them at once.
    pub fn connect_failed(
        &mut self,
        err: RaError,
        unreachable_after: u32,
        now: Instant,
    ) -> ConnectOutcome {
        let delay = self.backoff.failed();
        self.reconnect_time = now + delay;
        if self.tx_queue.is_empty() {
            self.connecting = false;
            return ConnectOutcome::GiveUp(Vec::new(), err);
        }
        if err.is_retryable() && self.backoff.failures_at_cap() < unreachable_after {
            return ConnectOutcome::Retry(delay);
        }
        self.connecting = false;
        let err = if err.is_retryable() {
            RaError::PeerUnreachable(self.nid)
        } else {
            err
        };
        ConnectOutcome::GiveUp(self.tx_queue.drain(..).collect(), err)
    }

    /// Nothing refers to this peer; it may leave the table.
    pub fn is_unreferenced(&self) -> bool {
        !self.persistent && !self.connecting && self.conns.is_empty() && self.tx_queue.is_empty()
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            nid: self.nid,
            addr: self.addr,
            persistent: self.persistent,
            connecting: self.connecting,
            conns: self.conns.len(),
            queued: self.tx_queue.len(),
        }
    }
}

/// Snapshot of a peer table entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub nid: Nid,
    pub addr: SocketAddr,
    pub persistent: bool,
    pub connecting: bool,
    pub conns: usize,
    pub queued: usize,
}
