/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Per-device scheduling state.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tokio::sync::Notify;

use crate::conn::Conn;
use crate::rdma_components::RaDevice;

/// A physical device and the work waiting for its scheduler.
pub struct Device {
    /// Index in the driver's device list.
    pub idx: usize,
    pub hw: Arc<dyn RaDevice>,
    /// Set by the completion callback.
    ready: AtomicBool,
    /// Connections needing service.
    connq: Mutex<VecDeque<Arc<Conn>>>,
    wakeup: Notify,
}

impl Device {
    /// Wrap `hw` and install its completion callback.
    pub fn new(idx: usize, hw: Arc<dyn RaDevice>) -> Arc<Self> {
        let dev = Arc::new(Self {
            idx,
            hw,
            ready: AtomicBool::new(false),
            connq: Mutex::new(VecDeque::new()),
            wakeup: Notify::new(),
        });
        let weak: Weak<Device> = Arc::downgrade(&dev);
        dev.hw.set_callback(Box::new(move || {
            if let Some(dev) = weak.upgrade() {
                dev.callback();
            }
        }));
        dev
    }

    /// The hardware completion callback: flag and wake, nothing else.
    pub fn callback(&self) {
        self.ready.store(true, Ordering::Release);
        self.wakeup.notify_one();
    }

    /// Consume the ready flag.
    pub fn take_ready(&self) -> bool {
        self.ready.swap(false, Ordering::AcqRel)
    }

    fn connq(&self) -> MutexGuard<'_, VecDeque<Arc<Conn>>> {
        self.connq.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue `conn` for service unless it is already queued.
    pub fn schedule(&self, conn: &Arc<Conn>) {
        if conn.set_scheduled() {
            self.connq().push_back(conn.clone());
            self.wakeup.notify_one();
        }
    }

    pub fn next_conn(&self) -> Option<Arc<Conn>> {
        let conn = self.connq().pop_front()?;
        conn.clear_scheduled();
        Some(conn)
    }

    pub fn has_work(&self) -> bool {
        self.ready.load(Ordering::Acquire) || !self.connq().is_empty()
    }

    /// Wait for a callback or a scheduled connection.
    pub async fn wait(&self) {
        let notified = self.wakeup.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.has_work() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::conn::ConnParams;
    use crate::loopback::LoopbackFabric;

    #[tokio::test]
    async fn test_callback_wakes_waiter() {
        let fabric = LoopbackFabric::new();
        let hw = fabric.device(0);
        let dev = Device::new(0, hw.clone());

        let waiter = tokio::spawn({
            let dev = dev.clone();
            async move { dev.wait().await }
        });
        tokio::task::yield_now().await;
        // What the hardware does on a completion.
        hw.overrun();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(dev.take_ready());
        assert!(!dev.take_ready());
    }

    #[tokio::test]
    async fn test_schedule_once() {
        let fabric = LoopbackFabric::new();
        let hw = fabric.device(0);
        let dev = Device::new(0, hw.clone());
        let conn = Arc::new(Conn::new(ConnParams {
            nid: 1,
            dev: 0,
            cqid: 5,
            endpoint: hw.create_endpoint(5).unwrap(),
            my_connstamp: 1,
            peerstamp: 1,
            peer_connstamp: 1,
            local_timeout: 30,
            peer_timeout: 30,
        }));
        dev.schedule(&conn);
        dev.schedule(&conn);
        // Already has work: returns at once.
        dev.wait().await;
        assert_eq!(dev.next_conn().map(|c| c.cqid), Some(5));
        assert!(dev.next_conn().is_none());
        dev.schedule(&conn);
        assert!(dev.next_conn().is_some());
    }
}
