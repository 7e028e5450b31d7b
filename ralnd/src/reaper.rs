/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The reaper: periodic connection health checks.
//!
//! Every pass looks at each live connection and
//! - closes it if nothing has arrived within its timeout, or if a
//!   descriptor has been waiting longer than that;
//! - queues it for a keepalive if it has been quiet on the send side;
//! - terminates it if it has been closing for longer than its timeout.
//!
//! Passes run at a quarter of the shortest connection timeout (at least
//! once a second), so every connection is checked well within its window.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::conn::Conn;
use crate::conn::ConnState;
use crate::ranal::Driver;

/// Reaper pacing state.
#[derive(Debug)]
pub(crate) struct Reaper {
    min_timeout: Mutex<Duration>,
    changed: Notify,
}

impl Reaper {
    pub fn new(timeout: Duration) -> Self {
        Self {
            min_timeout: Mutex::new(timeout),
            changed: Notify::new(),
        }
    }

    fn min_timeout(&self) -> Duration {
        *self.min_timeout.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A connection with `timeout` appeared; wake early if it needs
    /// checking more often than anything so far.
    pub fn report_timeout(&self, timeout: Duration) {
        let mut min = self.min_timeout.lock().unwrap_or_else(|e| e.into_inner());
        if timeout < *min {
            *min = timeout;
            drop(min);
            self.changed.notify_one();
        }
    }

    pub fn period(&self) -> Duration {
        (self.min_timeout() / 4).max(Duration::from_secs(1))
    }
}

pub(crate) async fn run(driver: Arc<Driver>) {
    loop {
        let period = driver.reaper.period();
        tokio::select! {
            biased;
            _ = driver.stopped() => break,
            _ = driver.reaper.changed.notified() => continue,
            _ = tokio::time::sleep(period) => {}
        }
        scan(&driver, Instant::now());
    }
    tracing::debug!("reaper stopped");
}

enum Verdict {
    Healthy,
    Keepalive,
    Close(String),
    Terminate,
}

fn check(conn: &Conn, now: Instant) -> Verdict {
    let inner = conn.lock();
    match inner.state() {
        ConnState::Closed => Verdict::Healthy,
        ConnState::Closing => match inner.closing_since() {
            Some(since) if now.saturating_duration_since(since) > conn.timeout => {
                Verdict::Terminate
            }
            _ => Verdict::Healthy,
        },
        ConnState::Established => {
            let silent = now.saturating_duration_since(inner.last_rx);
            if silent > conn.timeout {
                return Verdict::Close(format!("nothing received for {:?}", silent));
            }
            if let Some(qtime) = inner.oldest_qtime() {
                let waited = now.saturating_duration_since(qtime);
                if waited > conn.timeout {
                    return Verdict::Close(format!("tx waiting for {:?}", waited));
                }
            }
            if now.saturating_duration_since(inner.last_tx) >= conn.keepalive {
                Verdict::Keepalive
            } else {
                Verdict::Healthy
            }
        }
    }
}

/// One pass over every connection, as of `now`.
pub(crate) fn scan(driver: &Driver, now: Instant) {
    let conns: Vec<Arc<Conn>> = driver.tables().conns.values().cloned().collect();
    let mut min_timeout = driver.tunables.timeout();
    for conn in &conns {
        match check(conn, now) {
            Verdict::Healthy => {}
            Verdict::Keepalive => driver.schedule_conn(conn),
            Verdict::Close(reason) => {
                tracing::error!("timed out connection to {:#x}: {}", conn.nid, reason);
                driver.close_conn(conn, reason);
            }
            Verdict::Terminate => {
                tracing::warn!(
                    "connection to {:#x} (cqid {}) stuck closing",
                    conn.nid,
                    conn.cqid
                );
                driver.terminate_conn(conn);
            }
        }
        if conn.state() != ConnState::Closed {
            min_timeout = min_timeout.min(conn.timeout);
        }
    }
    *driver
        .reaper
        .min_timeout
        .lock()
        .unwrap_or_else(|e| e.into_inner()) = min_timeout;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period() {
        let reaper = Reaper::new(Duration::from_secs(60));
        assert_eq!(reaper.period(), Duration::from_secs(15));
        reaper.report_timeout(Duration::from_secs(90));
        assert_eq!(reaper.period(), Duration::from_secs(15));
        reaper.report_timeout(Duration::from_secs(8));
        assert_eq!(reaper.period(), Duration::from_secs(2));
        reaper.report_timeout(Duration::from_secs(2));
        assert_eq!(reaper.period(), Duration::from_secs(1));
    }
}
