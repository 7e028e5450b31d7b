/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Configuration for the RapidArray network driver.
//!
//! Protocol constants are fixed at compile time. Runtime tunables are
//! gathered into [`Tunables`], which can be loaded from defaults, a YAML
//! file and environment variables (in that order of precedence, lowest
//! first), and are sanitized before the driver starts.

use std::env;
use std::fs::File;
use std::io::Read;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

/// Max # devices RapidArray supports.
pub const MAX_DEVS: usize = 2;
/// # connection daemons.
pub const N_CONND: usize = 4;

/// First failed connection retry...
pub const MIN_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);
/// ...exponentially increasing to this.
pub const MAX_RECONNECT_INTERVAL: Duration = Duration::from_secs(60);

/// Max size of the FMA "prefix", which carries the protocol header.
pub const FMA_MAX_PREFIX: usize = 232;
/// Max FMA message is 7K including prefix.
pub const FMA_MAX_DATA: usize = (7 << 10) - 256;

pub const PEER_HASH_SIZE: usize = 101;
pub const CONN_HASH_SIZE: usize = 101;

/// # general tx descriptors.
pub const NTX: usize = 64;
/// # reserved (non-blocking) tx descriptors.
pub const NTX_NBLK: usize = 256;

/// # connections a scheduler services before yielding.
pub const RESCHED: usize = 100;

/// Minimum comms timeout (seconds).
pub const MIN_TIMEOUT: u64 = 5;

/// Keepalive interval (seconds) for a given timeout (seconds). At least two
/// keepalives fit in one timeout window.
pub fn keepalive_interval(timeout: u64) -> u64 {
    (timeout + 1) / 2
}

const DEFAULT_TIMEOUT: u64 = 30;
const DEFAULT_LISTENER_TIMEOUT: u64 = 5;
const DEFAULT_BACKLOG: u32 = 127;
const DEFAULT_PORT: u16 = 988;
const DEFAULT_MAX_IMMEDIATE: usize = 2 << 10;

/// Runtime tunables consumed from the environment/admin layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    /// Comms timeout (seconds).
    pub timeout: u64,
    /// Max time the listener-side handshake can block (seconds).
    pub listener_timeout: u64,
    /// Listener's backlog.
    pub backlog: u32,
    /// Listener's TCP port. Zero binds an ephemeral port.
    pub port: u16,
    /// Address the listener binds.
    pub listen_addr: IpAddr,
    /// Immediate payload breakpoint (bytes).
    pub max_immediate: usize,
    /// Consecutive handshake failures at the maximum reconnect interval
    /// before sends queued on the peer fail.
    pub unreachable_after: u32,
    /// # connection daemons.
    pub n_connd: usize,
    /// # general tx descriptors.
    pub ntx: usize,
    /// # reserved tx descriptors.
    pub ntx_nblk: usize,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            listener_timeout: DEFAULT_LISTENER_TIMEOUT,
            backlog: DEFAULT_BACKLOG,
            port: DEFAULT_PORT,
            listen_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            max_immediate: DEFAULT_MAX_IMMEDIATE,
            unreachable_after: 1,
            n_connd: N_CONND,
            ntx: NTX,
            ntx_nblk: NTX_NBLK,
        }
    }
}

impl Tunables {
    /// Defaults overridden by environment variables.
    pub fn from_env() -> Self {
        let mut tunables = Self::default();
        tunables.apply_env();
        tunables
    }

    /// Load tunables from a YAML file. Keys that are absent keep their
    /// default values.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        let tunables: Tunables = serde_yaml::from_str(&contents)?;
        Ok(tunables)
    }

    /// Save tunables to a YAML file.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), anyhow::Error> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Full load: defaults, then the optional YAML file, then the
    /// environment, then sanitization.
    pub fn load(path: Option<&Path>) -> Result<Self, anyhow::Error> {
        let mut tunables = match path {
            Some(path) => Self::from_yaml(path)?,
            None => Self::default(),
        };
        tunables.apply_env();
        Ok(tunables.sanitize())
    }

    /// Override fields from `RALND_*` environment variables. Unparseable
    /// values are ignored.
    pub fn apply_env(&mut self) {
        if let Some(val) = env_parse::<u64>("RALND_TIMEOUT") {
            self.timeout = val;
        }
        if let Some(val) = env_parse::<u64>("RALND_LISTENER_TIMEOUT") {
            self.listener_timeout = val;
        }
        if let Some(val) = env_parse::<u32>("RALND_BACKLOG") {
            self.backlog = val;
        }
        if let Some(val) = env_parse::<u16>("RALND_PORT") {
            self.port = val;
        }
        if let Some(val) = env_parse::<usize>("RALND_MAX_IMMEDIATE") {
            self.max_immediate = val;
        }
        if let Some(val) = env_parse::<u32>("RALND_UNREACHABLE_AFTER") {
            self.unreachable_after = val;
        }
    }

    /// Enforce floors and ceilings.
    pub fn sanitize(mut self) -> Self {
        if self.timeout < MIN_TIMEOUT {
            tracing::warn!(
                "timeout {}s below minimum, using {}s",
                self.timeout,
                MIN_TIMEOUT
            );
            self.timeout = MIN_TIMEOUT;
        }
        if self.max_immediate > FMA_MAX_DATA {
            tracing::warn!(
                "max_immediate {} above FMA data limit, using {}",
                self.max_immediate,
                FMA_MAX_DATA
            );
            self.max_immediate = FMA_MAX_DATA;
        }
        self.listener_timeout = self.listener_timeout.max(1);
        self.n_connd = self.n_connd.max(1);
        self.ntx = self.ntx.max(1);
        self.ntx_nblk = self.ntx_nblk.max(1);
        self.unreachable_after = self.unreachable_after.max(1);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn listener_timeout(&self) -> Duration {
        Duration::from_secs(self.listener_timeout)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok()?.parse().ok()
}
