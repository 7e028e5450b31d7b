/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! RapidArray network driver: reliable, connection-oriented messaging and
//! RDMA between nodes, beneath a portals-style upper layer.

pub mod buffer;
pub mod config;
mod conn;
mod connd;
mod device;
pub mod error;
mod hash;
pub mod loopback;
mod peer;
mod ranal;
pub mod rdma_components;
mod reaper;
mod scheduler;
pub mod telemetry;
mod tx;
pub mod wire;

pub use buffer::IoBuffer;
pub use buffer::Region;
pub use config::Tunables;
pub use conn::ConnInfo;
pub use conn::ConnState;
pub use error::Completion;
pub use error::RaError;
pub use loopback::FabricEvent;
pub use loopback::LoopbackFabric;
pub use peer::PeerInfo;
pub use ranal::Ranal;
pub use ranal::Receiver;
pub use rdma_components::RaDevice;
pub use rdma_components::RaEndpoint;
pub use tx::TxState;
pub use wire::Nid;
pub use wire::PortalsHeader;

#[cfg(test)]
mod ranal_tests;
#[cfg(test)]
mod test_utils;
