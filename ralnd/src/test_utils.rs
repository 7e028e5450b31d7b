/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

pub mod test_utils {
    use std::collections::VecDeque;
    use std::future::Future;
    use std::net::IpAddr;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::time::Duration;

    use anyhow::anyhow;
    use bytes::Bytes;

    use crate::buffer::IoBuffer;
    use crate::config::Tunables;
    use crate::error::RaError;
    use crate::loopback::LoopbackDevice;
    use crate::loopback::LoopbackFabric;
    use crate::ranal::Ranal;
    use crate::ranal::Receiver;
    use crate::rdma_components::RaDevice;
    use crate::wire::Nid;
    use crate::wire::PTL_HDR_SIZE;
    use crate::wire::PortalsHeader;

    pub const NID_1: Nid = 0x1001;
    pub const NID_2: Nid = 0x2002;

    const TEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// A portals header tagged with `tag`.
    pub fn hdr(tag: u8) -> PortalsHeader {
        let mut hdr = [0u8; PTL_HDR_SIZE];
        hdr[0] = tag;
        hdr[PTL_HDR_SIZE - 1] = tag;
        PortalsHeader(hdr)
    }

    /// `len` bytes of recognizable data.
    pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    /// Run `fut`, failing if it takes too long.
    pub async fn within<F: Future>(fut: F) -> Result<F::Output, anyhow::Error> {
        tokio::time::timeout(TEST_TIMEOUT, fut)
            .await
            .map_err(|_| anyhow!("timed out after {:?}", TEST_TIMEOUT))
    }

    /// Poll `cond` until it holds.
    pub async fn wait_until(mut cond: impl FnMut() -> bool) -> Result<(), anyhow::Error> {
        within(async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
    }

    #[derive(Default)]
    struct ReceiverState {
        immediates: Vec<(Nid, PortalsHeader, Bytes)>,
        sinks: VecDeque<IoBuffer>,
        puts: Vec<(Nid, PortalsHeader, Result<Vec<u8>, String>)>,
        sources: VecDeque<IoBuffer>,
    }

    /// Records deliveries and serves the buffers it has been offered, in
    /// order. With nothing on offer, PUTs and GETs are refused.
    #[derive(Default)]
    pub struct TestReceiver {
        state: Mutex<ReceiverState>,
    }

    impl TestReceiver {
        fn state(&self) -> std::sync::MutexGuard<'_, ReceiverState> {
            self.state.lock().unwrap()
        }

        pub fn offer_sink(&self, sink: IoBuffer) {
            self.state().sinks.push_back(sink);
        }

        pub fn offer_source(&self, source: IoBuffer) {
            self.state().sources.push_back(source);
        }

        pub fn immediates(&self) -> Vec<(Nid, PortalsHeader, Bytes)> {
            self.state().immediates.clone()
        }

        pub fn puts(&self) -> Vec<(Nid, PortalsHeader, Result<Vec<u8>, String>)> {
            self.state().puts.clone()
        }
    }

    impl Receiver for TestReceiver {
        fn immediate(&self, src: Nid, hdr: &PortalsHeader, payload: Bytes) {
            self.state().immediates.push((src, *hdr, payload));
        }

        fn put_sink(&self, _src: Nid, _hdr: &PortalsHeader) -> Option<IoBuffer> {
            self.state().sinks.pop_front()
        }

        fn put_complete(&self, src: Nid, hdr: &PortalsHeader, result: Result<IoBuffer, RaError>) {
            let result = result
                .map(|sink| sink.to_bytes().to_vec())
                .map_err(|e| e.to_string());
            self.state().puts.push((src, *hdr, result));
        }

        fn get_source(&self, _src: Nid, _hdr: &PortalsHeader) -> Option<IoBuffer> {
            self.state().sources.pop_front()
        }
    }

    /// Two drivers on one loopback fabric, each a persistent peer of the
    /// other.
    pub struct RanalTestEnv {
        pub fabric: LoopbackFabric,
        pub tunables: Tunables,
        pub node_1: Ranal,
        pub node_2: Ranal,
        pub device_1: Arc<LoopbackDevice>,
        pub device_2: Arc<LoopbackDevice>,
        pub receiver_1: Arc<TestReceiver>,
        pub receiver_2: Arc<TestReceiver>,
    }

    impl RanalTestEnv {
        pub fn tunables() -> Tunables {
            Tunables {
                port: 0,
                listen_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
                ntx: 8,
                ntx_nblk: 8,
                n_connd: 2,
                ..Default::default()
            }
        }

        pub async fn setup() -> Result<Self, anyhow::Error> {
            Self::setup_with(Self::tunables()).await
        }

        pub async fn setup_with(tunables: Tunables) -> Result<Self, anyhow::Error> {
            let fabric = LoopbackFabric::new();
            let device_1 = fabric.device(0);
            let device_2 = fabric.device(0);
            let receiver_1 = Arc::new(TestReceiver::default());
            let receiver_2 = Arc::new(TestReceiver::default());

            let node_1 = Ranal::startup(
                NID_1,
                tunables.clone(),
                vec![device_1.clone() as Arc<dyn RaDevice>],
                receiver_1.clone(),
            )
            .await?;
            let node_2 = Ranal::startup(
                NID_2,
                tunables.clone(),
                vec![device_2.clone() as Arc<dyn RaDevice>],
                receiver_2.clone(),
            )
            .await?;

            let addr_1 = node_1.listen_addr();
            let addr_2 = node_2.listen_addr();
            node_1.add_peer(NID_2, addr_2.ip(), addr_2.port());
            node_2.add_peer(NID_1, addr_1.ip(), addr_1.port());

            Ok(Self {
                fabric,
                tunables,
                node_1,
                node_2,
                device_1,
                device_2,
                receiver_1,
                receiver_2,
            })
        }

        /// Send an IMMEDIATE from node 1 to node 2 and wait for it to land,
        /// which leaves the two connected.
        pub async fn connect(&self) -> Result<(), anyhow::Error> {
            let before = self.receiver_2.immediates().len();
            within(
                self.node_1
                    .send(NID_2, hdr(0), IoBuffer::from_bytes(b"hello")),
            )
            .await??;
            wait_until(|| self.receiver_2.immediates().len() > before).await?;
            wait_until(|| self.node_2.conn_info(NID_1).is_some()).await
        }

        /// Wait for every descriptor on both nodes to be returned.
        pub async fn wait_for_idle_txs(&self) -> Result<(), anyhow::Error> {
            let full = (self.tunables.ntx, self.tunables.ntx_nblk);
            wait_until(|| self.node_1.idle_txs() == full && self.node_2.idle_txs() == full).await
        }
    }
}
