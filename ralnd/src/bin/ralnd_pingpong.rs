/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Ping-pong between two drivers on an in-process fabric. Messages up to
//! `max_immediate` bytes travel inline; larger ones exercise PUT.

use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;
use ralnd::IoBuffer;
use ralnd::LoopbackFabric;
use ralnd::Nid;
use ralnd::PortalsHeader;
use ralnd::RaDevice;
use ralnd::RaError;
use ralnd::Ranal;
use ralnd::Receiver;
use ralnd::Region;
use ralnd::Tunables;
use ralnd::telemetry::initialize_logging;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio::time::Instant;

const PING: Nid = 1;
const PONG: Nid = 2;

/// Hands every delivered payload to a channel.
struct Collect {
    size: usize,
    delivered: mpsc::UnboundedSender<Bytes>,
}

impl Receiver for Collect {
    fn immediate(&self, _src: Nid, _hdr: &PortalsHeader, payload: Bytes) {
        let _ = self.delivered.send(payload);
    }

    fn put_sink(&self, _src: Nid, _hdr: &PortalsHeader) -> Option<IoBuffer> {
        IoBuffer::virt(Region::new(self.size), 0, self.size).ok()
    }

    fn put_complete(&self, src: Nid, _hdr: &PortalsHeader, result: Result<IoBuffer, RaError>) {
        match result {
            Ok(sink) => {
                let _ = self.delivered.send(sink.to_bytes());
            }
            Err(e) => tracing::warn!("PUT from {:#x} failed: {}", src, e),
        }
    }

    fn get_source(&self, _src: Nid, _hdr: &PortalsHeader) -> Option<IoBuffer> {
        None
    }
}

#[derive(Parser)]
struct Cli {
    /// YAML tunables file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Message size in bytes
    #[arg(long, default_value_t = 1024)]
    message_size: usize,

    /// Number of round trips
    #[arg(long, default_value_t = 1000)]
    num_iter: usize,
}

async fn start(
    fabric: &LoopbackFabric,
    nid: Nid,
    tunables: &Tunables,
    size: usize,
) -> Result<(Ranal, mpsc::UnboundedReceiver<Bytes>), anyhow::Error> {
    let (delivered, rx) = mpsc::unbounded_channel();
    let device: Arc<dyn RaDevice> = fabric.device(0);
    let ranal = Ranal::startup(
        nid,
        tunables.clone(),
        vec![device],
        Arc::new(Collect { size, delivered }),
    )
    .await?;
    Ok((ranal, rx))
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    initialize_logging();
    let args = Cli::parse();

    let mut tunables = Tunables::load(args.config.as_deref())?;
    tunables.port = 0;
    tunables.listen_addr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    let fabric = LoopbackFabric::new();
    let (ping, mut ping_rx) = start(&fabric, PING, &tunables, args.message_size).await?;
    let (pong, mut pong_rx) = start(&fabric, PONG, &tunables, args.message_size).await?;
    let pong = Arc::new(pong);
    ping.add_peer(PONG, pong.listen_addr().ip(), pong.listen_addr().port());
    pong.add_peer(PING, ping.listen_addr().ip(), ping.listen_addr().port());

    let echo = tokio::spawn({
        let pong = pong.clone();
        async move {
            while let Some(payload) = pong_rx.recv().await {
                pong.send(PING, PortalsHeader::default(), IoBuffer::from_bytes(payload))
                    .await?;
            }
            Ok::<_, RaError>(())
        }
    });

    let message = Bytes::from(vec![0xa5u8; args.message_size]);
    let mut latencies = Vec::with_capacity(args.num_iter);
    let start = Instant::now();
    for i in 0..args.num_iter {
        let t = Instant::now();
        ping.send(PONG, PortalsHeader::default(), IoBuffer::from_bytes(&message))
            .await?;
        let echoed = ping_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("pong went away"))?;
        anyhow::ensure!(echoed == message, "round trip {} corrupted the payload", i);
        latencies.push(t.elapsed());
    }
    let elapsed = start.elapsed();

    ping.shutdown().await;
    pong.shutdown().await;
    echo.abort();

    if let (Some(min), Some(max)) = (latencies.iter().min(), latencies.iter().max()) {
        let avg = latencies.iter().sum::<Duration>() / latencies.len() as u32;
        println!("Round trips: {}", latencies.len());
        println!("Message size: {} bytes", args.message_size);
        println!("Average latency: {:?}", avg);
        println!("Min latency: {:?}", min);
        println!("Max latency: {:?}", max);
        println!("Total time: {:?}", elapsed);
    }
    Ok(())
}
