/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! End-to-end tests: two drivers talking over a loopback fabric and real
//! TCP handshakes on localhost.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::time::Instant;
    use tracing_test::traced_test;

    use crate::buffer::IoBuffer;
    use crate::buffer::Region;
    use crate::config::RESCHED;
    use crate::config::Tunables;
    use crate::conn::ConnParams;
    use crate::conn::ConnState;
    use crate::error::RaError;
    use crate::loopback::FabricEvent;
    use crate::rdma_components::RaDevice;
    use crate::reaper;
    use crate::scheduler;
    use crate::test_utils::test_utils::*;
    use crate::tx::TxState;
    use crate::wire::Msg;
    use crate::wire::MsgBody;
    use crate::wire::MsgType;

    fn position(events: &[FabricEvent], pred: impl Fn(&FabricEvent) -> bool) -> Option<usize> {
        events.iter().position(pred)
    }

    fn is_fma(event: &FabricEvent, msg_type: MsgType) -> bool {
        matches!(event, FabricEvent::FmaSent { msg_type: Some(t), .. } if *t == msg_type)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_immediate_in_order() -> Result<(), anyhow::Error> {
        let env = RanalTestEnv::setup().await?;
        for i in 0..20u8 {
            let payload = IoBuffer::from_bytes(pattern(100 + i as usize, i));
            within(env.node_1.send(NID_2, hdr(i), payload)).await??;
        }
        wait_until(|| env.receiver_2.immediates().len() == 20).await?;
        for (i, (src, hdr_, payload)) in env.receiver_2.immediates().into_iter().enumerate() {
            assert_eq!(src, NID_1);
            assert_eq!(hdr_, hdr(i as u8));
            assert_eq!(payload, Bytes::from(pattern(100 + i, i as u8)));
        }

        // Both sides agree on the connection.
        let conn_1 = env.node_1.conn_info(NID_2).unwrap();
        let conn_2 = env.node_2.conn_info(NID_1).unwrap();
        assert_eq!(conn_1.state, ConnState::Established);
        assert_eq!(conn_1.my_connstamp, conn_2.peer_connstamp);
        assert_eq!(conn_2.my_connstamp, conn_1.peer_connstamp);

        env.wait_for_idle_txs().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_put() -> Result<(), anyhow::Error> {
        let env = RanalTestEnv::setup().await?;
        let len = env.tunables.max_immediate * 4;
        env.receiver_2
            .offer_sink(IoBuffer::virt(Region::new(len), 0, len)?);

        let data = pattern(len, 7);
        within(env.node_1.send(NID_2, hdr(1), IoBuffer::from_bytes(&data))).await??;

        wait_until(|| !env.receiver_2.puts().is_empty()).await?;
        let puts = env.receiver_2.puts();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].0, NID_1);
        assert_eq!(puts[0].1, hdr(1));
        assert_eq!(puts[0].2, Ok(data));
        assert!(env.receiver_2.immediates().is_empty());

        let journal = env.fabric.journal();
        let req = position(&journal, |e| is_fma(e, MsgType::PutReq)).unwrap();
        let ack = position(&journal, |e| is_fma(e, MsgType::PutAck)).unwrap();
        let done = position(&journal, |e| is_fma(e, MsgType::PutDone)).unwrap();
        assert!(req < ack && ack < done);
        assert!(matches!(
            journal[done],
            FabricEvent::FmaSent { fence: true, .. }
        ));

        env.wait_for_idle_txs().await?;
        wait_until(|| env.fabric.registered() == 0).await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_put_done_waits_for_rdma() -> Result<(), anyhow::Error> {
        let env = RanalTestEnv::setup().await?;
        env.connect().await?;
        let len = env.tunables.max_immediate + 1;
        env.receiver_2
            .offer_sink(IoBuffer::virt(Region::new(len), 0, len)?);
        env.fabric.hold_rdma_completions();

        let mut send = Box::pin(env.node_1.send(
            NID_2,
            hdr(2),
            IoBuffer::from_bytes(pattern(len, 2)),
        ));
        assert!(
            tokio::time::timeout(Duration::from_millis(100), send.as_mut())
                .await
                .is_err()
        );
        wait_until(|| {
            env.fabric
                .journal()
                .iter()
                .any(|e| matches!(e, FabricEvent::RdmaPosted { .. }))
        })
        .await?;

        // Give the scheduler every chance to jump the gun.
        assert!(
            tokio::time::timeout(Duration::from_millis(200), send.as_mut())
                .await
                .is_err()
        );
        let journal = env.fabric.journal();
        assert!(position(&journal, |e| is_fma(e, MsgType::PutDone)).is_none());
        assert!(env.receiver_2.puts().is_empty());
        let conn = env.node_1.conn_info(NID_2).unwrap();
        assert_eq!(conn.rdmaq, vec![TxState::PutiRdma]);

        env.fabric.release_rdma_completions();
        within(send).await??;

        let journal = env.fabric.journal();
        let completed = position(&journal, |e| matches!(e, FabricEvent::RdmaCompleted { .. }))
            .unwrap();
        let done = position(&journal, |e| is_fma(e, MsgType::PutDone)).unwrap();
        assert!(completed < done);
        wait_until(|| env.receiver_2.puts().len() == 1).await?;
        assert_eq!(env.receiver_2.puts()[0].2, Ok(pattern(len, 2)));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_put_refused() -> Result<(), anyhow::Error> {
        let env = RanalTestEnv::setup().await?;
        let len = env.tunables.max_immediate * 2;
        let result = within(env.node_1.send(NID_2, hdr(3), IoBuffer::from_bytes(pattern(len, 3))))
            .await?;
        assert!(matches!(result, Err(RaError::NoMatchingBuffer(nid)) if nid == NID_2));
        assert!(env.receiver_2.puts().is_empty());
        env.wait_for_idle_txs().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_get() -> Result<(), anyhow::Error> {
        let env = RanalTestEnv::setup().await?;
        let data = pattern(5000, 9);
        env.receiver_2.offer_source(IoBuffer::from_bytes(&data));

        let region = Region::new(8192);
        let sink = IoBuffer::virt(region.clone(), 0, 8192)?;
        within(env.node_1.get(NID_2, hdr(4), sink)).await??;
        assert_eq!(&region.to_vec()[..5000], &data[..]);
        assert!(region.to_vec()[5000..].iter().all(|b| *b == 0));

        let journal = env.fabric.journal();
        let done = position(&journal, |e| is_fma(e, MsgType::GetDone)).unwrap();
        assert!(matches!(
            journal[done],
            FabricEvent::FmaSent { fence: true, .. }
        ));
        env.wait_for_idle_txs().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_get_refused() -> Result<(), anyhow::Error> {
        let env = RanalTestEnv::setup().await?;

        // Nothing on offer.
        let sink = IoBuffer::virt(Region::new(64), 0, 64)?;
        let result = within(env.node_1.get(NID_2, hdr(5), sink)).await?;
        assert!(matches!(result, Err(RaError::NoMatchingBuffer(_))));

        // Too big for the sink.
        env.receiver_2
            .offer_source(IoBuffer::from_bytes(pattern(128, 5)));
        let sink = IoBuffer::virt(Region::new(64), 0, 64)?;
        let result = within(env.node_1.get(NID_2, hdr(5), sink)).await?;
        assert!(matches!(result, Err(RaError::NoMatchingBuffer(_))));

        env.wait_for_idle_txs().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_mixed_concurrent() -> Result<(), anyhow::Error> {
        let env = RanalTestEnv::setup().await?;
        let big = env.tunables.max_immediate * 3;
        env.receiver_2
            .offer_sink(IoBuffer::virt(Region::new(big), 0, big)?);
        env.receiver_1.offer_source(IoBuffer::from_bytes(pattern(300, 1)));
        let region = Region::new(300);
        let sink = IoBuffer::virt(region.clone(), 0, 300)?;

        let (a, b, c, d) = tokio::join!(
            env.node_1.send(NID_2, hdr(1), IoBuffer::from_bytes(b"one")),
            env.node_1.send(NID_2, hdr(2), IoBuffer::from_bytes(pattern(big, 2))),
            env.node_2.get(NID_1, hdr(3), sink),
            env.node_2.send(NID_1, hdr(4), IoBuffer::from_bytes(b"four")),
        );
        a?;
        b?;
        c?;
        d?;
        assert_eq!(region.to_vec(), pattern(300, 1));
        wait_until(|| env.receiver_1.immediates().len() == 1).await?;
        wait_until(|| env.receiver_2.puts().len() == 1).await?;

        // One connection each way, whoever won the race.
        assert_eq!(env.node_1.conns().len(), 1);
        env.wait_for_idle_txs().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stale_connection_rejected() -> Result<(), anyhow::Error> {
        let env = RanalTestEnv::setup().await?;
        env.connect().await?;
        let existing = env.node_2.conn_info(NID_1).unwrap();
        let driver = env.node_2.driver();

        let params = |peer_connstamp| -> Result<ConnParams, anyhow::Error> {
            let cqid = driver.new_cqid();
            Ok(ConnParams {
                nid: NID_1,
                dev: 0,
                cqid,
                endpoint: env.device_2.create_endpoint(cqid)?,
                my_connstamp: driver.new_connstamp(),
                peerstamp: existing.peerstamp,
                peer_connstamp,
                local_timeout: 30,
                peer_timeout: 30,
            })
        };
        let addr = env.node_1.listen_addr();

        let result = driver.install_conn(params(existing.peer_connstamp)?, addr);
        assert!(matches!(
            result,
            Err(RaError::StaleConnection { nid, .. }) if nid == NID_1
        ));
        let result = driver.install_conn(params(existing.peer_connstamp - 1)?, addr);
        assert!(matches!(result, Err(RaError::StaleConnection { .. })));
        assert_eq!(env.node_2.conn_info(NID_1).unwrap().cqid, existing.cqid);

        // A newer attempt replaces the existing connection.
        let newer = driver.install_conn(params(existing.peer_connstamp + 1)?, addr)?;
        assert_eq!(env.node_2.conn_info(NID_1).unwrap().cqid, newer.cqid);
        wait_until(|| {
            env.node_2
                .conns()
                .iter()
                .all(|c| c.cqid != existing.cqid || c.state != ConnState::Established)
        })
        .await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reaper_closes_stuck_connection() -> Result<(), anyhow::Error> {
        let env = RanalTestEnv::setup().await?;
        env.connect().await?;
        env.fabric.withhold_credits(true);

        let mut send = Box::pin(env.node_1.send(NID_2, hdr(6), IoBuffer::from_bytes(b"stuck")));
        assert!(
            tokio::time::timeout(Duration::from_millis(100), send.as_mut())
                .await
                .is_err()
        );
        wait_until(|| {
            env.node_1
                .conn_info(NID_2)
                .is_some_and(|c| c.fmaq.len() == 1)
        })
        .await?;

        let later = Instant::now() + env.tunables.timeout() + Duration::from_secs(1);
        reaper::scan(env.node_1.driver(), later);
        let result = within(send).await?;
        assert!(matches!(result, Err(RaError::ConnectionClosing(nid)) if nid == NID_2));
        assert!(env.node_1.conn_info(NID_2).is_none());

        // Once credits return, CLOSE goes out and both sides tear down.
        env.fabric.withhold_credits(false);
        wait_until(|| env.node_1.conns().is_empty() && env.node_2.conns().is_empty()).await?;
        env.wait_for_idle_txs().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[traced_test]
    async fn test_sequence_gap_logged() -> Result<(), anyhow::Error> {
        let env = RanalTestEnv::setup().await?;
        env.connect().await?;
        let conn = env.node_2.conn_info(NID_1).unwrap();

        let mut msg = Msg::new(MsgBody::Noop);
        msg.srcnid = NID_1;
        msg.connstamp = conn.peer_connstamp;
        msg.seq = conn.rx_seq.wrapping_add(5);
        env.device_2
            .inject(conn.cqid, msg.encode(), Bytes::new())?;

        wait_until(|| logs_contain("sequence gap")).await?;
        assert_eq!(
            env.node_2.conn_info(NID_1).map(|c| c.state),
            Some(ConnState::Established)
        );

        // Not fatal: traffic keeps flowing.
        within(env.node_1.send(NID_2, hdr(8), IoBuffer::from_bytes(b"after"))).await??;
        wait_until(|| env.receiver_2.immediates().len() == 2).await?;
        assert_eq!(env.node_2.conn_info(NID_1).unwrap().cqid, conn.cqid);
        Ok(())
    }

    // Single-threaded, so the scheduler task can't run while the test
    // inspects the queue.
    #[tokio::test]
    async fn test_send_queue_drained_in_bounded_batches() -> Result<(), anyhow::Error> {
        let queued = 3 * RESCHED;
        let env = RanalTestEnv::setup_with(Tunables {
            ntx: queued,
            ..RanalTestEnv::tunables()
        })
        .await?;
        env.connect().await?;
        let driver = env.node_1.driver();
        let cqid = env.node_1.conn_info(NID_2).unwrap().cqid;
        let conn = driver.conn_by_cqid(cqid).unwrap();
        let rx_seq = env.node_2.conn_info(NID_1).unwrap().rx_seq;

        let mut txs = Vec::with_capacity(queued);
        for _ in 0..queued {
            let mut tx = driver.pool.acquire(false).await?;
            tx.state = TxState::Simple;
            tx.nid = NID_2;
            tx.cqid = Some(cqid);
            tx.msg = Msg::new(MsgBody::Noop);
            txs.push(tx);
        }
        conn.lock().fmaq.extend(txs);

        scheduler::service_conn(driver, &conn);
        assert_eq!(conn.lock().fmaq.len(), queued - RESCHED);

        // The rest goes out on later passes.
        wait_until(|| conn.lock().fmaq.is_empty()).await?;
        wait_until(|| {
            env.node_2
                .conn_info(NID_1)
                .is_some_and(|c| c.rx_seq == rx_seq.wrapping_add(queued as u32))
        })
        .await?;
        env.wait_for_idle_txs().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_keepalive_on_quiet_connection() -> Result<(), anyhow::Error> {
        let env = RanalTestEnv::setup().await?;
        env.connect().await?;
        let driver = env.node_1.driver();
        let cqid = env.node_1.conn_info(NID_2).unwrap().cqid;
        let conn = driver.conn_by_cqid(cqid).unwrap();
        let rx_seq = env.node_2.conn_info(NID_1).unwrap().rx_seq;
        let noops = || {
            env.fabric
                .journal()
                .iter()
                .filter(|e| is_fma(e, MsgType::Noop))
                .count()
        };
        assert_eq!(noops(), 0);

        // Recently active: nothing to do.
        reaper::scan(driver, Instant::now());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(noops(), 0);

        let quiet = conn.keepalive + Duration::from_secs(1);
        conn.lock().last_tx = Instant::now().checked_sub(quiet).unwrap();
        reaper::scan(driver, Instant::now());
        wait_until(|| noops() == 1).await?;
        wait_until(|| {
            env.node_2
                .conn_info(NID_1)
                .is_some_and(|c| c.rx_seq == rx_seq.wrapping_add(1))
        })
        .await?;
        assert_eq!(
            env.node_1.conn_info(NID_2).map(|c| c.state),
            Some(ConnState::Established)
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[traced_test]
    async fn test_unknown_cqid_and_overrun_not_fatal() -> Result<(), anyhow::Error> {
        let env = RanalTestEnv::setup().await?;
        env.connect().await?;
        let cqid = env.node_2.conn_info(NID_1).unwrap().cqid;

        // An endpoint that belongs to no connection.
        let stray_cqid = u32::MAX;
        let _stray = env.device_2.create_endpoint(stray_cqid)?;
        env.device_2
            .inject(stray_cqid, Msg::new(MsgBody::Noop).encode(), Bytes::new())?;
        wait_until(|| logs_contain("unknown cqid")).await?;

        env.device_2.overrun();
        wait_until(|| logs_contain("fma cq overrun")).await?;

        within(env.node_1.send(NID_2, hdr(9), IoBuffer::from_bytes(b"still up"))).await??;
        wait_until(|| env.receiver_2.immediates().len() == 2).await?;
        let conn = env.node_2.conn_info(NID_1).unwrap();
        assert_eq!(conn.cqid, cqid);
        assert_eq!(conn.state, ConnState::Established);
        env.wait_for_idle_txs().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_and_reconnect() -> Result<(), anyhow::Error> {
        let env = RanalTestEnv::setup().await?;
        env.connect().await?;
        let first = env.node_1.conn_info(NID_2).unwrap();

        assert_eq!(env.node_1.close_conns(NID_2), 1);
        wait_until(|| env.node_1.conns().is_empty() && env.node_2.conns().is_empty()).await?;
        // Persistent peers outlive their connections.
        assert!(env.node_1.peers().iter().any(|p| p.nid == NID_2));

        env.connect().await?;
        let second = env.node_1.conn_info(NID_2).unwrap();
        assert_ne!(first.my_connstamp, second.my_connstamp);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_del_peer() -> Result<(), anyhow::Error> {
        let env = RanalTestEnv::setup().await?;
        env.connect().await?;
        assert!(env.node_1.del_peer(NID_2));
        assert!(!env.node_1.del_peer(0xdead));
        wait_until(|| env.node_1.peers().iter().all(|p| p.nid != NID_2)).await?;
        wait_until(|| env.node_2.conns().is_empty()).await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_fails_pending() -> Result<(), anyhow::Error> {
        let env = RanalTestEnv::setup().await?;
        // Nothing listens at 127.0.0.1:0; the send waits on the peer.
        let nowhere = 0x7f00_0001;
        let mut send = Box::pin(env.node_1.send(nowhere, hdr(7), IoBuffer::from_bytes(b"lost")));
        assert!(
            tokio::time::timeout(Duration::from_millis(200), send.as_mut())
                .await
                .is_err()
        );
        let peer = env
            .node_1
            .peers()
            .into_iter()
            .find(|p| p.nid == nowhere)
            .unwrap();
        assert_eq!(peer.queued, 1);
        assert!(!peer.persistent);

        within(env.node_1.shutdown()).await?;
        let result = within(send).await?;
        assert!(matches!(result, Err(RaError::Shutdown)));
        assert_eq!(env.node_1.idle_txs(), (env.tunables.ntx, env.tunables.ntx_nblk));

        let result = within(env.node_1.send(NID_2, hdr(7), IoBuffer::from_bytes(b"late"))).await?;
        assert!(matches!(result, Err(RaError::Shutdown)));
        Ok(())
    }
}
