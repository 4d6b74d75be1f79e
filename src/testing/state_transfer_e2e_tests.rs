//! End-to-end state transfer scenarios on the in-process harness.

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;

    use crate::commands::{CommandInvoker, InvocationContext, StateChunk, WriteCommand, WriteFlags};
    use crate::config::StateTransferConfig;
    use crate::statetransfer::{CacheMode, StateConsumer};
    use crate::testing::*;
    use crate::txn::{GlobalTransactionId, TransactionInfo};
    use crate::types::{CacheEntry, SegmentId};

    const NUM_SEGMENTS: u32 = 4;
    const WAIT: Duration = Duration::from_secs(5);

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("info")
            .try_init();
    }

    fn config() -> StateTransferConfig {
        StateTransferConfig::new().with_timeout(Duration::from_secs(2))
    }

    fn seg_key(segment: SegmentId) -> Bytes {
        key_in_segment(segment, NUM_SEGMENTS, "key")
    }

    fn seg_entry(segment: SegmentId) -> CacheEntry {
        CacheEntry::new(seg_key(segment), Bytes::from(format!("value-{}", segment)))
    }

    /// A single node holds four segments; a second node joins and must end
    /// up with exactly the segments the new write assignment gives it, with
    /// one terminal rehash notification even under duplicate updates.
    #[tokio::test]
    async fn bootstrap_join_moves_segments_to_the_new_node() {
        init_tracing();
        let entries: Vec<CacheEntry> = (0..NUM_SEGMENTS).map(seg_entry).collect();

        let rpc_a = ClusterRpc::new(NUM_SEGMENTS);
        let node_a = TestNode::build(1, config(), CacheMode::NonTx, rpc_a);
        for entry in &entries {
            node_a.container.insert(entry.clone());
        }

        let rpc_b = ClusterRpc::new(NUM_SEGMENTS);
        rpc_b.add_node(
            1,
            Arc::new(SourceNode {
                container: node_a.container.clone(),
                ..Default::default()
            }),
        );
        let node_b = TestNode::build(2, config(), CacheMode::NonTx, rpc_b);

        // node A alone owns everything
        let t0 = topology(1, vec![1], vec![vec![1]; 4], None);
        node_a.consumer.on_topology_update(t0, false).await.unwrap();
        assert!(node_a.consumer.owns_data());

        assert!(!node_b.consumer.is_state_transfer_in_progress());

        // B joins: rebalance with pending assignment {0:A, 1:B, 2:A, 3:B}
        let pending = vec![vec![1], vec![2], vec![1], vec![2]];
        let t1 = topology(2, vec![1, 2], vec![vec![1]; 4], Some(pending.clone()));
        node_b
            .consumer
            .on_topology_update(t1.clone(), true)
            .await
            .unwrap();
        node_b.consumer.wait_for_topology(2).await.unwrap();
        assert!(node_b.consumer.is_state_transfer_in_progress());

        // B pulls segments 1 and 3 from A and reports completion
        assert!(
            wait_until(|| node_b.notifier.completion_count() == 1, WAIT).await,
            "node B never finished receiving its segments"
        );
        assert_eq!(node_b.notifier.completions.lock()[0], 2);
        assert!(!node_b.consumer.has_active_transfers());

        // A processes the same rebalance and drops what it no longer owns
        node_a.consumer.on_topology_update(t1, true).await.unwrap();

        // terminal update without a pending assignment ends the rebalance
        let t2 = topology(3, vec![1, 2], pending, None);
        node_b
            .consumer
            .on_topology_update(t2.clone(), false)
            .await
            .unwrap();
        assert!(!node_b.consumer.is_state_transfer_in_progress());

        // a duplicate terminal update must not emit a second notification
        node_b
            .consumer
            .on_topology_update(t2.clone(), false)
            .await
            .unwrap();
        assert_eq!(node_b.notifier.post_rehash_count(), 1);

        node_a.consumer.on_topology_update(t2, false).await.unwrap();

        // the key/value maps match the final write assignment exactly
        let mut expected_b: Vec<Bytes> = vec![seg_key(1), seg_key(3)];
        expected_b.sort();
        assert_eq!(node_b.keys(), expected_b);
        for segment in [1, 3] {
            assert_eq!(
                node_b.container.get(&seg_key(segment)),
                Some(Bytes::from(format!("value-{}", segment)))
            );
        }

        let mut expected_a: Vec<Bytes> = vec![seg_key(0), seg_key(2)];
        expected_a.sort();
        assert_eq!(node_a.keys(), expected_a);
    }

    /// The source of an in-flight transfer crashes before sending the last
    /// chunk; the transfer restarts from the prior owner and completes.
    #[tokio::test]
    async fn source_leaving_mid_transfer_restarts_from_prior_owner() {
        init_tracing();
        let seg2_entry = seg_entry(2);

        let rpc = ClusterRpc::new(NUM_SEGMENTS);
        rpc.add_node(1, SourceNode::with_entries(vec![seg2_entry.clone()]));
        let source_b = SourceNode::with_entries(vec![seg2_entry.clone()]);
        source_b.hold_last_chunk.store(true, Ordering::SeqCst);
        rpc.add_node(2, source_b);

        let node_c = TestNode::build(3, config(), CacheMode::NonTx, rpc);

        // C joins and must pull segment 2 from B, the current owner
        let t6 = topology(
            6,
            vec![1, 2, 3],
            vec![vec![1], vec![1], vec![2], vec![2]],
            Some(vec![vec![1], vec![1], vec![3], vec![2]]),
        );
        node_c.consumer.on_topology_update(t6, true).await.unwrap();

        assert!(
            wait_until(
                || node_c.container.get(&seg2_entry.key).is_some(),
                WAIT
            )
            .await,
            "first chunk from B never arrived"
        );
        // B held back the end-of-segment marker, so the transfer stays open
        assert!(node_c.consumer.has_active_transfers());
        assert_eq!(node_c.notifier.completion_count(), 0);

        // B crashes; A, the prior owner, is the only remaining source
        let t7 = topology(
            7,
            vec![1, 3],
            vec![vec![1]; 4],
            Some(vec![vec![1], vec![1], vec![3], vec![1]]),
        );
        node_c.consumer.on_topology_update(t7, false).await.unwrap();

        assert!(
            wait_until(|| node_c.notifier.completion_count() == 1, WAIT).await,
            "transfer was not restarted from the prior owner"
        );
        assert_eq!(node_c.rpc.requests_of_kind("start-transfer"), vec![2, 1]);
        assert_eq!(
            node_c.container.get(&seg2_entry.key),
            Some(seg2_entry.value.clone())
        );

        let t8 = topology(8, vec![1, 3], vec![vec![1], vec![1], vec![3], vec![1]], None);
        node_c.consumer.on_topology_update(t8, false).await.unwrap();
        assert!(!node_c.consumer.is_state_transfer_in_progress());
        assert_eq!(node_c.notifier.post_rehash_count(), 1);
    }

    /// A user write lands before the chunk carrying the same key; the
    /// transferred value must not overwrite it.
    #[tokio::test]
    async fn user_write_wins_over_transferred_state() {
        init_tracing();
        let key = seg_key(3);

        let rpc = ClusterRpc::new(NUM_SEGMENTS);
        let source_a = SourceNode::with_entries(vec![CacheEntry::new(
            key.clone(),
            Bytes::from_static(b"state"),
        )]);
        source_a.paused.store(true, Ordering::SeqCst);
        rpc.add_node(1, source_a);

        let node_c = TestNode::build(2, config(), CacheMode::NonTx, rpc);

        let t1 = topology(
            2,
            vec![1, 2],
            vec![vec![1]; 4],
            Some(vec![vec![1], vec![1], vec![1], vec![2]]),
        );
        node_c.consumer.on_topology_update(t1, true).await.unwrap();
        assert!(
            wait_until(
                || !node_c.rpc.requests_of_kind("start-transfer").is_empty(),
                WAIT
            )
            .await
        );

        // user write through the chain, before the chunk arrives
        node_c
            .invoker
            .invoke(
                &InvocationContext::NonTx,
                WriteCommand::Put {
                    key: key.clone(),
                    value: Bytes::from_static(b"user"),
                    expires_at_nanos: None,
                    flags: WriteFlags::default(),
                },
            )
            .await
            .unwrap();
        assert!(node_c.consumer.is_key_updated(&key));

        // now the chunk for the same key arrives
        let chunk = StateChunk::new(
            3,
            vec![CacheEntry::new(key.clone(), Bytes::from_static(b"state"))],
            true,
        );
        node_c.consumer.apply_state(1, 2, vec![chunk]).await;

        assert_eq!(node_c.container.get(&key), Some(Bytes::from_static(b"user")));
        assert!(node_c.consumer.stats().entries_skipped >= 1);
        assert!(
            wait_until(|| node_c.notifier.completion_count() == 1, WAIT).await,
            "segment should still complete after the skipped key"
        );
    }

    /// A topology change takes a segment away mid-transfer: the segment is
    /// cancelled at the source, late chunks for it are unsolicited, and the
    /// task keeps serving its other segments.
    #[tokio::test]
    async fn topology_change_cancels_removed_segments() {
        init_tracing();
        let rpc = ClusterRpc::new(NUM_SEGMENTS);
        let source_b = SourceNode::new();
        source_b.paused.store(true, Ordering::SeqCst);
        rpc.add_node(2, source_b);
        rpc.add_node(1, SourceNode::new());

        let node_c = TestNode::build(3, config(), CacheMode::NonTx, rpc);

        // C pulls segments 0 and 2, both from B
        let t6 = topology(
            6,
            vec![1, 2, 3],
            vec![vec![2], vec![1], vec![2], vec![1]],
            Some(vec![vec![3], vec![1], vec![3], vec![1]]),
        );
        node_c.consumer.on_topology_update(t6, true).await.unwrap();
        assert!(
            wait_until(
                || !node_c.rpc.requests_of_kind("start-transfer").is_empty(),
                WAIT
            )
            .await
        );

        // a new topology takes segment 2 away from C
        let t7 = topology(
            7,
            vec![1, 2, 3],
            vec![vec![2], vec![1], vec![2], vec![1]],
            Some(vec![vec![3], vec![1], vec![2], vec![1]]),
        );
        node_c.consumer.on_topology_update(t7, false).await.unwrap();

        // the cancel went to B and the task survives with segment 0
        assert_eq!(node_c.rpc.requests_of_kind("cancel-transfer"), vec![2]);
        assert!(node_c.consumer.has_active_transfers());

        // a late chunk for the cancelled segment is unsolicited and dropped
        let late = seg_entry(2);
        node_c
            .consumer
            .apply_state(2, 7, vec![StateChunk::new(2, vec![late.clone()], true)])
            .await;
        assert!(node_c.container.get(&late.key).is_none());

        // the surviving segment still completes
        let kept = seg_entry(0);
        node_c
            .consumer
            .apply_state(2, 7, vec![StateChunk::new(0, vec![kept.clone()], true)])
            .await;
        assert!(
            wait_until(|| node_c.notifier.completion_count() == 1, WAIT).await
        );
        assert_eq!(node_c.container.get(&kept.key), Some(kept.value.clone()));
    }

    /// Prepared remote transactions are fetched before any entries and
    /// installed one topology behind, with their keys backup-locked.
    #[tokio::test]
    async fn prepared_transactions_carry_over() {
        init_tracing();
        let key = seg_key(1);
        let gtx = GlobalTransactionId::new(1);

        let rpc = ClusterRpc::new(NUM_SEGMENTS);
        let source_a = SourceNode::new();
        source_a.transactions.lock().push(TransactionInfo {
            global_tx: gtx,
            modifications: vec![WriteCommand::Put {
                key: key.clone(),
                value: Bytes::from_static(b"v"),
                expires_at_nanos: None,
                flags: WriteFlags::default(),
            }],
            locked_keys: vec![key.clone()],
        });
        rpc.add_node(1, source_a);

        let manager = TestTransactionManager::new();
        let table = TestTransactionTable::new();
        let node_c = TestNode::build(
            2,
            config(),
            CacheMode::Tx {
                manager,
                table: table.clone(),
            },
            rpc,
        );

        let t10 = topology(
            10,
            vec![1, 2],
            vec![vec![1]; 4],
            Some(vec![vec![1], vec![2], vec![1], vec![1]]),
        );
        node_c.consumer.on_topology_update(t10, true).await.unwrap();

        let remote = table
            .remote_transaction(&gtx)
            .expect("remote transaction was installed");
        assert_eq!(remote.lookup_topology_id(), 9);
        assert!(remote.has_backup_lock(&key));
        assert_eq!(remote.modifications().len(), 1);
        assert_eq!(*table.cleanups.lock(), vec![10]);

        // the data pull still runs after the transaction fetch
        assert!(
            wait_until(|| node_c.notifier.completion_count() == 1, WAIT).await
        );
        let transactions = node_c.rpc.requests_of_kind("get-transactions");
        let starts = node_c.rpc.requests_of_kind("start-transfer");
        assert_eq!(transactions, vec![1]);
        assert_eq!(starts, vec![1]);
    }

    /// When the transaction source fails, its segments are retried against
    /// another source and the failed node is excluded.
    #[tokio::test]
    async fn failed_transaction_source_is_excluded_and_retried() {
        init_tracing();
        let rpc = ClusterRpc::new(NUM_SEGMENTS);
        // owner list for segment 1 is [2, 3]: 3 is preferred but fails
        let failing = SourceNode::new();
        failing.fail_transactions.store(true, Ordering::SeqCst);
        rpc.add_node(3, failing);
        rpc.add_node(2, SourceNode::new());

        let manager = TestTransactionManager::new();
        let table = TestTransactionTable::new();
        let node = TestNode::build(
            1,
            config(),
            CacheMode::Tx {
                manager,
                table,
            },
            rpc,
        );

        let t5 = topology(
            5,
            vec![1, 2, 3],
            vec![vec![2], vec![2, 3], vec![2], vec![2]],
            Some(vec![vec![2], vec![1], vec![2], vec![2]]),
        );
        node.consumer.on_topology_update(t5, true).await.unwrap();

        // first attempt went to the newest owner, the retry to the older one
        assert_eq!(node.rpc.requests_of_kind("get-transactions"), vec![3, 2]);
        // after a failure the data fetch re-selects sources fresh
        assert!(
            wait_until(|| node.notifier.completion_count() == 1, WAIT).await
        );
        assert_eq!(node.rpc.requests_of_kind("start-transfer"), vec![2]);
    }

    /// A total-order cache blocks the topology update until in-flight
    /// remote transactions drained.
    #[tokio::test]
    async fn total_order_waits_for_inflight_transactions() {
        init_tracing();
        let rpc = ClusterRpc::new(NUM_SEGMENTS);
        rpc.add_node(1, SourceNode::new());

        let manager = TestTransactionManager::new();
        let table = TestTransactionTable::new();
        let total_order = TestTotalOrderManager::new();
        let latch = total_order.add_latch();

        let node = TestNode::build(
            2,
            config(),
            CacheMode::TxTotalOrder {
                manager,
                table,
                total_order: total_order.clone(),
            },
            rpc,
        );

        let t1 = topology(4, vec![1, 2], vec![vec![1]; 4], Some(vec![vec![1]; 4]));
        let consumer = node.consumer.clone();
        let update = tokio::spawn(async move { consumer.on_topology_update(t1, true).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!update.is_finished(), "update must block on the latch");
        // the new topology is not installed while the drain is pending
        assert!(node.consumer.get_cache_topology().is_none());

        latch.unblock();
        update.await.unwrap().unwrap();
        assert_eq!(*total_order.started.lock(), vec![4]);
        assert!(!total_order.ended.load(Ordering::SeqCst));

        let t2 = topology(5, vec![1, 2], vec![vec![1]; 4], None);
        node.consumer.on_topology_update(t2, false).await.unwrap();
        assert!(total_order.ended.load(Ordering::SeqCst));
    }

    /// Topologies older than the current one are rejected.
    #[tokio::test]
    async fn stale_topology_is_ignored() {
        init_tracing();
        let rpc = ClusterRpc::new(NUM_SEGMENTS);
        let node = TestNode::build(1, config(), CacheMode::NonTx, rpc);

        let t5 = topology(5, vec![1], vec![vec![1]; 4], None);
        node.consumer.on_topology_update(t5, false).await.unwrap();

        let t4 = topology(4, vec![1, 2], vec![vec![2]; 4], None);
        node.consumer.on_topology_update(t4, false).await.unwrap();

        assert_eq!(
            node.consumer.get_cache_topology().unwrap().topology_id(),
            5
        );
    }

    /// `stop` cancels in-flight transfers at their sources and empties the
    /// registry.
    #[tokio::test]
    async fn stop_cancels_active_transfers() {
        init_tracing();
        let rpc = ClusterRpc::new(NUM_SEGMENTS);
        let source = SourceNode::new();
        source.paused.store(true, Ordering::SeqCst);
        rpc.add_node(1, source);

        let node = TestNode::build(2, config(), CacheMode::NonTx, rpc);
        let t1 = topology(
            2,
            vec![1, 2],
            vec![vec![1]; 4],
            Some(vec![vec![2], vec![1], vec![1], vec![1]]),
        );
        node.consumer.on_topology_update(t1, true).await.unwrap();
        assert!(
            wait_until(|| node.consumer.has_active_transfers(), WAIT).await
        );

        node.consumer.stop().await;

        assert!(!node.consumer.has_active_transfers());
        assert_eq!(node.rpc.requests_of_kind("cancel-transfer"), vec![1]);
    }

    /// With L1-on-rehash, previous owners that lost a segment become L1
    /// requestors of the keys this node keeps.
    #[tokio::test]
    async fn l1_on_rehash_registers_previous_owners() {
        init_tracing();
        let rpc = ClusterRpc::new(NUM_SEGMENTS);
        rpc.add_node(2, SourceNode::new());

        let container = Arc::new(crate::container::MapDataContainer::new());
        let invoker = ContainerInvoker::new(container.clone());
        let notifier = RecordingNotifier::new();
        let l1 = RecordingL1Manager::new();

        let consumer = StateConsumer::builder(
            1,
            config().with_l1_on_rehash(true),
            CacheMode::NonTx,
        )
        .rpc(rpc.clone())
        .invoker(invoker.clone())
        .data_container(container.clone())
        .notifier(notifier)
        .l1_manager(l1.clone())
        .build()
        .unwrap();
        invoker.connect(&consumer);
        rpc.connect(&consumer);
        consumer.start();

        let key0 = seg_key(0);
        let key1 = seg_key(1);
        container.insert(CacheEntry::new(key0, Bytes::from_static(b"v0")));
        container.insert(CacheEntry::new(key1.clone(), Bytes::from_static(b"v1")));

        // node 2 owned segments 1 and 3; it leaves and node 1 takes over
        let t0 = topology(1, vec![1, 2], vec![vec![1], vec![2], vec![1], vec![2]], None);
        consumer.on_topology_update(t0, false).await.unwrap();

        let t1 = topology(2, vec![1], vec![vec![1]; 4], None);
        consumer.on_topology_update(t1, false).await.unwrap();

        assert_eq!(*l1.requestors.lock(), vec![(key1, 2)]);
    }

    /// Keys living only in the persistent stores are invalidated along with
    /// in-memory ones; a failing store degrades to memory-only.
    #[tokio::test]
    async fn persistent_store_keys_are_invalidated() {
        init_tracing();
        let rpc = ClusterRpc::new(NUM_SEGMENTS);
        rpc.add_node(2, SourceNode::new());

        let key_mem = key_in_segment(1, NUM_SEGMENTS, "mem");
        let key_store = key_in_segment(1, NUM_SEGMENTS, "store");

        let container = Arc::new(crate::container::MapDataContainer::new());
        let invoker = ContainerInvoker::new(container.clone());
        let persistence = MapPersistence::new(vec![key_store.clone()]);

        let consumer = StateConsumer::builder(1, config(), CacheMode::NonTx)
            .rpc(rpc.clone())
            .invoker(invoker.clone())
            .data_container(container.clone())
            .persistence(persistence)
            .notifier(RecordingNotifier::new())
            .build()
            .unwrap();
        invoker.connect(&consumer);
        rpc.connect(&consumer);
        consumer.start();

        container.insert(CacheEntry::new(key_mem.clone(), Bytes::from_static(b"v")));

        let t0 = topology(1, vec![1, 2], vec![vec![1]; 4], None);
        consumer.on_topology_update(t0, false).await.unwrap();

        // segment 1 moves to node 2
        let t1 = topology(2, vec![1, 2], vec![vec![1], vec![2], vec![1], vec![1]], None);
        consumer.on_topology_update(t1, false).await.unwrap();

        let invalidated = invoker.invalidated.lock().clone();
        assert!(invalidated.contains(&key_mem));
        assert!(invalidated.contains(&key_store));
        assert!(container.get(&key_mem).is_none());
    }

    /// A failing store enumeration is absorbed: in-memory invalidation
    /// still runs.
    #[tokio::test]
    async fn failing_store_still_invalidates_memory() {
        init_tracing();
        let rpc = ClusterRpc::new(NUM_SEGMENTS);
        rpc.add_node(2, SourceNode::new());

        let key_mem = key_in_segment(1, NUM_SEGMENTS, "mem");
        let container = Arc::new(crate::container::MapDataContainer::new());
        let invoker = ContainerInvoker::new(container.clone());
        let persistence = MapPersistence::new(vec![]);
        persistence.fail.store(true, Ordering::SeqCst);

        let consumer = StateConsumer::builder(1, config(), CacheMode::NonTx)
            .rpc(rpc.clone())
            .invoker(invoker.clone())
            .data_container(container.clone())
            .persistence(persistence)
            .notifier(RecordingNotifier::new())
            .build()
            .unwrap();
        invoker.connect(&consumer);
        rpc.connect(&consumer);
        consumer.start();

        container.insert(CacheEntry::new(key_mem.clone(), Bytes::from_static(b"v")));

        let t0 = topology(1, vec![1, 2], vec![vec![1]; 4], None);
        consumer.on_topology_update(t0, false).await.unwrap();
        let t1 = topology(2, vec![1, 2], vec![vec![1], vec![2], vec![1], vec![1]], None);
        consumer.on_topology_update(t1, false).await.unwrap();

        assert!(container.get(&key_mem).is_none());
    }

    /// A chunk for a segment the node does not own under the write
    /// assignment is dropped.
    #[tokio::test]
    async fn chunk_for_unowned_segment_is_dropped() {
        init_tracing();
        let rpc = ClusterRpc::new(NUM_SEGMENTS);
        let source = SourceNode::new();
        source.paused.store(true, Ordering::SeqCst);
        rpc.add_node(1, source);

        let node = TestNode::build(2, config(), CacheMode::NonTx, rpc);
        let t1 = topology(
            2,
            vec![1, 2],
            vec![vec![1]; 4],
            Some(vec![vec![2], vec![1], vec![1], vec![1]]),
        );
        node.consumer.on_topology_update(t1, true).await.unwrap();

        // segment 1 is not owned by node 2 under the write assignment
        let entry = seg_entry(1);
        node.consumer
            .apply_state(1, 2, vec![StateChunk::new(1, vec![entry.clone()], true)])
            .await;
        assert!(node.container.get(&entry.key).is_none());
        assert_eq!(node.consumer.stats().chunks_applied, 0);
    }

    /// Cluster listeners advertised by a peer are installed on a fresh
    /// join; failures to reach a peer are absorbed.
    #[tokio::test]
    async fn cluster_listeners_are_collected_on_join() {
        init_tracing();
        use crate::commands::ClusterListenerSpec;
        use uuid::Uuid;

        let rpc = ClusterRpc::new(NUM_SEGMENTS);
        let dead = SourceNode::new();
        dead.unreachable.store(true, Ordering::SeqCst);
        rpc.add_node(1, dead);

        let listener = ClusterListenerSpec {
            id: Uuid::new_v4(),
            filter: None,
        };
        let alive = SourceNode::new();
        alive.listeners.lock().push(listener.clone());
        rpc.add_node(2, alive);

        let node = TestNode::build(3, config(), CacheMode::NonTx, rpc);
        let t1 = topology(
            2,
            vec![1, 2, 3],
            vec![vec![1], vec![1], vec![2], vec![2]],
            Some(vec![vec![1], vec![1], vec![2], vec![3]]),
        );
        node.consumer.on_topology_update(t1, true).await.unwrap();

        assert!(
            wait_until(|| node.notifier.listeners.lock().len() == 1, WAIT).await
        );
        assert_eq!(node.notifier.listeners.lock()[0], listener);
    }

    /// Keys in transit are reported by `is_state_transfer_in_progress_for_key`
    /// only while a pending assignment exists.
    #[tokio::test]
    async fn in_progress_key_queries_follow_the_pending_assignment() {
        init_tracing();
        let rpc = ClusterRpc::new(NUM_SEGMENTS);
        rpc.add_node(1, SourceNode::new());
        let node = TestNode::build(2, config(), CacheMode::NonTx, rpc);

        let incoming = seg_key(3);
        let staying = seg_key(0);

        let t1 = topology(
            2,
            vec![1, 2],
            vec![vec![1]; 4],
            Some(vec![vec![1], vec![1], vec![1], vec![2]]),
        );
        node.consumer.on_topology_update(t1, true).await.unwrap();

        assert!(node.consumer.is_state_transfer_in_progress_for_key(&incoming));
        assert!(!node.consumer.is_state_transfer_in_progress_for_key(&staying));

        let t2 = topology(3, vec![1, 2], vec![vec![1], vec![1], vec![1], vec![2]], None);
        node.consumer.on_topology_update(t2, false).await.unwrap();
        assert!(!node.consumer.is_state_transfer_in_progress_for_key(&incoming));
    }
}
