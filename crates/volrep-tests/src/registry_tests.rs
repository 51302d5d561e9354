//! Channel registry behaviour against real sidecars
//!
//! Concurrent acquisition for one endpoint must converge on a single pooled channel,
//! distinct endpoints get distinct channels, and unhealthy or idle channels are replaced
//! or evicted.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::task::JoinSet;
    use tokio_util::sync::CancellationToken;
    use volrep_repl::{
        spawn_eviction, DesiredRole, GroupHealth, ReplicationIntent, ReplicationTarget,
        SimulatedBackend, VolumeId,
    };
    use volrep_transport::{
        ChannelRegistry, Opcode, RegistryConfig, RpcClientConfig, RpcConnector, TcpTransportConfig,
    };

    use crate::harness::{init_tracing, start_sidecar, TestBed, TestBedOptions};

    fn registry(config: RegistryConfig) -> Arc<ChannelRegistry<RpcConnector>> {
        Arc::new(ChannelRegistry::new(
            RpcConnector::new(TcpTransportConfig::default(), RpcClientConfig::default()),
            config,
        ))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_shares_one_channel() {
        init_tracing();
        let (endpoint, sidecar) = start_sidecar(Arc::new(SimulatedBackend::new())).await.unwrap();
        let registry = registry(RegistryConfig::default());

        let mut tasks = JoinSet::new();
        for _ in 0..32 {
            let registry = registry.clone();
            let endpoint = endpoint.clone();
            tasks.spawn(async move {
                let lease = registry.acquire(&endpoint).await.unwrap();
                lease.channel().call(Opcode::Ping, Vec::new()).await.unwrap();
                lease.entry() as *const _ as usize
            });
        }
        let mut entries = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            entries.push(joined.unwrap());
        }
        entries.sort_unstable();
        entries.dedup();

        assert_eq!(entries.len(), 1);
        let stats = registry.stats().await;
        assert_eq!(stats.created, 1);
        assert_eq!(stats.reused, 31);
        assert_eq!(stats.endpoints, 1);
        sidecar.abort();
    }

    #[tokio::test]
    async fn test_distinct_endpoints_get_distinct_channels() {
        let (first, a) = start_sidecar(Arc::new(SimulatedBackend::new())).await.unwrap();
        let (second, b) = start_sidecar(Arc::new(SimulatedBackend::new())).await.unwrap();
        let registry = registry(RegistryConfig::default());

        let lease_a = registry.acquire(&first).await.unwrap();
        let lease_b = registry.acquire(&second).await.unwrap();
        let lease_a2 = registry.acquire(&first).await.unwrap();

        assert!(std::ptr::eq(lease_a.entry(), lease_a2.entry()));
        assert!(!std::ptr::eq(lease_a.entry(), lease_b.entry()));
        assert_eq!(registry.entry_count().await, 2);
        assert_eq!(lease_a.entry().ref_count(), 2);
        a.abort();
        b.abort();
    }

    #[tokio::test]
    async fn test_unhealthy_channel_is_replaced_in_place() {
        let (endpoint, sidecar) = start_sidecar(Arc::new(SimulatedBackend::new())).await.unwrap();
        let registry = registry(RegistryConfig::default());

        let lease = registry.acquire(&endpoint).await.unwrap();
        registry.mark_unhealthy(lease.entry());
        drop(lease);

        let replacement = registry.acquire(&endpoint).await.unwrap();
        assert!(replacement.entry().is_healthy());
        replacement.channel().call(Opcode::Ping, Vec::new()).await.unwrap();

        let stats = registry.stats().await;
        assert_eq!(stats.created, 2);
        assert_eq!(stats.endpoints, 1);
        sidecar.abort();
    }

    #[tokio::test]
    async fn test_eviction_task_drops_idle_channels() {
        let (endpoint, sidecar) = start_sidecar(Arc::new(SimulatedBackend::new())).await.unwrap();
        let registry = registry(RegistryConfig {
            idle_timeout: Duration::from_millis(30),
            ..RegistryConfig::default()
        });
        drop(registry.acquire(&endpoint).await.unwrap());

        let cancel = CancellationToken::new();
        let task = spawn_eviction(registry.clone(), Duration::from_millis(10), cancel.clone());
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while registry.entry_count().await > 0 {
            assert!(tokio::time::Instant::now() < deadline, "idle channel never evicted");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(registry.stats().await.evicted, 1);
        sidecar.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_group_reconcile_uses_one_channel() {
        let bed = TestBed::start(TestBedOptions {
            over_tcp: true,
            ..TestBedOptions::default()
        })
        .await
        .unwrap();
        let members: Vec<VolumeId> = (0..8).map(|i| VolumeId::new(format!("g-{}", i))).collect();
        let mut intent = ReplicationIntent::for_volume("group", "unused", DesiredRole::Primary);
        intent.target = ReplicationTarget::Group {
            group_id: "g".to_string(),
            members: members.clone(),
        };
        bed.apply(intent).await.unwrap();

        bed.wait_for("group", Duration::from_secs(5), |stored| {
            stored
                .and_then(|s| s.status.as_ref())
                .is_some_and(|s| s.health == GroupHealth::Healthy && s.members.len() == 8)
        })
        .await
        .unwrap();

        let stats = bed.registry.as_ref().unwrap().stats().await;
        assert_eq!(stats.created, 1);
        assert_eq!(stats.endpoints, 1);
        for volume in &members {
            assert_eq!(bed.backend.side_effects(volume).await.promotions, 1);
        }
        bed.stop().await.unwrap();
    }
}
