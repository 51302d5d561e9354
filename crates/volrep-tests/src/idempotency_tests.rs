//! Idempotency and safety of individual operations
//!
//! Repeated Enable and Promote calls must not produce duplicate backend transitions, and
//! role changes against an unsafe peer must refuse unless forced. Exercised over the TCP
//! sidecar protocol so classification of remote replies is covered end to end.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use proptest::prelude::*;
    use volrep_repl::{
        dispatch, ErrorKind, OperationAdapter, OperationKind, OperationRequest, OperationResult,
        ReplicationRole, SimulatedBackend, StaticDriverResolver, VolumeId,
    };
    use volrep_transport::EndpointId;

    use crate::harness::{init_tracing, remote_adapter, start_sidecar};

    const DEADLINE: Duration = Duration::from_secs(2);

    fn request(kind: OperationKind, volume: &VolumeId) -> OperationRequest {
        let mut request = OperationRequest::new(kind, volume.clone());
        if kind == OperationKind::Enable {
            request
                .params
                .insert("mirroringMode".to_string(), "snapshot".to_string());
        }
        request
    }

    fn expect_success(result: OperationResult) -> volrep_repl::OperationReply {
        match result {
            OperationResult::Success(reply) => reply,
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_enable_twice_has_one_side_effect() {
        init_tracing();
        let backend = Arc::new(SimulatedBackend::new());
        let (endpoint, sidecar) = start_sidecar(backend.clone()).await.unwrap();
        let (adapter, _registry) = remote_adapter(DEADLINE);
        let volume = VolumeId::new("v1");

        let first = expect_success(adapter.execute(&endpoint, &request(OperationKind::Enable, &volume)).await);
        let second = expect_success(adapter.execute(&endpoint, &request(OperationKind::Enable, &volume)).await);

        assert!(!first.no_op);
        assert!(second.no_op);
        assert_eq!(backend.side_effects(&volume).await.enables, 1);
        assert_eq!(backend.info(&volume).await.role, ReplicationRole::Secondary);
        sidecar.abort();
    }

    #[tokio::test]
    async fn test_retried_token_is_replayed_not_reapplied() {
        let backend = Arc::new(SimulatedBackend::new());
        let (endpoint, sidecar) = start_sidecar(backend.clone()).await.unwrap();
        let (adapter, _registry) = remote_adapter(DEADLINE);
        let volume = VolumeId::new("v1");

        let enable = request(OperationKind::Enable, &volume);
        expect_success(adapter.execute(&endpoint, &enable).await);
        let promote = request(OperationKind::Promote, &volume);
        let first = expect_success(adapter.execute(&endpoint, &promote).await);

        // Demote out of band, then retry the promote with its original token.
        expect_success(adapter.execute(&endpoint, &request(OperationKind::Demote, &volume)).await);
        let replayed = expect_success(adapter.execute(&endpoint, &promote).await);

        assert_eq!(first, replayed);
        let effects = backend.side_effects(&volume).await;
        assert_eq!(effects.promotions, 1);
        assert_eq!(effects.demotions, 1);
        assert_eq!(backend.info(&volume).await.role, ReplicationRole::Secondary);
        sidecar.abort();
    }

    #[tokio::test]
    async fn test_promote_on_primary_is_no_op() {
        let backend = Arc::new(SimulatedBackend::new());
        let (endpoint, sidecar) = start_sidecar(backend.clone()).await.unwrap();
        let (adapter, _registry) = remote_adapter(DEADLINE);
        let volume = VolumeId::new("v1");

        expect_success(adapter.execute(&endpoint, &request(OperationKind::Enable, &volume)).await);
        let first = expect_success(adapter.execute(&endpoint, &request(OperationKind::Promote, &volume)).await);
        let again = expect_success(adapter.execute(&endpoint, &request(OperationKind::Promote, &volume)).await);

        assert!(!first.no_op);
        assert!(again.no_op);
        assert_eq!(backend.side_effects(&volume).await.promotions, 1);
        assert_eq!(backend.info(&volume).await.role, ReplicationRole::Primary);
        sidecar.abort();
    }

    #[tokio::test]
    async fn test_demote_unreachable_peer_requires_force() {
        let backend = Arc::new(SimulatedBackend::new());
        let (endpoint, sidecar) = start_sidecar(backend.clone()).await.unwrap();
        let (adapter, _registry) = remote_adapter(DEADLINE);
        let volume = VolumeId::new("v1");

        expect_success(adapter.execute(&endpoint, &request(OperationKind::Enable, &volume)).await);
        expect_success(adapter.execute(&endpoint, &request(OperationKind::Promote, &volume)).await);
        backend.set_peer_reachable(&volume, false).await;

        match adapter.execute(&endpoint, &request(OperationKind::Demote, &volume)).await {
            OperationResult::TerminalFailure(reason) => {
                assert_eq!(reason.kind, ErrorKind::UnsafeOperation)
            }
            other => panic!("expected unsafe operation, got {:?}", other),
        }
        assert_eq!(backend.info(&volume).await.role, ReplicationRole::Primary);

        let mut forced = request(OperationKind::Demote, &volume);
        forced.force = true;
        let reply = expect_success(adapter.execute(&endpoint, &forced).await);
        assert!(reply.forced);
        assert_eq!(backend.info(&volume).await.role, ReplicationRole::Secondary);
        assert_eq!(backend.side_effects(&volume).await.demotions, 1);
        sidecar.abort();
    }

    #[tokio::test]
    async fn test_force_rejected_for_enable_before_dispatch() {
        let backend = Arc::new(SimulatedBackend::new());
        let (endpoint, sidecar) = start_sidecar(backend.clone()).await.unwrap();
        let (adapter, registry) = remote_adapter(DEADLINE);

        let mut enable = request(OperationKind::Enable, &VolumeId::new("v1"));
        enable.force = true;
        match adapter.execute(&endpoint, &enable).await {
            OperationResult::TerminalFailure(reason) => assert_eq!(reason.kind, ErrorKind::Validation),
            other => panic!("expected validation failure, got {:?}", other),
        }
        assert_eq!(backend.call_count().await, 0);
        assert_eq!(registry.stats().await.created, 0);
        sidecar.abort();
    }

    fn local_adapter(backend: Arc<SimulatedBackend>) -> (OperationAdapter, EndpointId) {
        let endpoint = EndpointId::new("local");
        let resolver = StaticDriverResolver::new();
        resolver.register(endpoint.clone(), backend);
        (OperationAdapter::new(Arc::new(resolver), DEADLINE), endpoint)
    }

    fn op_strategy() -> impl Strategy<Value = OperationKind> {
        prop_oneof![
            Just(OperationKind::Enable),
            Just(OperationKind::Disable),
            Just(OperationKind::Promote),
            Just(OperationKind::Demote),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_repeating_an_operation_never_adds_side_effects(
            history in proptest::collection::vec(op_strategy(), 0..8),
            last in op_strategy(),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let backend = Arc::new(SimulatedBackend::new());
                let (adapter, endpoint) = local_adapter(backend.clone());
                let volume = VolumeId::new("v-prop");

                for kind in history {
                    let _ = adapter.execute(&endpoint, &request(kind, &volume)).await;
                }
                let first = adapter.execute(&endpoint, &request(last, &volume)).await;
                let before = backend.side_effects(&volume).await;
                let second = adapter.execute(&endpoint, &request(last, &volume)).await;
                let after = backend.side_effects(&volume).await;

                prop_assert_eq!(before, after);
                if first.is_success() {
                    match second {
                        OperationResult::Success(reply) => prop_assert!(reply.no_op),
                        other => prop_assert!(false, "repeat of a successful {:?} failed: {:?}", last, other),
                    }
                }
                Ok(())
            })?;
        }

        #[test]
        fn prop_replayed_token_matches_first_reply(kind in op_strategy()) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let backend = Arc::new(SimulatedBackend::new());
                let volume = VolumeId::new("v-token");
                let enable = request(OperationKind::Enable, &volume);
                dispatch(backend.as_ref(), &enable).await.unwrap();

                let req = request(kind, &volume);
                let first = dispatch(backend.as_ref(), &req).await;
                let effects = backend.side_effects(&volume).await;
                let second = dispatch(backend.as_ref(), &req).await;

                prop_assert_eq!(effects, backend.side_effects(&volume).await);
                if let (Ok(a), Ok(b)) = (&first, &second) {
                    prop_assert_eq!(a, b);
                }
                Ok(())
            })?;
        }
    }
}
