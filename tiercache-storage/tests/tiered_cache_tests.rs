//! Integration tests for the tiered cache manager over fault-injecting tiers.

use std::sync::Arc;
use std::time::Duration;

use tiercache_storage::{
    BackendKind, CacheError, CacheSettings, ClientBinding, KeyScope, ManagerConfig, ManagerState,
    TierLevel, TieredCacheManager,
};
use tiercache_test_utils::assertions::{
    assert_all_tiers_failed, assert_config_error, assert_lifecycle, assert_partial,
    assert_unknown_cache,
};
use tiercache_test_utils::fixtures::{
    manual_clock, minutes, ready_two_tier, sessions_definition, two_tier, two_tier_with,
    users_definition,
};
use tiercache_test_utils::{
    init_test_tracing, Fault, LifecycleError, Op, RecordingClient,
};

// ============================================================================
// READ PATH
// ============================================================================

#[tokio::test]
async fn test_users_example_repopulates_l1_from_l2() {
    init_test_tracing();
    let setup = ready_two_tier(vec![users_definition()]);
    let value = br#"{"id":42}"#.to_vec();

    setup
        .manager
        .put("users", "42", value.clone(), None)
        .await
        .unwrap();
    assert_eq!(
        setup.manager.get("users", "42", None).await.unwrap(),
        Some(value.clone())
    );

    // Simulated L1 eviction, well before expire.
    setup.l1.store().clear();
    setup.clock.advance(minutes(2));

    assert_eq!(
        setup.manager.get("users", "42", None).await.unwrap(),
        Some(value.clone())
    );
    assert_eq!(setup.l1.store().ttl_of("users:42"), Some(minutes(3)));

    let stats = setup.manager.cache_stats("users").unwrap();
    assert_eq!(stats.promotions, 1);
    assert_eq!(stats.tier(TierLevel::L2).unwrap().hits, 1);
}

#[tokio::test]
async fn test_entries_expire_after_expire_interval() {
    let setup = ready_two_tier(vec![users_definition()]);
    setup
        .manager
        .put("users", "42", b"alice".to_vec(), None)
        .await
        .unwrap();

    setup.clock.advance(minutes(6));
    assert_eq!(setup.manager.get("users", "42", None).await.unwrap(), None);
}

#[tokio::test]
async fn test_unknown_cache_never_returns_a_value() {
    let setup = ready_two_tier(vec![users_definition()]);
    setup
        .manager
        .put("users", "42", b"alice".to_vec(), None)
        .await
        .unwrap();

    assert_unknown_cache(&setup.manager.get("nonexistent", "42", None).await, "nonexistent");
    assert_eq!(setup.l1.get_calls(), 0);
    assert_eq!(setup.l2.get_calls(), 0);
}

#[tokio::test]
async fn test_l1_timeout_degrades_to_l2() {
    let setup = ready_two_tier(vec![users_definition()]);
    setup
        .manager
        .put("users", "42", b"alice".to_vec(), None)
        .await
        .unwrap();
    setup.l1.fail_gets(Fault::Timeout);

    assert_eq!(
        setup.manager.get("users", "42", None).await.unwrap(),
        Some(b"alice".to_vec())
    );
    assert_eq!(setup.manager.cache_stats("users").unwrap().fallthroughs, 1);
}

#[tokio::test]
async fn test_promotion_failure_does_not_fail_read() {
    let setup = ready_two_tier(vec![users_definition()]);
    setup
        .manager
        .put("users", "42", b"alice".to_vec(), None)
        .await
        .unwrap();
    setup.l1.store().clear();
    setup.l1.fail_puts(Fault::Unavailable);

    assert_eq!(
        setup.manager.get("users", "42", None).await.unwrap(),
        Some(b"alice".to_vec())
    );
    assert_eq!(setup.manager.cache_stats("users").unwrap().promotions, 0);
}

// ============================================================================
// WRITE PATH
// ============================================================================

#[tokio::test]
async fn test_l2_unavailable_write_is_partial_and_readable() {
    let setup = ready_two_tier(vec![users_definition()]);
    setup.l2.fail_all(Fault::Unavailable);

    let outcome = setup
        .manager
        .put("users", "42", b"alice".to_vec(), None)
        .await
        .unwrap();
    assert_partial(&outcome, &[TierLevel::L2]);

    assert_eq!(
        setup.manager.get("users", "42", None).await.unwrap(),
        Some(b"alice".to_vec())
    );
}

#[tokio::test]
async fn test_write_rejected_by_every_tier_fails() {
    let setup = ready_two_tier(vec![users_definition()]);
    setup.l1.fail_puts(Fault::Unavailable);
    setup.l2.fail_puts(Fault::Timeout);

    let result = setup.manager.put("users", "42", b"alice".to_vec(), None).await;
    assert_all_tiers_failed(&result, "users");
    assert!(result.unwrap_err().is_transient());
}

#[tokio::test]
async fn test_evict_is_idempotent_and_partial_aware() {
    let setup = ready_two_tier(vec![users_definition()]);
    setup
        .manager
        .put("users", "42", b"alice".to_vec(), None)
        .await
        .unwrap();

    assert!(setup.manager.evict("users", "42", None).await.unwrap().is_complete());
    assert!(setup.manager.evict("users", "42", None).await.unwrap().is_complete());

    setup.l2.fail_deletes(Fault::Unavailable);
    let outcome = setup.manager.evict("users", "42", None).await.unwrap();
    assert_partial(&outcome, &[TierLevel::L2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_puts_leave_one_of_the_values() {
    let setup = ready_two_tier(vec![users_definition()]);
    let manager = Arc::new(setup.manager);

    let writers: Vec<_> = (0..16u8)
        .map(|i| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .put("users", "42", vec![i; 64], None)
                    .await
                    .unwrap();
            })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap();
    }

    let value = manager.get("users", "42", None).await.unwrap().unwrap();
    assert_eq!(value.len(), 64);
    assert!(value.iter().all(|b| *b == value[0]), "no torn write");
    assert!(value[0] < 16);
}

#[tokio::test]
async fn test_single_tier_cache_writes_only_l1() {
    let setup = ready_two_tier(vec![sessions_definition()]);
    let outcome = setup
        .manager
        .put("sessions", "s1", b"token".to_vec(), None)
        .await
        .unwrap();
    assert_eq!(outcome.tiers.len(), 1);
    assert_eq!(setup.l2.put_calls(), 0);
}

// ============================================================================
// KEYS
// ============================================================================

#[tokio::test]
async fn test_physical_keys_and_ttls_per_tier() {
    let (_clock, shared) = manual_clock();
    let local = Arc::new(RecordingClient::new(Arc::clone(&shared)));
    let remote = Arc::new(RecordingClient::new(Arc::clone(&shared)));

    let manager = TieredCacheManager::new(
        ManagerConfig::default()
            .with_environment("live")
            .with_clock(shared),
    )
    .unwrap();
    manager
        .register_client(
            ClientBinding::new(BackendKind::local(), local.clone())
                .with_scope(KeyScope::tenant_only()),
        )
        .unwrap();
    manager
        .register_client(ClientBinding::new(BackendKind::remote(), remote.clone()))
        .unwrap();
    manager.register_definition(users_definition()).unwrap();
    manager.initialize().unwrap();

    manager
        .put("users", "a:b", b"v".to_vec(), Some("acme"))
        .await
        .unwrap();

    assert_eq!(local.put_keys(), vec!["acme@users:a%3Ab".to_string()]);
    assert_eq!(remote.put_keys(), vec!["live#acme@users:a%3Ab".to_string()]);
    assert_eq!(remote.last_ttl("live#acme@users:a%3Ab"), Some(minutes(5)));

    manager.evict("users", "a:b", Some("acme")).await.unwrap();
    assert!(remote
        .calls()
        .iter()
        .any(|c| c.op == Op::Delete && c.key == "live#acme@users:a%3Ab"));
}

#[tokio::test]
async fn test_load_test_traffic_keys_are_prefixed() {
    let (_clock, shared) = manual_clock();
    let local = Arc::new(RecordingClient::new(Arc::clone(&shared)));
    let remote = Arc::new(RecordingClient::new(Arc::clone(&shared)));

    let manager = TieredCacheManager::new(
        ManagerConfig::default()
            .with_environment("live")
            .with_test_traffic(true)
            .with_clock(shared),
    )
    .unwrap();
    manager
        .register_client(
            ClientBinding::new(BackendKind::local(), local.clone())
                .with_scope(KeyScope::tenant_only().without_test_prefix()),
        )
        .unwrap();
    manager
        .register_client(ClientBinding::new(BackendKind::remote(), remote.clone()))
        .unwrap();
    manager.register_definition(users_definition()).unwrap();
    manager.initialize().unwrap();

    manager
        .put("users", "42", b"v".to_vec(), Some("acme"))
        .await
        .unwrap();

    assert_eq!(local.put_keys(), vec!["acme@users:42".to_string()]);
    assert_eq!(remote.put_keys(), vec!["__test_live#acme@users:42".to_string()]);
    assert_eq!(
        manager.get("users", "42", Some("acme")).await.unwrap(),
        Some(b"v".to_vec())
    );
}

// ============================================================================
// RELOAD
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_reload_task_keeps_hot_entries_alive() {
    let setup = ready_two_tier(vec![users_definition()]);
    setup
        .manager
        .put("users", "42", b"alice".to_vec(), None)
        .await
        .unwrap();
    setup
        .manager
        .put("users", "cold", b"bob".to_vec(), None)
        .await
        .unwrap();

    // Past reload, before expire: this read marks the key hot.
    setup.clock.advance(Duration::from_secs(200));
    setup.manager.get("users", "42", None).await.unwrap();

    // Let the reload task tick once.
    tokio::time::sleep(minutes(3) + Duration::from_secs(1)).await;

    // Past the original expiry.
    setup.clock.advance(Duration::from_secs(200));
    assert_eq!(
        setup.manager.get("users", "42", None).await.unwrap(),
        Some(b"alice".to_vec())
    );
    assert_eq!(setup.manager.get("users", "cold", None).await.unwrap(), None);

    let stats = setup.manager.cache_stats("users").unwrap();
    assert_eq!(stats.renewals, 1);
    setup.manager.close().await;
}

#[tokio::test]
async fn test_renewal_failure_keeps_schedule() {
    let setup = ready_two_tier(vec![users_definition()]);
    setup
        .manager
        .put("users", "42", b"alice".to_vec(), None)
        .await
        .unwrap();
    setup.clock.advance(Duration::from_secs(200));
    setup.manager.get("users", "42", None).await.unwrap();

    setup.l2.fail_gets(Fault::Unavailable);
    let report = setup.manager.renew_now("users").await.unwrap();
    assert_eq!(report.failed, 1);

    setup.l2.heal();
    setup.manager.get("users", "42", None).await.unwrap();
    let report = setup.manager.renew_now("users").await.unwrap();
    assert_eq!(report.renewed, 1);
    assert_eq!(setup.manager.cache_stats("users").unwrap().renewal_failures, 1);
}

#[tokio::test]
async fn test_renew_now_without_reload_is_empty() {
    let setup = ready_two_tier(vec![sessions_definition()]);
    let report = setup.manager.renew_now("sessions").await.unwrap();
    assert_eq!(report.total(), 0);
}

// ============================================================================
// LIFECYCLE
// ============================================================================

#[tokio::test]
async fn test_runtime_calls_before_initialize_fail() {
    let setup = two_tier(vec![users_definition()]);
    assert_eq!(setup.manager.state(), ManagerState::Building);
    assert_lifecycle(
        &setup.manager.get("users", "42", None).await,
        LifecycleError::NotReady,
    );
    assert_lifecycle(
        &setup.manager.put("users", "42", vec![], None).await,
        LifecycleError::NotReady,
    );
}

#[tokio::test]
async fn test_late_registration_fails() {
    let setup = ready_two_tier(vec![users_definition()]);
    assert_lifecycle(
        &setup.manager.register_definition(sessions_definition()),
        LifecycleError::AlreadyInitialized,
    );
    assert_lifecycle(&setup.manager.initialize(), LifecycleError::AlreadyInitialized);
}

#[tokio::test]
async fn test_close_stops_everything() {
    let setup = two_tier_with(
        ManagerConfig::default().with_stats_log_interval(Duration::from_secs(1)),
        vec![users_definition()],
    );
    setup.manager.initialize().unwrap();
    setup.manager.close().await;
    setup.manager.close().await;

    assert_eq!(setup.manager.state(), ManagerState::Closed);
    assert_lifecycle(
        &setup.manager.get("users", "42", None).await,
        LifecycleError::Closed,
    );
    assert_lifecycle(&setup.manager.initialize(), LifecycleError::Closed);
}

#[tokio::test]
async fn test_definition_referencing_unknown_client_fails() {
    let setup = two_tier(vec![]);
    let definition = tiercache_storage::CacheDefinition::builder(
        "orders",
        minutes(5),
        BackendKind::new("redis"),
    )
    .build()
    .unwrap();
    assert_config_error(&setup.manager.register_definition(definition));
}

// ============================================================================
// CONFIGURATION
// ============================================================================

const SETTINGS: &str = r#"
environment = "staging"

[[caches]]
name = "users"
version = "v2"
expire = "5m"
reload = "3m"
level1 = "local"
level2 = "remote"

[[caches]]
name = "sessions"
expire = "1m"
level1 = "local"
"#;

#[tokio::test]
async fn test_from_config_builds_ready_manager() {
    let settings = CacheSettings::from_toml_str(SETTINGS).unwrap();
    let (_clock, shared) = manual_clock();
    let local = Arc::new(RecordingClient::new(Arc::clone(&shared)));
    let remote = Arc::new(RecordingClient::new(Arc::clone(&shared)));

    let manager = TieredCacheManager::from_config(
        &settings,
        vec![
            ClientBinding::new(BackendKind::local(), local.clone()),
            ClientBinding::new(BackendKind::remote(), remote.clone()),
        ],
        shared,
    )
    .unwrap();

    assert_eq!(manager.state(), ManagerState::Ready);
    assert_eq!(manager.environment(), Some("staging"));
    assert_eq!(manager.cache_names(), vec!["sessions", "users"]);
    assert_eq!(
        manager.definition("users").unwrap().reload(),
        Some(minutes(3))
    );

    manager.put("users", "42", b"v".to_vec(), None).await.unwrap();
    assert_eq!(remote.put_keys(), vec!["staging#users/v2:42".to_string()]);
}

#[tokio::test]
async fn test_from_config_missing_binding_fails() {
    let settings = CacheSettings::from_toml_str(SETTINGS).unwrap();
    let (_clock, shared) = manual_clock();
    let local = Arc::new(RecordingClient::new(Arc::clone(&shared)));

    let result = TieredCacheManager::from_config(
        &settings,
        vec![ClientBinding::new(BackendKind::local(), local)],
        shared,
    );
    assert!(matches!(result, Err(CacheError::Config(_))));
}
