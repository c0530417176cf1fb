//! End-to-end tests of the client surface: range, put, delete-range,
//! compaction, leases and watches through a controller over a local
//! command log.

mod common;

use common::{fresh_controller, put, put_with_lease, range_one};
use dingokv::config::Config;
use dingokv::controller::{
    DeleteRangeRequest, PutRequest, RangeRequest, WatchOutcome, WatchRequest,
};
use dingokv::error::KvError;
use dingokv::lease::run_lease_ticker;
use dingokv::watch::{EventType, WatchFilters};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Put / Range scenarios
// ============================================================================

#[test]
fn put_then_overwrite_reports_previous_value() {
    let controller = fresh_controller();
    let first_rev = put(&controller, b"a", b"1");

    let response = controller
        .kv_put(&PutRequest {
            key: b"a".to_vec(),
            value: b"2".to_vec(),
            need_prev: true,
            ..Default::default()
        })
        .unwrap();

    let prev = response.prev_kv.expect("previous value must be reported");
    assert_eq!(prev.key, b"a");
    assert_eq!(prev.value, b"1");
    assert_eq!(prev.version, 1);
    assert_eq!(prev.mod_revision, first_rev);

    let kv = range_one(&controller, b"a").unwrap();
    assert_eq!(kv.value, b"2");
    assert_eq!(kv.version, 2);
    assert_eq!(kv.mod_revision, response.revision);
    assert_eq!(kv.create_revision, first_rev);
}

#[test]
fn put_after_delete_starts_a_new_generation() {
    let controller = fresh_controller();
    put(&controller, b"a", b"1");
    controller
        .kv_delete_range(&DeleteRangeRequest {
            key: b"a".to_vec(),
            ..Default::default()
        })
        .unwrap();
    let third_rev = put(&controller, b"a", b"2");

    let kv = range_one(&controller, b"a").unwrap();
    assert_eq!(kv.value, b"2");
    assert_eq!(kv.version, 1);
    assert_eq!(kv.create_revision, third_rev);
    assert_eq!(kv.mod_revision, third_rev);
}

#[test]
fn range_is_half_open() {
    let controller = fresh_controller();
    for (key, value) in [(b"a", b"1"), (b"b", b"2"), (b"c", b"3"), (b"d", b"4"), (b"e", b"5")] {
        put(&controller, key, value);
    }

    let response = controller
        .kv_range(&RangeRequest {
            key: b"a".to_vec(),
            range_end: b"c".to_vec(),
            ..Default::default()
        })
        .unwrap();

    let keys: Vec<&[u8]> = response.kvs.iter().map(|kv| kv.key.as_slice()).collect();
    assert_eq!(keys, vec![b"a".as_slice(), b"b".as_slice()]);
    assert_eq!(response.total_count, 2);
}

#[test]
fn range_to_zero_byte_is_unbounded() {
    let controller = fresh_controller();
    for key in [b"a".as_slice(), b"m", b"z"] {
        put(&controller, key, b"v");
    }

    let response = controller
        .kv_range(&RangeRequest {
            key: b"b".to_vec(),
            range_end: vec![0u8],
            ..Default::default()
        })
        .unwrap();
    let keys: Vec<&[u8]> = response.kvs.iter().map(|kv| kv.key.as_slice()).collect();
    assert_eq!(keys, vec![b"m".as_slice(), b"z".as_slice()]);
}

#[test]
fn range_total_count_ignores_limit() {
    let controller = fresh_controller();
    for key in [b"a".as_slice(), b"b", b"c", b"d", b"e"] {
        put(&controller, key, b"v");
    }

    let response = controller
        .kv_range(&RangeRequest {
            key: b"a".to_vec(),
            range_end: vec![0u8],
            limit: 2,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(response.kvs.len(), 2);
    assert_eq!(response.total_count, 5);
}

#[test]
fn range_count_only_and_keys_only() {
    let controller = fresh_controller();
    put(&controller, b"a", b"long-value");
    put(&controller, b"b", b"long-value");

    let counted = controller
        .kv_range(&RangeRequest {
            key: b"a".to_vec(),
            range_end: vec![0u8],
            count_only: true,
            ..Default::default()
        })
        .unwrap();
    assert!(counted.kvs.is_empty());
    assert_eq!(counted.total_count, 2);

    let keys_only = controller
        .kv_range(&RangeRequest {
            key: b"a".to_vec(),
            range_end: vec![0u8],
            keys_only: true,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(keys_only.kvs.len(), 2);
    assert!(keys_only.kvs.iter().all(|kv| kv.value.is_empty()));
}

#[test]
fn historical_range_walks_generations() {
    let controller = fresh_controller();
    let r1 = put(&controller, b"k", b"v1");
    let r2 = put(&controller, b"k", b"v2");
    let deleted = controller
        .kv_delete_range(&DeleteRangeRequest {
            key: b"k".to_vec(),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(deleted.deleted_count, 1);

    let at = |revision| {
        controller.kv_range(&RangeRequest {
            key: b"k".to_vec(),
            revision,
            ..Default::default()
        })
    };

    assert_eq!(at(r1).unwrap().kvs[0].value, b"v1");
    assert_eq!(at(r2).unwrap().kvs[0].value, b"v2");
    // At the delete revision the key is gone.
    assert!(at(r2 + 1).unwrap().kvs.is_empty());
    // The key is live again after a fresh put.
    let r4 = put(&controller, b"k", b"v3");
    assert_eq!(at(r4).unwrap().kvs[0].value, b"v3");
}

// ============================================================================
// Validation boundaries
// ============================================================================

#[test]
fn put_key_at_size_cap_succeeds_one_over_fails() {
    let controller = fresh_controller();
    let max = controller.config().kv.max_kv_key_size;

    let at_cap = vec![b'k'; max];
    assert!(controller
        .kv_put(&PutRequest {
            key: at_cap,
            value: b"v".to_vec(),
            ..Default::default()
        })
        .is_ok());

    let over_cap = vec![b'k'; max + 1];
    let err = controller
        .kv_put(&PutRequest {
            key: over_cap,
            value: b"v".to_vec(),
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, KvError::BadArgument(_)));
}

#[test]
fn put_value_at_size_cap_succeeds_one_over_fails() {
    let controller = fresh_controller();
    let max = controller.config().kv.max_kv_value_size;

    assert!(controller
        .kv_put(&PutRequest {
            key: b"k".to_vec(),
            value: vec![b'v'; max],
            ..Default::default()
        })
        .is_ok());

    let err = controller
        .kv_put(&PutRequest {
            key: b"k2".to_vec(),
            value: vec![b'v'; max + 1],
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, KvError::BadArgument(_)));
}

#[test]
fn put_rejects_empty_key_and_empty_value() {
    let controller = fresh_controller();
    assert!(matches!(
        controller
            .kv_put(&PutRequest {
                value: b"v".to_vec(),
                ..Default::default()
            })
            .unwrap_err(),
        KvError::BadArgument(_)
    ));
    assert!(matches!(
        controller
            .kv_put(&PutRequest {
                key: b"k".to_vec(),
                ..Default::default()
            })
            .unwrap_err(),
        KvError::BadArgument(_)
    ));
}

#[test]
fn delete_of_absent_range_reports_zero() {
    let controller = fresh_controller();
    let response = controller
        .kv_delete_range(&DeleteRangeRequest {
            key: b"ghost".to_vec(),
            range_end: vec![0u8],
            ..Default::default()
        })
        .unwrap();
    assert_eq!(response.deleted_count, 0);
    assert!(response.prev_kvs.is_empty());
}

#[test]
fn delete_range_reports_previous_values() {
    let controller = fresh_controller();
    put(&controller, b"a", b"1");
    put(&controller, b"b", b"2");
    put(&controller, b"c", b"3");

    let response = controller
        .kv_delete_range(&DeleteRangeRequest {
            key: b"a".to_vec(),
            range_end: b"c".to_vec(),
            need_prev: true,
        })
        .unwrap();
    assert_eq!(response.deleted_count, 2);
    let values: Vec<&[u8]> = response
        .prev_kvs
        .iter()
        .map(|kv| kv.value.as_slice())
        .collect();
    assert_eq!(values, vec![b"1".as_slice(), b"2".as_slice()]);
    assert!(range_one(&controller, b"a").is_none());
    assert!(range_one(&controller, b"c").is_some());
}

// ============================================================================
// ignore_value / ignore_lease
// ============================================================================

#[test]
fn ignore_value_reuses_current_value() {
    let controller = fresh_controller();
    put(&controller, b"k", b"keep-me");

    controller
        .kv_put(&PutRequest {
            key: b"k".to_vec(),
            ignore_value: true,
            ..Default::default()
        })
        .unwrap();

    let kv = range_one(&controller, b"k").unwrap();
    assert_eq!(kv.value, b"keep-me");
    assert_eq!(kv.version, 2);
}

#[test]
fn ignore_value_requires_existing_value() {
    let controller = fresh_controller();
    let err = controller
        .kv_put(&PutRequest {
            key: b"absent".to_vec(),
            ignore_value: true,
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, KvError::BadArgument(_)));
}

#[test]
fn ignore_lease_keeps_current_binding() {
    let controller = fresh_controller();
    let lease = controller.lease_grant(60, 0).unwrap();
    put_with_lease(&controller, b"k", b"v1", lease.id);

    controller
        .kv_put(&PutRequest {
            key: b"k".to_vec(),
            value: b"v2".to_vec(),
            ignore_lease: true,
            ..Default::default()
        })
        .unwrap();

    let kv = range_one(&controller, b"k").unwrap();
    assert_eq!(kv.value, b"v2");
    assert_eq!(kv.lease, lease.id);
    let query = controller.lease_query(lease.id, true).unwrap();
    assert_eq!(query.keys.unwrap(), vec![b"k".to_vec()]);
}

#[test]
fn ignore_lease_requires_existing_key() {
    let controller = fresh_controller();
    let err = controller
        .kv_put(&PutRequest {
            key: b"absent".to_vec(),
            value: b"v".to_vec(),
            ignore_lease: true,
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, KvError::BadArgument(_)));
}

#[test]
fn put_rejects_mismatched_lease() {
    let controller = fresh_controller();
    let lease = controller.lease_grant(60, 0).unwrap();
    put_with_lease(&controller, b"k", b"v", lease.id);

    let err = controller
        .kv_put(&PutRequest {
            key: b"k".to_vec(),
            value: b"v2".to_vec(),
            lease_id: 0,
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, KvError::BadArgument(_)));
}

// ============================================================================
// Compaction
// ============================================================================

#[test]
fn compaction_prunes_history_but_keeps_latest() {
    let controller = fresh_controller();
    let mut last_value = Vec::new();
    for n in 0..1000u32 {
        last_value = format!("value-{n}").into_bytes();
        put(&controller, b"k", &last_value);
    }

    let compact_rev = controller.current_revision();
    let compacted = controller.kv_compact(compact_rev).unwrap();
    assert_eq!(compacted, compact_rev);

    assert_eq!(controller.store().rev_count(), 1);
    let kv = range_one(&controller, b"k").unwrap();
    assert_eq!(kv.value, last_value);
    assert_eq!(kv.version, 1000);
}

#[test]
fn compaction_is_idempotent_at_the_same_revision() {
    let controller = fresh_controller();
    for _ in 0..10 {
        put(&controller, b"k", b"v");
    }
    let revision = controller.current_revision();

    controller.kv_compact(revision).unwrap();
    let revs_after_first = controller.store().rev_count();
    controller.kv_compact(revision).unwrap();
    assert_eq!(controller.store().rev_count(), revs_after_first);
}

#[test]
fn reads_below_the_floor_fail_compacted() {
    let controller = fresh_controller();
    let r1 = put(&controller, b"k", b"v1");
    for _ in 0..5 {
        put(&controller, b"k", b"v");
    }
    controller.kv_compact(controller.current_revision()).unwrap();

    let err = controller
        .kv_range(&RangeRequest {
            key: b"k".to_vec(),
            revision: r1,
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, KvError::Compacted { .. }));
}

#[test]
fn compaction_rejects_future_revisions() {
    let controller = fresh_controller();
    put(&controller, b"k", b"v");
    let err = controller.kv_compact(100).unwrap_err();
    assert!(matches!(err, KvError::BadArgument(_)));
}

// ============================================================================
// Leases
// ============================================================================

#[test]
fn lease_grant_auto_assigns_ids() {
    let controller = fresh_controller();
    let first = controller.lease_grant(10, 0).unwrap();
    let second = controller.lease_grant(10, 0).unwrap();
    assert!(second.id > first.id);
    assert_eq!(first.ttl_secs, 10);
}

#[test]
fn lease_grant_rejects_bad_requests() {
    let controller = fresh_controller();
    assert!(matches!(
        controller.lease_grant(0, 0).unwrap_err(),
        KvError::BadArgument(_)
    ));

    controller.lease_grant(10, 77).unwrap();
    assert!(matches!(
        controller.lease_grant(10, 77).unwrap_err(),
        KvError::BadArgument(_)
    ));
}

#[test]
fn lease_revoke_deletes_bound_keys() {
    let controller = fresh_controller();
    let lease = controller.lease_grant(60, 0).unwrap();
    put_with_lease(&controller, b"a", b"1", lease.id);
    put_with_lease(&controller, b"b", b"2", lease.id);

    controller.lease_revoke(lease.id).unwrap();

    assert!(range_one(&controller, b"a").is_none());
    assert!(range_one(&controller, b"b").is_none());
    assert!(matches!(
        controller.lease_query(lease.id, false).unwrap_err(),
        KvError::LeaseNotFound { .. }
    ));
}

#[test]
fn lease_renew_restores_full_ttl() {
    let controller = fresh_controller();
    let lease = controller.lease_grant(30, 0).unwrap();
    let remaining = controller.lease_renew(lease.id).unwrap();
    assert_eq!(remaining, 30);

    assert!(matches!(
        controller.lease_renew(12345).unwrap_err(),
        KvError::LeaseNotFound { .. }
    ));
}

#[test]
fn put_with_unknown_lease_fails() {
    let controller = fresh_controller();
    let err = controller
        .kv_put(&PutRequest {
            key: b"k".to_vec(),
            value: b"v".to_vec(),
            lease_id: 404,
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, KvError::LeaseNotFound { lease_id: 404 }));
}

// ============================================================================
// Watches
// ============================================================================

#[tokio::test]
async fn one_shot_watch_fires_once_then_deregisters() {
    let controller = Arc::new(fresh_controller());

    let watcher = Arc::clone(&controller);
    let parked = tokio::spawn(async move {
        watcher
            .watch(&WatchRequest {
                key: b"x".to_vec(),
                timeout: Some(Duration::from_secs(5)),
                ..Default::default()
            })
            .await
    });

    // Wait for the subscription to land before mutating.
    while controller.watches().subscription_count() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    put(&controller, b"x", b"v");
    let outcome = parked.await.unwrap().unwrap();
    let WatchOutcome::Event(event) = outcome else {
        panic!("watch must fire, not time out");
    };
    assert_eq!(event.event_type, EventType::Put);
    assert_eq!(event.kv.key, b"x");
    assert_eq!(event.kv.value, b"v");
    assert!(event.prev_kv.is_none());

    // The subscription was consumed: a second put fires nothing.
    assert_eq!(controller.watches().subscription_count(), 0);
    put(&controller, b"x", b"v2");
}

#[tokio::test]
async fn watch_delivers_prev_kv_on_request() {
    let controller = Arc::new(fresh_controller());
    put(&controller, b"x", b"old");

    let watcher = Arc::clone(&controller);
    let parked = tokio::spawn(async move {
        watcher
            .watch(&WatchRequest {
                key: b"x".to_vec(),
                need_prev: true,
                timeout: Some(Duration::from_secs(5)),
                ..Default::default()
            })
            .await
    });
    while controller.watches().subscription_count() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    put(&controller, b"x", b"new");
    let WatchOutcome::Event(event) = parked.await.unwrap().unwrap() else {
        panic!("watch must fire");
    };
    let prev = event.prev_kv.expect("prev_kv requested");
    assert_eq!(prev.value, b"old");
    assert_eq!(event.kv.value, b"new");
}

#[tokio::test]
async fn watch_times_out_and_cleans_up() {
    let controller = Arc::new(fresh_controller());
    let outcome = controller
        .watch(&WatchRequest {
            key: b"quiet".to_vec(),
            timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(outcome, WatchOutcome::TimedOut);
    assert_eq!(controller.watches().subscription_count(), 0);
}

#[tokio::test]
async fn watch_filter_suppresses_put_events() {
    let controller = Arc::new(fresh_controller());

    let watcher = Arc::clone(&controller);
    let parked = tokio::spawn(async move {
        watcher
            .watch(&WatchRequest {
                key: b"x".to_vec(),
                filters: WatchFilters::NO_PUT,
                timeout: Some(Duration::from_secs(5)),
                ..Default::default()
            })
            .await
    });
    while controller.watches().subscription_count() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    put(&controller, b"x", b"v");
    // The put was filtered; the subscription stays armed until the delete.
    assert_eq!(controller.watches().subscription_count(), 1);
    controller
        .kv_delete_range(&DeleteRangeRequest {
            key: b"x".to_vec(),
            ..Default::default()
        })
        .unwrap();

    let WatchOutcome::Event(event) = parked.await.unwrap().unwrap() else {
        panic!("watch must fire on delete");
    };
    assert_eq!(event.event_type, EventType::Delete);
}

#[test]
fn watch_at_future_revision_does_not_fire_on_compaction() {
    let controller = fresh_controller();
    for _ in 0..10 {
        put(&controller, b"k", b"v");
    }

    let (_, mut rx) = controller.watches().subscribe(
        b"k".to_vec(),
        Vec::new(),
        controller.current_revision() + 100,
        WatchFilters::empty(),
        false,
    );

    controller.kv_compact(controller.current_revision()).unwrap();
    assert!(rx.try_recv().is_err());
    assert_eq!(controller.watches().subscription_count(), 1);
}

// ============================================================================
// Lease expiry end to end
// ============================================================================

#[tokio::test]
async fn expired_lease_deletes_keys_and_fires_delete_watch() {
    let config = Config::from_toml_str("[lease]\ntick_interval_ms = 50\n").unwrap();
    let controller = Arc::new(common::controller_with_config(config));

    let lease = controller.lease_grant(1, 0).unwrap();
    let put_rev = put_with_lease(&controller, b"k", b"v", lease.id);

    let watcher = Arc::clone(&controller);
    let parked = tokio::spawn(async move {
        watcher
            .watch(&WatchRequest {
                key: b"k".to_vec(),
                start_revision: put_rev,
                timeout: Some(Duration::from_secs(10)),
                ..Default::default()
            })
            .await
    });
    while controller.watches().subscription_count() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let ticker = tokio::spawn(run_lease_ticker(Arc::clone(&controller), shutdown_rx));

    let WatchOutcome::Event(event) = parked.await.unwrap().unwrap() else {
        panic!("expiry must fire the delete watch");
    };
    assert_eq!(event.event_type, EventType::Delete);
    assert!(event.kv.mod_revision > put_rev);

    assert!(range_one(&controller, b"k").is_none());

    // The revoke removes the lease in the same apply step as the deletes;
    // give the proposing ticker a moment to finish its step.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        match controller.lease_query(lease.id, false) {
            Err(KvError::LeaseNotFound { .. }) => break,
            _ if tokio::time::Instant::now() >= deadline => {
                panic!("lease must be revoked after expiry")
            }
            _ => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = ticker.await;
}
