//! Storage layer tests for keyclaim.

use super::db::{DatabaseError, KeyDatabase};
use super::models::{KeyState, LicenseUser};
use super::queries_keys::{ClaimResult, NewKey, ReservationResult};

const NOW: i64 = 1_750_000_000;
const LEASE: i64 = 5;

async fn test_db() -> KeyDatabase {
    KeyDatabase::open_in_memory().await.unwrap()
}

async fn seed(db: &KeyDatabase, serial: &str, duration: Option<&str>) {
    db.insert_key(
        &NewKey {
            serial,
            order_id: "bloxproducts-1234",
            key_duration: duration,
        },
        NOW - 100,
    )
    .await
    .unwrap();
}

fn token_of(result: &ReservationResult) -> i64 {
    match result {
        ReservationResult::Reserved(r) => r.fencing_token,
        other => panic!("expected reservation, got {other:?}"),
    }
}

// === Key pool ===

#[tokio::test]
async fn insert_and_get_key() {
    let db = test_db().await;
    seed(&db, "ABCDEFGHIJ", None).await;

    let key = db.get_key("ABCDEFGHIJ").await.unwrap().unwrap();
    assert_eq!(key.order_id, "bloxproducts-1234");
    assert!(key.is_lifetime());
    assert_eq!(key.state_at(NOW), KeyState::Free);

    assert!(db.get_key("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn insert_rejects_bad_duration() {
    let db = test_db().await;
    for duration in [
        "forever and ever",
        "9223372036854775807 seconds",
        "9999999999999999:00",
    ] {
        let err = db
            .insert_key(
                &NewKey {
                    serial: "BAD",
                    order_id: "x",
                    key_duration: Some(duration),
                },
                NOW,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Invalid(_)), "{duration}: {err}");
    }
    assert!(db.get_key("BAD").await.unwrap().is_none());
}

#[tokio::test]
async fn duplicate_serial_is_rejected() {
    let db = test_db().await;
    seed(&db, "DUP", None).await;
    let err = db
        .insert_key(
            &NewKey {
                serial: "DUP",
                order_id: "y",
                key_duration: None,
            },
            NOW,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DatabaseError::Query(_)));
}

// === Reservation ===

#[tokio::test]
async fn reserve_free_key_returns_fencing_token() {
    let db = test_db().await;
    seed(&db, "K1", Some("30 days")).await;

    let result = db.try_reserve("K1", "U1", NOW, LEASE).await.unwrap();
    assert_eq!(token_of(&result), NOW + LEASE);

    let key = db.get_key("K1").await.unwrap().unwrap();
    assert_eq!(
        key.state_at(NOW),
        KeyState::Reserved {
            by: "U1".into(),
            until: NOW + LEASE
        }
    );
}

#[tokio::test]
async fn lease_holds_through_its_last_second() {
    let db = test_db().await;
    seed(&db, "K1", None).await;
    db.try_reserve("K1", "U1", NOW, LEASE).await.unwrap();

    let edge = NOW + LEASE;
    let key = db.get_key("K1").await.unwrap().unwrap();
    assert!(matches!(key.state_at(edge), KeyState::Reserved { .. }));
    assert_eq!(db.key_stats(edge).await.unwrap().reserved, 1);
    assert!(matches!(
        db.try_reserve("K1", "U2", edge, LEASE).await.unwrap(),
        ReservationResult::ReservedByOther { .. }
    ));

    let after = edge + 1;
    assert_eq!(key.state_at(after), KeyState::Free);
    assert_eq!(db.key_stats(after).await.unwrap().reserved, 0);
    assert!(matches!(
        db.try_reserve("K1", "U2", after, LEASE).await.unwrap(),
        ReservationResult::Reserved(_)
    ));
}

#[tokio::test]
async fn reserve_unknown_serial_is_not_found() {
    let db = test_db().await;
    let result = db.try_reserve("nope", "U1", NOW, LEASE).await.unwrap();
    assert_eq!(result, ReservationResult::NotFound);
}

#[tokio::test]
async fn live_lease_blocks_other_identity() {
    let db = test_db().await;
    seed(&db, "K1", None).await;

    db.try_reserve("K1", "U1", NOW, LEASE).await.unwrap();
    let result = db.try_reserve("K1", "U2", NOW + 1, LEASE).await.unwrap();
    assert_eq!(
        result,
        ReservationResult::ReservedByOther {
            reserved_until: NOW + LEASE
        }
    );
}

#[tokio::test]
async fn live_lease_reports_still_being_claimed_to_holder() {
    let db = test_db().await;
    seed(&db, "K1", None).await;

    db.try_reserve("K1", "U1", NOW, LEASE).await.unwrap();
    let result = db.try_reserve("K1", "U1", NOW + 2, LEASE).await.unwrap();
    assert_eq!(
        result,
        ReservationResult::StillBeingClaimed {
            reserved_until: NOW + LEASE
        }
    );
}

#[tokio::test]
async fn expired_lease_can_be_taken_by_anyone() {
    let db = test_db().await;
    seed(&db, "K1", None).await;

    db.try_reserve("K1", "U1", NOW, LEASE).await.unwrap();
    let later = NOW + LEASE + 1;
    let result = db.try_reserve("K1", "U2", later, LEASE).await.unwrap();
    assert_eq!(token_of(&result), later + LEASE);

    // The first holder can also retry once the lease has lapsed.
    let db2 = test_db().await;
    seed(&db2, "K2", None).await;
    db2.try_reserve("K2", "U1", NOW, LEASE).await.unwrap();
    let retry = db2.try_reserve("K2", "U1", later, LEASE).await.unwrap();
    assert_eq!(token_of(&retry), later + LEASE);
}

#[tokio::test]
async fn concurrent_reservations_have_one_winner() {
    let db = test_db().await;
    seed(&db, "RACE", None).await;

    let mut handles = Vec::new();
    for i in 0..16 {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            db.try_reserve("RACE", &format!("user-{i}"), NOW, LEASE)
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    let mut others = 0;
    for handle in handles {
        match handle.await.unwrap() {
            ReservationResult::Reserved(_) => winners += 1,
            ReservationResult::ReservedByOther { .. } => others += 1,
            other => panic!("unexpected result {other:?}"),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(others, 15);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reservations_across_connections_have_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let db = KeyDatabase::open(&dir.path().join("keys.db")).await.unwrap();
    seed(&db, "RACE", None).await;

    let barrier = std::sync::Arc::new(tokio::sync::Barrier::new(16));
    let mut handles = Vec::new();
    for i in 0..16 {
        let db = db.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            let identity = format!("user-{i}");
            let result = db.try_reserve("RACE", &identity, NOW, LEASE).await.unwrap();
            (identity, result)
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            (identity, ReservationResult::Reserved(_)) => winners.push(identity),
            (_, ReservationResult::ReservedByOther { .. }) => {}
            (_, other) => panic!("unexpected result {other:?}"),
        }
    }
    assert_eq!(winners.len(), 1);

    let key = db.get_key("RACE").await.unwrap().unwrap();
    assert_eq!(key.reserved_to.as_ref(), Some(&winners[0]));
    db.close().await;
}

// === Finalize ===

#[tokio::test]
async fn finalize_with_valid_token_claims() {
    let db = test_db().await;
    seed(&db, "K1", None).await;

    let token = token_of(&db.try_reserve("K1", "U1", NOW, LEASE).await.unwrap());
    let result = db.finalize_claim("K1", "U1", token, NOW + 1).await.unwrap();
    let ClaimResult::Claimed(record) = result else {
        panic!("expected claim, got {result:?}");
    };
    assert_eq!(record.claimed_at, Some(NOW + 1));
    assert_eq!(record.linked_to.as_deref(), Some("U1"));
}

#[tokio::test]
async fn finalize_replay_is_already_claimed() {
    let db = test_db().await;
    seed(&db, "K1", None).await;

    let token = token_of(&db.try_reserve("K1", "U1", NOW, LEASE).await.unwrap());
    db.finalize_claim("K1", "U1", token, NOW + 1).await.unwrap();

    let replay = db.finalize_claim("K1", "U1", token, NOW + 50).await.unwrap();
    let ClaimResult::AlreadyClaimed(record) = replay else {
        panic!("expected already claimed, got {replay:?}");
    };
    assert_eq!(record.claimed_at, Some(NOW + 1));
}

#[tokio::test]
async fn other_identity_cannot_finalize() {
    let db = test_db().await;
    seed(&db, "K1", None).await;

    let token = token_of(&db.try_reserve("K1", "U1", NOW, LEASE).await.unwrap());
    let result = db.finalize_claim("K1", "U2", token, NOW + 1).await.unwrap();
    assert!(matches!(result, ClaimResult::LeaseLost(_)));

    let key = db.get_key("K1").await.unwrap().unwrap();
    assert!(key.claimed_at.is_none());
}

#[tokio::test]
async fn stale_holder_cannot_finalize_after_takeover() {
    let db = test_db().await;
    seed(&db, "K1", None).await;

    let stale = token_of(&db.try_reserve("K1", "U1", NOW, LEASE).await.unwrap());
    let later = NOW + LEASE + 1;
    let fresh = token_of(&db.try_reserve("K1", "U2", later, LEASE).await.unwrap());

    let result = db.finalize_claim("K1", "U1", stale, later + 1).await.unwrap();
    assert!(matches!(result, ClaimResult::LeaseLost(_)));

    let result = db.finalize_claim("K1", "U2", fresh, later + 1).await.unwrap();
    assert!(matches!(result, ClaimResult::Claimed(_)));
}

#[tokio::test]
async fn expired_but_untouched_lease_still_finalizes() {
    let db = test_db().await;
    seed(&db, "K1", None).await;

    let token = token_of(&db.try_reserve("K1", "U1", NOW, LEASE).await.unwrap());
    let result = db
        .finalize_claim("K1", "U1", token, NOW + LEASE + 30)
        .await
        .unwrap();
    assert!(matches!(result, ClaimResult::Claimed(_)));
}

#[tokio::test]
async fn claimed_key_cannot_be_reserved_again() {
    let db = test_db().await;
    seed(&db, "K1", None).await;

    let token = token_of(&db.try_reserve("K1", "U1", NOW, LEASE).await.unwrap());
    db.finalize_claim("K1", "U1", token, NOW).await.unwrap();

    for identity in ["U1", "U2"] {
        let result = db
            .try_reserve("K1", identity, NOW + 1_000, LEASE)
            .await
            .unwrap();
        assert_eq!(
            result,
            ReservationResult::AlreadyClaimed {
                linked_to: "U1".into()
            }
        );
    }

    let key = db.get_key("K1").await.unwrap().unwrap();
    assert_eq!(key.claimed_at, Some(NOW));
    assert_eq!(key.reserved_to.as_deref(), Some("U1"));
}

#[tokio::test]
async fn stats_and_listing() {
    let db = test_db().await;
    seed(&db, "A", None).await;
    seed(&db, "B", Some("1 month")).await;
    seed(&db, "C", Some("7d")).await;

    let token = token_of(&db.try_reserve("A", "U1", NOW, LEASE).await.unwrap());
    db.finalize_claim("A", "U1", token, NOW).await.unwrap();
    db.try_reserve("B", "U2", NOW, LEASE).await.unwrap();

    let stats = db.key_stats(NOW + 1).await.unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.claimed, 1);
    assert_eq!(stats.reserved, 1);

    let unclaimed = db.list_unclaimed(10).await.unwrap();
    let serials: Vec<_> = unclaimed.iter().map(|k| k.serial.as_str()).collect();
    assert_eq!(serials, ["B", "C"]);

    let linked = db.keys_linked_to("U1").await.unwrap();
    assert_eq!(linked.len(), 1);
    assert_eq!(linked[0].serial, "A");
}

// === Rate limit counters ===

#[tokio::test]
async fn hit_counter_saturates_past_max() {
    let db = test_db().await;

    for expected in 1..=3 {
        let state = db.hit_counter("redeemkey", "U1", 3, 60, NOW).await.unwrap();
        assert_eq!(state.count, expected);
        assert_eq!(state.reset_at, NOW + 60);
    }
    for _ in 0..5 {
        let state = db.hit_counter("redeemkey", "U1", 3, 60, NOW + 1).await.unwrap();
        assert_eq!(state.count, 4);
    }
}

#[tokio::test]
async fn hit_counter_restarts_after_window() {
    let db = test_db().await;
    db.hit_counter("redeemkey", "U1", 1, 60, NOW).await.unwrap();

    let state = db.hit_counter("redeemkey", "U1", 1, 60, NOW + 60).await.unwrap();
    assert_eq!(state.count, 1);
    assert_eq!(state.reset_at, NOW + 120);
}

#[tokio::test]
async fn counters_are_per_bucket_and_identity() {
    let db = test_db().await;
    db.hit_counter("redeemkey", "U1", 5, 60, NOW).await.unwrap();
    db.hit_counter("redeemkey", "U1", 5, 60, NOW).await.unwrap();

    let other_user = db.hit_counter("redeemkey", "U2", 5, 60, NOW).await.unwrap();
    assert_eq!(other_user.count, 1);
    let other_bucket = db.hit_counter("bugreports", "U1", 5, 60, NOW).await.unwrap();
    assert_eq!(other_bucket.count, 1);
}

#[tokio::test]
async fn track_get_delete_counter() {
    let db = test_db().await;
    assert!(db.get_counter("syncuser", "system", NOW).await.unwrap().is_none());

    db.track_counter("syncuser", "system", 60, NOW).await.unwrap();
    let state = db.track_counter("syncuser", "system", 60, NOW).await.unwrap();
    assert_eq!(state.count, 2);

    let current = db.get_counter("syncuser", "system", NOW + 1).await.unwrap();
    assert_eq!(current.map(|s| s.count), Some(2));
    assert!(db.get_counter("syncuser", "system", NOW + 60).await.unwrap().is_none());

    assert!(db.delete_counter("syncuser", "system").await.unwrap());
    assert!(!db.delete_counter("syncuser", "system").await.unwrap());
    assert!(db.get_counter("syncuser", "system", NOW).await.unwrap().is_none());
}

#[tokio::test]
async fn purge_drops_only_elapsed_windows() {
    let db = test_db().await;
    db.track_counter("a", "U1", 10, NOW).await.unwrap();
    db.track_counter("b", "U1", 100, NOW).await.unwrap();

    let removed = db.purge_expired_counters(NOW + 50).await.unwrap();
    assert_eq!(removed, 1);
    assert!(db.get_counter("b", "U1", NOW + 50).await.unwrap().is_some());
}

// === License mirror ===

#[tokio::test]
async fn upsert_license_user_replaces_row() {
    let db = test_db().await;
    let mut user = LicenseUser {
        discord_id: "U1".into(),
        user_key: "lk-1".into(),
        auth_expire: NOW + 86_400,
        note: "order - K1".into(),
        status: "reset".into(),
        banned: 0,
        synced_at: NOW,
    };
    db.upsert_license_user(&user).await.unwrap();

    user.auth_expire = -1;
    user.synced_at = NOW + 10;
    db.upsert_license_user(&user).await.unwrap();

    let stored = db.get_license_user("U1").await.unwrap().unwrap();
    assert_eq!(stored, user);
    let by_key = db.get_license_user_by_key("lk-1").await.unwrap().unwrap();
    assert_eq!(by_key.discord_id, "U1");
}
