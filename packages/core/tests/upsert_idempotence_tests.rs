//! Upsert idempotence (§8): normalizing and upserting the same canonical
//! trial twice yields the same row, modulo `updated_at`.

mod common;

use common::fixtures::canonical_trial;
use common::TestHarness;
use pipeline_core::domains::trials::TrialRepository;
use registries::Registry;

#[tokio::test]
async fn upserting_the_same_trial_twice_is_idempotent() {
    let ctx = TestHarness::new().await;
    let trials = TrialRepository::new(ctx.db_pool.clone());

    let trial_key = format!("ctgov:idempotence-{}", uuid::Uuid::new_v4());
    let trial = canonical_trial(&trial_key, Registry::CtGov, "Metformin in T2D");

    trials.upsert(&trial).await.expect("first upsert");
    let first = trials.find_by_key(&trial_key).await.expect("find").expect("row exists");

    trials.upsert(&trial).await.expect("second upsert");
    let second = trials.find_by_key(&trial_key).await.expect("find").expect("row exists");

    assert_eq!(first.trial_key, second.trial_key);
    assert_eq!(first.title_official, second.title_official);
    assert_eq!(first.conditions, second.conditions);
    assert_eq!(first.status, second.status);
    assert_eq!(first.phase, second.phase);
    assert_eq!(first.external_ids, second.external_ids);
}

#[tokio::test]
async fn upserting_a_newer_record_for_the_same_key_overwrites_scalar_fields() {
    let ctx = TestHarness::new().await;
    let trials = TrialRepository::new(ctx.db_pool.clone());

    let trial_key = format!("ctgov:merge-{}", uuid::Uuid::new_v4());
    let mut trial = canonical_trial(&trial_key, Registry::CtGov, "Metformin in T2D");
    trials.upsert(&trial).await.expect("first upsert");

    trial.title_official = "Metformin in Type 2 Diabetes (updated)".to_string();
    trial.last_update = Some(chrono::Utc::now() + chrono::Duration::days(1));
    trials.upsert(&trial).await.expect("second upsert");

    let row = trials.find_by_key(&trial_key).await.expect("find").expect("row exists");
    assert_eq!(row.title_official, "Metformin in Type 2 Diabetes (updated)");
}
