//! Merge preservation and transaction atomicity (§8): merging duplicates
//! into a primary row unions every array field and overwrites every scalar
//! field with whichever member last updated most recently (§4.8), and a
//! merge either fully applies or leaves every row untouched.

mod common;

use common::fixtures::canonical_trial;
use common::TestHarness;
use pipeline_core::domains::dedup::DedupRepository;
use pipeline_core::domains::trials::TrialRepository;
use registries::{Intervention, Registry, Sponsor};

#[tokio::test]
async fn merge_group_unions_arrays_and_overwrites_scalars_from_the_newest_member() {
    let ctx = TestHarness::new().await;
    let trials = TrialRepository::new(ctx.db_pool.clone());
    let dedup = DedupRepository::new(ctx.db_pool.clone());

    let suffix = uuid::Uuid::new_v4();
    let primary_key = format!("ctgov:merge-atomic-{suffix}");
    let dup_key = format!("euctr:merge-atomic-{suffix}");

    let mut primary = canonical_trial(&primary_key, Registry::CtGov, "Metformin in T2D");
    primary.conditions = std::collections::HashSet::from(["diabetes".to_string()]);
    primary.interventions = vec![Intervention {
        kind: "Drug".to_string(),
        name: "Metformin".to_string(),
        description: None,
    }];
    primary.sponsor = Sponsor {
        lead: Some("Old Lead Sponsor".to_string()),
        collaborators: vec!["Acme Research".to_string()],
    };
    primary.last_update = Some(chrono::Utc::now() - chrono::Duration::days(2));
    trials.upsert(&primary).await.expect("upsert primary");

    // The duplicate is the more recently updated source: its scalar fields
    // should win the merge, while both sides' array entries should survive
    // as a union rather than one replacing the other.
    let mut duplicate = canonical_trial(&dup_key, Registry::EuCtr, "Metformin for type-2 diabetes, updated");
    duplicate.conditions = std::collections::HashSet::from(["diabetes".to_string(), "obesity".to_string()]);
    duplicate.interventions = vec![Intervention {
        kind: "Drug".to_string(),
        name: "Placebo".to_string(),
        description: None,
    }];
    duplicate.sponsor = Sponsor {
        lead: Some("New Lead Sponsor".to_string()),
        collaborators: vec!["Newco Partners".to_string()],
    };
    duplicate.last_update = Some(chrono::Utc::now());
    trials.upsert(&duplicate).await.expect("upsert duplicate");

    let winner = dedup
        .merge_group(&[primary_key.clone(), dup_key.clone()])
        .await
        .expect("merge")
        .expect("merge should produce a winner");

    assert_eq!(winner, primary_key, "ClinicalTrials.gov should win merge priority over EU CTR");

    let merged = trials.find_by_key(&primary_key).await.expect("find").expect("primary still active");

    let merged_conditions: std::collections::HashSet<_> = merged.conditions.iter().cloned().collect();
    assert!(merged_conditions.contains("diabetes"));
    assert!(merged_conditions.contains("obesity"), "array fields should union, not overwrite");

    let merged_interventions: Vec<Intervention> =
        serde_json::from_value(merged.interventions.clone()).expect("interventions deserialize");
    let intervention_names: std::collections::HashSet<_> =
        merged_interventions.iter().map(|i| i.name.as_str()).collect();
    assert!(intervention_names.contains("Metformin"));
    assert!(intervention_names.contains("Placebo"), "interventions should union across members");

    let merged_sponsor: Sponsor = serde_json::from_value(merged.sponsor.clone()).expect("sponsor deserialize");
    assert_eq!(
        merged_sponsor.lead.as_deref(),
        Some("New Lead Sponsor"),
        "scalar sponsor.lead should take the most recently updated member's value"
    );
    assert!(merged_sponsor.collaborators.contains(&"Acme Research".to_string()));
    assert!(
        merged_sponsor.collaborators.contains(&"Newco Partners".to_string()),
        "sponsor.collaborators should union across members"
    );

    assert_eq!(
        merged.title_official, "Metformin for type-2 diabetes, updated",
        "scalar title_official should be overwritten by the most recently updated member"
    );

    let absorbed = trials.find_by_key(&dup_key).await.expect("find").expect("duplicate row still exists");
    assert!(!absorbed.is_active);
    assert_eq!(absorbed.merged_into_key.as_deref(), Some(primary_key.as_str()));
}

#[tokio::test]
async fn merge_group_with_a_missing_member_rolls_back_entirely() {
    let ctx = TestHarness::new().await;
    let trials = TrialRepository::new(ctx.db_pool.clone());
    let dedup = DedupRepository::new(ctx.db_pool.clone());

    let suffix = uuid::Uuid::new_v4();
    let primary_key = format!("ctgov:merge-rollback-{suffix}");
    let missing_key = format!("euctr:merge-rollback-missing-{suffix}");

    let primary = canonical_trial(&primary_key, Registry::CtGov, "Metformin in T2D");
    trials.upsert(&primary).await.expect("upsert primary");

    // Only one of the two keys resolves to a live row, so the group never
    // reaches the minimum of two members and the merge is a no-op.
    let result = dedup
        .merge_group(&[primary_key.clone(), missing_key])
        .await
        .expect("merge call should not error");

    assert!(result.is_none());

    let row = trials.find_by_key(&primary_key).await.expect("find").expect("row still exists");
    assert!(row.is_active);
    assert!(row.merged_into_key.is_none());
}
