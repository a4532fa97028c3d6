//! Scenario tests for pipeline semantics that span crate seams: confidence
//! tiering, allowlist suppression, tier-scoped post-match actions, and
//! cursor round-trips.

use std::collections::HashMap;

use faceguard::discovery::{CursorState, DiscoveryResult};
use faceguard::embedding::{compute_centroid, cosine_similarity, l2_normalize, norm};
use faceguard::tiers::TierPolicy;
use faceguard::types::{ConfidenceTier, KnownAccount, MatchThresholds, Tier};
use faceguard::urlparse::check_allowlist;
use uuid::Uuid;

fn account(platform: &str, handle: &str) -> KnownAccount {
    KnownAccount {
        id: Uuid::new_v4(),
        contributor_id: Uuid::new_v4(),
        platform: Some(platform.to_string()),
        handle: Some(handle.to_string()),
        domain: None,
    }
}

/// A batch of five embeddings at similarities [0.92, 0.70, 0.58, 0.49,
/// 0.95] against thresholds (0.50, 0.65, 0.85) produces exactly four match
/// rows at tiers high, medium, low, high — and none for 0.49.
#[test]
fn scenario_confidence_tiers_for_similarity_batch() {
    let thresholds = MatchThresholds::default();
    let similarities = [0.92, 0.70, 0.58, 0.49, 0.95];
    let tiers: Vec<Option<ConfidenceTier>> =
        similarities.iter().map(|s| thresholds.tier_for(*s)).collect();

    assert_eq!(
        tiers,
        vec![
            Some(ConfidenceTier::High),
            Some(ConfidenceTier::Medium),
            Some(ConfidenceTier::Low),
            None,
            Some(ConfidenceTier::High),
        ]
    );
}

/// A 0.72-similarity match on a premium contributor with no allowlist hit
/// triggers all three post-match actions: AI classification, evidence
/// capture, and a notification.
#[test]
fn scenario_premium_medium_match_actions() {
    let thresholds = MatchThresholds::default();
    let confidence = thresholds.tier_for(0.72).unwrap();
    assert_eq!(confidence, ConfidenceTier::Medium);

    let policy = TierPolicy::for_tier(Tier::Premium);
    assert!(policy.should_run_ai_detection(confidence, false));
    assert!(policy.should_capture_evidence(confidence, false));
    assert!(policy.should_notify(confidence, false));
}

/// The same match for a free contributor stores and notifies, but never
/// pays for classification or evidence.
#[test]
fn scenario_free_medium_match_actions() {
    let thresholds = MatchThresholds::default();
    let confidence = thresholds.tier_for(0.72).unwrap();

    let policy = TierPolicy::for_tier(Tier::Free);
    assert!(policy.store_match);
    assert!(policy.should_notify(confidence, false));
    assert!(!policy.should_run_ai_detection(confidence, false));
    assert!(!policy.should_capture_evidence(confidence, false));
}

/// Known-account allowlisting: a handle mismatch on the same platform is
/// not suppressed; the real handle is, regardless of URL decoration.
#[test]
fn scenario_allowlist_handle_discrimination() {
    let accounts = vec![account("instagram", "bob_official")];

    let impersonator = check_allowlist(
        Some("https://www.instagram.com/bob_impersonator/"),
        &accounts,
    );
    assert!(impersonator.is_none());

    let own_account = check_allowlist(
        Some("https://instagram.com/bob_official/?hl=en"),
        &accounts,
    );
    assert!(own_account.is_some());

    // Suppression also suppresses every downstream action.
    let policy = TierPolicy::for_tier(Tier::Premium);
    assert!(!policy.should_run_ai_detection(ConfidenceTier::High, true));
    assert!(!policy.should_capture_evidence(ConfidenceTier::High, true));
    assert!(!policy.should_notify(ConfidenceTier::High, true));
}

/// Four embeddings where one is inconsistent with the others: the centroid
/// keeps three, reports one outlier, and stays unit-norm.
#[test]
fn scenario_centroid_outlier_rejection() {
    let mut base: Vec<Vec<f32>> = (0..3)
        .map(|i| {
            let mut v = vec![0.0f32; 16];
            v[0] = 1.0;
            v[1 + i] = 0.05;
            l2_normalize(&mut v);
            v
        })
        .collect();
    let mut outlier = vec![0.0f32; 16];
    outlier[15] = 1.0;
    base.push(outlier);

    let scores = vec![Some(0.99), Some(0.98), Some(0.97), Some(0.30)];
    let centroid = compute_centroid(&base, &scores).unwrap().unwrap();

    assert_eq!(centroid.embeddings_total, 4);
    assert_eq!(centroid.embeddings_used, 3);
    assert_eq!(centroid.outliers_rejected, 1);
    assert!((norm(&centroid.vector) - 1.0).abs() < 1e-6);
    assert!(cosine_similarity(&centroid.vector, &base[0]).unwrap() > 0.99);
}

/// Cursor round-trip: what a crawl writes at tick N is what tick N+1 reads,
/// and a term exhausted at end-of-tick restarts from the newest page.
#[test]
fn scenario_cursor_round_trip_and_exhaustion_restart() {
    let mut state = CursorState::default();

    // Tick N: two live terms, one exhausted.
    state.apply(&DiscoveryResult {
        next_cursor: Some("feed-9".to_string()),
        search_cursors: Some(HashMap::from([
            ("woman".to_string(), Some("w-3".to_string())),
            ("portrait".to_string(), Some("p-7".to_string())),
            ("headshot".to_string(), None),
        ])),
        ..DiscoveryResult::default()
    });

    let blob = state.to_json().unwrap();
    let reread = CursorState::from_json(Some(&blob));
    assert_eq!(reread, state);

    // Tick N+1 resumes the live terms and restarts the exhausted one.
    let context = reread.to_context("civitai");
    let cursors = context.search_cursors.unwrap();
    assert_eq!(cursors.get("woman").map(String::as_str), Some("w-3"));
    assert_eq!(cursors.get("portrait").map(String::as_str), Some("p-7"));
    assert!(!cursors.contains_key("headshot"));
    assert_eq!(context.cursor.as_deref(), Some("feed-9"));
}
