//! Per-subscription-tier scanner policy.
//!
//! The tier controls discovery frequency and which post-match actions run.
//! Policy values are fixed at compile time; only similarity thresholds are
//! runtime-mutable (see `MatchThresholds`).

use crate::types::{ConfidenceTier, Tier};

/// What the scanner does for a contributor at a given subscription tier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierPolicy {
    /// Hours between reverse-image scans.
    pub reverse_image_interval_hours: i64,
    /// Reference photos submitted per reverse-image scan.
    pub reverse_image_max_photos: usize,
    /// Whether this tier participates in platform-crawl matching.
    pub platform_crawl_matching: bool,
    /// Whether user-submitted URL checks run.
    pub url_check: bool,
    /// Hours between URL checks (fractional for premium).
    pub url_check_interval_hours: f64,
    /// Allowlist capacity.
    pub max_known_accounts: usize,
    /// Whether matches are stored at all.
    pub store_match: bool,
    /// Whether a notification row is written for a match.
    pub notify_on_match: bool,
    /// Whether a screenshot evidence capture runs.
    pub capture_evidence: bool,
    /// Whether the AI-generation classifier runs.
    pub ai_detection: bool,
    /// Whether takedown notices can be generated.
    pub generate_takedown: bool,
    /// Whether legal escalation is available.
    pub legal_escalation: bool,
    /// Whether the match preview is blurred.
    pub show_blurred_preview: bool,
    /// Whether full match details are shown.
    pub show_full_details: bool,
}

const FREE: TierPolicy = TierPolicy {
    reverse_image_interval_hours: 168,
    reverse_image_max_photos: 3,
    platform_crawl_matching: true,
    url_check: false,
    url_check_interval_hours: 0.0,
    max_known_accounts: 3,
    store_match: true,
    notify_on_match: true,
    capture_evidence: false,
    ai_detection: false,
    generate_takedown: false,
    legal_escalation: false,
    show_blurred_preview: true,
    show_full_details: false,
};

const PROTECTED: TierPolicy = TierPolicy {
    reverse_image_interval_hours: 24,
    reverse_image_max_photos: 10,
    platform_crawl_matching: true,
    url_check: true,
    url_check_interval_hours: 1.0,
    max_known_accounts: 10,
    store_match: true,
    notify_on_match: true,
    capture_evidence: true,
    ai_detection: true,
    generate_takedown: true,
    legal_escalation: false,
    show_blurred_preview: true,
    show_full_details: true,
};

const PREMIUM: TierPolicy = TierPolicy {
    reverse_image_interval_hours: 6,
    reverse_image_max_photos: 10,
    platform_crawl_matching: true,
    url_check: true,
    url_check_interval_hours: 0.5,
    max_known_accounts: 25,
    store_match: true,
    notify_on_match: true,
    capture_evidence: true,
    ai_detection: true,
    generate_takedown: true,
    legal_escalation: true,
    show_blurred_preview: true,
    show_full_details: true,
};

impl TierPolicy {
    /// Policy for a subscription tier.
    #[must_use]
    pub fn for_tier(tier: Tier) -> &'static TierPolicy {
        match tier {
            Tier::Free => &FREE,
            Tier::Protected => &PROTECTED,
            Tier::Premium => &PREMIUM,
        }
    }

    /// Whether to run the AI-generation classifier for a match.
    ///
    /// Paid tiers only, at medium confidence or above, and never on matches
    /// suppressed by the allowlist.
    #[must_use]
    pub fn should_run_ai_detection(
        &self,
        confidence: ConfidenceTier,
        is_known_account: bool,
    ) -> bool {
        self.ai_detection && !is_known_account && confidence >= ConfidenceTier::Medium
    }

    /// Whether to capture screenshot evidence for a match.
    #[must_use]
    pub fn should_capture_evidence(
        &self,
        confidence: ConfidenceTier,
        is_known_account: bool,
    ) -> bool {
        self.capture_evidence && !is_known_account && confidence >= ConfidenceTier::Medium
    }

    /// Whether to write a notification row for a match.
    #[must_use]
    pub fn should_notify(&self, confidence: ConfidenceTier, is_known_account: bool) -> bool {
        let _ = confidence;
        self.notify_on_match && !is_known_account
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_tier_policy() {
        let p = TierPolicy::for_tier(Tier::Free);
        assert_eq!(p.reverse_image_interval_hours, 168);
        assert_eq!(p.reverse_image_max_photos, 3);
        assert!(!p.url_check);
        assert!(!p.capture_evidence);
        assert!(!p.ai_detection);
        assert!(p.notify_on_match);
        assert!(!p.show_full_details);
    }

    #[test]
    fn test_protected_tier_policy() {
        let p = TierPolicy::for_tier(Tier::Protected);
        assert_eq!(p.reverse_image_interval_hours, 24);
        assert!(p.url_check);
        assert!(p.capture_evidence);
        assert!(p.ai_detection);
        assert!(!p.legal_escalation);
    }

    #[test]
    fn test_premium_tier_policy() {
        let p = TierPolicy::for_tier(Tier::Premium);
        assert_eq!(p.reverse_image_interval_hours, 6);
        assert_eq!(p.max_known_accounts, 25);
        assert!(p.legal_escalation);
        assert!((p.url_check_interval_hours - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_ai_detection_gated_by_tier() {
        let free = TierPolicy::for_tier(Tier::Free);
        let premium = TierPolicy::for_tier(Tier::Premium);
        assert!(!free.should_run_ai_detection(ConfidenceTier::High, false));
        assert!(premium.should_run_ai_detection(ConfidenceTier::Medium, false));
        assert!(premium.should_run_ai_detection(ConfidenceTier::High, false));
    }

    #[test]
    fn test_ai_detection_skipped_at_low_confidence() {
        let premium = TierPolicy::for_tier(Tier::Premium);
        assert!(!premium.should_run_ai_detection(ConfidenceTier::Low, false));
    }

    #[test]
    fn test_known_account_suppresses_actions() {
        let premium = TierPolicy::for_tier(Tier::Premium);
        assert!(!premium.should_run_ai_detection(ConfidenceTier::High, true));
        assert!(!premium.should_capture_evidence(ConfidenceTier::High, true));
        assert!(!premium.should_notify(ConfidenceTier::High, true));
    }

    #[test]
    fn test_evidence_gated_by_confidence() {
        let protected = TierPolicy::for_tier(Tier::Protected);
        assert!(!protected.should_capture_evidence(ConfidenceTier::Low, false));
        assert!(protected.should_capture_evidence(ConfidenceTier::Medium, false));
    }

    #[test]
    fn test_notify_allowed_at_all_confidences() {
        let free = TierPolicy::for_tier(Tier::Free);
        assert!(free.should_notify(ConfidenceTier::Low, false));
        assert!(free.should_notify(ConfidenceTier::High, false));
    }
}
