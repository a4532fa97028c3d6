//! URL parsing and known-account allowlist matching.
//!
//! Extracts (platform, handle, domain) from page URLs so matches on a
//! contributor's own accounts can be suppressed. Well-known social domains
//! never match by bare domain — only by platform + handle — so a
//! contributor's `instagram.com` entry cannot suppress matches found under
//! `instagram.com/impersonator`.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::types::KnownAccount;

/// Platform and handle extracted from a page URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUrl {
    pub platform: Option<&'static str>,
    pub handle: Option<String>,
    pub domain: String,
}

/// (platform name, domain, path pattern capturing the handle)
static PLATFORM_PATTERNS: LazyLock<Vec<(&'static str, &'static str, Regex)>> =
    LazyLock::new(|| {
        #[allow(clippy::expect_used)] // static patterns, validated by tests
        let build = |pattern: &str| Regex::new(pattern).expect("invalid platform pattern");
        vec![
            ("instagram", "instagram.com", build(r"^/([A-Za-z0-9_.]+)/?$")),
            ("twitter", "twitter.com", build(r"^/([A-Za-z0-9_]+)/?$")),
            ("twitter", "x.com", build(r"^/([A-Za-z0-9_]+)/?$")),
            ("tiktok", "tiktok.com", build(r"^/@?([A-Za-z0-9_.]+)/?$")),
            ("facebook", "facebook.com", build(r"^/([A-Za-z0-9.]+)/?$")),
            ("linkedin", "linkedin.com", build(r"^/in/([A-Za-z0-9_-]+)/?$")),
            ("deviantart", "deviantart.com", build(r"^/([A-Za-z0-9_-]+)/?.*$")),
            ("reddit", "reddit.com", build(r"^/user/([A-Za-z0-9_-]+)/?.*$")),
            ("civitai", "civitai.com", build(r"^/user/([A-Za-z0-9_-]+)/?.*$")),
            ("youtube", "youtube.com", build(r"^/@?([A-Za-z0-9_-]+)/?$")),
        ]
    });

/// Domains where bare-domain allowlist matching is too broad.
const SOCIAL_DOMAINS: &[&str] = &[
    "instagram.com",
    "twitter.com",
    "x.com",
    "tiktok.com",
    "facebook.com",
    "linkedin.com",
    "youtube.com",
    "reddit.com",
    "deviantart.com",
    "civitai.com",
];

/// Whether a normalized domain is a well-known social platform.
#[must_use]
pub fn is_social_domain(domain: &str) -> bool {
    SOCIAL_DOMAINS.contains(&domain)
}

/// Strip `www.`, `m.`, and `mobile.` prefixes and lowercase the domain.
#[must_use]
pub fn normalize_domain(domain: &str) -> String {
    let mut domain = domain.to_lowercase();
    for prefix in ["www.", "m.", "mobile."] {
        if let Some(stripped) = domain.strip_prefix(prefix) {
            domain = stripped.to_string();
        }
    }
    domain
}

/// Extract platform and handle from a URL. Tolerates missing schemes,
/// www/mobile prefixes, and trailing slashes.
#[must_use]
pub fn parse_url(raw: &str) -> ParsedUrl {
    let with_scheme;
    let candidate = if raw.contains("://") {
        raw
    } else {
        with_scheme = format!("https://{raw}");
        &with_scheme
    };

    let Ok(parsed) = Url::parse(candidate) else {
        return ParsedUrl {
            platform: None,
            handle: None,
            domain: "unknown".to_string(),
        };
    };

    let domain = normalize_domain(parsed.host_str().unwrap_or(""));
    let path = parsed.path();

    for (platform, pattern_domain, handle_re) in PLATFORM_PATTERNS.iter() {
        if domain == *pattern_domain || domain.ends_with(&format!(".{pattern_domain}")) {
            if let Some(captures) = handle_re.captures(path) {
                return ParsedUrl {
                    platform: Some(platform),
                    handle: captures.get(1).map(|m| m.as_str().to_lowercase()),
                    domain,
                };
            }
            // Matched the domain but could not extract a handle
            return ParsedUrl {
                platform: Some(platform),
                handle: None,
                domain,
            };
        }
    }

    ParsedUrl {
        platform: None,
        handle: None,
        domain,
    }
}

/// Check a page URL against a contributor's known accounts.
///
/// Matches by (platform, handle) first; bare-domain matching applies only to
/// non-social custom domains. Returns the matching account.
#[must_use]
pub fn check_allowlist<'a>(
    page_url: Option<&str>,
    known_accounts: &'a [KnownAccount],
) -> Option<&'a KnownAccount> {
    let page_url = page_url?;
    let parsed = parse_url(page_url);

    for account in known_accounts {
        if let (Some(platform), Some(handle)) = (parsed.platform, parsed.handle.as_deref()) {
            let platform_matches = account.platform.as_deref() == Some(platform);
            let handle_matches = account
                .handle
                .as_deref()
                .is_some_and(|h| h.to_lowercase() == handle);
            if platform_matches && handle_matches {
                return Some(account);
            }
        }

        if let Some(account_domain) = account.domain.as_deref() {
            let account_domain = normalize_domain(account_domain);
            if is_social_domain(&account_domain) {
                continue;
            }
            if parsed.domain == account_domain {
                return Some(account);
            }
        }
    }

    None
}
