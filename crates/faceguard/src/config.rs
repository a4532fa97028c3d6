//! Environment-driven scanner configuration.

use std::env;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::types::MatchThresholds;

/// Scanner service configuration, read once at startup from environment
/// variables. Every field has a default except `database_url`.
#[derive(Debug, Clone)]
pub struct Config {
    // Database
    pub database_url: String,
    pub database_ssl: bool,

    // Supabase Storage (contributor images, thumbnails, evidence)
    pub supabase_url: String,
    pub supabase_service_role_key: String,
    pub evidence_bucket: String,

    // Provider credentials
    pub tineye_api_key: String,
    pub hive_api_key: String,
    pub deviantart_client_id: String,
    pub deviantart_client_secret: String,

    // Matching thresholds (config defaults; the ML state store overrides)
    pub match_threshold_low: f64,
    pub match_threshold_medium: f64,
    pub match_threshold_high: f64,

    // Scheduling
    pub scan_batch_size: i64,
    pub scheduler_tick_seconds: u64,

    // Face detection (subprocess isolation)
    pub face_detection_chunk_size: i64,
    pub face_detection_timeout: u64,
    pub face_detection_max_chunks: u32,
    pub face_detection_provider: String,
    pub face_detection_service_url: String,
    pub insightface_model: String,

    // Matching
    pub matching_batch_size: i64,

    // Crawl scheduling (hours between automatic crawls, 0 = manual only)
    pub civitai_crawl_interval_hours: i64,
    pub deviantart_crawl_interval_hours: i64,

    // CivitAI crawl
    pub civitai_max_pages: u32,
    pub civitai_model_pages_per_tag: u32,
    pub civitai_nsfw_filter: String,
    pub civitai_backfill_days: i64,

    // DeviantArt crawl depth, per damage tier of the tag
    pub deviantart_max_pages: u32,
    pub deviantart_high_damage_pages: u32,
    pub deviantart_medium_damage_pages: u32,
    pub deviantart_low_damage_pages: u32,

    // Evidence capture
    pub screenshot_service_url: String,

    // Optional rotating proxy for crawl HTTP
    pub proxy_url: String,

    // Taxonomy mapper cadence
    pub mapper_interval_hours: i64,

    // ML intelligence
    pub auto_apply_low_risk: bool,

    // Logging
    pub log_level: String,

    // Local scratch directory
    pub temp_dir: String,
}

impl Config {
    /// Read configuration from the environment.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `database_url` is unset. Malformed
    /// numeric/boolean values fall back to their defaults.
    pub fn from_env() -> Result<Self> {
        let database_url = env_string("database_url", "");
        if database_url.is_empty() {
            return Err(Error::config("database_url is required"));
        }

        Ok(Self {
            database_url,
            database_ssl: env_parse("database_ssl", true),
            supabase_url: env_string("supabase_url", ""),
            supabase_service_role_key: env_string("supabase_service_role_key", ""),
            evidence_bucket: env_string("evidence_bucket", "madeofus-evidence"),
            tineye_api_key: env_string("tineye_api_key", ""),
            hive_api_key: env_string("hive_api_key", ""),
            deviantart_client_id: env_string("deviantart_client_id", ""),
            deviantart_client_secret: env_string("deviantart_client_secret", ""),
            match_threshold_low: env_parse("match_threshold_low", 0.50),
            match_threshold_medium: env_parse("match_threshold_medium", 0.65),
            match_threshold_high: env_parse("match_threshold_high", 0.85),
            scan_batch_size: env_parse("scan_batch_size", 10),
            scheduler_tick_seconds: env_parse("scheduler_tick_seconds", 60),
            face_detection_chunk_size: env_parse("face_detection_chunk_size", 1000),
            face_detection_timeout: env_parse("face_detection_timeout", 600),
            face_detection_max_chunks: env_parse("face_detection_max_chunks", 5),
            face_detection_provider: env_string("face_detection_provider", "insightface"),
            face_detection_service_url: env_string("face_detection_service_url", ""),
            insightface_model: env_string("insightface_model", "buffalo_sc"),
            matching_batch_size: env_parse("matching_batch_size", 500),
            civitai_crawl_interval_hours: env_parse("civitai_crawl_interval_hours", 24),
            deviantart_crawl_interval_hours: env_parse("deviantart_crawl_interval_hours", 24),
            civitai_max_pages: env_parse("civitai_max_pages", 1),
            civitai_model_pages_per_tag: env_parse("civitai_model_pages_per_tag", 1),
            civitai_nsfw_filter: env_string("civitai_nsfw_filter", "None"),
            civitai_backfill_days: env_parse("civitai_backfill_days", 30),
            deviantart_max_pages: env_parse("deviantart_max_pages", 2),
            deviantart_high_damage_pages: env_parse("deviantart_high_damage_pages", 2),
            deviantart_medium_damage_pages: env_parse("deviantart_medium_damage_pages", 1),
            deviantart_low_damage_pages: env_parse("deviantart_low_damage_pages", 1),
            screenshot_service_url: env_string("screenshot_service_url", ""),
            proxy_url: env_string("proxy_url", ""),
            mapper_interval_hours: env_parse("mapper_interval_hours", 168),
            auto_apply_low_risk: env_parse("auto_apply_low_risk", false),
            log_level: env_string("log_level", "info"),
            temp_dir: env_string("temp_dir", "/tmp/faceguard_images"),
        })
    }

    /// Config-default similarity thresholds. The matching engine prefers the
    /// values in the ML state store and uses these as the fallback.
    #[must_use]
    pub fn default_thresholds(&self) -> MatchThresholds {
        MatchThresholds {
            low: self.match_threshold_low,
            medium: self.match_threshold_medium,
            high: self.match_threshold_high,
        }
    }
}

/// Read a string key, checking the lowercase name then its UPPERCASE form.
fn env_string(key: &str, default: &str) -> String {
    env::var(key)
        .or_else(|_| env::var(key.to_uppercase()))
        .unwrap_or_else(|_| default.to_string())
}

/// Read and parse a key, falling back to the default on absence or parse
/// failure.
fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    let raw = env_string(key, "");
    if raw.is_empty() {
        return default;
    }
    raw.parse().unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; each uses its own key names to
    // stay independent of test ordering.

    #[test]
    fn test_env_string_default() {
        assert_eq!(env_string("faceguard_test_unset_key", "fallback"), "fallback");
    }

    #[test]
    fn test_env_string_uppercase_fallback() {
        std::env::set_var("FACEGUARD_TEST_UPPER", "value");
        assert_eq!(env_string("faceguard_test_upper", ""), "value");
        std::env::remove_var("FACEGUARD_TEST_UPPER");
    }

    #[test]
    fn test_env_parse_valid() {
        std::env::set_var("faceguard_test_num", "42");
        let v: i64 = env_parse("faceguard_test_num", 7);
        assert_eq!(v, 42);
        std::env::remove_var("faceguard_test_num");
    }

    #[test]
    fn test_env_parse_malformed_falls_back() {
        std::env::set_var("faceguard_test_bad_num", "not-a-number");
        let v: i64 = env_parse("faceguard_test_bad_num", 7);
        assert_eq!(v, 7);
        std::env::remove_var("faceguard_test_bad_num");
    }

    #[test]
    fn test_env_parse_bool() {
        std::env::set_var("faceguard_test_bool", "true");
        assert!(env_parse("faceguard_test_bool", false));
        std::env::remove_var("faceguard_test_bool");
    }

    #[test]
    fn test_from_env_database_url_handling() {
        // Single sequential test: from_env reads database_url, and parallel
        // tests must not observe each other's mutations of that key.
        std::env::remove_var("database_url");
        std::env::remove_var("DATABASE_URL");
        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("database_url"));

        std::env::set_var("database_url", "postgres://localhost/faceguard_test");
        let config = Config::from_env().unwrap();
        assert_eq!(config.database_url, "postgres://localhost/faceguard_test");

        let t = config.default_thresholds();
        assert!((t.low - 0.50).abs() < f64::EPSILON);
        assert!((t.medium - 0.65).abs() < f64::EPSILON);
        assert!((t.high - 0.85).abs() < f64::EPSILON);
        assert_eq!(config.evidence_bucket, "madeofus-evidence");
        assert_eq!(config.scheduler_tick_seconds, 60);
        assert_eq!(config.face_detection_chunk_size, 1000);
        std::env::remove_var("database_url");
    }
}
