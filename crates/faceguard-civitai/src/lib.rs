//! # faceguard-civitai
//!
//! CivitAI platform-crawl provider — the highest-volume source of
//! AI-generated likeness content the scanner monitors.
//!
//! Three independent cursor spaces cover the platform:
//! - the paginated global image feed (one opaque cursor),
//! - face-targeted image searches (one cursor per search term),
//! - LoRA model sample images browsed by human-relevant tag (one cursor
//!   per tag).
//!
//! The provider declares the INLINE detection strategy with a two-pass
//! thumbnail probe: pass 1 downloads the width-450 CDN rendition and runs
//! face detection on it; only face-positive images pay for the full-res
//! original, which is re-detected, embedded, and thumbnailed into object
//! storage. The probe costs roughly 1/20th of the original and most feed
//! images carry no face, so the two passes dominate the bandwidth budget.

mod crawl;

pub use crawl::{
    thumbnail_url, CivitaiConfig, CivitaiCrawl, FACE_INDICATORS, IMAGE_SEARCH_TERMS,
    LORA_HUMAN_TAGS,
};
