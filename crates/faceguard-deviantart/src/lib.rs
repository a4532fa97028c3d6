//! # faceguard-deviantart
//!
//! DeviantArt platform-crawl provider. Tag-based browsing over the OAuth2
//! client-credentials API, with per-tag offset cursors and per-tag page
//! depth taken from the taxonomy mapper's damage-tier categorization.
//!
//! DEFERRED strategy: only URL metadata comes back from the crawl; the
//! subprocess face-detection worker handles downloads and detection later.

mod crawl;

pub use crawl::{
    default_tags, DeviantArtConfig, DeviantArtCrawl, AI_BROWSE_TAGS, DEFAULT_TAGS, PHOTO_TAGS,
};
