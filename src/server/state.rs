use crate::address::AddressCodec;
use crate::cache::CacheStore;
use crate::config::Config;
use crate::error::Result;
use crate::store::MetadataStore;
use crate::upstream::{IndexSource, UpstreamFetcher};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Settings key holding the offline switch.
pub const OFFLINE_MODE_KEY: &str = "offline_mode";

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    pub store: MetadataStore,
    pub cache: CacheStore,
    /// Where listings and artifacts come from on a miss
    pub upstream: Arc<dyn IndexSource>,
    /// Rewrites upstream hrefs into proxied download URLs
    pub codec: AddressCodec,
    pub started_at: Instant,
}

impl AppState {
    /// Open the metadata database and cache directory named in `config`.
    pub async fn new(config: Config) -> Result<Self> {
        let store = MetadataStore::open(&config.db_path).await?;
        let upstream = UpstreamFetcher::from_config(&config)?;
        Ok(Self::with_source(config, store, Arc::new(upstream)).await)
    }

    /// Build state around an already opened store and any index source.
    pub async fn with_source(
        config: Config,
        store: MetadataStore,
        upstream: Arc<dyn IndexSource>,
    ) -> Self {
        let cache = CacheStore::new(&config.cache_dir, config.cache_layout);
        if !cache.create_directories([&config.cache_dir]).await {
            warn!(
                "Cache directory {} is not writable yet",
                config.cache_dir.display()
            );
        }
        info!(
            "Cache at {} ({} layout), metadata at {}",
            config.cache_dir.display(),
            config.cache_layout,
            config.db_path.display()
        );

        let codec = AddressCodec::new(&config.proxy_base_url, &config.download_endpoint);

        Self {
            config: Arc::new(config),
            store,
            cache,
            upstream,
            codec,
            started_at: Instant::now(),
        }
    }

    pub async fn offline_mode(&self) -> Result<bool> {
        let value = self.store.get_setting(OFFLINE_MODE_KEY, "false").await?;
        Ok(parse_switch(&value))
    }

    pub async fn set_offline_mode(&self, on: bool) -> Result<()> {
        self.store
            .set_setting(OFFLINE_MODE_KEY, if on { "true" } else { "false" })
            .await
    }
}

/// `true`/`on` (any case) switch a flag on; everything else is off.
pub fn parse_switch(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switch_values() {
        assert!(parse_switch("true"));
        assert!(parse_switch(" ON "));
        assert!(!parse_switch("off"));
        assert!(!parse_switch("1"));
        assert!(!parse_switch(""));
    }
}
