//! Page-data use case: serve a key through the cache, fetching from the
//! upstream on demand.

use std::sync::Arc;

use serde_json::Value;
use tracing::instrument;

use crate::cache::{CachedValue, DataCache};
use crate::upstream::Upstream;

use super::error::AppError;

const MAX_KEY_LEN: usize = 256;

#[derive(Clone)]
pub struct DataService {
    cache: DataCache,
    upstream: Arc<dyn Upstream>,
}

impl DataService {
    pub fn new(cache: DataCache, upstream: Arc<dyn Upstream>) -> Self {
        Self { cache, upstream }
    }

    pub fn cache(&self) -> &DataCache {
        &self.cache
    }

    #[instrument(skip_all, fields(cache_key = %key, force_refresh))]
    pub async fn load(&self, key: &str, force_refresh: bool) -> Result<CachedValue<Value>, AppError> {
        validate_key(key)?;

        let upstream = Arc::clone(&self.upstream);
        let owned_key = key.to_string();
        let value = self
            .cache
            .get_or_fetch(
                key,
                move || async move { upstream.fetch(&owned_key).await },
                force_refresh,
            )
            .await?;
        Ok(value)
    }
}

pub fn validate_key(key: &str) -> Result<(), AppError> {
    if key.trim().is_empty() {
        return Err(AppError::validation("cache key must not be empty"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(AppError::validation(format!(
            "cache key exceeds {MAX_KEY_LEN} bytes"
        )));
    }
    if key.chars().any(char::is_control) {
        return Err(AppError::validation("cache key contains control characters"));
    }
    Ok(())
}
