use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::env;

/// Engine-level tuning knobs. Built once from the environment via the
/// global [`config()`] singleton, or constructed directly for tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard ceiling on requested page sizes; larger requests are clamped.
    pub max_page_size: u32,
    /// Page size used when the caller does not ask for one.
    pub default_page_size: u32,
    /// Currency stamped onto lazily created wallets.
    pub default_currency: String,
    /// Queries slower than this are logged at WARN.
    pub slow_query_warn_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_page_size: 100,
            default_page_size: 25,
            default_currency: "USD".to_string(),
            slow_query_warn_ms: 250,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        // Pick up .env so local runs and tests see the same knobs
        let _ = dotenvy::dotenv();

        Self::default().with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = env::var("TENANTRY_MAX_PAGE_SIZE") {
            self.max_page_size = v.parse().unwrap_or(self.max_page_size);
        }
        if let Ok(v) = env::var("TENANTRY_DEFAULT_PAGE_SIZE") {
            self.default_page_size = v.parse().unwrap_or(self.default_page_size);
        }
        if let Ok(v) = env::var("TENANTRY_DEFAULT_CURRENCY") {
            if !v.trim().is_empty() {
                self.default_currency = v;
            }
        }
        if let Ok(v) = env::var("TENANTRY_SLOW_QUERY_WARN_MS") {
            self.slow_query_warn_ms = v.parse().unwrap_or(self.slow_query_warn_ms);
        }

        // A default page size above the ceiling would make every unpaged
        // list request invalid; clamp it here once instead of per call.
        if self.default_page_size > self.max_page_size {
            self.default_page_size = self.max_page_size;
        }

        self
    }
}

static CONFIG: Lazy<EngineConfig> = Lazy::new(EngineConfig::from_env);

/// Process-wide configuration singleton.
pub fn config() -> &'static EngineConfig {
    &CONFIG
}
