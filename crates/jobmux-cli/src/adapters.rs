//! Adapter wiring for the `jobmux` binary.
//!
//! The scrapers/APIs behind each job platform are an external collaborator:
//! only the [`jobmux_core::adapter::Adapter`] contract is this crate's
//! concern. `PlaceholderAdapter` stands in for a real platform integration
//! so `jobmux serve` has something to dispatch to; swap it for a real
//! implementation per platform when one exists.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use jobmux_core::adapter::{Adapter, AdapterRegistry, AdapterResult, JobRecord};
use jobmux_core::registry::Registry;

struct PlaceholderAdapter {
    platform: String,
}

#[async_trait]
impl Adapter for PlaceholderAdapter {
    fn name(&self) -> &str {
        &self.platform
    }

    async fn search(
        &self,
        query: &str,
        location: &str,
        limit: u32,
        _deadline: DateTime<Utc>,
    ) -> Result<AdapterResult, jobmux_core::adapter::AdapterError> {
        let records = (0..limit.min(5))
            .map(|i| JobRecord {
                title: format!("{query} ({} #{i})", self.platform),
                company: "placeholder".to_string(),
                location: location.to_string(),
                date_posted: Some(Utc::now()),
                description: None,
                salary: None,
                job_url: None,
                source_platform: self.platform.clone(),
            })
            .collect();
        Ok(AdapterResult {
            records,
            latency_ms: 1,
            cursor: None,
        })
    }
}

/// Register one [`PlaceholderAdapter`] per platform in the registry's
/// catalog, so a freshly started server can accept submissions without a
/// real scraper configured.
pub fn build_placeholder_registry(registry: &Registry) -> AdapterRegistry {
    let mut adapters = AdapterRegistry::new();
    for platform in registry.platform_names() {
        adapters.register(PlaceholderAdapter {
            platform: platform.to_string(),
        });
    }
    adapters
}
