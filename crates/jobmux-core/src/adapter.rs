//! The `Adapter` trait -- the capability interface each external job
//! platform must satisfy, and a registry of named adapters.
//!
//! Object-safe so it can be stored as `Box<dyn Adapter>` in
//! [`AdapterRegistry`].

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single normalized job posting returned by an adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub title: String,
    pub company: String,
    pub location: String,
    pub date_posted: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub salary: Option<String>,
    pub job_url: Option<String>,
    pub source_platform: String,
}

/// The error category an adapter's failure is classified into. Mirrors the
/// Error Engine's classification outcome so adapters can self-report when
/// they know better than generic pattern-matching (e.g. an HTTP 401 is
/// unambiguously `Authentication`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterErrorCategory {
    Network,
    Authentication,
    RateLimit,
    Parsing,
    Validation,
    Timeout,
    Resource,
    Platform,
    System,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct AdapterError {
    pub category: AdapterErrorCategory,
    pub message: String,
    pub retryable: bool,
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.category, self.message)
    }
}

impl std::error::Error for AdapterError {}

/// Successful result of an adapter search.
#[derive(Debug, Clone)]
pub struct AdapterResult {
    pub records: Vec<JobRecord>,
    pub latency_ms: u64,
    pub cursor: Option<String>,
}

/// Capability interface each external job-board scraper/API must satisfy.
///
/// Implementors wrap a specific platform's search API and translate its
/// results into [`JobRecord`]s.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Platform name, matching a [`crate::registry::PlatformConfig::name`].
    fn name(&self) -> &str;

    /// Search for jobs matching `query` near `location`, returning at most
    /// `limit` records. Implementations should respect `deadline` and
    /// return a `Timeout`-category error if exceeded.
    async fn search(
        &self,
        query: &str,
        location: &str,
        limit: u32,
        deadline: DateTime<Utc>,
    ) -> Result<AdapterResult, AdapterError>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn Adapter) {}
};

/// A named collection of registered [`Adapter`] implementations.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Box<dyn Adapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: impl Adapter + 'static) -> Option<Box<dyn Adapter>> {
        let name = adapter.name().to_string();
        self.adapters.insert(name, Box::new(adapter))
    }

    pub fn get(&self, name: &str) -> Option<&dyn Adapter> {
        self.adapters.get(name).map(|b| b.as_ref())
    }

    pub fn list(&self) -> Vec<&str> {
        self.adapters.keys().map(|s| s.as_str()).collect()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopAdapter {
        platform: String,
    }

    #[async_trait]
    impl Adapter for NoopAdapter {
        fn name(&self) -> &str {
            &self.platform
        }

        async fn search(
            &self,
            _query: &str,
            _location: &str,
            _limit: u32,
            _deadline: DateTime<Utc>,
        ) -> Result<AdapterResult, AdapterError> {
            Ok(AdapterResult {
                records: vec![],
                latency_ms: 0,
                cursor: None,
            })
        }
    }

    #[test]
    fn adapter_is_object_safe() {
        let adapter: Box<dyn Adapter> = Box::new(NoopAdapter {
            platform: "noop".into(),
        });
        assert_eq!(adapter.name(), "noop");
    }

    #[tokio::test]
    async fn registry_register_and_get() {
        let mut registry = AdapterRegistry::new();
        registry.register(NoopAdapter {
            platform: "linkedin".into(),
        });
        let adapter = registry.get("linkedin").expect("registered");
        let result = adapter
            .search("rust", "remote", 10, Utc::now())
            .await
            .expect("noop never fails");
        assert!(result.records.is_empty());
    }
}
