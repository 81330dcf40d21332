//! Platform Registry: the static, read-mostly catalog of adapter
//! capabilities, regional priorities, and rate limits.
//!
//! Built once from compiled-in defaults (optionally overridden by layered
//! configuration, see `jobmux-cli::config`) and shared read-only via `Arc`.

use std::collections::HashMap;

/// Per-platform capability and concurrency shape.
#[derive(Debug, Clone, PartialEq)]
pub struct PlatformConfig {
    pub name: String,
    pub max_concurrent_requests: u32,
    pub timeout_seconds: u64,
    pub retry_attempts: u32,
    pub rate_limit_per_minute: u32,
    pub priority: u32,
}

/// A resolved region with its ordered platform preference and the keyword
/// set used to detect it from free-text location strings.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionConfig {
    pub name: String,
    pub primary_platforms: Vec<String>,
    pub fallback_platforms: Vec<String>,
    pub location_keywords: Vec<String>,
}

/// Default cap on the ordered primary+fallback platform list a region
/// resolves to when the caller doesn't name platforms explicitly.
pub const DEFAULT_N_MAX: usize = 5;

/// Static catalog of platforms and regions.
#[derive(Debug, Clone)]
pub struct Registry {
    platforms: HashMap<String, PlatformConfig>,
    regions: Vec<RegionConfig>,
}

impl Registry {
    pub fn new(platforms: Vec<PlatformConfig>, regions: Vec<RegionConfig>) -> Self {
        let platforms = platforms.into_iter().map(|p| (p.name.clone(), p)).collect();
        Self { platforms, regions }
    }

    /// The default catalog, grounded in the pre-distillation source's
    /// `multi_platform_config.py` defaults.
    pub fn default_catalog() -> Self {
        let platforms = vec![
            PlatformConfig {
                name: "linkedin".into(),
                max_concurrent_requests: 3,
                timeout_seconds: 45,
                retry_attempts: 3,
                rate_limit_per_minute: 30,
                priority: 1,
            },
            PlatformConfig {
                name: "indeed".into(),
                max_concurrent_requests: 5,
                timeout_seconds: 30,
                retry_attempts: 2,
                rate_limit_per_minute: 60,
                priority: 2,
            },
            PlatformConfig {
                name: "google".into(),
                max_concurrent_requests: 4,
                timeout_seconds: 35,
                retry_attempts: 3,
                rate_limit_per_minute: 45,
                priority: 2,
            },
            PlatformConfig {
                name: "seek".into(),
                max_concurrent_requests: 3,
                timeout_seconds: 40,
                retry_attempts: 3,
                rate_limit_per_minute: 40,
                priority: 1,
            },
            PlatformConfig {
                name: "job_bank_1111".into(),
                max_concurrent_requests: 4,
                timeout_seconds: 30,
                retry_attempts: 2,
                rate_limit_per_minute: 50,
                priority: 1,
            },
            PlatformConfig {
                name: "job_bank_104".into(),
                max_concurrent_requests: 4,
                timeout_seconds: 30,
                retry_attempts: 2,
                rate_limit_per_minute: 50,
                priority: 1,
            },
        ];

        let regions = vec![
            RegionConfig {
                name: "us".into(),
                primary_platforms: vec!["linkedin".into(), "indeed".into(), "google".into()],
                fallback_platforms: vec!["glassdoor".into()],
                location_keywords: vec![
                    "united states".into(),
                    "usa".into(),
                    "america".into(),
                    "new york".into(),
                    "california".into(),
                    "texas".into(),
                ],
            },
            RegionConfig {
                name: "taiwan".into(),
                primary_platforms: vec!["job_bank_1111".into(), "job_bank_104".into()],
                fallback_platforms: vec!["linkedin".into()],
                location_keywords: vec![
                    "taiwan".into(),
                    "taipei".into(),
                    "taichung".into(),
                    "kaohsiung".into(),
                ],
            },
            RegionConfig {
                name: "australia".into(),
                primary_platforms: vec!["seek".into(), "linkedin".into()],
                fallback_platforms: vec!["indeed".into()],
                location_keywords: vec![
                    "australia".into(),
                    "sydney".into(),
                    "melbourne".into(),
                    "brisbane".into(),
                    "perth".into(),
                ],
            },
            RegionConfig {
                name: "global".into(),
                primary_platforms: vec!["linkedin".into(), "indeed".into(), "google".into()],
                fallback_platforms: vec![],
                location_keywords: vec!["remote".into(), "worldwide".into(), "global".into()],
            },
        ];

        Self::new(platforms, regions)
    }

    pub fn platform(&self, name: &str) -> Option<&PlatformConfig> {
        self.platforms.get(name)
    }

    pub fn is_dispatchable(&self, name: &str) -> bool {
        self.platforms.contains_key(name)
    }

    /// Every dispatchable platform name in the catalog, in no particular
    /// order. Used to wire one adapter per known platform at startup.
    pub fn platform_names(&self) -> Vec<&str> {
        self.platforms.keys().map(|s| s.as_str()).collect()
    }

    pub fn region(&self, name: &str) -> Option<&RegionConfig> {
        self.regions.iter().find(|r| r.name == name)
    }

    /// Resolve a region from free-text location, longest matching keyword
    /// wins; ties broken by the order regions were registered (lower index
    /// = higher priority). Falls back to `"global"` when nothing matches.
    pub fn resolve_region(&self, location: &str) -> &str {
        let location = location.to_lowercase();
        let mut best: Option<(&str, usize)> = None;

        for region in &self.regions {
            for keyword in &region.location_keywords {
                if location.contains(keyword.as_str()) {
                    let len = keyword.len();
                    match best {
                        Some((_, best_len)) if best_len >= len => {}
                        _ => best = Some((region.name.as_str(), len)),
                    }
                }
            }
        }

        best.map(|(name, _)| name).unwrap_or("global")
    }

    /// Ordered candidate platform list for a region: primary platforms
    /// first, then fallbacks, skipping any fallback with no registry entry
    /// (recorded by the caller as `degraded_coverage`, never a panic).
    /// Trimmed to [`DEFAULT_N_MAX`] entries.
    pub fn candidate_platforms(&self, region: &str) -> Vec<String> {
        self.candidate_platforms_capped(region, DEFAULT_N_MAX)
    }

    /// Same as [`Registry::candidate_platforms`] but with an explicit
    /// `n_max` cap, for callers that need a narrower or wider bound than
    /// the default.
    pub fn candidate_platforms_capped(&self, region: &str, n_max: usize) -> Vec<String> {
        let Some(region) = self.region(region) else {
            return Vec::new();
        };

        let mut out: Vec<String> = region.primary_platforms.clone();
        for fallback in &region.fallback_platforms {
            if self.is_dispatchable(fallback) {
                out.push(fallback.clone());
            }
        }
        out.truncate(n_max.max(1));
        out
    }

    /// Names of fallback platforms in `region` that carry no registry
    /// entry of their own — used to populate a job's `degraded_coverage`
    /// note rather than silently dropping them.
    pub fn undispatchable_fallbacks(&self, region: &str) -> Vec<String> {
        let Some(region) = self.region(region) else {
            return Vec::new();
        };
        region
            .fallback_platforms
            .iter()
            .filter(|p| !self.is_dispatchable(p))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_has_six_platforms() {
        let registry = Registry::default_catalog();
        for name in [
            "linkedin",
            "indeed",
            "google",
            "seek",
            "job_bank_1111",
            "job_bank_104",
        ] {
            assert!(registry.platform(name).is_some(), "{name} missing");
        }
    }

    #[test]
    fn resolve_region_longest_match_wins() {
        let registry = Registry::default_catalog();
        assert_eq!(registry.resolve_region("San Francisco, California"), "us");
        assert_eq!(registry.resolve_region("Taipei, Taiwan"), "taiwan");
        assert_eq!(registry.resolve_region("Remote, worldwide"), "global");
        assert_eq!(registry.resolve_region("somewhere unlisted"), "global");
    }

    #[test]
    fn glassdoor_fallback_is_not_dispatchable() {
        let registry = Registry::default_catalog();
        assert!(!registry.is_dispatchable("glassdoor"));
        let candidates = registry.candidate_platforms("us");
        assert!(!candidates.contains(&"glassdoor".to_string()));
        assert_eq!(registry.undispatchable_fallbacks("us"), vec!["glassdoor"]);
    }

    #[test]
    fn candidate_platforms_orders_primary_before_fallback() {
        let registry = Registry::default_catalog();
        let candidates = registry.candidate_platforms("taiwan");
        assert_eq!(candidates, vec!["job_bank_1111", "job_bank_104", "linkedin"]);
    }

    #[test]
    fn candidate_platforms_is_trimmed_to_n_max() {
        let registry = Registry::default_catalog();
        let candidates = registry.candidate_platforms_capped("us", 2);
        assert_eq!(candidates, vec!["linkedin", "indeed"]);
        assert!(registry.candidate_platforms("us").len() <= DEFAULT_N_MAX);
    }
}
