//! URL allocator with deterministic candidates and bounded collision retry
//!
//! The first candidate is built from the slugified project name; collisions
//! retry with a `-2`, `-3`, ... suffix up to a bounded attempt count.
//! Reservation and lookup are atomic per URL, so two concurrent allocations
//! can never hand out the same URL.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, warn};

/// URL allocation errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AllocatorError {
    #[error("Invalid project name: {0}")]
    InvalidProjectName(String),

    #[error("URL namespace exhausted for '{slug}' after {attempts} attempts")]
    AllocationExhausted { slug: String, attempts: usize },
}

/// Allocator configuration
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Public domain URLs are built under (e.g. "portshare.dev")
    pub public_domain: String,
    /// URL scheme
    pub scheme: String,
    /// Maximum candidates tried before giving up
    pub max_attempts: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            public_domain: "portshare.dev".to_string(),
            scheme: "https".to_string(),
            max_attempts: 8,
        }
    }
}

#[derive(Debug, Clone)]
struct Reservation {
    owner_id: String,
    project_name: String,
}

/// Reserves collision-free public URLs
pub struct UrlAllocator {
    config: AllocatorConfig,
    /// url -> reservation; private, mutated only through allocate/release
    allocations: DashMap<String, Reservation>,
}

impl UrlAllocator {
    pub fn new(config: AllocatorConfig) -> Self {
        Self {
            config,
            allocations: DashMap::new(),
        }
    }

    /// Validate a project name against DNS-label rules
    ///
    /// 3-63 characters, alphanumeric and hyphens only, no leading or
    /// trailing hyphen. Validation is case-insensitive; candidates are
    /// built from the lowercased name.
    pub fn validate_project_name(&self, name: &str) -> Result<(), AllocatorError> {
        if name.len() < 3 {
            return Err(AllocatorError::InvalidProjectName(
                "Project name too short (minimum 3 characters)".to_string(),
            ));
        }

        if name.len() > 63 {
            return Err(AllocatorError::InvalidProjectName(format!(
                "Project name too long (max 63 characters): {}",
                name.len()
            )));
        }

        if name.starts_with('-') || name.ends_with('-') {
            return Err(AllocatorError::InvalidProjectName(
                "Project name cannot start or end with hyphen".to_string(),
            ));
        }

        for ch in name.chars() {
            if !ch.is_ascii_alphanumeric() && ch != '-' {
                return Err(AllocatorError::InvalidProjectName(format!(
                    "Project name contains invalid character '{}' (only alphanumeric and hyphens allowed)",
                    ch
                )));
            }
        }

        Ok(())
    }

    /// Reserve a public URL for `(owner_id, project_name)`
    ///
    /// The reservation must be released if the caller's own setup fails
    /// afterwards; the allocator has no idea whether a registry insert
    /// succeeded.
    pub fn allocate(&self, owner_id: &str, project_name: &str) -> Result<String, AllocatorError> {
        self.validate_project_name(project_name)?;
        let slug = project_name.to_ascii_lowercase();

        for attempt in 1..=self.config.max_attempts {
            let host = if attempt == 1 {
                format!("{}.{}", slug, self.config.public_domain)
            } else {
                format!("{}-{}.{}", slug, attempt, self.config.public_domain)
            };
            let url = format!("{}://{}", self.config.scheme, host);

            match self.allocations.entry(url.clone()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(vacant) => {
                    vacant.insert(Reservation {
                        owner_id: owner_id.to_string(),
                        project_name: project_name.to_string(),
                    });
                    debug!(owner_id = %owner_id, url = %url, attempt, "Allocated public URL");
                    return Ok(url);
                }
            }
        }

        warn!(
            owner_id = %owner_id,
            slug = %slug,
            attempts = self.config.max_attempts,
            "URL allocation exhausted"
        );
        Err(AllocatorError::AllocationExhausted {
            slug,
            attempts: self.config.max_attempts,
        })
    }

    /// Release a reserved URL, making it available again
    ///
    /// Returns whether a reservation was actually released; releasing an
    /// unknown URL is logged as an anomaly but is not an error.
    pub fn release(&self, url: &str) -> bool {
        match self.allocations.remove(url) {
            Some((_, reservation)) => {
                debug!(
                    url = %url,
                    owner_id = %reservation.owner_id,
                    project = %reservation.project_name,
                    "Released public URL"
                );
                true
            }
            None => {
                warn!(url = %url, "Attempted to release unallocated URL");
                false
            }
        }
    }

    /// Whether a URL is currently reserved
    pub fn is_allocated(&self, url: &str) -> bool {
        self.allocations.contains_key(url)
    }

    /// Number of live reservations
    pub fn count(&self) -> usize {
        self.allocations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_allocator() -> UrlAllocator {
        UrlAllocator::new(AllocatorConfig::default())
    }

    #[test]
    fn test_allocate_builds_deterministic_url() {
        let allocator = test_allocator();
        let url = allocator.allocate("u1", "demo").unwrap();
        assert_eq!(url, "https://demo.portshare.dev");
        assert!(allocator.is_allocated(&url));
    }

    #[test]
    fn test_collision_retries_with_suffix() {
        let allocator = test_allocator();

        let first = allocator.allocate("u1", "demo").unwrap();
        let second = allocator.allocate("u2", "demo").unwrap();
        let third = allocator.allocate("u3", "demo").unwrap();

        assert_eq!(first, "https://demo.portshare.dev");
        assert_eq!(second, "https://demo-2.portshare.dev");
        assert_eq!(third, "https://demo-3.portshare.dev");
    }

    #[test]
    fn test_allocation_exhausted_after_bounded_attempts() {
        let allocator = UrlAllocator::new(AllocatorConfig {
            max_attempts: 2,
            ..Default::default()
        });

        allocator.allocate("u1", "demo").unwrap();
        allocator.allocate("u2", "demo").unwrap();

        let result = allocator.allocate("u3", "demo");
        assert_eq!(
            result,
            Err(AllocatorError::AllocationExhausted {
                slug: "demo".to_string(),
                attempts: 2,
            })
        );
    }

    #[test]
    fn test_release_makes_url_reusable() {
        let allocator = test_allocator();

        let url = allocator.allocate("u1", "demo").unwrap();
        assert!(allocator.release(&url));
        assert!(!allocator.is_allocated(&url));

        // The base candidate is free again
        let again = allocator.allocate("u2", "demo").unwrap();
        assert_eq!(again, url);
    }

    #[test]
    fn test_release_unknown_url_is_not_an_error() {
        let allocator = test_allocator();
        assert!(!allocator.release("https://ghost.portshare.dev"));
    }

    #[test]
    fn test_slug_is_lowercased() {
        let allocator = test_allocator();
        let url = allocator.allocate("u1", "MyDemo").unwrap();
        assert_eq!(url, "https://mydemo.portshare.dev");
    }

    #[test]
    fn test_project_name_validation() {
        let allocator = test_allocator();

        assert!(allocator.validate_project_name("my-app").is_ok());
        assert!(allocator.validate_project_name("api-v2").is_ok());
        assert!(allocator.validate_project_name("demo123").is_ok());

        assert!(allocator.validate_project_name("").is_err());
        assert!(allocator.validate_project_name("ab").is_err());
        assert!(allocator.validate_project_name(&"a".repeat(64)).is_err());
        assert!(allocator.validate_project_name("-app").is_err());
        assert!(allocator.validate_project_name("app-").is_err());
        assert!(allocator.validate_project_name("my_app").is_err());
        assert!(allocator.validate_project_name("my.app").is_err());
    }

    #[test]
    fn test_concurrent_allocations_are_unique() {
        use std::sync::Arc;

        let allocator = Arc::new(test_allocator());
        let mut handles = Vec::new();

        for i in 0..8 {
            let allocator = allocator.clone();
            handles.push(std::thread::spawn(move || {
                allocator.allocate(&format!("u{}", i), "shared").unwrap()
            }));
        }

        let mut urls: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        urls.sort();
        urls.dedup();
        assert_eq!(urls.len(), 8, "Concurrent allocations must never collide");
    }
}
