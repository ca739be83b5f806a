//! Configuration management for TrieVault
//!
//! Provides tier-size presets for different hardware classes and
//! validation of custom configurations.

use crate::error::{TrieError, TrieResult};
use crate::page::{MAX_SMALL_OBJECT, PAGE_SIZE};

/// Largest revision ring. A root shared by every slot, plus the one extra
/// reference a writer holds while it replaces a shared node, must still fit
/// the 16-bit refcount.
pub const MAX_REVISIONS: u32 = u16::MAX as u32 - 1;

/// TrieVault configuration with memory tier presets
#[derive(Debug, Clone)]
pub struct Config {
    /// Size of the hot (cached, MRU-tracked) tier in bytes
    pub hot_bytes: u64,
    /// Size of the cold (evicted) tier in bytes
    pub cold_bytes: u64,
    /// Size of the big-object segment in bytes
    pub big_bytes: u64,
    /// Capacity of the object directory
    pub max_objects: u32,
    /// Number of revision slots in the revision ring
    pub max_revisions: u32,
    /// Maximum key size in bytes
    pub max_key_size: usize,
    /// Maximum value size in bytes
    pub max_value_size: usize,
    /// Objects at or above this size bypass the page allocator
    pub big_object_threshold: usize,
    /// Entries a value cluster may hold before it refactors into branches; 0 disables clusters
    pub max_cluster_entries: usize,
}

impl Config {
    /// Server-class: 4GB hot tier backed by a 16GB cold tier
    pub fn server() -> Self {
        Self {
            hot_bytes: 4 * 1024 * 1024 * 1024,
            cold_bytes: 16 * 1024 * 1024 * 1024,
            big_bytes: 4 * 1024 * 1024 * 1024,
            max_objects: 1 << 30,
            max_revisions: MAX_REVISIONS,
            max_key_size: 1024,
            max_value_size: 32 * 1024 * 1024,
            big_object_threshold: MAX_SMALL_OBJECT,
            max_cluster_entries: 16,
        }
    }

    /// Phone-class: 256MB hot tier, 1GB cold tier
    pub fn phone() -> Self {
        Self {
            hot_bytes: 256 * 1024 * 1024,
            cold_bytes: 1024 * 1024 * 1024,
            big_bytes: 256 * 1024 * 1024,
            max_objects: 1 << 26,
            max_revisions: 1 << 12,
            max_key_size: 512,
            max_value_size: 16 * 1024 * 1024,
            big_object_threshold: MAX_SMALL_OBJECT,
            max_cluster_entries: 16,
        }
    }

    /// Budget-class: 32MB hot tier, 128MB cold tier
    pub fn budget() -> Self {
        Self {
            hot_bytes: 32 * 1024 * 1024,
            cold_bytes: 128 * 1024 * 1024,
            big_bytes: 32 * 1024 * 1024,
            max_objects: 1 << 22,
            max_revisions: 1 << 8,
            max_key_size: 256,
            max_value_size: 8 * 1024 * 1024,
            big_object_threshold: MAX_SMALL_OBJECT,
            max_cluster_entries: 8,
        }
    }

    /// Tiny arenas for tests: a handful of hot pages so eviction happens quickly
    pub fn testing() -> Self {
        Self {
            hot_bytes: 64 * PAGE_SIZE as u64,
            cold_bytes: 1024 * PAGE_SIZE as u64,
            big_bytes: 256 * PAGE_SIZE as u64,
            max_objects: 1 << 16,
            max_revisions: 64,
            max_key_size: 256,
            max_value_size: 64 * 1024,
            big_object_threshold: MAX_SMALL_OBJECT,
            max_cluster_entries: 8,
        }
    }

    /// Same as `self` with value clusters switched off.
    pub fn without_clusters(mut self) -> Self {
        self.max_cluster_entries = 0;
        self
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> TrieResult<()> {
        let page = PAGE_SIZE as u64;
        for (name, bytes) in [
            ("hot_bytes", self.hot_bytes),
            ("cold_bytes", self.cold_bytes),
            ("big_bytes", self.big_bytes),
        ] {
            if bytes % page != 0 {
                return Err(invalid(format!("{} must be a multiple of {}", name, PAGE_SIZE)));
            }
            // header + list pages + at least a few object pages
            if bytes < 8 * page {
                return Err(invalid(format!("{} must be at least {} bytes", name, 8 * page)));
            }
            if bytes / page > u32::MAX as u64 {
                return Err(invalid(format!("{} exceeds the 32-bit page space", name)));
            }
            if bytes >= 1 << 46 {
                return Err(invalid(format!("{} exceeds the 46-bit offset space", name)));
            }
        }
        if self.max_objects < 16 || self.max_objects == u32::MAX {
            return Err(invalid("max_objects must be in [16, 2^32 - 1)".into()));
        }
        if self.max_revisions == 0 || self.max_revisions > MAX_REVISIONS {
            return Err(invalid(format!("max_revisions must be in [1, {}]", MAX_REVISIONS)));
        }
        if self.max_key_size == 0 || self.max_key_size > u16::MAX as usize {
            return Err(invalid("max_key_size must be in [1, 65535]".into()));
        }
        if self.max_value_size == 0 || self.max_value_size > u32::MAX as usize - 16 {
            return Err(invalid("max_value_size must be in [1, 4GB)".into()));
        }
        if self.big_object_threshold < 64 || self.big_object_threshold > MAX_SMALL_OBJECT {
            return Err(invalid(format!(
                "big_object_threshold must be in [64, {}]",
                MAX_SMALL_OBJECT
            )));
        }
        if self.max_cluster_entries > 255 {
            return Err(invalid("max_cluster_entries must be <= 255".into()));
        }
        Ok(())
    }
}

fn invalid(message: String) -> TrieError {
    TrieError::InvalidConfig(message)
}

impl Default for Config {
    fn default() -> Self { Self::server() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_presets_valid() {
        assert!(Config::server().validate().is_ok());
        assert!(Config::phone().validate().is_ok());
        assert!(Config::budget().validate().is_ok());
        assert!(Config::testing().validate().is_ok());
    }

    #[test]
    fn test_tier_ordering() {
        let s = Config::server();
        let p = Config::phone();
        let b = Config::budget();
        assert!(s.hot_bytes > p.hot_bytes);
        assert!(p.hot_bytes > b.hot_bytes);
        assert!(s.cold_bytes > p.cold_bytes);
        assert!(p.cold_bytes > b.cold_bytes);
    }

    #[test]
    fn test_rejects_unaligned_tier() {
        let mut config = Config::testing();
        config.hot_bytes += 1;
        assert!(matches!(config.validate(), Err(TrieError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_revision_ring_overflow() {
        let mut config = Config::testing();
        config.max_revisions = MAX_REVISIONS;
        assert!(config.validate().is_ok());
        config.max_revisions = MAX_REVISIONS + 1;
        assert!(config.validate().is_err());
        config.max_revisions = 1 << 16;
        assert!(config.validate().is_err());
        config.max_revisions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_oversized_threshold() {
        let mut config = Config::testing();
        config.big_object_threshold = PAGE_SIZE;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_without_clusters() {
        let config = Config::testing().without_clusters();
        assert_eq!(config.max_cluster_entries, 0);
        assert!(config.validate().is_ok());
    }
}
