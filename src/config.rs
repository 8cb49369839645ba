//! Engine configuration

use serde::{Deserialize, Serialize};

/// Tunables shared by the merge engine and the bitmap index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Granularity, in bytes, by which growable mappings are extended.
    /// Must be a multiple of the OS page size.
    pub map_growth_granularity: u64,
    /// Default number of values per bitmap index block. Power of two.
    pub index_block_value_count: u64,
    /// Capacity of the copy task ring. Power of two.
    pub copy_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            map_growth_granularity: 16 * 4096, // 64 KB
            index_block_value_count: 256,
            copy_queue_capacity: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_powers_of_two() {
        let config = EngineConfig::default();
        assert!(config.index_block_value_count.is_power_of_two());
        assert!(config.copy_queue_capacity.is_power_of_two());
        assert_eq!(config.map_growth_granularity % 4096, 0);
    }
}
