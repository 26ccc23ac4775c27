//! Configuration for the engine.

/// Tunables recognized by the engine core.
///
/// Log verbosity is an observer concern: the embedding process configures
/// its own `tracing` subscriber.
#[derive(Debug, Clone)]
pub struct KvConfig {
    /// MemTable flush threshold in megabytes. Default: 64.
    pub max_memtable_size_mb: usize,

    /// Period of the background compaction tick. Default: 60 000 ms.
    pub compaction_interval_ms: u64,

    /// Whether newly built runs carry a bloom filter. Default: true.
    pub enable_bloom_filter: bool,

    /// Period of the background TTL sweep. Default: 1 000 ms.
    pub sweep_interval_ms: u64,

    /// How many keys each TTL sweep samples. Default: 20.
    pub sweep_sample_size: usize,

    /// Capacity of the command request channel. Default: 1 024.
    pub channel_capacity: usize,

    /// Capacity of the event broadcast channel. Default: 256.
    pub event_capacity: usize,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            max_memtable_size_mb: 64,
            compaction_interval_ms: 60_000,
            enable_bloom_filter: true,
            sweep_interval_ms: 1_000,
            sweep_sample_size: 20,
            channel_capacity: 1_024,
            event_capacity: 256,
        }
    }
}

impl KvConfig {
    /// The MemTable flush threshold in bytes.
    pub fn memtable_size_bytes(&self) -> usize {
        self.max_memtable_size_mb * 1024 * 1024
    }

    /// Builder-style: set the MemTable flush threshold in MB.
    pub fn with_max_memtable_size_mb(mut self, mb: usize) -> Self {
        self.max_memtable_size_mb = mb;
        self
    }

    /// Builder-style: set the compaction tick period.
    pub fn with_compaction_interval_ms(mut self, ms: u64) -> Self {
        self.compaction_interval_ms = ms;
        self
    }

    /// Builder-style: enable or disable bloom filters on runs.
    pub fn with_bloom_filter(mut self, enabled: bool) -> Self {
        self.enable_bloom_filter = enabled;
        self
    }

    /// Builder-style: set the TTL sweep period.
    pub fn with_sweep_interval_ms(mut self, ms: u64) -> Self {
        self.sweep_interval_ms = ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = KvConfig::default();
        assert_eq!(config.max_memtable_size_mb, 64);
        assert_eq!(config.memtable_size_bytes(), 64 * 1024 * 1024);
        assert_eq!(config.compaction_interval_ms, 60_000);
        assert!(config.enable_bloom_filter);
    }

    #[test]
    fn test_builder_methods() {
        let config = KvConfig::default()
            .with_max_memtable_size_mb(1)
            .with_compaction_interval_ms(100)
            .with_bloom_filter(false);
        assert_eq!(config.memtable_size_bytes(), 1024 * 1024);
        assert_eq!(config.compaction_interval_ms, 100);
        assert!(!config.enable_bloom_filter);
    }
}
