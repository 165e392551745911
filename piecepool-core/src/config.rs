//! Centralized configuration for piecepool.
//!
//! All tunable parameters are defined here to avoid hard-coded values
//! scattered throughout the codebase. Values are fixed once a cache is built.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::cache::chunk::DEFAULT_CHUNK_SIZE;
use crate::cache::{CacheError, EvictionPolicy, LeastRecentlyUsed, NoEviction};

/// Central configuration for all piecepool components.
#[derive(Debug, Clone, Default)]
pub struct PiecepoolConfig {
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

/// Slot pool sizing and reclamation.
///
/// Slot size must be at least the largest piece stored in the pool; chunk
/// size is the granularity of write coverage tracking.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Number of slot buffers in the pool
    pub slot_count: usize,
    /// Bytes per slot buffer
    pub slot_size: usize,
    /// Coverage tracking unit in bytes
    pub chunk_size: u32,
    /// What happens when a claim finds the pool full
    pub eviction: EvictionMode,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            slot_count: 16,
            slot_size: 4 * 1024 * 1024, // 4 MiB
            chunk_size: DEFAULT_CHUNK_SIZE,
            eviction: EvictionMode::Disabled,
        }
    }
}

impl CacheConfig {
    /// Creates a pool of `slot_count` slots sized for `max_piece_length`.
    pub fn for_pieces(slot_count: usize, max_piece_length: usize) -> Self {
        Self {
            slot_count,
            slot_size: max_piece_length,
            ..Default::default()
        }
    }

    /// Creates the largest pool of `max_piece_length` slots fitting `budget` bytes.
    ///
    /// At least one slot is always configured.
    pub fn from_memory_budget(budget: usize, max_piece_length: usize) -> Self {
        let slot_count = budget.checked_div(max_piece_length).unwrap_or(0).max(1);
        Self::for_pieces(slot_count, max_piece_length)
    }

    /// Creates a small configuration for tests: 2 slots of 32 KiB.
    pub fn for_testing() -> Self {
        Self::for_pieces(2, 32 * 1024)
    }

    /// Sets the eviction mode.
    pub fn with_eviction(mut self, eviction: EvictionMode) -> Self {
        self.eviction = eviction;
        self
    }

    /// Total bytes held by all slot buffers.
    pub fn memory_budget(&self) -> u64 {
        self.slot_count as u64 * self.slot_size as u64
    }

    /// Checks the configuration can back a pool.
    ///
    /// # Errors
    ///
    /// - `CacheError::InvalidConfiguration` - If any size is zero or chunks exceed slots
    pub fn validate(&self) -> Result<(), CacheError> {
        let reason = if self.slot_count == 0 {
            "slot count must be positive"
        } else if self.slot_size == 0 {
            "slot size must be positive"
        } else if self.chunk_size == 0 {
            "chunk size must be positive"
        } else if self.chunk_size as usize > self.slot_size {
            "chunk size must not exceed slot size"
        } else {
            return Ok(());
        };

        Err(CacheError::InvalidConfiguration {
            reason: reason.to_string(),
        })
    }

    /// Applies `PIECEPOOL_*` environment overrides.
    ///
    /// Unparseable values are ignored and the current setting is kept.
    pub fn apply_env(&mut self) {
        if let Some(count) = env_value::<usize>("PIECEPOOL_SLOT_COUNT") {
            self.slot_count = count;
        }

        if let Some(size) = env_value::<usize>("PIECEPOOL_SLOT_SIZE") {
            self.slot_size = size;
        }

        if let Some(size) = env_value::<u32>("PIECEPOOL_CHUNK_SIZE") {
            self.chunk_size = size;
        }

        if let Some(mode) = env_value::<EvictionMode>("PIECEPOOL_EVICTION") {
            self.eviction = mode;
        }

        if let Some(millis) = env_value::<u64>("PIECEPOOL_EVICTION_MIN_IDLE_MS") {
            if let EvictionMode::LeastRecentlyUsed { min_idle } = &mut self.eviction {
                *min_idle = Duration::from_millis(millis);
            }
        }
    }
}

/// Reclamation behavior when every slot is occupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionMode {
    /// Claims fail until a slot is released explicitly
    #[default]
    Disabled,
    /// Coldest unpinned piece idle for at least `min_idle` is reclaimed
    LeastRecentlyUsed { min_idle: Duration },
}

impl EvictionMode {
    /// Builds the policy object for this mode.
    pub fn build_policy(&self) -> Box<dyn EvictionPolicy> {
        match self {
            EvictionMode::Disabled => Box::new(NoEviction),
            EvictionMode::LeastRecentlyUsed { min_idle } => {
                Box::new(LeastRecentlyUsed::with_min_idle(*min_idle))
            }
        }
    }
}

impl FromStr for EvictionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "disabled" | "none" => Ok(EvictionMode::Disabled),
            "lru" => Ok(EvictionMode::LeastRecentlyUsed {
                min_idle: Duration::ZERO,
            }),
            _ => Err(format!("Invalid eviction mode: {s}")),
        }
    }
}

impl std::fmt::Display for EvictionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictionMode::Disabled => write!(f, "disabled"),
            EvictionMode::LeastRecentlyUsed { .. } => write!(f, "lru"),
        }
    }
}

/// Log output configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Directory receiving the full debug log of each run
    pub logs_dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            logs_dir: PathBuf::from("logs"),
        }
    }
}

impl PiecepoolConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.cache.apply_env();

        if let Ok(dir) = std::env::var("PIECEPOOL_LOGS_DIR") {
            config.logging.logs_dir = PathBuf::from(dir);
        }

        config
    }

    /// Creates a configuration optimized for testing.
    pub fn for_testing() -> Self {
        Self {
            cache: CacheConfig::for_testing(),
            ..Default::default()
        }
    }
}

fn env_value<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}
