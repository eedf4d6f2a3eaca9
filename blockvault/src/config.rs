//! Archive-wide configuration. These are plain serde-serializable types;
//! loading them from a file or environment is left to the caller (an
//! explicit Non-goal), so the only logic here is `Default` and the small
//! amount of cross-field validation each layer needs at construction time.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockFileConfig {
    /// Pointers per block, including the skiplist forward pointers.
    pub num_ptrs: usize,
    /// Bytes of payload per block.
    pub data_size: usize,
}

impl Default for BlockFileConfig {
    fn default() -> Self {
        Self {
            num_ptrs: 12,
            data_size: 32 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    /// Merkle tree fan-out.
    pub fan_out: usize,
    /// Path the signed tree head (and its rollback pin) are kept at. `None`
    /// disables the pin-file rollback check.
    pub pin_file: Option<String>,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            fan_out: 8,
            pin_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Argon2id parameters for deriving the master key from a password.
    pub argon2_memory_kib: u32,
    pub argon2_iterations: u32,
    pub argon2_parallelism: u32,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            argon2_memory_kib: 64 * 1024,
            argon2_iterations: 3,
            argon2_parallelism: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OramConfig {
    pub enabled: bool,
    /// Stash capacity, in blocks, before `Commit` refuses further writes.
    pub stash_limit: usize,
    /// Number of leaves in the bucket tree. Bounds how many distinct
    /// logical blocks the ORAM layer can address without leaf reuse
    /// collisions becoming frequent enough to matter.
    pub capacity_leaves: u64,
    pub position_map_path: Option<String>,
}

impl Default for OramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            stash_limit: 256,
            capacity_leaves: 4096,
            position_map_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Path to the local WAL's sqlite database.
    pub db_path: String,
    /// Number of un-drained commits before `Start` begins blocking callers.
    pub high_water_mark: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            db_path: "blockvault-wal.sqlite3".to_string(),
            high_water_mark: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub block_file: BlockFileConfig,
    pub integrity: IntegrityConfig,
    pub crypto: CryptoConfig,
    pub oram: OramConfig,
    pub wal: WalConfig,
    pub retry: RetryConfig,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            block_file: BlockFileConfig::default(),
            integrity: IntegrityConfig::default(),
            crypto: CryptoConfig::default(),
            oram: OramConfig::default(),
            wal: WalConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl ArchiveConfig {
    pub fn validate(&self) -> Result<()> {
        if self.block_file.num_ptrs == 0 {
            return Err(Error::Other("block_file.num_ptrs must be nonzero".into()));
        }
        if self.integrity.fan_out < 2 {
            return Err(Error::Other("integrity.fan_out must be at least 2".into()));
        }
        if self.oram.enabled && self.oram.stash_limit == 0 {
            return Err(Error::Other("oram.stash_limit must be nonzero when oram.enabled".into()));
        }
        Ok(())
    }
}
