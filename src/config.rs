//! Configuration: flash geometry and FTL tuning knobs.
//!
//! Both sections deserialize from TOML with every field optional; missing
//! fields take the defaults below. `CHUNK_FTL__<section>__<field>`
//! environment variables override individual values.

use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Bytes taken by one back-pointer entry on flash.
pub const BACK_POINTER_BYTES: u32 = 4;

/// Errors returned by configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
    /// The values parse but describe an impossible device.
    #[error("invalid geometry: {0}")]
    Geometry(String),
}

/// Physical layout of the flash array and the logical space exported on top.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Geometry {
    /// Number of banks. Bank `b` sits on channel `b % channels`.
    pub banks: u32,
    pub channels: u32,
    /// Log blocks managed per bank (clean list + heaps + active logs).
    pub log_blocks_per_bank: u32,
    /// Physical blocks at the start of each bank kept out of the log pool.
    pub reserved_blocks_per_bank: u32,
    pub pages_per_block: u32,
    pub sectors_per_page: u32,
    pub sectors_per_chunk: u32,
    pub bytes_per_sector: u32,
    /// Payload chunks that fit in a recycled (encoded) low page.
    pub chunks_per_recycled_page: u32,
    /// Logical pages exported to the host.
    pub logical_pages: u32,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            banks: 8,
            channels: 4,
            log_blocks_per_bank: 64,
            reserved_blocks_per_bank: 2,
            pages_per_block: 128,
            sectors_per_page: 64,
            sectors_per_chunk: 8,
            bytes_per_sector: 512,
            chunks_per_recycled_page: 3,
            logical_pages: 49_152,
        }
    }
}

impl Geometry {
    pub fn chunks_per_page(&self) -> u32 {
        self.sectors_per_page / self.sectors_per_chunk
    }

    pub fn bytes_per_chunk(&self) -> usize {
        (self.sectors_per_chunk * self.bytes_per_sector) as usize
    }

    pub fn bytes_per_page(&self) -> usize {
        (self.sectors_per_page * self.bytes_per_sector) as usize
    }

    pub fn chunks_per_block(&self) -> u32 {
        self.pages_per_block * self.chunks_per_page()
    }

    /// Number of banks sharing one channel.
    pub fn columns(&self) -> u32 {
        self.banks / self.channels
    }

    /// Low pages of an MLC block: page 0 and every odd page.
    pub fn is_low_page(&self, page: u32) -> bool {
        page == 0 || page % 2 == 1
    }

    /// Last page that carries data in a completed block.
    pub fn last_data_page(&self) -> u32 {
        self.pages_per_block - 2
    }

    /// Page holding the back-pointer list of a completed block.
    pub fn list_page(&self) -> u32 {
        self.pages_per_block - 1
    }

    /// Last low page written during the first (hot) use of a block.
    pub fn first_usage_last_page(&self) -> u32 {
        self.pages_per_block - 5
    }

    /// Page holding the back-pointer list written after the first use.
    pub fn first_usage_list_page(&self) -> u32 {
        self.pages_per_block - 3
    }

    /// Sectors needed to store a block's back-pointer list.
    pub fn list_sectors(&self) -> u32 {
        let bytes = self.chunks_per_block() * BACK_POINTER_BYTES;
        bytes.div_ceil(self.bytes_per_sector)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: String| Err(ConfigError::Geometry(msg));

        if self.banks == 0 || self.channels == 0 || self.banks % self.channels != 0 {
            return fail(format!(
                "{} banks cannot be spread evenly over {} channels",
                self.banks, self.channels
            ));
        }
        if self.pages_per_block < 8 || self.pages_per_block % 2 != 0 {
            return fail(format!(
                "pages_per_block must be even and at least 8, got {}",
                self.pages_per_block
            ));
        }
        if self.sectors_per_chunk == 0
            || self.bytes_per_sector == 0
            || self.sectors_per_page % self.sectors_per_chunk != 0
        {
            return fail(format!(
                "{} sectors per chunk do not tile a {}-sector page",
                self.sectors_per_chunk, self.sectors_per_page
            ));
        }
        if self.chunks_per_page() < 2 {
            return fail("a page must hold at least two chunks".to_string());
        }
        if self.chunks_per_recycled_page == 0
            || self.chunks_per_recycled_page >= self.chunks_per_page()
        {
            return fail(format!(
                "chunks_per_recycled_page must be in 1..{}, got {}",
                self.chunks_per_page(),
                self.chunks_per_recycled_page
            ));
        }
        if self.list_sectors() > self.sectors_per_page {
            return fail(format!(
                "back-pointer list of {} entries does not fit in a page",
                self.chunks_per_block()
            ));
        }
        if self.log_blocks_per_bank < 4 {
            return fail(format!(
                "need at least 4 log blocks per bank, got {}",
                self.log_blocks_per_bank
            ));
        }
        if self.logical_pages == 0
            || u64::from(self.logical_pages) * u64::from(self.chunks_per_page()) > u64::from(u32::MAX)
            || self.logical_pages - 1 > crate::address::MAX_LOGICAL_PAGE
        {
            return fail(format!("unsupported logical page count {}", self.logical_pages));
        }
        Ok(())
    }
}

/// How a first-usage hot block is judged ready for its second pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReuseStrategy {
    /// Sliding-window threshold with step-up/step-down hysteresis.
    Adaptive,
    /// Reuse whenever the first-usage candidate holds fewer valid chunks
    /// than the best GC candidate.
    Greedy,
}

impl std::str::FromStr for ReuseStrategy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "adaptive" => Ok(Self::Adaptive),
            "greedy" => Ok(Self::Greedy),
            _ => Err(()),
        }
    }
}

/// Opt-in fault injection for recycled-page programs.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WomFaultConfig {
    /// Percentage of recycled-page programs that succeed.
    pub success_rate: f64,
    pub seed: u64,
}

impl Default for WomFaultConfig {
    /// Every program succeeds until a rate is configured.
    fn default() -> Self {
        Self { success_rate: 100.0, seed: 0 }
    }
}

/// Policy knobs of the log, reuse and GC machinery.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Tuning {
    /// Initial first-usage occupancy above which a hot block is reused.
    pub hot_first_accumulated: u32,
    /// Clean blocks the hot log insists on after taking a fresh block.
    pub clean_blocks_after_gc_hot: u32,
    /// Clean blocks kept in reserve before reuse or GC kicks in.
    pub min_clean_blocks: u32,
    pub second_hot_factor_num: u32,
    pub second_hot_factor_den: u32,
    /// Clean list size under which a peer bank joins a GC round.
    pub background_gc_threshold: u32,
    /// Low pages holding fewer valid chunks than this are relocated and reused.
    pub valid_chunks_in_page_to_reuse_threshold: u32,
    pub adaptive_window_size: usize,
    pub max_step_ups: u32,
    pub max_step_downs: u32,
    pub init_step_up: u32,
    pub init_step_down: u32,
    /// The adaptive threshold only steps up while below this value.
    pub threshold_ceiling: u32,
    /// The adaptive threshold only steps down while above this value.
    pub threshold_floor: u32,
    pub reuse_strategy: ReuseStrategy,
    /// Let the cold log take over first-usage blocks before drawing clean ones.
    pub reuse_blocks_for_cold: bool,
    /// Merge partial updates of staged chunks in place.
    pub dram_absorb: bool,
    /// Polls of the host ring before a sub-page write gives up.
    pub max_backpressure_polls: u64,
    pub wom_fault: Option<WomFaultConfig>,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            hot_first_accumulated: 8,
            clean_blocks_after_gc_hot: 2,
            min_clean_blocks: 2,
            second_hot_factor_num: 1,
            second_hot_factor_den: 1,
            background_gc_threshold: 1,
            valid_chunks_in_page_to_reuse_threshold: 0,
            adaptive_window_size: 5,
            max_step_ups: 7,
            max_step_downs: 7,
            init_step_up: 1,
            init_step_down: 1,
            threshold_ceiling: 112,
            threshold_floor: 5,
            reuse_strategy: ReuseStrategy::Adaptive,
            reuse_blocks_for_cold: true,
            dram_absorb: true,
            max_backpressure_polls: 1_000_000,
            wom_fault: None,
        }
    }
}

impl Tuning {
    pub fn validate(&self, geometry: &Geometry) -> Result<(), ConfigError> {
        if self.second_hot_factor_den == 0 {
            return Err(ConfigError::InvalidValue {
                key: "tuning.second_hot_factor_den".to_string(),
                value: "0".to_string(),
            });
        }
        if self.adaptive_window_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "tuning.adaptive_window_size".to_string(),
                value: "0".to_string(),
            });
        }
        // The active hot and cold blocks plus the reserve must fit in the pool.
        if self.min_clean_blocks.max(self.clean_blocks_after_gc_hot) + 2 > geometry.log_blocks_per_bank {
            return Err(ConfigError::Geometry(format!(
                "{} log blocks per bank cannot keep {} clean blocks in reserve",
                geometry.log_blocks_per_bank,
                self.min_clean_blocks.max(self.clean_blocks_after_gc_hot)
            )));
        }
        if let Some(wom) = self.wom_fault {
            if !(0.0..=100.0).contains(&wom.success_rate) {
                return Err(ConfigError::InvalidValue {
                    key: "tuning.wom_fault.success_rate".to_string(),
                    value: wom.success_rate.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Top-level configuration schema.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct FtlConfig {
    pub geometry: Geometry,
    pub tuning: Tuning,
}

impl FtlConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Load from the file named by `CHUNK_FTL_CONFIG` (if set), then apply
    /// `CHUNK_FTL__section__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let mut config = match env::var("CHUNK_FTL_CONFIG").ok() {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            if !key.starts_with("CHUNK_FTL__") {
                continue;
            }
            let path = key["CHUNK_FTL__".len()..].to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim();
            let g = &mut self.geometry;
            let t = &mut self.tuning;

            match parts.as_slice() {
                ["geometry", "banks"] => g.banks = parse_value(&key, value)?,
                ["geometry", "channels"] => g.channels = parse_value(&key, value)?,
                ["geometry", "log_blocks_per_bank"] => g.log_blocks_per_bank = parse_value(&key, value)?,
                ["geometry", "reserved_blocks_per_bank"] => {
                    g.reserved_blocks_per_bank = parse_value(&key, value)?
                }
                ["geometry", "pages_per_block"] => g.pages_per_block = parse_value(&key, value)?,
                ["geometry", "sectors_per_page"] => g.sectors_per_page = parse_value(&key, value)?,
                ["geometry", "sectors_per_chunk"] => g.sectors_per_chunk = parse_value(&key, value)?,
                ["geometry", "bytes_per_sector"] => g.bytes_per_sector = parse_value(&key, value)?,
                ["geometry", "chunks_per_recycled_page"] => {
                    g.chunks_per_recycled_page = parse_value(&key, value)?
                }
                ["geometry", "logical_pages"] => g.logical_pages = parse_value(&key, value)?,
                ["tuning", "hot_first_accumulated"] => t.hot_first_accumulated = parse_value(&key, value)?,
                ["tuning", "clean_blocks_after_gc_hot"] => {
                    t.clean_blocks_after_gc_hot = parse_value(&key, value)?
                }
                ["tuning", "min_clean_blocks"] => t.min_clean_blocks = parse_value(&key, value)?,
                ["tuning", "second_hot_factor_num"] => t.second_hot_factor_num = parse_value(&key, value)?,
                ["tuning", "second_hot_factor_den"] => t.second_hot_factor_den = parse_value(&key, value)?,
                ["tuning", "background_gc_threshold"] => {
                    t.background_gc_threshold = parse_value(&key, value)?
                }
                ["tuning", "valid_chunks_in_page_to_reuse_threshold"] => {
                    t.valid_chunks_in_page_to_reuse_threshold = parse_value(&key, value)?
                }
                ["tuning", "adaptive_window_size"] => t.adaptive_window_size = parse_value(&key, value)?,
                ["tuning", "max_step_ups"] => t.max_step_ups = parse_value(&key, value)?,
                ["tuning", "max_step_downs"] => t.max_step_downs = parse_value(&key, value)?,
                ["tuning", "init_step_up"] => t.init_step_up = parse_value(&key, value)?,
                ["tuning", "init_step_down"] => t.init_step_down = parse_value(&key, value)?,
                ["tuning", "threshold_ceiling"] => t.threshold_ceiling = parse_value(&key, value)?,
                ["tuning", "threshold_floor"] => t.threshold_floor = parse_value(&key, value)?,
                ["tuning", "reuse_strategy"] => t.reuse_strategy = parse_value(&key, value)?,
                ["tuning", "reuse_blocks_for_cold"] => t.reuse_blocks_for_cold = parse_value(&key, value)?,
                ["tuning", "dram_absorb"] => t.dram_absorb = parse_value(&key, value)?,
                ["tuning", "max_backpressure_polls"] => {
                    t.max_backpressure_polls = parse_value(&key, value)?
                }
                ["tuning", "wom_fault"] if value.eq_ignore_ascii_case("none") => t.wom_fault = None,
                ["tuning", "wom_fault"] => {
                    return Err(ConfigError::InvalidValue { key, value: value.to_string() });
                }
                ["tuning", "wom_fault", "success_rate"] => {
                    t.wom_fault.get_or_insert_with(WomFaultConfig::default).success_rate = parse_value(&key, value)?
                }
                ["tuning", "wom_fault", "seed"] => {
                    t.wom_fault.get_or_insert_with(WomFaultConfig::default).seed = parse_value(&key, value)?
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.geometry.validate()?;
        self.tuning.validate(&self.geometry)
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
